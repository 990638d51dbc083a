//! Profile lookups.
//!
//! The QR server asks the profile service which platform a player is on
//! when the game name does not tell it.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use crate::core::Platform;

/// Profile errors.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// Profile file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Profile file is not a `{pid: platform}` object.
    #[error("invalid profile file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Keyed lookups into the player profile store.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    /// Platform the profile was registered from, if known.
    async fn platform_for_profile(&self, profile_id: i64) -> Option<Platform>;
}

/// Fixed profile table.
#[derive(Debug, Clone, Default)]
pub struct StaticProfileDirectory {
    platforms: BTreeMap<i64, Platform>,
}

impl StaticProfileDirectory {
    /// Empty directory. Every lookup misses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON object such as `{"600000001": "wii"}`.
    pub fn from_json(text: &str) -> Result<Self, ProfileError> {
        let platforms: BTreeMap<i64, Platform> = serde_json::from_str(text)?;
        Ok(Self { platforms })
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ProfileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let directory = Self::from_json(&text)?;
        info!("Loaded {} profiles from {}", directory.platforms.len(), path.display());
        Ok(directory)
    }

    /// Add or replace one entry.
    pub fn insert(&mut self, profile_id: i64, platform: Platform) {
        self.platforms.insert(profile_id, platform);
    }
}

#[async_trait]
impl ProfileDirectory for StaticProfileDirectory {
    async fn platform_for_profile(&self, profile_id: i64) -> Option<Platform> {
        self.platforms.get(&profile_id).copied()
    }
}
