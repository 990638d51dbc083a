//! Per-game secret keys.
//!
//! Keys come from a fixed-column text file: the game title occupies
//! columns 0..54, the game id 54..73 and the secret key the rest of the line.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;
use tracing::info;

const ID_COLUMN: usize = 54;
const KEY_COLUMN: usize = ID_COLUMN + 19;

/// Secret key loading errors.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Key file could not be read.
    #[error("Failed to read key file {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Read-only map of game id to secret key.
#[derive(Debug, Clone, Default)]
pub struct SecretKeyTable {
    keys: BTreeMap<String, String>,
}

impl SecretKeyTable {
    /// Parse the fixed-column key list.
    pub fn parse(text: &str) -> Self {
        let mut keys = BTreeMap::new();

        for line in text.lines() {
            let id = column(line, ID_COLUMN, Some(KEY_COLUMN)).trim();
            let key = column(line, KEY_COLUMN, None).trim();
            if id.is_empty() {
                continue;
            }
            keys.insert(id.to_string(), key.to_string());
        }

        Self { keys }
    }

    /// Load and parse a key file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| KeyError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let table = Self::parse(&String::from_utf8_lossy(&bytes));
        info!("Loaded {} game keys from {}", table.len(), path.display());
        Ok(table)
    }

    /// Build a table from explicit pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            keys: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Secret key of a game.
    pub fn get(&self, game_id: &str) -> Option<&str> {
        self.keys.get(game_id).map(String::as_str)
    }

    /// Secret key of a game, or an empty key when unknown.
    pub fn key_bytes(&self, game_id: &str) -> &[u8] {
        self.get(game_id).map(str::as_bytes).unwrap_or_default()
    }

    /// Number of known games.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when no keys are loaded.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Byte-column slice that tolerates short lines and non-ASCII titles.
fn column(line: &str, start: usize, end: Option<usize>) -> &str {
    let bytes = line.as_bytes();
    if start >= bytes.len() {
        return "";
    }
    let end = end.unwrap_or(bytes.len()).min(bytes.len());
    std::str::from_utf8(&bytes[start..end]).unwrap_or("")
}
