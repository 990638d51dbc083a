//! In-memory server registry.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::record::{SearchResult, ServerRecord, CONSOLE_FIELD, SESSION_FIELD};
use super::RegistryError;
use crate::core::wire::{ip_to_int, ByteOrder, LocalAddr};
use crate::core::Platform;
use crate::filter;

/// Fields every search result carries besides the `localip<N>` family.
const ADDRESS_FIELDS: [&str; 6] = [
    "localport",
    "natneg",
    "publicip",
    "publicport",
    SESSION_FIELD,
    CONSOLE_FIELD,
];

/// Operations the front-ends need from the registry.
///
/// Implemented in-process by [`Registry`] and over the wire by
/// [`RemoteRegistry`](super::rpc::RemoteRegistry).
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Replace the record of `(game_id, session_id)`, stamping the hidden
    /// fields. Returns the stored record.
    async fn upsert(
        &self,
        game_id: &str,
        session_id: u32,
        fields: ServerRecord,
        platform: Platform,
    ) -> Result<ServerRecord, RegistryError>;

    /// Remove the record of `(game_id, session_id)` if present.
    async fn delete(&self, game_id: &str, session_id: u32) -> Result<(), RegistryError>;

    /// Filtered search. `Some(0)` yields nothing, `None` is unlimited.
    async fn search(
        &self,
        game_id: &str,
        filter: &str,
        fields: &[String],
        max_results: Option<u32>,
    ) -> Result<Vec<SearchResult>, RegistryError>;

    /// First record whose `publicip` equals `ip` (packed integer text) and,
    /// when `port` is given, whose `publicport` equals it.
    async fn find_by_public_address(
        &self,
        ip: &str,
        port: Option<u16>,
        game_id: Option<&str>,
    ) -> Result<Option<ServerRecord>, RegistryError>;

    /// Resolve a server from a client's public IP and reported local address.
    async fn find_by_local_address(
        &self,
        public_ip: Ipv4Addr,
        local: LocalAddr,
        game_id: Option<&str>,
    ) -> Result<Option<ServerRecord>, RegistryError>;

    /// Snapshot of every game's records.
    async fn get_all(&self) -> Result<BTreeMap<String, Vec<ServerRecord>>, RegistryError>;

    /// Remember a server targeted by a natneg cookie.
    async fn add_natneg_server(&self, cookie: i32, server: ServerRecord) -> Result<(), RegistryError>;

    /// Servers targeted by a natneg cookie.
    async fn get_natneg_servers(&self, cookie: i32) -> Result<Vec<ServerRecord>, RegistryError>;

    /// Forget a natneg cookie.
    async fn delete_natneg_server(&self, cookie: i32) -> Result<(), RegistryError>;
}

type GameList = Arc<RwLock<Vec<ServerRecord>>>;

/// The registry.
///
/// Game lists have their own locks so writers to one game never block
/// readers of another.
#[derive(Default)]
pub struct Registry {
    games: RwLock<BTreeMap<String, GameList>>,
    natneg: RwLock<BTreeMap<i32, Vec<ServerRecord>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    async fn game(&self, game_id: &str) -> Option<GameList> {
        self.games.read().await.get(game_id).cloned()
    }

    async fn game_or_create(&self, game_id: &str) -> GameList {
        if let Some(list) = self.game(game_id).await {
            return list;
        }
        self.games
            .write()
            .await
            .entry(game_id.to_string())
            .or_default()
            .clone()
    }

    /// Game lists to scan: one game or all of them.
    async fn scope(&self, game_id: Option<&str>) -> Vec<GameList> {
        match game_id {
            Some(id) => self.game(id).await.into_iter().collect(),
            None => self.games.read().await.values().cloned().collect(),
        }
    }

    /// See [`RegistryApi::upsert`].
    pub async fn upsert(
        &self,
        game_id: &str,
        session_id: u32,
        mut fields: ServerRecord,
        platform: Platform,
    ) -> ServerRecord {
        fields.set(SESSION_FIELD, i64::from(session_id));
        fields.set(CONSOLE_FIELD, platform.tag());

        let list = self.game_or_create(game_id).await;
        let mut list = list.write().await;
        list.retain(|r| r.session_id() != Some(session_id));
        list.push(fields.clone());

        debug!("Added session {} to {} ({} servers)", session_id, game_id, list.len());
        fields
    }

    /// See [`RegistryApi::delete`].
    pub async fn delete(&self, game_id: &str, session_id: u32) {
        let Some(list) = self.game(game_id).await else {
            return;
        };
        let mut list = list.write().await;
        let before = list.len();
        list.retain(|r| r.session_id() != Some(session_id));
        debug!(
            "Deleted {} {} servers where session = {}",
            before - list.len(),
            game_id,
            session_id
        );
    }

    /// See [`RegistryApi::search`].
    pub async fn search(
        &self,
        game_id: &str,
        filter: &str,
        fields: &[String],
        max_results: Option<u32>,
    ) -> Vec<SearchResult> {
        if max_results == Some(0) {
            return Vec::new();
        }
        let Some(list) = self.game(game_id).await else {
            return Vec::new();
        };
        let list = list.read().await;

        let limit = max_results.map(|n| n as usize);
        let results: Vec<SearchResult> = filter::evaluate_batch(filter, list.iter(), limit)
            .into_iter()
            .map(|record| project(record, fields))
            .collect();

        debug!("Matched {} {} servers", results.len(), game_id);
        results
    }

    /// See [`RegistryApi::find_by_public_address`].
    pub async fn find_by_public_address(
        &self,
        ip: &str,
        port: Option<u16>,
        game_id: Option<&str>,
    ) -> Option<ServerRecord> {
        let port = port.filter(|p| *p != 0).map(|p| p.to_string());

        for list in self.scope(game_id).await {
            let list = list.read().await;
            let found = list.iter().find(|r| {
                r.text("publicip").as_deref() == Some(ip)
                    && port
                        .as_deref()
                        .map_or(true, |p| r.text("publicport").as_deref() == Some(p))
            });
            if let Some(record) = found {
                return Some(record.clone());
            }
        }
        None
    }

    /// See [`RegistryApi::find_by_local_address`].
    ///
    /// The public IP is tried packed little-endian, then big-endian. Within
    /// one encoding a record whose `localport` matches wins outright;
    /// otherwise the last record with a matching `localip<N>` is taken, and
    /// when the client reported no local port any record on that public IP
    /// will do.
    pub async fn find_by_local_address(
        &self,
        public_ip: Ipv4Addr,
        local: LocalAddr,
        game_id: Option<&str>,
    ) -> Option<ServerRecord> {
        let lists = self.scope(game_id).await;

        for order in [ByteOrder::Little, ByteOrder::Big] {
            let packed = ip_to_int(public_ip, order).to_string();
            for list in &lists {
                let list = list.read().await;
                if let Some(found) = match_local(&list, &packed, &local) {
                    return Some(found.clone());
                }
            }
        }

        debug!("No server matches public {} local {}:{}", public_ip, local.ip, local.port);
        None
    }

    /// See [`RegistryApi::get_all`].
    pub async fn get_all(&self) -> BTreeMap<String, Vec<ServerRecord>> {
        let games: Vec<(String, GameList)> = self
            .games
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut out = BTreeMap::new();
        for (game_id, list) in games {
            out.insert(game_id, list.read().await.clone());
        }
        out
    }

    /// See [`RegistryApi::add_natneg_server`].
    pub async fn add_natneg_server(&self, cookie: i32, server: ServerRecord) {
        self.natneg.write().await.entry(cookie).or_default().push(server);
        debug!("Added natneg server {}", cookie);
    }

    /// See [`RegistryApi::get_natneg_servers`].
    pub async fn get_natneg_servers(&self, cookie: i32) -> Vec<ServerRecord> {
        self.natneg.read().await.get(&cookie).cloned().unwrap_or_default()
    }

    /// See [`RegistryApi::delete_natneg_server`].
    pub async fn delete_natneg_server(&self, cookie: i32) {
        self.natneg.write().await.remove(&cookie);
        debug!("Deleted natneg server {}", cookie);
    }
}

fn match_local<'a>(list: &'a [ServerRecord], packed_ip: &str, local: &LocalAddr) -> Option<&'a ServerRecord> {
    let local_ip = local.ip.to_string();
    let local_port = local.port.to_string();
    let mut best = None;

    for record in list.iter().filter(|r| r.text("publicip").as_deref() == Some(packed_ip)) {
        if record.text("localport").as_deref() == Some(local_port.as_str()) {
            return Some(record);
        }

        if record.local_ips().any(|(_, v)| v.as_text() == local_ip) {
            best = Some(record);
        }

        if local.port == 0 && best.is_none() {
            best = Some(record);
        }
    }
    best
}

/// Addressing projection plus requested fields (missing ones become empty).
fn project(record: &ServerRecord, fields: &[String]) -> SearchResult {
    let mut projected = ServerRecord::new();
    for (name, value) in record.local_ips() {
        projected.set(name, value.clone());
    }
    for name in ADDRESS_FIELDS {
        if let Some(value) = record.get(name) {
            projected.set(name, value.clone());
        }
    }

    let mut requested = ServerRecord::new();
    for name in fields {
        let value = record.get(name).cloned().unwrap_or_else(|| "".into());
        requested.set(name.as_str(), value);
    }

    SearchResult {
        record: projected,
        requested,
    }
}

#[async_trait]
impl RegistryApi for Registry {
    async fn upsert(
        &self,
        game_id: &str,
        session_id: u32,
        fields: ServerRecord,
        platform: Platform,
    ) -> Result<ServerRecord, RegistryError> {
        Ok(Registry::upsert(self, game_id, session_id, fields, platform).await)
    }

    async fn delete(&self, game_id: &str, session_id: u32) -> Result<(), RegistryError> {
        Registry::delete(self, game_id, session_id).await;
        Ok(())
    }

    async fn search(
        &self,
        game_id: &str,
        filter: &str,
        fields: &[String],
        max_results: Option<u32>,
    ) -> Result<Vec<SearchResult>, RegistryError> {
        Ok(Registry::search(self, game_id, filter, fields, max_results).await)
    }

    async fn find_by_public_address(
        &self,
        ip: &str,
        port: Option<u16>,
        game_id: Option<&str>,
    ) -> Result<Option<ServerRecord>, RegistryError> {
        Ok(Registry::find_by_public_address(self, ip, port, game_id).await)
    }

    async fn find_by_local_address(
        &self,
        public_ip: Ipv4Addr,
        local: LocalAddr,
        game_id: Option<&str>,
    ) -> Result<Option<ServerRecord>, RegistryError> {
        Ok(Registry::find_by_local_address(self, public_ip, local, game_id).await)
    }

    async fn get_all(&self) -> Result<BTreeMap<String, Vec<ServerRecord>>, RegistryError> {
        Ok(Registry::get_all(self).await)
    }

    async fn add_natneg_server(&self, cookie: i32, server: ServerRecord) -> Result<(), RegistryError> {
        Registry::add_natneg_server(self, cookie, server).await;
        Ok(())
    }

    async fn get_natneg_servers(&self, cookie: i32) -> Result<Vec<ServerRecord>, RegistryError> {
        Ok(Registry::get_natneg_servers(self, cookie).await)
    }

    async fn delete_natneg_server(&self, cookie: i32) -> Result<(), RegistryError> {
        Registry::delete_natneg_server(self, cookie).await;
        Ok(())
    }
}
