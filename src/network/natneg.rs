//! NAT Negotiation Relay
//!
//! Two clients that want to talk each send an init for the same
//! negotiation session. The relay answers each, then tells every pair of
//! not-yet-connected clients about each other's public address.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use super::{peer_ipv4, ServerError};
use crate::config::ServerConfig;
use crate::core::wire::{ip_to_int, read_cstr, read_u32_le, ByteOrder, LocalAddr};
use crate::core::WireError;
use crate::registry::{RegistryApi, ServerRecord};

/// Every natneg packet starts with this.
pub const NATNEG_MAGIC: [u8; 6] = [0xfd, 0xfc, 0x1e, 0x66, 0x6a, 0xb2];

/// Record types.
pub mod record {
    /// Client init.
    pub const INIT: u8 = 0x00;
    /// Init reply.
    pub const INIT_ACK: u8 = 0x01;
    /// Reachability test (reply to natify).
    pub const ERT_TEST: u8 = 0x02;
    /// Reachability test ack.
    pub const ERT_ACK: u8 = 0x03;
    /// State update.
    pub const STATE_UPDATE: u8 = 0x04;
    /// Peer address for the client.
    pub const CONNECT: u8 = 0x05;
    /// Client connected to its peer.
    pub const CONNECT_ACK: u8 = 0x06;
    /// Peer-to-peer ping.
    pub const CONNECT_PING: u8 = 0x07;
    /// Backup test.
    pub const BACKUP_TEST: u8 = 0x08;
    /// Backup test reply.
    pub const BACKUP_ACK: u8 = 0x09;
    /// Address check.
    pub const ADDRESS_CHECK: u8 = 0x0a;
    /// Address check reply.
    pub const ADDRESS_REPLY: u8 = 0x0b;
    /// Natify request.
    pub const NATIFY_REQUEST: u8 = 0x0c;
    /// Result report.
    pub const REPORT: u8 = 0x0d;
    /// Report reply.
    pub const REPORT_ACK: u8 = 0x0e;
    /// Version 4 pairing.
    pub const PREINIT: u8 = 0x0f;
    /// Pairing reply.
    pub const PREINIT_ACK: u8 = 0x10;
}

/// Tail of every init reply.
const INIT_ACK_TAIL: [u8; 7] = [0xff, 0xff, 0x6d, 0x16, 0xb5, 0x7d, 0xea];

/// Trailer of every connect packet.
const CONNECT_TAIL: [u8; 2] = [0x42, 0x00];

const GAME_NAME_OFFSET: usize = 0x15;
const LOCAL_ADDR_OFFSET: usize = 15;
const READ_BUFFER_SIZE: usize = 2048;

/// One client of a negotiation session.
#[derive(Debug, Clone)]
pub struct ClientSlot {
    /// Client reported a successful connection.
    pub connected: bool,
    /// Observed address.
    pub addr: SocketAddr,
    /// Reported local address.
    pub local: LocalAddr,
    /// Host record resolved for this client.
    pub server: Option<ServerRecord>,
    /// Last packet time.
    pub touched: Instant,
}

/// Negotiation sessions are scoped by game.
type SessionKey = (String, u32);

/// Clients of one negotiation session, by client index.
type SlotGroup = Arc<Mutex<BTreeMap<u8, ClientSlot>>>;

type Datagrams = Vec<(Vec<u8>, SocketAddr)>;

/// The NAT negotiation relay.
pub struct NatNegServer {
    bind_addr: SocketAddr,
    slot_ttl: Option<Duration>,
    registry: Arc<dyn RegistryApi>,
    sessions: RwLock<BTreeMap<SessionKey, SlotGroup>>,
    preinit: Mutex<BTreeMap<u32, (SocketAddr, Instant)>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl NatNegServer {
    /// Create a relay.
    pub fn new(config: &ServerConfig, registry: Arc<dyn RegistryApi>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            bind_addr: config.natneg_addr(),
            slot_ttl: config.natneg_slot_ttl,
            registry,
            sessions: RwLock::new(BTreeMap::new()),
            preinit: Mutex::new(BTreeMap::new()),
            shutdown_tx,
        }
    }

    /// Bind and serve until shutdown.
    #[instrument(skip(self), fields(addr = %self.bind_addr))]
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let socket = Arc::new(UdpSocket::bind(self.bind_addr).await?);
        info!("NatNeg server listening on {}", self.bind_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut prune = interval(self.slot_ttl.unwrap_or(Duration::from_secs(60)));
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => {
                            let data = buf[..len].to_vec();
                            let server = self.clone();
                            let socket = socket.clone();
                            tokio::spawn(async move {
                                server.process(&socket, &data, addr).await;
                            });
                        }
                        Err(e) => {
                            error!("NatNeg receive error: {}", e);
                        }
                    }
                }
                _ = prune.tick(), if self.slot_ttl.is_some() => {
                    let removed = self.prune(Instant::now()).await;
                    if removed > 0 {
                        debug!("Pruned {} natneg slots", removed);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn process(&self, socket: &UdpSocket, data: &[u8], addr: SocketAddr) {
        debug!("NatNeg packet from {}: {}", addr, hex::encode(data));
        match self.handle_packet(data, addr, Instant::now()).await {
            Ok(datagrams) => {
                for (packet, dest) in datagrams {
                    if let Err(e) = socket.send_to(&packet, dest).await {
                        error!("Failed to send to {}: {}", dest, e);
                    }
                }
            }
            Err(e) => warn!("Dropped NatNeg packet from {}: {}", addr, e),
        }
    }

    /// Signal the serve loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Handle one datagram. Returns the datagrams to send and where.
    pub async fn handle_packet(&self, data: &[u8], addr: SocketAddr, now: Instant) -> Result<Datagrams, ServerError> {
        if data.len() < 8 || data[..6] != NATNEG_MAGIC {
            warn!("Illegal natneg packet from {}", addr);
            return Ok(Vec::new());
        }

        match data[7] {
            record::INIT => self.init(data, addr, now).await,
            record::CONNECT_ACK => {
                self.connect_ack(data, addr).await?;
                Ok(Vec::new())
            }
            record::BACKUP_TEST => {
                debug!("Backup test from {}", addr);
                Ok(vec![(retyped(data, record::BACKUP_ACK), addr)])
            }
            record::ADDRESS_CHECK => address_check(data, addr),
            record::NATIFY_REQUEST => {
                debug!("Natify request from {}", addr);
                Ok(vec![(retyped(data, record::ERT_TEST), addr)])
            }
            record::REPORT => {
                let mut out = prefix(data, 21)?;
                out[7] = record::REPORT_ACK;
                out[14] = 0;
                debug!("Report from {}", addr);
                Ok(vec![(out, addr)])
            }
            record::PREINIT => self.preinit(data, addr, now).await,
            record::ERT_ACK => {
                info!("ERT ack from {}", addr);
                Ok(Vec::new())
            }
            kind @ (record::INIT_ACK
            | record::ERT_TEST
            | record::STATE_UPDATE
            | record::CONNECT
            | record::CONNECT_PING
            | record::BACKUP_ACK
            | record::ADDRESS_REPLY
            | record::REPORT_ACK
            | record::PREINIT_ACK) => {
                warn!("Unexpected natneg record {:02x} from {}: {}", kind, addr, hex::encode(data));
                Ok(Vec::new())
            }
            kind => {
                warn!("Unknown natneg record {:02x} from {}: {}", kind, addr, hex::encode(data));
                Ok(Vec::new())
            }
        }
    }

    async fn init(&self, data: &[u8], addr: SocketAddr, now: Instant) -> Result<Datagrams, ServerError> {
        let session_id = read_u32_le(data, 8)?;
        let client = *data.get(13).ok_or(WireError::Truncated { offset: 13, needed: 1 })?;
        let local = LocalAddr::read(data, LOCAL_ADDR_OFFSET)?;
        let game_id = read_cstr(data, GAME_NAME_OFFSET).map(|(s, _)| s).unwrap_or_default();

        let mut reply = prefix(data, 14)?;
        reply.extend_from_slice(&INIT_ACK_TAIL);
        reply[7] = record::INIT_ACK;
        let mut out = vec![(reply, addr)];
        debug!("Init from {} for session {:08x} client {} in {}", addr, session_id, client, game_id);

        let mut group = self.lock_group((game_id.clone(), session_id)).await;
        let slot = group.entry(client).or_insert_with(|| ClientSlot {
            connected: false,
            addr,
            local,
            server: None,
            touched: now,
        });
        slot.addr = addr;
        slot.local = local;
        slot.touched = now;

        let peers: Vec<u8> = group
            .iter()
            .filter(|(index, peer)| **index != client && !peer.connected)
            .map(|(index, _)| *index)
            .collect();

        for index in peers {
            let peer = self.resolve_slot(&mut group, index, &game_id, session_id).await;
            let me = self.resolve_slot(&mut group, client, &game_id, session_id).await;
            let (Some(peer), Some(me)) = (peer, me) else {
                continue;
            };

            out.push((connect_packet(data, &peer)?, me.addr));
            out.push((connect_packet(data, &me)?, peer.addr));
            debug!("Introduced {} and {} for session {:08x}", me.addr, peer.addr, session_id);
        }

        Ok(out)
    }

    /// Lock the slots of a session, creating the session if needed.
    ///
    /// Only packets of the same session wait on each other. A group pruned
    /// while we waited for it is not used; the lookup starts over.
    async fn lock_group(&self, key: SessionKey) -> OwnedMutexGuard<BTreeMap<u8, ClientSlot>> {
        loop {
            let group = {
                let sessions = self.sessions.read().await;
                sessions.get(&key).cloned()
            };
            let group = match group {
                Some(group) => group,
                None => self.sessions.write().await.entry(key.clone()).or_default().clone(),
            };

            let guard = group.clone().lock_owned().await;
            let current = self.sessions.read().await.get(&key).is_some_and(|g| Arc::ptr_eq(g, &group));
            if current {
                return guard;
            }
        }
    }

    /// Resolve the host record of a slot and store it. Returns the updated slot.
    async fn resolve_slot(
        &self,
        group: &mut BTreeMap<u8, ClientSlot>,
        index: u8,
        game_id: &str,
        session_id: u32,
    ) -> Option<ClientSlot> {
        let slot = group.get(&index)?.clone();
        let server = match self.find_server(&slot, game_id, session_id).await {
            Ok(server) => server,
            Err(e) => {
                warn!("Server lookup for {} failed: {}", slot.addr, e);
                None
            }
        };
        debug!("Server for {}: {:?}", slot.addr, server);

        let slot = group.get_mut(&index)?;
        slot.server = server;
        Some(slot.clone())
    }

    /// A client's host: first among the servers the browser tied to this
    /// session's cookie, then by local address.
    async fn find_server(
        &self,
        slot: &ClientSlot,
        game_id: &str,
        session_id: u32,
    ) -> Result<Option<ServerRecord>, ServerError> {
        let ip = peer_ipv4(&slot.addr)?;

        let servers = self.registry.get_natneg_servers(session_id as i32).await?;
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let packed = ip_to_int(ip, order).to_string();
            if let Some(server) = servers.iter().find(|s| s.text("publicip").as_deref() == Some(packed.as_str())) {
                return Ok(Some(server.clone()));
            }
        }

        Ok(self.registry.find_by_local_address(ip, slot.local, Some(game_id)).await?)
    }

    async fn connect_ack(&self, data: &[u8], addr: SocketAddr) -> Result<(), ServerError> {
        let session_id = read_u32_le(data, 8)?;
        let client = *data.get(13).ok_or(WireError::Truncated { offset: 13, needed: 1 })?;
        debug!("Client {} of session {:08x} connected ({})", client, session_id, addr);

        let groups: Vec<SlotGroup> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|((_, id), _)| *id == session_id)
            .map(|(_, group)| group.clone())
            .collect();

        for group in groups {
            if let Some(slot) = group.lock().await.get_mut(&client) {
                slot.connected = true;
            }
        }
        Ok(())
    }

    async fn preinit(&self, data: &[u8], addr: SocketAddr, now: Instant) -> Result<Datagrams, ServerError> {
        if data.len() < 18 {
            return Err(WireError::Truncated {
                offset: data.len(),
                needed: 18 - data.len(),
            }
            .into());
        }

        let split = data.len() - 4;
        let other = read_u32_le(data, split)?;
        let mut output = data[..split].to_vec();
        output.extend_from_slice(&[0, 0, 0, 0]);
        output[7] = record::PREINIT_ACK;

        let mut out = Vec::new();
        let mut pending = self.preinit.lock().await;
        if other == 0 {
            output[13] = 2;
        } else if let Some((waiting, _)) = pending.remove(&other) {
            output[13] = 2;
            out.push((output.clone(), waiting));
            output[12] = if output[12] == 0 { 1 } else { 0 };
            debug!("Paired pre-init {:08x}: {} and {}", other, waiting, addr);
        } else {
            output[13] = 0;
            pending.insert(other, (addr, now));
        }

        out.push((output, addr));
        Ok(out)
    }

    /// Drop slots and pre-init entries older than the configured TTL.
    /// Returns how many were removed. Does nothing without a TTL.
    pub async fn prune(&self, now: Instant) -> usize {
        let Some(ttl) = self.slot_ttl else {
            return 0;
        };
        let expired = |touched: Instant| now.saturating_duration_since(touched) >= ttl;
        let mut removed = 0;

        let groups: Vec<SlotGroup> = self.sessions.read().await.values().cloned().collect();
        for group in groups {
            let mut group = group.lock().await;
            let before = group.len();
            group.retain(|_, slot| !expired(slot.touched));
            removed += before - group.len();
        }

        // Groups in use are left for the next pass.
        self.sessions
            .write()
            .await
            .retain(|_, group| group.try_lock().map_or(true, |g| !g.is_empty()));

        let mut pending = self.preinit.lock().await;
        let before = pending.len();
        pending.retain(|_, (_, touched)| !expired(*touched));
        removed += before - pending.len();

        removed
    }

    /// Slot of a client, if known.
    pub async fn slot(&self, game_id: &str, session_id: u32, client: u8) -> Option<ClientSlot> {
        let group = self.sessions.read().await.get(&(game_id.to_string(), session_id)).cloned()?;
        let group = group.lock().await;
        group.get(&client).cloned()
    }
}

/// First `len` bytes of the packet.
fn prefix(data: &[u8], len: usize) -> Result<Vec<u8>, WireError> {
    data.get(..len).map(<[u8]>::to_vec).ok_or_else(|| WireError::Truncated {
        offset: data.len(),
        needed: len.saturating_sub(data.len()),
    })
}

/// The packet with only its record type changed.
fn retyped(data: &[u8], kind: u8) -> Vec<u8> {
    let mut out = data.to_vec();
    out[7] = kind;
    out
}

fn address_check(data: &[u8], addr: SocketAddr) -> Result<Datagrams, ServerError> {
    let ip = peer_ipv4(&addr)?;
    let mut out = prefix(data, 15)?;
    out.extend_from_slice(&ip.octets());
    out.extend_from_slice(&addr.port().to_be_bytes());
    if let Some(rest) = data.get(out.len()..) {
        out.extend_from_slice(rest);
    }
    out[7] = record::ADDRESS_REPLY;
    debug!("Address check from {}", addr);
    Ok(vec![(out, addr)])
}

/// Connect packet describing `slot` to its peer.
fn connect_packet(data: &[u8], slot: &ClientSlot) -> Result<Vec<u8>, ServerError> {
    let port = slot
        .server
        .as_ref()
        .and_then(|s| s.int("publicport"))
        .and_then(|p| u16::try_from(p).ok())
        .or(Some(slot.local.port).filter(|p| *p != 0))
        .unwrap_or(slot.addr.port());

    let mut out = prefix(data, 12)?;
    out.extend_from_slice(&peer_ipv4(&slot.addr)?.octets());
    out.extend_from_slice(&port.to_be_bytes());
    out.extend_from_slice(&CONNECT_TAIL);
    out[7] = record::CONNECT;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Platform;
    use crate::registry::{Registry, RegistryError, SearchResult};
    use std::net::Ipv4Addr;

    fn server_with(registry: Arc<Registry>, slot_ttl: Option<Duration>) -> NatNegServer {
        let config = ServerConfig {
            natneg_slot_ttl: slot_ttl,
            ..ServerConfig::default()
        };
        NatNegServer::new(&config, registry)
    }

    fn server() -> NatNegServer {
        server_with(Arc::new(Registry::new()), None)
    }

    fn header(kind: u8, session_id: u32) -> Vec<u8> {
        let mut out = NATNEG_MAGIC.to_vec();
        out.push(3);
        out.push(kind);
        out.extend_from_slice(&session_id.to_le_bytes());
        out
    }

    fn init(session_id: u32, client: u8, local: [u8; 4], local_port: u16) -> Vec<u8> {
        let mut out = header(record::INIT, session_id);
        out.extend_from_slice(&[0, client, 1]);
        out.extend_from_slice(&local);
        out.extend_from_slice(&local_port.to_be_bytes());
        out.extend_from_slice(b"mariokartwii\0");
        out
    }

    fn a() -> SocketAddr {
        "203.0.113.7:40000".parse().unwrap()
    }

    fn b() -> SocketAddr {
        "198.51.100.4:51000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_init_reply() {
        let server = server();
        let data = init(0x7100f13d, 0, [10, 0, 1, 226], 0);
        let out = server.handle_packet(&data, a(), Instant::now()).await.unwrap();

        assert_eq!(out.len(), 1);
        let (reply, dest) = &out[0];
        assert_eq!(*dest, a());
        assert_eq!(reply[..7], data[..7]);
        assert_eq!(reply[7], record::INIT_ACK);
        assert_eq!(reply[8..14], data[8..14]);
        assert_eq!(reply[14..], INIT_ACK_TAIL);

        let slot = server.slot("mariokartwii", 0x7100f13d, 0).await.unwrap();
        assert_eq!(slot.local.ip, Ipv4Addr::new(10, 0, 1, 226));
        assert!(!slot.connected);
    }

    #[tokio::test]
    async fn test_second_init_introduces_peers() {
        let server = server();
        let now = Instant::now();
        server.handle_packet(&init(5, 0, [10, 0, 0, 2], 0), a(), now).await.unwrap();
        let second = init(5, 1, [10, 0, 0, 3], 6000);
        let out = server.handle_packet(&second, b(), now).await.unwrap();

        assert_eq!(out.len(), 3);

        // To the new client: the peer's observed address, observed port.
        let (to_b, dest) = &out[1];
        assert_eq!(*dest, b());
        assert_eq!(to_b[7], record::CONNECT);
        assert_eq!(to_b[8..12], 5u32.to_le_bytes());
        assert_eq!(to_b[12..16], [203, 0, 113, 7]);
        assert_eq!(to_b[16..18], 40000u16.to_be_bytes());
        assert_eq!(to_b[18..], CONNECT_TAIL);

        // To the waiting client: the new client's reported local port.
        let (to_a, dest) = &out[2];
        assert_eq!(*dest, a());
        assert_eq!(to_a[12..16], [198, 51, 100, 4]);
        assert_eq!(to_a[16..18], 6000u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_connected_clients_are_not_introduced() {
        let server = server();
        let now = Instant::now();
        server.handle_packet(&init(6, 0, [10, 0, 0, 2], 0), a(), now).await.unwrap();

        let mut ack = header(record::CONNECT_ACK, 6);
        ack.extend_from_slice(&[0x90, 0]);
        server.handle_packet(&ack, a(), now).await.unwrap();
        assert!(server.slot("mariokartwii", 6, 0).await.unwrap().connected);

        let out = server.handle_packet(&init(6, 1, [10, 0, 0, 3], 0), b(), now).await.unwrap();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_peer_port_from_cookie_server() {
        let registry = Arc::new(Registry::new());
        let host = ServerRecord::from_pairs([
            ("publicip", ip_to_int(Ipv4Addr::new(203, 0, 113, 7), ByteOrder::Big).to_string()),
            ("publicport", "41234".to_string()),
        ]);
        let host = registry.upsert("mariokartwii", 1, host, Platform::Wii).await;
        registry.add_natneg_server(9, host).await;

        let server = server_with(registry, None);
        let now = Instant::now();
        server.handle_packet(&init(9, 1, [10, 0, 0, 2], 0), a(), now).await.unwrap();
        let out = server.handle_packet(&init(9, 0, [10, 0, 0, 3], 0), b(), now).await.unwrap();

        let (to_b, _) = &out[1];
        assert_eq!(to_b[16..18], 41234u16.to_be_bytes());
        let slot = server.slot("mariokartwii", 9, 1).await.unwrap();
        assert_eq!(slot.server.and_then(|s| s.session_id()), Some(1));
    }

    #[tokio::test]
    async fn test_echo_records() {
        let server = server();
        let mut data = header(record::BACKUP_TEST, 1);
        data.extend_from_slice(&[0; 10]);

        let out = server.handle_packet(&data, a(), Instant::now()).await.unwrap();
        assert_eq!(out[0].0[7], record::BACKUP_ACK);
        assert_eq!(out[0].0.len(), data.len());

        data[7] = record::NATIFY_REQUEST;
        let out = server.handle_packet(&data, a(), Instant::now()).await.unwrap();
        assert_eq!(out[0].0[7], record::ERT_TEST);
    }

    #[tokio::test]
    async fn test_address_check_reports_observed_address() {
        let server = server();
        let mut data = header(record::ADDRESS_CHECK, 0);
        data.extend_from_slice(&[1, 0, 0]);
        data.extend_from_slice(&[0; 20]);

        let out = server.handle_packet(&data, a(), Instant::now()).await.unwrap();
        let reply = &out[0].0;
        assert_eq!(reply[7], record::ADDRESS_REPLY);
        assert_eq!(reply[15..19], [203, 0, 113, 7]);
        assert_eq!(reply[19..21], 40000u16.to_be_bytes());
        assert_eq!(reply.len(), data.len());
    }

    #[tokio::test]
    async fn test_report_ack() {
        let server = server();
        let mut data = header(record::REPORT, 3);
        data.extend_from_slice(&[0, 0, 1, 0, 0, 0, 6, 0, 0]);
        data.extend_from_slice(b"mariokartwii\0");

        let out = server.handle_packet(&data, a(), Instant::now()).await.unwrap();
        let reply = &out[0].0;
        assert_eq!(reply.len(), 21);
        assert_eq!(reply[7], record::REPORT_ACK);
        assert_eq!(reply[14], 0);
    }

    #[tokio::test]
    async fn test_preinit_pairing() {
        let server = server();
        let now = Instant::now();
        let mut first = header(record::PREINIT, 0x2a95e0b5);
        first[6] = 4;
        first.extend_from_slice(&[0, 0x24]);
        first.extend_from_slice(&0x5eb3b238u32.to_le_bytes());

        let out = server.handle_packet(&first, a(), now).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0[7], record::PREINIT_ACK);
        assert_eq!(out[0].0[13], 0);
        assert_eq!(out[0].0[14..], [0, 0, 0, 0]);

        let mut second = first.clone();
        second[12] = 1;
        let out = server.handle_packet(&second, b(), now).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].1, a());
        assert_eq!(out[0].0[12], 1);
        assert_eq!(out[0].0[13], 2);
        assert_eq!(out[1].1, b());
        assert_eq!(out[1].0[12], 0);
        assert_eq!(out[1].0[13], 2);

        let mut zero = first.clone();
        let len = zero.len();
        zero[len - 4..].copy_from_slice(&[0, 0, 0, 0]);
        let out = server.handle_packet(&zero, a(), now).await.unwrap();
        assert_eq!(out[0].0[13], 2);
    }

    #[tokio::test]
    async fn test_prune_requires_ttl() {
        let now = Instant::now();
        let later = now + Duration::from_secs(120);

        let keep = server();
        keep.handle_packet(&init(1, 0, [10, 0, 0, 2], 0), a(), now).await.unwrap();
        assert_eq!(keep.prune(later).await, 0);
        assert!(keep.slot("mariokartwii", 1, 0).await.is_some());

        let pruning = server_with(Arc::new(Registry::new()), Some(Duration::from_secs(60)));
        pruning.handle_packet(&init(1, 0, [10, 0, 0, 2], 0), a(), now).await.unwrap();
        pruning.handle_packet(&init(1, 1, [10, 0, 0, 3], 0), b(), later).await.unwrap();
        assert_eq!(pruning.prune(later).await, 1);
        assert!(pruning.slot("mariokartwii", 1, 0).await.is_none());
        assert!(pruning.slot("mariokartwii", 1, 1).await.is_some());
    }

    #[test]
    fn test_prefix_of_longer_packet() {
        let data = [1u8, 2, 3, 4, 5, 6];
        assert_eq!(prefix(&data, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(prefix(&data, 6).unwrap(), data.to_vec());
        assert!(matches!(
            prefix(&data, 9),
            Err(WireError::Truncated { offset: 6, needed: 3 })
        ));
    }

    /// Registry whose natneg lookups for cookie 1 wait for a permit.
    struct GatedRegistry {
        inner: Registry,
        entered: tokio::sync::Notify,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait::async_trait]
    impl RegistryApi for GatedRegistry {
        async fn upsert(
            &self,
            game_id: &str,
            session_id: u32,
            fields: ServerRecord,
            platform: Platform,
        ) -> Result<ServerRecord, RegistryError> {
            RegistryApi::upsert(&self.inner, game_id, session_id, fields, platform).await
        }

        async fn delete(&self, game_id: &str, session_id: u32) -> Result<(), RegistryError> {
            RegistryApi::delete(&self.inner, game_id, session_id).await
        }

        async fn search(
            &self,
            game_id: &str,
            filter: &str,
            fields: &[String],
            max_results: Option<u32>,
        ) -> Result<Vec<SearchResult>, RegistryError> {
            RegistryApi::search(&self.inner, game_id, filter, fields, max_results).await
        }

        async fn find_by_public_address(
            &self,
            ip: &str,
            port: Option<u16>,
            game_id: Option<&str>,
        ) -> Result<Option<ServerRecord>, RegistryError> {
            RegistryApi::find_by_public_address(&self.inner, ip, port, game_id).await
        }

        async fn find_by_local_address(
            &self,
            public_ip: Ipv4Addr,
            local: LocalAddr,
            game_id: Option<&str>,
        ) -> Result<Option<ServerRecord>, RegistryError> {
            RegistryApi::find_by_local_address(&self.inner, public_ip, local, game_id).await
        }

        async fn get_all(&self) -> Result<BTreeMap<String, Vec<ServerRecord>>, RegistryError> {
            RegistryApi::get_all(&self.inner).await
        }

        async fn add_natneg_server(&self, cookie: i32, server: ServerRecord) -> Result<(), RegistryError> {
            RegistryApi::add_natneg_server(&self.inner, cookie, server).await
        }

        async fn get_natneg_servers(&self, cookie: i32) -> Result<Vec<ServerRecord>, RegistryError> {
            if cookie == 1 {
                self.entered.notify_one();
                let _permit = self.gate.acquire().await;
            }
            RegistryApi::get_natneg_servers(&self.inner, cookie).await
        }

        async fn delete_natneg_server(&self, cookie: i32) -> Result<(), RegistryError> {
            RegistryApi::delete_natneg_server(&self.inner, cookie).await
        }
    }

    #[tokio::test]
    async fn test_sessions_proceed_independently() {
        let registry = Arc::new(GatedRegistry {
            inner: Registry::new(),
            entered: tokio::sync::Notify::new(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let server = Arc::new(NatNegServer::new(&ServerConfig::default(), registry.clone()));
        let now = Instant::now();

        server.handle_packet(&init(1, 0, [10, 0, 0, 2], 0), a(), now).await.unwrap();
        let stalled = {
            let server = server.clone();
            tokio::spawn(async move { server.handle_packet(&init(1, 1, [10, 0, 0, 3], 0), b(), now).await })
        };
        registry.entered.notified().await;

        let other = async {
            server.handle_packet(&init(2, 0, [10, 0, 0, 2], 0), a(), now).await.unwrap();
            server.handle_packet(&init(2, 1, [10, 0, 0, 3], 0), b(), now).await.unwrap()
        };
        let out = tokio::time::timeout(Duration::from_secs(5), other)
            .await
            .expect("session 2 waited on session 1");
        assert_eq!(out.len(), 3);
        assert!(!stalled.is_finished());

        registry.gate.add_permits(8);
        let out = stalled.await.unwrap().unwrap();
        assert_eq!(out.len(), 3);
        assert!(server.slot("mariokartwii", 1, 1).await.is_some());
    }

    #[tokio::test]
    async fn test_bad_magic_and_truncation() {
        let server = server();
        assert!(server.handle_packet(b"hello world", a(), Instant::now()).await.unwrap().is_empty());

        let data = header(record::INIT, 1);
        assert!(server.handle_packet(&data, a(), Instant::now()).await.is_err());
    }
}
