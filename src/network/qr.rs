//! QR Heartbeat Server
//!
//! Hosts report their sessions over UDP. The first heartbeat of a session
//! is answered with a challenge; the host proves it knows the game's secret
//! key, and from then on every heartbeat replaces its registry record.
//!
//! ```text
//! host                      server                   registry
//!  | 03 heartbeat  -------->  |
//!  |  <-------- FE FD 01 challenge
//!  | 01 answer     -------->  |
//!  |  <-------- FE FD 0A      | ---- upsert -------->  |
//!  | 03 heartbeat  -------->  | ---- upsert -------->  |
//!  | 08 keepalive  -------->  |
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use super::profile::ProfileDirectory;
use super::{peer_ipv4, ServerError};
use crate::config::ServerConfig;
use crate::core::wire::{ip_to_int, parse_kv_list, read_u32_le};
use crate::core::{prepare_rc4_base64, Platform, SecretKeyTable};
use crate::registry::{RegistryApi, ServerRecord};

/// Server packet prefix.
pub const SERVER_MAGIC: [u8; 2] = [0xfe, 0xfd];

/// Client commands.
pub mod command {
    /// Query (unused).
    pub const QUERY: u8 = 0x00;
    /// Challenge answer.
    pub const CHALLENGE: u8 = 0x01;
    /// Echo (unused).
    pub const ECHO: u8 = 0x02;
    /// Heartbeat.
    pub const HEARTBEAT: u8 = 0x03;
    /// Add error (unused).
    pub const ADD_ERROR: u8 = 0x04;
    /// Echo response (unused).
    pub const ECHO_RESPONSE: u8 = 0x05;
    /// Client message (server to client). Also used to forward browser messages.
    pub const CLIENT_MESSAGE: u8 = 0x06;
    /// Client message ack.
    pub const CLIENT_MESSAGE_ACK: u8 = 0x07;
    /// Keepalive.
    pub const KEEPALIVE: u8 = 0x08;
    /// Availability check.
    pub const AVAILABLE: u8 = 0x09;
    /// Client registered (server to client).
    pub const CLIENT_REGISTERED: u8 = 0x0a;
}

const READ_BUFFER_SIZE: usize = 2048;

/// Per-session state.
#[derive(Debug, Clone)]
pub struct QrSession {
    /// Session id from the packet header.
    pub session_id: u32,
    /// Last source address.
    pub addr: SocketAddr,
    /// Challenge string sent to the host.
    pub challenge: Option<String>,
    /// Secret key of the reported game.
    pub secret_key: String,
    /// Whether a challenge has been sent since the last failure.
    pub sent_challenge: bool,
    /// Last packet time.
    pub last_keepalive: Instant,
    /// Host platform.
    pub platform: Platform,
    /// Host profile id.
    pub player_id: Option<i64>,
    /// Game the session is registered under.
    pub game_id: String,
    /// Heartbeat held until the challenge is answered.
    pub pending: Option<ServerRecord>,
}

impl QrSession {
    fn new(session_id: u32, addr: SocketAddr, now: Instant) -> Self {
        Self {
            session_id,
            addr,
            challenge: None,
            secret_key: String::new(),
            sent_challenge: false,
            last_keepalive: now,
            platform: Platform::default(),
            player_id: None,
            game_id: String::new(),
            pending: None,
        }
    }
}

/// The QR server.
pub struct QrServer {
    bind_addr: SocketAddr,
    keepalive_timeout: Duration,
    sweep_interval: Duration,
    registry: Arc<dyn RegistryApi>,
    keys: Arc<SecretKeyTable>,
    profiles: Arc<dyn ProfileDirectory>,
    sessions: RwLock<BTreeMap<u32, Arc<Mutex<QrSession>>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl QrServer {
    /// Create a QR server.
    pub fn new(
        config: &ServerConfig,
        registry: Arc<dyn RegistryApi>,
        keys: Arc<SecretKeyTable>,
        profiles: Arc<dyn ProfileDirectory>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            bind_addr: config.qr_addr(),
            keepalive_timeout: config.keepalive_timeout,
            sweep_interval: config.sweep_interval,
            registry,
            keys,
            profiles,
            sessions: RwLock::new(BTreeMap::new()),
            shutdown_tx,
        }
    }

    /// Bind the QR socket. The browser forwards messages through it too.
    pub async fn bind(&self) -> Result<Arc<UdpSocket>, ServerError> {
        let socket = UdpSocket::bind(self.bind_addr).await?;
        info!("QR server listening on {}", self.bind_addr);
        Ok(Arc::new(socket))
    }

    /// Bind and serve until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let socket = self.bind().await?;
        self.serve(socket).await
    }

    /// Serve on a bound socket until shutdown.
    #[instrument(skip(self, socket), fields(addr = %self.bind_addr))]
    pub async fn serve(self: Arc<Self>, socket: Arc<UdpSocket>) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut sweep = interval(self.sweep_interval);
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
                            error!("QR receive error: {}", e);
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.sweep(Instant::now()).await;
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
        debug!("QR packet from {}: {}", addr, hex::encode(data));
        match self.handle_packet(data, addr, Instant::now()).await {
            Ok(replies) => {
                for reply in replies {
                    if let Err(e) = socket.send_to(&reply, addr).await {
                        error!("Failed to send to {}: {}", addr, e);
                    }
                }
            }
            Err(e) => warn!("Dropped QR packet from {}: {}", addr, e),
        }
    }

    /// Signal the serve loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Number of tracked sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Snapshot of one session.
    pub async fn session(&self, session_id: u32) -> Option<QrSession> {
        let session = self.sessions.read().await.get(&session_id).cloned()?;
        let session = session.lock().await;
        Some(session.clone())
    }

    async fn session_or_create(&self, session_id: u32, addr: SocketAddr, now: Instant) -> Arc<Mutex<QrSession>> {
        if let Some(session) = self.sessions.read().await.get(&session_id) {
            return session.clone();
        }
        self.sessions
            .write()
            .await
            .entry(session_id)
            .or_insert_with(|| {
                debug!("New QR session {:08x} from {}", session_id, addr);
                Arc::new(Mutex::new(QrSession::new(session_id, addr, now)))
            })
            .clone()
    }

    /// Lock a session, creating it if needed. A session the sweep removed
    /// while we waited is not used; the lookup starts over.
    async fn lock_session(&self, session_id: u32, addr: SocketAddr, now: Instant) -> OwnedMutexGuard<QrSession> {
        loop {
            let session = self.session_or_create(session_id, addr, now).await;
            let guard = session.clone().lock_owned().await;
            let current = self
                .sessions
                .read()
                .await
                .get(&session_id)
                .is_some_and(|s| Arc::ptr_eq(s, &session));
            if current {
                return guard;
            }
            debug!("QR session {:08x} was removed while waiting, starting over", session_id);
        }
    }

    /// Handle one datagram. Returns the replies for the sender.
    pub async fn handle_packet(
        &self,
        data: &[u8],
        addr: SocketAddr,
        now: Instant,
    ) -> Result<Vec<Vec<u8>>, ServerError> {
        let Some(&cmd) = data.first() else {
            return Ok(Vec::new());
        };

        if cmd == command::AVAILABLE {
            let game = data.get(5..data.len().saturating_sub(1)).unwrap_or_default();
            debug!("Availability check for '{}' from {}", String::from_utf8_lossy(game), addr);
            return Ok(vec![vec![0xfe, 0xfd, command::AVAILABLE, 0x00, 0x00, 0x00, 0x00]]);
        }

        let session_id = read_u32_le(data, 1)?;
        let raw_id = &data[1..5];
        let payload = &data[5..];

        let mut session = self.lock_session(session_id, addr, now).await;
        session.last_keepalive = now;
        session.addr = addr;

        let mut replies = Vec::new();
        match cmd {
            command::CHALLENGE => {
                let answer = &payload[..payload.len().saturating_sub(1)];
                let expected = session
                    .challenge
                    .as_deref()
                    .map(|c| prepare_rc4_base64(session.secret_key.as_bytes(), c.as_bytes()));

                if expected.as_deref().map(str::as_bytes) == Some(answer) {
                    debug!("Session {:08x} answered the challenge", session_id);
                    let mut reply = vec![0xfe, 0xfd, command::CLIENT_REGISTERED];
                    reply.extend_from_slice(raw_id);
                    replies.push(reply);

                    if let Some(pending) = session.pending.clone() {
                        self.update_server_list(&mut session, pending).await?;
                    }
                } else {
                    debug!("Session {:08x} failed the challenge", session_id);
                    session.sent_challenge = false;
                    self.registry.delete(&session.game_id, session_id).await?;
                }
            }
            command::HEARTBEAT => {
                debug!("Heartbeat from {} ({:08x})", addr, session_id);
                let mut record = ServerRecord::from_pairs(parse_kv_list(payload));
                self.identify(&mut session, &record).await;
                fix_public_address(&mut record, addr, session.platform)?;

                if session.sent_challenge {
                    self.update_server_list(&mut session, record).await?;
                } else {
                    let challenge = make_challenge(addr)?;
                    let mut reply = vec![0xfe, 0xfd, command::CHALLENGE];
                    reply.extend_from_slice(raw_id);
                    reply.extend_from_slice(challenge.as_bytes());
                    reply.push(0);
                    replies.push(reply);

                    debug!("Sent challenge {} to {}", challenge, addr);
                    session.challenge = Some(challenge);
                    session.sent_challenge = true;
                    session.pending = Some(record);
                }
            }
            command::KEEPALIVE => {
                debug!("Keepalive from {} ({:08x})", addr, session_id);
            }
            command::CLIENT_MESSAGE_ACK => {
                debug!("Client message ack from {} ({:08x})", addr, session_id);
            }
            command::QUERY
            | command::ECHO
            | command::ADD_ERROR
            | command::ECHO_RESPONSE
            | command::CLIENT_MESSAGE
            | command::CLIENT_REGISTERED => {
                debug!("Ignoring QR command {:02x} from {}: {}", cmd, addr, hex::encode(payload));
            }
            _ => {
                warn!("Unknown QR command {:02x} from {}: {}", cmd, addr, hex::encode(data));
            }
        }

        Ok(replies)
    }

    /// Pick up the secret key and platform from a heartbeat.
    async fn identify(&self, session: &mut QrSession, record: &ServerRecord) {
        let game_name = record.text("gamename").map(|s| s.into_owned());

        if let Some(name) = &game_name {
            match self.keys.get(name) {
                Some(key) => session.secret_key = key.to_string(),
                None => info!("Connection from unknown game '{}'", name),
            }
        }

        if session.player_id.is_some() {
            return;
        }
        let Some(pid) = record.int("dwc_pid") else {
            return;
        };
        session.player_id = Some(pid);

        session.platform = match game_name.as_deref().and_then(Platform::from_game_name) {
            Some(platform) => platform,
            None => match self.profiles.platform_for_profile(pid).await {
                Some(platform) => platform,
                None => {
                    debug!("No platform known for profile {}", pid);
                    Platform::default()
                }
            },
        };
    }

    async fn update_server_list(&self, session: &mut QrSession, record: ServerRecord) -> Result<(), ServerError> {
        let Some(game_id) = record.text("gamename").map(|s| s.into_owned()) else {
            warn!("Heartbeat for {:08x} has no gamename", session.session_id);
            return Ok(());
        };

        if record.text("statechanged").as_deref() == Some("2") {
            self.registry.delete(&game_id, session.session_id).await?;
            self.sessions.write().await.remove(&session.session_id);
            info!("Session {:08x} closed its {} server", session.session_id, game_id);
            return Ok(());
        }

        self.registry
            .upsert(&game_id, session.session_id, record, session.platform)
            .await?;
        session.game_id = game_id;
        Ok(())
    }

    /// Drop sessions that have been silent for the keepalive timeout.
    /// Returns the removed session ids.
    pub async fn sweep(&self, now: Instant) -> Vec<u32> {
        let sessions: Vec<(u32, Arc<Mutex<QrSession>>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();

        let mut removed = Vec::new();
        for (session_id, session) in sessions {
            let session = session.lock().await;
            let silent = now.saturating_duration_since(session.last_keepalive);
            if silent < self.keepalive_timeout {
                continue;
            }

            if let Err(e) = self.registry.delete(&session.game_id, session_id).await {
                error!("Failed to delete expired session {:08x}: {}", session_id, e);
                continue;
            }
            self.sessions.write().await.remove(&session_id);
            debug!(
                "Keepalive check removed {} for game {} after {}s",
                session.addr,
                session.game_id,
                silent.as_secs()
            );
            removed.push(session_id);
        }
        removed
    }
}

/// Fill in `publicip` and correct `publicport` from the observed address.
fn fix_public_address(record: &mut ServerRecord, addr: SocketAddr, platform: Platform) -> Result<(), ServerError> {
    if record.text("publicip").as_deref() == Some("0") {
        let ip = peer_ipv4(&addr)?;
        record.set("publicip", ip_to_int(ip, platform.byte_order()).to_string());
    }

    let public = record.text("publicport").map(|s| s.into_owned());
    let local = record.text("localport").map(|s| s.into_owned());
    if let (Some(public), Some(local)) = (public, local) {
        if public != local {
            debug!("publicport {} doesn't match localport {}, using {}", public, local, addr.port());
            record.set("publicport", addr.port().to_string());
        }
    }
    Ok(())
}

/// Six random characters, `00`, then the observed address in hex.
fn make_challenge(addr: SocketAddr) -> Result<String, ServerError> {
    let ip = peer_ipv4(&addr)?;
    let prefix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    let ip_hex: String = ip.octets().iter().map(|b| format!("{:02X}", b)).collect();
    Ok(format!("{}00{}{:04X}", prefix, ip_hex, addr.port()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::wire::ByteOrder;
    use crate::network::profile::StaticProfileDirectory;
    use crate::registry::Registry;
    use std::net::Ipv4Addr;

    const KEY: &str = "9r3Rmy";

    fn server_with(profiles: StaticProfileDirectory) -> (Arc<QrServer>, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let keys = Arc::new(SecretKeyTable::from_pairs([("mariokartwii", KEY), ("tetrisds", "Iw3Wf9")]));
        let server = QrServer::new(&ServerConfig::default(), registry.clone(), keys, Arc::new(profiles));
        (Arc::new(server), registry)
    }

    fn server() -> (Arc<QrServer>, Arc<Registry>) {
        server_with(StaticProfileDirectory::new())
    }

    fn packet(cmd: u8, session_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![cmd];
        data.extend_from_slice(&session_id.to_le_bytes());
        data.extend_from_slice(payload);
        data
    }

    fn heartbeat(pairs: &[(&str, &str)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (k, v) in pairs {
            out.extend_from_slice(k.as_bytes());
            out.push(0);
            out.extend_from_slice(v.as_bytes());
            out.push(0);
        }
        out.push(0);
        out
    }

    fn host_heartbeat(game: &str, publicport: &str) -> Vec<u8> {
        heartbeat(&[
            ("localip0", "192.168.1.20"),
            ("localport", "52000"),
            ("natneg", "1"),
            ("gamename", game),
            ("publicip", "0"),
            ("publicport", publicport),
            ("dwc_pid", "600000001"),
            ("numplayers", "1"),
        ])
    }

    fn addr() -> SocketAddr {
        "203.0.113.7:40000".parse().unwrap()
    }

    /// Register a session through the full handshake.
    async fn register(server: &QrServer, session_id: u32, game: &str, now: Instant) {
        let replies = server
            .handle_packet(&packet(command::HEARTBEAT, session_id, &host_heartbeat(game, "52000")), addr(), now)
            .await
            .unwrap();
        let challenge = &replies[0][7..replies[0].len() - 1];
        let answer = prepare_rc4_base64(server.keys.key_bytes(game), challenge);
        let mut payload = answer.into_bytes();
        payload.push(0);
        let replies = server
            .handle_packet(&packet(command::CHALLENGE, session_id, &payload), addr(), now)
            .await
            .unwrap();
        assert_eq!(replies[0][..3], [0xfe, 0xfd, command::CLIENT_REGISTERED]);
    }

    #[tokio::test]
    async fn test_availability_creates_no_session() {
        let (server, _) = server();
        let mut data = vec![command::AVAILABLE, 0, 0, 0, 0];
        data.extend_from_slice(b"mariokartwii\0");

        let replies = server.handle_packet(&data, addr(), Instant::now()).await.unwrap();
        assert_eq!(replies, vec![vec![0xfe, 0xfd, 0x09, 0, 0, 0, 0]]);
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_first_heartbeat_sends_challenge() {
        let (server, registry) = server();
        let session_id = 0x1234_5678;
        let data = packet(command::HEARTBEAT, session_id, &host_heartbeat("mariokartwii", "52000"));

        let replies = server.handle_packet(&data, addr(), Instant::now()).await.unwrap();
        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert_eq!(reply[..3], [0xfe, 0xfd, command::CHALLENGE]);
        assert_eq!(reply[3..7], session_id.to_le_bytes());
        assert_eq!(*reply.last().unwrap(), 0);

        let challenge = std::str::from_utf8(&reply[7..reply.len() - 1]).unwrap();
        assert_eq!(challenge.len(), 6 + 2 + 8 + 4);
        assert!(challenge[..6].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(&challenge[6..], "00CB0071079C40");

        // Nothing is registered before the answer.
        assert!(registry.get_all().await.is_empty());
        let session = server.session(session_id).await.unwrap();
        assert!(session.sent_challenge);
        assert_eq!(session.platform, Platform::Wii);
        assert_eq!(session.secret_key, KEY);
    }

    #[tokio::test]
    async fn test_handshake_registers_pending_heartbeat() {
        let (server, registry) = server();
        register(&server, 7, "mariokartwii", Instant::now()).await;

        let all = registry.get_all().await;
        let record = &all["mariokartwii"][0];
        let expected_ip = ip_to_int(Ipv4Addr::new(203, 0, 113, 7), ByteOrder::Big).to_string();
        assert_eq!(record.text("publicip").as_deref(), Some(expected_ip.as_str()));
        assert_eq!(record.text("publicport").as_deref(), Some("52000"));
        assert_eq!(record.session_id(), Some(7));
        assert_eq!(record.platform(), Platform::Wii);
    }

    #[tokio::test]
    async fn test_mismatched_publicport_uses_source_port() {
        let (server, registry) = server();
        register(&server, 8, "tetrisds", Instant::now()).await;

        let data = packet(command::HEARTBEAT, 8, &host_heartbeat("tetrisds", "1"));
        assert!(server.handle_packet(&data, addr(), Instant::now()).await.unwrap().is_empty());

        let record = &registry.get_all().await["tetrisds"][0];
        assert_eq!(record.text("publicport").as_deref(), Some("40000"));
        let expected_ip = ip_to_int(Ipv4Addr::new(203, 0, 113, 7), ByteOrder::Little).to_string();
        assert_eq!(record.text("publicip").as_deref(), Some(expected_ip.as_str()));
    }

    #[tokio::test]
    async fn test_wrong_answer_allows_new_challenge() {
        let (server, registry) = server();
        let now = Instant::now();
        let data = packet(command::HEARTBEAT, 9, &host_heartbeat("mariokartwii", "52000"));
        server.handle_packet(&data, addr(), now).await.unwrap();

        let replies = server
            .handle_packet(&packet(command::CHALLENGE, 9, b"bogus\0"), addr(), now)
            .await
            .unwrap();
        assert!(replies.is_empty());
        assert!(!server.session(9).await.unwrap().sent_challenge);
        assert!(registry.get_all().await.is_empty());

        // Next heartbeat asks again.
        let replies = server.handle_packet(&data, addr(), now).await.unwrap();
        assert_eq!(replies[0][2], command::CHALLENGE);
    }

    #[tokio::test]
    async fn test_statechanged_two_closes_session() {
        let (server, registry) = server();
        register(&server, 10, "mariokartwii", Instant::now()).await;

        let close = heartbeat(&[("gamename", "mariokartwii"), ("statechanged", "2")]);
        server
            .handle_packet(&packet(command::HEARTBEAT, 10, &close), addr(), Instant::now())
            .await
            .unwrap();

        assert!(registry.get_all().await["mariokartwii"].is_empty());
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_platform_from_profile() {
        let mut profiles = StaticProfileDirectory::new();
        profiles.insert(600000001, Platform::Wii);
        let (server, _) = server_with(profiles);

        let data = packet(command::HEARTBEAT, 11, &host_heartbeat("unknowngame", "52000"));
        server.handle_packet(&data, addr(), Instant::now()).await.unwrap();
        assert_eq!(server.session(11).await.unwrap().platform, Platform::Wii);
    }

    #[tokio::test]
    async fn test_sweep_expires_silent_sessions() {
        let (server, registry) = server();
        let start = Instant::now();
        register(&server, 20, "mariokartwii", start).await;
        register(&server, 21, "mariokartwii", start).await;

        let later = start + Duration::from_secs(30);
        server
            .handle_packet(&packet(command::KEEPALIVE, 21, &[]), addr(), later)
            .await
            .unwrap();

        assert!(server.sweep(start + Duration::from_secs(59)).await.is_empty());
        assert_eq!(server.sweep(start + Duration::from_secs(60)).await, vec![20]);

        let all = registry.get_all().await;
        assert_eq!(all["mariokartwii"].len(), 1);
        assert_eq!(all["mariokartwii"][0].session_id(), Some(21));
        assert_eq!(server.sweep(later + Duration::from_secs(60)).await, vec![21]);
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_packet_waiting_on_removed_session_starts_fresh() {
        let (server, registry) = server();
        let now = Instant::now();
        register(&server, 40, "mariokartwii", now).await;

        // Hold the session the way the sweep does while removing it.
        let removed = server.sessions.read().await.get(&40).cloned().unwrap();
        let guard = removed.lock().await;

        let waiting = {
            let server = server.clone();
            let data = packet(command::HEARTBEAT, 40, &host_heartbeat("mariokartwii", "52000"));
            tokio::spawn(async move { server.handle_packet(&data, addr(), now).await })
        };
        while Arc::strong_count(&removed) < 3 {
            tokio::task::yield_now().await;
        }

        registry.delete("mariokartwii", 40).await;
        server.sessions.write().await.remove(&40);
        drop(guard);

        let replies = waiting.await.unwrap().unwrap();
        assert_eq!(replies[0][..3], [0xfe, 0xfd, command::CHALLENGE]);
        assert!(registry.get_all().await["mariokartwii"].is_empty());
        assert!(server.session(40).await.unwrap().pending.is_some());
    }

    #[tokio::test]
    async fn test_ignored_and_unknown_commands_reply_nothing() {
        let (server, registry) = server();
        let now = Instant::now();
        for cmd in [command::QUERY, command::ECHO, command::CLIENT_MESSAGE_ACK, 0x42] {
            let replies = server.handle_packet(&packet(cmd, 30, b"\x01\x02"), addr(), now).await.unwrap();
            assert!(replies.is_empty());
        }
        assert!(registry.get_all().await.values().all(|servers| servers.is_empty()));
        assert!(server.session(30).await.is_some());
    }

    #[tokio::test]
    async fn test_short_packet_is_rejected() {
        let (server, _) = server();
        assert!(server.handle_packet(&[command::HEARTBEAT, 1, 2], addr(), Instant::now()).await.is_err());
        assert!(server.handle_packet(&[], addr(), Instant::now()).await.unwrap().is_empty());
    }
}
