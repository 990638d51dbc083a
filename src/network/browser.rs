//! Server Browser
//!
//! TCP service clients use to list hosted sessions and to reach a host
//! behind its NAT. Requests are length-prefixed frames; list replies are
//! EncTypeX-encrypted with the game's secret key and the client's
//! challenge.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use super::natneg::NATNEG_MAGIC;
use super::qr::command::CLIENT_MESSAGE;
use super::{peer_ipv4, ServerError};
use crate::config::ServerConfig;
use crate::core::enctypex;
use crate::core::wire::{
    int_to_bytes, ip_to_int, parse_ip, read_array, read_cstr, read_u16_be, read_u16_le, read_u32_be, read_u32_le,
};
use crate::core::{Platform, SecretKeyTable, WireError};
use crate::registry::{RegistryApi, SearchResult, ServerRecord, CONSOLE_FIELD};

/// Client commands.
pub mod command {
    /// Server list request.
    pub const LIST_REQUEST: u8 = 0x00;
    /// Server info request (unused).
    pub const INFO_REQUEST: u8 = 0x01;
    /// Send message request.
    pub const SEND_MESSAGE: u8 = 0x02;
    /// Keepalive reply.
    pub const KEEPALIVE_REPLY: u8 = 0x03;
}

/// List request option bits.
pub mod options {
    /// Reply with the client's own address only.
    pub const NO_SERVER_LIST: u32 = 0x02;
    /// An alternate source address follows.
    pub const ALTERNATE_SOURCE_IP: u32 = 0x08;
    /// A result limit follows.
    pub const LIMIT_RESULT_COUNT: u32 = 0x80;
}

/// Per-server flag bits.
pub mod flags {
    /// Private address follows.
    pub const PRIVATE_IP: u8 = 0x02;
    /// Host supports NAT negotiation.
    pub const CONNECT_NEGOTIATE: u8 = 0x04;
    /// ICMP address follows.
    pub const ICMP_IP: u8 = 0x08;
    /// Public port follows.
    pub const NONSTANDARD_PORT: u8 = 0x10;
    /// Private port follows.
    pub const NONSTANDARD_PRIVATE_PORT: u8 = 0x20;
    /// Field values follow.
    pub const HAS_KEYS: u8 = 0x40;
}

/// Plaintext size at which a list reply is flushed as its own message.
pub const MAX_CHUNK_LEN: usize = 256 + 511 + 255;

/// Port reported back by an address-only reply.
const OWN_ADDRESS_PORT: u16 = 6500;

/// Prefixes of the message that carries the sender's own host address.
const SBCM_MAGICS: [[u8; 4]; 2] = [[0xbb, 0x49, 0xcc, 0x4d], *b"SBCM"];

/// Frame assembly state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Fewer than two bytes buffered.
    AwaitingHeader,
    /// Length known, frame incomplete.
    AwaitingMore {
        /// Bytes buffered so far.
        bytes_so_far: usize,
        /// Declared frame length.
        expected_len: usize,
    },
}

/// Splits a TCP byte stream into frames prefixed by a big-endian u16
/// length that counts the prefix itself.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: BytesMut,
    state: FrameState,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    /// Empty assembler.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(u16::MAX as usize),
            state: FrameState::AwaitingHeader,
        }
    }

    /// Current state.
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Feed received bytes. Returns every frame now complete.
    ///
    /// A declared length shorter than a command frame is fatal for the
    /// connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>, ServerError> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            if self.buffer.len() < 2 {
                self.state = FrameState::AwaitingHeader;
                break;
            }

            let expected_len = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
            if expected_len < 3 {
                return Err(ServerError::BadFrame(expected_len));
            }

            if self.buffer.len() < expected_len {
                self.state = FrameState::AwaitingMore {
                    bytes_so_far: self.buffer.len(),
                    expected_len,
                };
                break;
            }

            frames.push(self.buffer.split_to(expected_len).freeze());
        }

        Ok(frames)
    }
}

/// A decoded list request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    /// List protocol version.
    pub list_version: u8,
    /// Encoding version.
    pub encoding_version: u8,
    /// Game version.
    pub game_version: u32,
    /// Game whose servers are listed.
    pub query_game: String,
    /// Game whose key encrypts the reply.
    pub game_name: String,
    /// Client challenge.
    pub challenge: [u8; 8],
    /// Filter expression.
    pub filter: String,
    /// Requested fields.
    pub fields: Vec<String>,
    /// Option bits.
    pub options: u32,
    /// Result limit.
    pub max_servers: Option<u32>,
    /// Alternate source address.
    pub source_ip: Option<Ipv4Addr>,
    /// Reply with the client's address only.
    pub send_ip: bool,
}

impl ListRequest {
    /// Decode a list request frame.
    pub fn parse(frame: &[u8]) -> Result<Self, WireError> {
        let [list_version, encoding_version] = read_array::<2>(frame, 3)?;
        let game_version = read_u32_le(frame, 5)?;
        let (query_game, idx) = read_cstr(frame, 9)?;
        let (game_name, idx) = read_cstr(frame, idx)?;
        let challenge = read_array::<8>(frame, idx)?;
        let (filter, idx) = read_cstr(frame, idx + 8)?;
        let (fields, idx) = read_cstr(frame, idx)?;
        let options = read_u32_be(frame, idx)?;
        let idx = idx + 4;

        let mut request = Self {
            list_version,
            encoding_version,
            game_version,
            query_game,
            game_name,
            challenge,
            filter,
            fields: fields
                .split('\\')
                .filter(|f| !f.trim().is_empty())
                .map(str::to_string)
                .collect(),
            options,
            max_servers: None,
            source_ip: None,
            send_ip: false,
        };

        if options & options::LIMIT_RESULT_COUNT != 0 {
            request.max_servers = Some(read_u32_le(frame, idx)?);
        } else if options & options::ALTERNATE_SOURCE_IP != 0 {
            request.source_ip = Some(Ipv4Addr::from(read_array::<4>(frame, idx)?));
        } else if options & options::NO_SERVER_LIST != 0 {
            request.send_ip = true;
        }

        Ok(request)
    }
}

/// Something a browser connection wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Bytes for the TCP client.
    Reply(Vec<u8>),
    /// Datagram for a host, sent from the QR socket.
    Forward {
        /// Datagram.
        packet: Vec<u8>,
        /// Host address.
        dest: SocketAddr,
    },
}

/// State of one browser client.
pub struct BrowserConnection {
    peer: SocketAddr,
    platform: Platform,
    own_server: Option<ServerRecord>,
    registry: Arc<dyn RegistryApi>,
    keys: Arc<SecretKeyTable>,
}

impl BrowserConnection {
    /// New connection from `peer`.
    pub fn new(peer: SocketAddr, registry: Arc<dyn RegistryApi>, keys: Arc<SecretKeyTable>) -> Self {
        Self {
            peer,
            platform: Platform::default(),
            own_server: None,
            registry,
            keys,
        }
    }

    /// Handle one complete frame.
    pub async fn handle_frame(&mut self, frame: &[u8]) -> Result<Vec<Outbound>, ServerError> {
        let Some(&cmd) = frame.get(2) else {
            return Err(ServerError::BadFrame(frame.len()));
        };

        match cmd {
            command::LIST_REQUEST => {
                let request = ListRequest::parse(frame)?;
                debug!(
                    "List request from {}: list version {:02x}, encoding {:02x}, game version {:08x}, \
                     query game {}, game name {}, filter {:?}, fields {:?}, options {:08x}",
                    self.peer,
                    request.list_version,
                    request.encoding_version,
                    request.game_version,
                    request.query_game,
                    request.game_name,
                    request.filter,
                    request.fields,
                    request.options
                );
                self.list(&request).await
            }
            command::SEND_MESSAGE => self.send_message(frame).await,
            command::KEEPALIVE_REPLY => {
                debug!("Keepalive from {}", self.peer);
                Ok(Vec::new())
            }
            _ => {
                debug!("Unknown browser command {:02x} from {}: {}", cmd, self.peer, hex::encode(frame));
                Ok(Vec::new())
            }
        }
    }

    async fn list(&mut self, request: &ListRequest) -> Result<Vec<Outbound>, ServerError> {
        let peer_ip = peer_ipv4(&self.peer)?;

        let chunks = if (request.filter.is_empty() && request.fields.is_empty()) || request.send_ip {
            debug!("Responding to {} with its own address", self.peer);
            let mut data = peer_ip.octets().to_vec();
            data.extend_from_slice(&OWN_ADDRESS_PORT.to_be_bytes());
            vec![data]
        } else {
            let results = self
                .registry
                .search(&request.query_game, &request.filter, &request.fields, request.max_servers)
                .await?;
            debug!("Found {} {} servers for {}", results.len(), request.query_game, self.peer);
            self.encode_server_list(peer_ip, &request.fields, &results)
        };

        let key = self.keys.key_bytes(&request.game_name);
        let mut out = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match enctypex::encrypt(key, &request.challenge, &chunk) {
                Some(encrypted) => out.push(Outbound::Reply(encrypted)),
                None => {
                    warn!("Cannot encrypt list for unknown game '{}'", request.game_name);
                    return Ok(Vec::new());
                }
            }
        }
        Ok(out)
    }

    /// Plaintext list, split into chunks of at least [`MAX_CHUNK_LEN`].
    ///
    /// The byte order of each server's public address follows that server's
    /// platform, and the last one seen sticks to the connection.
    pub fn encode_server_list(&mut self, peer_ip: Ipv4Addr, fields: &[String], results: &[SearchResult]) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();

        let mut data = Vec::new();
        data.extend_from_slice(&peer_ip.octets());
        data.extend_from_slice(&self.peer.port().to_be_bytes());
        data.extend_from_slice(&(fields.len() as u16).to_le_bytes());
        for field in fields {
            data.extend_from_slice(field.as_bytes());
            data.extend_from_slice(&[0, 0]);
        }

        for result in results {
            if result.record.contains(CONSOLE_FIELD) {
                self.platform = result.record.platform();
            }

            match encode_server(result, fields, self.platform) {
                Some(entry) => data.extend_from_slice(&entry),
                None => warn!("Skipping server with bad address fields: {:?}", result.record),
            }

            if data.len() >= MAX_CHUNK_LEN {
                chunks.push(std::mem::take(&mut data));
            }
        }

        data.push(0);
        data.extend_from_slice(&[0xff; 4]);
        chunks.push(data);
        chunks
    }

    async fn send_message(&mut self, frame: &[u8]) -> Result<Vec<Outbound>, ServerError> {
        let dest_ip = Ipv4Addr::from(read_array::<4>(frame, 3)?);
        let dest_port = read_u16_be(frame, 7)?;
        let payload = &frame[9..];
        debug!(
            "Send message from {} to {}:{}: {}",
            self.peer,
            dest_ip,
            dest_port,
            hex::encode(payload)
        );

        let Some(server) = self.find_server(dest_ip, dest_port).await? else {
            debug!("No server at {}:{}", dest_ip, dest_port);
            return Ok(Vec::new());
        };

        // Port 0 finds any host on the address; only one that advertised
        // public port 0 is reached, through its local port.
        if server.text("publicport").as_deref() != Some(dest_port.to_string().as_str()) {
            debug!("Server at {}:{} advertises another public port", dest_ip, dest_port);
            return Ok(Vec::new());
        }

        let mut dest = SocketAddr::from((dest_ip, dest_port));
        if dest_port == 0 {
            if let Some(port) = server.int("localport").and_then(|p| u16::try_from(p).ok()) {
                dest.set_port(port);
            }
        }

        if self.own_server.is_none() && payload.len() >= 16 && SBCM_MAGICS.iter().any(|m| payload[..4] == m[..]) {
            let own_port = read_u16_le(payload, 10)?;
            let own_ip = Ipv4Addr::from(read_array::<4>(payload, 12)?);
            self.own_server = self.find_server(own_ip, own_port).await?;
            match &self.own_server {
                Some(_) => debug!("Found own server for {} at {}:{}", self.peer, own_ip, own_port),
                None => debug!("Could not find own server at {}:{}", own_ip, own_port),
            }
        } else if payload.len() == 10 && payload[..6] == NATNEG_MAGIC {
            let cookie = i32::from_le_bytes(read_array::<4>(payload, 6)?);
            debug!("Adding {} to natneg server list", cookie);
            self.registry.add_natneg_server(cookie, server.clone()).await?;
            if let Some(own) = &self.own_server {
                self.registry.add_natneg_server(cookie, own.clone()).await?;
            }
        }

        let Some(session_id) = server.session_id() else {
            warn!("Server at {} has no session id", dest);
            return Ok(Vec::new());
        };

        let mut packet = vec![0xfe, 0xfd, CLIENT_MESSAGE];
        packet.extend_from_slice(&session_id.to_le_bytes());
        packet.extend_from_slice(&rand::random::<u32>().to_le_bytes());
        packet.extend_from_slice(payload);

        Ok(vec![Outbound::Forward { packet, dest }])
    }

    /// Look a host up by public address, in this connection's byte order
    /// first.
    async fn find_server(&self, ip: Ipv4Addr, port: u16) -> Result<Option<ServerRecord>, ServerError> {
        for platform in [self.platform, self.platform.other()] {
            let packed = ip_to_int(ip, platform.byte_order()).to_string();
            if let Some(server) = self.registry.find_by_public_address(&packed, Some(port), None).await? {
                return Ok(Some(server));
            }
        }
        Ok(None)
    }
}

/// One server entry. `None` when an address field is unusable.
fn encode_server(result: &SearchResult, fields: &[String], platform: Platform) -> Option<Vec<u8>> {
    let record = &result.record;
    let mut flag = flags::HAS_KEYS | flags::NONSTANDARD_PORT | flags::ICMP_IP;
    let mut body = Vec::with_capacity(16);

    if record.contains("natneg") {
        flag |= flags::CONNECT_NEGOTIATE;
    }

    let public_ip = i32::try_from(record.int("publicip")?).ok()?;
    body.extend_from_slice(&int_to_bytes(public_ip, platform.byte_order()));

    let port = match record.text("publicport") {
        Some(port) if port != "0" => port.parse::<u16>().ok()?,
        _ => record.text("localport")?.parse::<u16>().ok()?,
    };
    body.extend_from_slice(&port.to_be_bytes());

    if let Some(local_ip) = record.text("localip0") {
        flag |= flags::PRIVATE_IP;
        body.extend_from_slice(&parse_ip(&local_ip).ok()?.octets());
    }

    if let Some(local_port) = record.text("localport") {
        flag |= flags::NONSTANDARD_PRIVATE_PORT;
        body.extend_from_slice(&local_port.parse::<u16>().ok()?.to_be_bytes());
    }

    body.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());

    let mut out = vec![flag];
    out.extend_from_slice(&body);
    for field in fields {
        out.push(0xff);
        if let Some(value) = result.requested.text(field) {
            out.extend_from_slice(value.as_bytes());
        }
        out.push(0);
    }
    Some(out)
}

/// The server browser listener.
pub struct BrowserServer {
    bind_addr: SocketAddr,
    registry: Arc<dyn RegistryApi>,
    keys: Arc<SecretKeyTable>,
    forward: Arc<UdpSocket>,
    shutdown_tx: broadcast::Sender<()>,
}

impl BrowserServer {
    /// Create a browser server. `forward` is the QR socket, or any UDP
    /// socket when the QR server runs elsewhere.
    pub fn new(
        config: &ServerConfig,
        registry: Arc<dyn RegistryApi>,
        keys: Arc<SecretKeyTable>,
        forward: Arc<UdpSocket>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            bind_addr: config.browser_addr(),
            registry,
            keys,
            forward,
            shutdown_tx,
        }
    }

    /// Bind and serve until shutdown.
    #[instrument(skip(self), fields(addr = %self.bind_addr))]
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!("Server browser listening on {}", self.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Browser connection from {}", addr);
                            let connection = BrowserConnection::new(addr, self.registry.clone(), self.keys.clone());
                            let forward = self.forward.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, connection, forward).await {
                                    warn!("Browser connection {} closed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
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

    /// Signal the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Serve one client until it disconnects. Frames that fail to parse or
/// resolve are logged and skipped; only socket errors and an unusable
/// length prefix end the connection.
async fn handle_connection<S>(
    mut stream: S,
    mut connection: BrowserConnection,
    forward: Arc<UdpSocket>,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut assembler = FrameAssembler::new();
    let mut buf = vec![0u8; 4096];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            debug!("Browser client {} disconnected", connection.peer);
            return Ok(());
        }

        for frame in assembler.push(&buf[..n])? {
            let outbound = match connection.handle_frame(&frame).await {
                Ok(outbound) => outbound,
                Err(ServerError::Io(e)) => return Err(ServerError::Io(e)),
                Err(e) => {
                    warn!("Bad request from {}: {}", connection.peer, e);
                    continue;
                }
            };

            for outbound in outbound {
                match outbound {
                    Outbound::Reply(data) => stream.write_all(&data).await?,
                    Outbound::Forward { packet, dest } => {
                        debug!("Forwarding {} bytes to {}", packet.len(), dest);
                        forward.send_to(&packet, dest).await?;
                    }
                }
            }
        }
    }
}
