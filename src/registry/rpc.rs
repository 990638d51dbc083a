//! Registry RPC
//!
//! The registry runs as its own service so the QR, server browser and NAT
//! negotiation front-ends can live in separate processes. Frames are a
//! big-endian u32 length followed by a bincode body; each request gets
//! exactly one response on the same connection.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, instrument, warn};

use super::record::{SearchResult, ServerRecord};
use super::store::{Registry, RegistryApi};
use super::RegistryError;
use crate::core::wire::LocalAddr;
use crate::core::Platform;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A registry call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// [`RegistryApi::upsert`]
    Upsert {
        /// Game id.
        game_id: String,
        /// QR session id.
        session_id: u32,
        /// Heartbeat fields.
        fields: ServerRecord,
        /// Client platform.
        platform: Platform,
    },
    /// [`RegistryApi::delete`]
    Delete {
        /// Game id.
        game_id: String,
        /// QR session id.
        session_id: u32,
    },
    /// [`RegistryApi::search`]
    Search {
        /// Game id.
        game_id: String,
        /// Filter expression.
        filter: String,
        /// Requested fields.
        fields: Vec<String>,
        /// Result limit.
        max_results: Option<u32>,
    },
    /// [`RegistryApi::find_by_public_address`]
    FindByPublicAddress {
        /// Packed public IP text.
        ip: String,
        /// Public port.
        port: Option<u16>,
        /// Game id.
        game_id: Option<String>,
    },
    /// [`RegistryApi::find_by_local_address`]
    FindByLocalAddress {
        /// Observed public IP.
        public_ip: Ipv4Addr,
        /// Reported local address.
        local: LocalAddr,
        /// Game id.
        game_id: Option<String>,
    },
    /// [`RegistryApi::get_all`]
    GetAll,
    /// [`RegistryApi::add_natneg_server`]
    AddNatnegServer {
        /// Natneg cookie.
        cookie: i32,
        /// Target server.
        server: ServerRecord,
    },
    /// [`RegistryApi::get_natneg_servers`]
    GetNatnegServers {
        /// Natneg cookie.
        cookie: i32,
    },
    /// [`RegistryApi::delete_natneg_server`]
    DeleteNatnegServer {
        /// Natneg cookie.
        cookie: i32,
    },
}

impl Request {
    /// Whether sending the request twice leaves the registry as sending it
    /// once would.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Request::AddNatnegServer { .. })
    }
}

/// A registry reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Call completed without a value.
    Done,
    /// Stored record.
    Record(ServerRecord),
    /// Search hits.
    Results(Vec<SearchResult>),
    /// Lookup result.
    Found(Option<ServerRecord>),
    /// Full snapshot.
    All(BTreeMap<String, Vec<ServerRecord>>),
    /// Natneg cookie targets.
    Servers(Vec<ServerRecord>),
    /// Server-side failure.
    Error(String),
}

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), RegistryError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(RegistryError::FrameTooLarge(body.len()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one raw frame body. `Ok(None)` on clean EOF.
pub async fn read_frame_bytes<R>(reader: &mut R) -> Result<Option<Vec<u8>>, RegistryError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(RegistryError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Read and decode one frame. `Ok(None)` on clean EOF.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, RegistryError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    match read_frame_bytes(reader).await? {
        Some(body) => Ok(Some(bincode::deserialize(&body)?)),
        None => Ok(None),
    }
}

/// Apply one request to a local registry.
pub async fn dispatch(registry: &Registry, request: Request) -> Response {
    match request {
        Request::Upsert {
            game_id,
            session_id,
            fields,
            platform,
        } => Response::Record(registry.upsert(&game_id, session_id, fields, platform).await),
        Request::Delete { game_id, session_id } => {
            registry.delete(&game_id, session_id).await;
            Response::Done
        }
        Request::Search {
            game_id,
            filter,
            fields,
            max_results,
        } => Response::Results(registry.search(&game_id, &filter, &fields, max_results).await),
        Request::FindByPublicAddress { ip, port, game_id } => {
            Response::Found(registry.find_by_public_address(&ip, port, game_id.as_deref()).await)
        }
        Request::FindByLocalAddress {
            public_ip,
            local,
            game_id,
        } => Response::Found(
            registry
                .find_by_local_address(public_ip, local, game_id.as_deref())
                .await,
        ),
        Request::GetAll => Response::All(registry.get_all().await),
        Request::AddNatnegServer { cookie, server } => {
            registry.add_natneg_server(cookie, server).await;
            Response::Done
        }
        Request::GetNatnegServers { cookie } => Response::Servers(registry.get_natneg_servers(cookie).await),
        Request::DeleteNatnegServer { cookie } => {
            registry.delete_natneg_server(cookie).await;
            Response::Done
        }
    }
}

/// TCP service exposing a [`Registry`].
pub struct RegistryServer {
    bind_addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RegistryServer {
    /// Create a service around `registry`.
    pub fn new(bind_addr: SocketAddr, registry: Arc<Registry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            bind_addr,
            registry,
            shutdown_tx,
        }
    }

    /// The served registry.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Bind and serve until shutdown.
    #[instrument(skip(self), fields(addr = %self.bind_addr))]
    pub async fn run(&self) -> Result<(), RegistryError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!("Registry listening on {}", self.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RegistryError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Registry client connected from {}", addr);
                            let registry = self.registry.clone();
                            let mut shutdown_rx = self.shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                tokio::select! {
                                    result = Self::handle_connection(stream, registry) => {
                                        if let Err(e) = result {
                                            warn!("Registry client {} dropped: {}", addr, e);
                                        }
                                    }
                                    _ = shutdown_rx.recv() => {}
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Registry shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(mut stream: TcpStream, registry: Arc<Registry>) -> Result<(), RegistryError> {
        while let Some(body) = read_frame_bytes(&mut stream).await? {
            let response = match bincode::deserialize::<Request>(&body) {
                Ok(request) => dispatch(&registry, request).await,
                Err(e) => {
                    warn!("Undecodable registry request: {}", e);
                    Response::Error(format!("bad request: {}", e))
                }
            };
            write_frame(&mut stream, &response).await?;
        }
        Ok(())
    }

    /// Stop accepting and drop open connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Idle connections a [`RemoteRegistry`] keeps open.
pub const MAX_IDLE_CONNECTIONS: usize = 8;

/// [`RegistryApi`] client for a remote [`RegistryServer`].
///
/// Each call checks a connection out of a small idle pool, or opens a new
/// one, so calls from different tasks run side by side. Idempotent calls
/// are retried once on a fresh connection; `AddNatnegServer` never is.
pub struct RemoteRegistry {
    addr: SocketAddr,
    idle: Mutex<Vec<TcpStream>>,
}

impl RemoteRegistry {
    /// Client for the service at `addr`. Connects lazily.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Connections currently parked in the pool.
    pub async fn idle_connections(&self) -> usize {
        self.idle.lock().await.len()
    }

    async fn checkout(&self) -> Result<TcpStream, RegistryError> {
        if let Some(stream) = self.idle.lock().await.pop() {
            return Ok(stream);
        }
        let stream = TcpStream::connect(self.addr).await?;
        debug!("Connected to registry at {}", self.addr);
        Ok(stream)
    }

    async fn checkin(&self, stream: TcpStream) {
        let mut idle = self.idle.lock().await;
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(stream);
        }
    }

    async fn call(&self, request: Request) -> Result<Response, RegistryError> {
        let attempts = if request.is_idempotent() { 2 } else { 1 };
        let mut last = RegistryError::Disconnected;

        for attempt in 0..attempts {
            let mut stream = self.checkout().await?;
            let result = async {
                write_frame(&mut stream, &request).await?;
                read_frame::<_, Response>(&mut stream).await
            }
            .await;

            match result {
                Ok(Some(response)) => {
                    self.checkin(stream).await;
                    return match response {
                        Response::Error(message) => Err(RegistryError::Remote(message)),
                        response => Ok(response),
                    };
                }
                Ok(None) => last = RegistryError::Disconnected,
                Err(e) => last = e,
            }

            if attempt + 1 < attempts {
                warn!("Registry call failed, reconnecting: {}", last);
            }
        }

        Err(last)
    }
}

fn unexpected(response: Response) -> RegistryError {
    RegistryError::UnexpectedResponse(format!("{:?}", response))
}

#[async_trait]
impl RegistryApi for RemoteRegistry {
    async fn upsert(
        &self,
        game_id: &str,
        session_id: u32,
        fields: ServerRecord,
        platform: Platform,
    ) -> Result<ServerRecord, RegistryError> {
        let request = Request::Upsert {
            game_id: game_id.to_string(),
            session_id,
            fields,
            platform,
        };
        match self.call(request).await? {
            Response::Record(record) => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, game_id: &str, session_id: u32) -> Result<(), RegistryError> {
        let request = Request::Delete {
            game_id: game_id.to_string(),
            session_id,
        };
        match self.call(request).await? {
            Response::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn search(
        &self,
        game_id: &str,
        filter: &str,
        fields: &[String],
        max_results: Option<u32>,
    ) -> Result<Vec<SearchResult>, RegistryError> {
        let request = Request::Search {
            game_id: game_id.to_string(),
            filter: filter.to_string(),
            fields: fields.to_vec(),
            max_results,
        };
        match self.call(request).await? {
            Response::Results(results) => Ok(results),
            other => Err(unexpected(other)),
        }
    }

    async fn find_by_public_address(
        &self,
        ip: &str,
        port: Option<u16>,
        game_id: Option<&str>,
    ) -> Result<Option<ServerRecord>, RegistryError> {
        let request = Request::FindByPublicAddress {
            ip: ip.to_string(),
            port,
            game_id: game_id.map(str::to_string),
        };
        match self.call(request).await? {
            Response::Found(found) => Ok(found),
            other => Err(unexpected(other)),
        }
    }

    async fn find_by_local_address(
        &self,
        public_ip: Ipv4Addr,
        local: LocalAddr,
        game_id: Option<&str>,
    ) -> Result<Option<ServerRecord>, RegistryError> {
        let request = Request::FindByLocalAddress {
            public_ip,
            local,
            game_id: game_id.map(str::to_string),
        };
        match self.call(request).await? {
            Response::Found(found) => Ok(found),
            other => Err(unexpected(other)),
        }
    }

    async fn get_all(&self) -> Result<BTreeMap<String, Vec<ServerRecord>>, RegistryError> {
        match self.call(Request::GetAll).await? {
            Response::All(all) => Ok(all),
            other => Err(unexpected(other)),
        }
    }

    async fn add_natneg_server(&self, cookie: i32, server: ServerRecord) -> Result<(), RegistryError> {
        match self.call(Request::AddNatnegServer { cookie, server }).await? {
            Response::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn get_natneg_servers(&self, cookie: i32) -> Result<Vec<ServerRecord>, RegistryError> {
        match self.call(Request::GetNatnegServers { cookie }).await? {
            Response::Servers(servers) => Ok(servers),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_natneg_server(&self, cookie: i32) -> Result<(), RegistryError> {
        match self.call(Request::DeleteNatnegServer { cookie }).await? {
            Response::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
