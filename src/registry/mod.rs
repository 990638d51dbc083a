//! Server Registry
//!
//! Shared table of hosted game sessions. QR heartbeats write it, the server
//! browser searches it and the NAT negotiation relay resolves addresses
//! from it. It can run in-process or behind the RPC service in [`rpc`].

pub mod record;
pub mod rpc;
pub mod stats;
pub mod store;

pub use record::{FieldValue, SearchResult, ServerRecord, CONSOLE_FIELD, SESSION_FIELD};
pub use rpc::{RegistryServer, RemoteRegistry};
pub use stats::snapshot;
pub use store::{Registry, RegistryApi};

/// Registry errors.
///
/// The in-process registry never fails; these come from the RPC layer.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Frame exceeds the size limit.
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// The service reported a failure.
    #[error("Remote error: {0}")]
    Remote(String),

    /// The service closed the connection mid-call.
    #[error("Registry disconnected")]
    Disconnected,

    /// Reply did not match the request.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}
