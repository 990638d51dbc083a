//! Network Layer
//!
//! The three client-facing front-ends. Each owns its socket and session
//! table and talks to the registry through [`RegistryApi`], so it can run
//! beside the registry or in its own process.
//!
//! [`RegistryApi`]: crate::registry::RegistryApi

pub mod browser;
pub mod natneg;
pub mod profile;
pub mod qr;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub use browser::{BrowserConnection, BrowserServer, FrameAssembler, Outbound};
pub use natneg::NatNegServer;
pub use profile::{ProfileDirectory, StaticProfileDirectory};
pub use qr::QrServer;

use crate::core::WireError;
use crate::registry::RegistryError;

/// Front-end errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Registry call failed.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Packet could not be decoded.
    #[error("Malformed packet: {0}")]
    Wire(#[from] WireError),

    /// Browser frame declared an impossible length.
    #[error("Bad frame length: {0}")]
    BadFrame(usize),

    /// Peer is not reachable over IPv4.
    #[error("Not an IPv4 peer: {0}")]
    NotIpv4(SocketAddr),
}

/// IPv4 form of a peer address, unwrapping IPv4-mapped IPv6.
pub fn peer_ipv4(addr: &SocketAddr) -> Result<Ipv4Addr, ServerError> {
    match addr.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped().ok_or(ServerError::NotIpv4(*addr)),
    }
}
