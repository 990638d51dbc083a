//! # DWC Master Server
//!
//! Matchmaking backend for DWC-era console games: hosts announce their
//! sessions, clients list them with filter expressions, and the two sides
//! are introduced through NAT negotiation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DWC MASTER SERVER                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Protocol primitives                       │
//! │  ├── rc4.rs      - XOR cipher and GameSpy RC4 variant        │
//! │  ├── enctypex.rs - Server list stream cipher                 │
//! │  ├── wire.rs     - Byte order, C strings, key/value lists    │
//! │  └── keys.rs     - Per-game secret key table                 │
//! │                                                              │
//! │  filter/         - Untrusted filter expressions              │
//! │  ├── lexer.rs    - Tokenizer                                 │
//! │  ├── ast.rs      - Parser and validation                     │
//! │  └── eval.rs     - Evaluation against a record               │
//! │                                                              │
//! │  registry/       - Shared server table                       │
//! │  ├── record.rs   - Server records                            │
//! │  ├── store.rs    - In-memory registry                        │
//! │  ├── rpc.rs      - TCP service and client                    │
//! │  └── stats.rs    - Redacted JSON snapshot                    │
//! │                                                              │
//! │  network/        - Client-facing front-ends                  │
//! │  ├── qr.rs       - Heartbeats and challenges (UDP)           │
//! │  ├── browser.rs  - Encrypted server lists (TCP)              │
//! │  ├── natneg.rs   - NAT negotiation relay (UDP)               │
//! │  └── profile.rs  - Profile platform lookups                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data flow
//!
//! A QR heartbeat upserts a record. A browser list request searches the
//! registry and returns an EncTypeX-encrypted list. A browser send-message
//! is forwarded to the host through the QR socket, after which both peers
//! start NAT negotiation and the relay introduces them.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod filter;
pub mod network;
pub mod registry;

// Re-export commonly used types
pub use config::{ConfigError, ServerConfig};
pub use core::{Platform, SecretKeyTable};
pub use filter::{Filter, FilterError};
pub use network::{BrowserServer, NatNegServer, QrServer, ServerError};
pub use registry::{Registry, RegistryApi, RegistryError, RemoteRegistry, ServerRecord};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
