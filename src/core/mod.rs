//! Protocol primitives.
//!
//! Ciphers, byte-order helpers and the secret key table shared by every
//! front-end. Nothing here touches the network or holds shared state.

pub mod enctypex;
pub mod keys;
pub mod rc4;
pub mod wire;

pub use keys::{KeyError, SecretKeyTable};
pub use rc4::{prepare_rc4_base64, rc4_encrypt, xor_cycle};
pub use wire::{ByteOrder, LocalAddr, Platform, WireError};
