//! Wire Helpers
//!
//! Byte-level helpers shared by the QR, server browser and NAT negotiation
//! protocols: platform byte order, packed IPv4 integers, C strings and the
//! null-separated key/value lists used by heartbeats.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byte order used when an IPv4 address is packed into a 32-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Handheld family.
    Little,
    /// Home console family.
    Big,
}

/// Client platform. Decides the byte order of packed addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Handheld (DS, DSi). Little-endian.
    #[default]
    Ds,
    /// Home console (Wii). Big-endian.
    Wii,
}

impl Platform {
    /// Numeric tag stored in registry records.
    pub fn tag(self) -> i64 {
        match self {
            Platform::Ds => 0,
            Platform::Wii => 1,
        }
    }

    /// Platform from a registry tag. Any non-zero tag is the console family.
    pub fn from_tag(tag: i64) -> Self {
        if tag == 0 {
            Platform::Ds
        } else {
            Platform::Wii
        }
    }

    /// Byte order this platform packs addresses with.
    pub fn byte_order(self) -> ByteOrder {
        match self {
            Platform::Ds => ByteOrder::Little,
            Platform::Wii => ByteOrder::Big,
        }
    }

    /// The other platform family.
    pub fn other(self) -> Self {
        match self {
            Platform::Ds => Platform::Wii,
            Platform::Wii => Platform::Ds,
        }
    }

    /// Guess the platform from a game name suffix.
    pub fn from_game_name(game_name: &str) -> Option<Self> {
        const HANDHELD: [&str; 4] = ["ds", "dsam", "dsi", "dsiam"];
        const CONSOLE: [&str; 4] = ["wii", "wiiam", "wiiware", "wiiwaream"];

        if HANDHELD.iter().any(|s| game_name.ends_with(s)) {
            Some(Platform::Ds)
        } else if CONSOLE.iter().any(|s| game_name.ends_with(s)) {
            Some(Platform::Wii)
        } else {
            None
        }
    }
}

/// Wire decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Packet ended before a field could be read.
    #[error("packet truncated at offset {offset} (needed {needed} bytes)")]
    Truncated {
        /// Offset of the read.
        offset: usize,
        /// Bytes required.
        needed: usize,
    },

    /// A C string had no terminator.
    #[error("unterminated string at offset {0}")]
    UnterminatedString(usize),

    /// Dotted-quad address could not be parsed.
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),
}

/// Pack an address into a signed 32-bit integer, reading its octets in `order`.
///
/// This is the representation stored in the `publicip` field.
pub fn ip_to_int(ip: Ipv4Addr, order: ByteOrder) -> i32 {
    let octets = ip.octets();
    match order {
        ByteOrder::Little => i32::from_le_bytes(octets),
        ByteOrder::Big => i32::from_be_bytes(octets),
    }
}

/// Inverse of [`ip_to_int`].
pub fn int_to_ip(value: i32, order: ByteOrder) -> Ipv4Addr {
    Ipv4Addr::from(int_to_bytes(value, order))
}

/// Serialize a packed address back to bytes in `order`.
pub fn int_to_bytes(value: i32, order: ByteOrder) -> [u8; 4] {
    match order {
        ByteOrder::Little => value.to_le_bytes(),
        ByteOrder::Big => value.to_be_bytes(),
    }
}

/// Parse a dotted-quad string.
pub fn parse_ip(text: &str) -> Result<Ipv4Addr, WireError> {
    text.trim()
        .parse()
        .map_err(|_| WireError::InvalidAddress(text.to_string()))
}

/// Read `N` bytes at `offset`.
pub fn read_array<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], WireError> {
    data.get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(WireError::Truncated { offset, needed: N })
}

/// Read a little-endian u32.
pub fn read_u32_le(data: &[u8], offset: usize) -> Result<u32, WireError> {
    read_array::<4>(data, offset).map(u32::from_le_bytes)
}

/// Read a big-endian u32.
pub fn read_u32_be(data: &[u8], offset: usize) -> Result<u32, WireError> {
    read_array::<4>(data, offset).map(u32::from_be_bytes)
}

/// Read a big-endian u16.
pub fn read_u16_be(data: &[u8], offset: usize) -> Result<u16, WireError> {
    read_array::<2>(data, offset).map(u16::from_be_bytes)
}

/// Read a little-endian u16.
pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16, WireError> {
    read_array::<2>(data, offset).map(u16::from_le_bytes)
}

/// Read a null-terminated string starting at `offset`.
///
/// Returns the string and the offset just past the terminator.
pub fn read_cstr(data: &[u8], offset: usize) -> Result<(String, usize), WireError> {
    let rest = data.get(offset..).ok_or(WireError::Truncated { offset, needed: 1 })?;
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(WireError::UnterminatedString(offset))?;
    let text = String::from_utf8_lossy(&rest[..end]).into_owned();
    Ok((text, offset + end + 1))
}

/// Parse a `key\0value\0key\0value\0...` list, keeping wire order.
///
/// Trailing terminators are ignored. A dangling key without a value is dropped.
pub fn parse_kv_list(data: &[u8]) -> Vec<(String, String)> {
    let end = data.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    let parts: Vec<String> = data[..end]
        .split(|&b| b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();

    parts
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

/// A local address as reported by a NAT negotiation client.
///
/// The packed forms are kept for both byte orders because the caller's
/// platform is unknown until a registry record matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAddr {
    /// Local IPv4 address.
    pub ip: Ipv4Addr,
    /// Local port (0 when the client did not report one).
    pub port: u16,
}

impl LocalAddr {
    /// Read 4 address bytes followed by a big-endian port.
    pub fn read(data: &[u8], offset: usize) -> Result<Self, WireError> {
        let ip = Ipv4Addr::from(read_array::<4>(data, offset)?);
        let port = read_u16_be(data, offset + 4)?;
        Ok(Self { ip, port })
    }

    /// Address packed little-endian.
    pub fn ip_le(&self) -> i32 {
        ip_to_int(self.ip, ByteOrder::Little)
    }

    /// Address packed big-endian.
    pub fn ip_be(&self) -> i32 {
        ip_to_int(self.ip, ByteOrder::Big)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_packing_per_platform() {
        let ip = Ipv4Addr::new(10, 0, 0, 5);

        let le = ip_to_int(ip, ByteOrder::Little);
        let be = ip_to_int(ip, ByteOrder::Big);

        assert_eq!(le, 0x0500_000A);
        assert_eq!(be, 0x0A00_0005);
        assert_eq!(int_to_ip(le, ByteOrder::Little), ip);
        assert_eq!(int_to_ip(be, ByteOrder::Big), ip);
    }

    #[test]
    fn test_ip_packing_is_signed() {
        let ip = Ipv4Addr::new(192, 168, 1, 2);
        assert!(ip_to_int(ip, ByteOrder::Big) < 0);
        assert_eq!(int_to_bytes(ip_to_int(ip, ByteOrder::Big), ByteOrder::Big), ip.octets());
    }

    #[test]
    fn test_platform_from_game_name() {
        assert_eq!(Platform::from_game_name("mariokartds"), Some(Platform::Ds));
        assert_eq!(Platform::from_game_name("pokemondpds"), Some(Platform::Ds));
        assert_eq!(Platform::from_game_name("mariokartwii"), Some(Platform::Wii));
        assert_eq!(Platform::from_game_name("somegamewiiware"), Some(Platform::Wii));
        assert_eq!(Platform::from_game_name("tetrisd"), None);
    }

    #[test]
    fn test_read_cstr() {
        let data = b"abc\0de\0";
        let (first, next) = read_cstr(data, 0).unwrap();
        assert_eq!(first, "abc");
        let (second, next) = read_cstr(data, next).unwrap();
        assert_eq!(second, "de");
        assert_eq!(next, data.len());
        assert!(matches!(read_cstr(b"abc", 0), Err(WireError::UnterminatedString(0))));
    }

    #[test]
    fn test_parse_kv_list() {
        let data = b"localip0\010.0.0.2\0localport\06112\0natneg\01\0\0";
        let kv = parse_kv_list(data);
        assert_eq!(kv.len(), 3);
        assert_eq!(kv[0], ("localip0".to_string(), "10.0.0.2".to_string()));
        assert_eq!(kv[2], ("natneg".to_string(), "1".to_string()));
    }

    #[test]
    fn test_parse_kv_list_keeps_empty_values() {
        let kv = parse_kv_list(b"a\0\0b\02\0");
        assert_eq!(kv, vec![("a".into(), "".into()), ("b".into(), "2".into())]);
    }

    #[test]
    fn test_local_addr_read() {
        let data = [0xff, 10, 0, 1, 226, 0x17, 0xe0];
        let addr = LocalAddr::read(&data, 1).unwrap();
        assert_eq!(addr.ip, Ipv4Addr::new(10, 0, 1, 226));
        assert_eq!(addr.port, 6112);
        assert!(LocalAddr::read(&data, 3).is_err());
    }
}
