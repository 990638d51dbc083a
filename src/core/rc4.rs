//! Stream ciphers used outside the server list.
//!
//! - XOR cipher A: cyclic key XOR used by the profile/chat framing.
//! - gsmsalg: an RC4 variant whose PRGA index also advances by the
//!   plaintext byte. The QR challenge answer is built from it.

use base64::{engine::general_purpose, Engine as _};

/// XOR `data` with `key` repeated cyclically.
///
/// An empty key leaves the data untouched.
pub fn xor_cycle(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }

    data.iter()
        .zip(key.iter().cycle())
        .map(|(d, k)| d ^ k)
        .collect()
}

/// Encrypt `data` with the GameSpy RC4 variant.
///
/// Returns `None` for an empty key.
pub fn rc4_encrypt(key: &[u8], data: &[u8]) -> Option<Vec<u8>> {
    if key.is_empty() {
        return None;
    }

    let mut s: [u8; 256] = std::array::from_fn(|i| i as u8);

    let mut j: u8 = 0;
    for i in 0..256 {
        j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
        s.swap(i, j as usize);
    }

    let mut i: u8 = 0;
    let mut j: u8 = 0;
    let out = data
        .iter()
        .map(|&val| {
            i = i.wrapping_add(1).wrapping_add(val);
            j = j.wrapping_add(s[i as usize]);
            s.swap(i as usize, j as usize);
            val ^ s[s[i as usize].wrapping_add(s[j as usize]) as usize]
        })
        .collect();

    Some(out)
}

/// Expected answer to a QR challenge: `base64(rc4(key, data) ++ 0x00)`.
///
/// An empty key yields the encoding of a lone terminator.
pub fn prepare_rc4_base64(key: &[u8], data: &[u8]) -> String {
    let mut out = rc4_encrypt(key, data).unwrap_or_default();
    out.push(0);
    general_purpose::STANDARD.encode(out)
}
