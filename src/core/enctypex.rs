//! EncTypeX
//!
//! The stream cipher that protects server browser list responses.
//!
//! A message is a 20-byte header followed by ciphertext. The header is LCG
//! noise except for three fixed bytes that tell the decoder where the key
//! material ends: `hdr[0] ^ 0xEC` is the header length minus two and
//! `hdr[6] ^ 0xEA` is the number of seed bytes that follow it.
//!
//! The 261-byte state is a 256-entry permutation plus five running slots
//! (256..=260). Encoding and decoding share one transform; they differ only in
//! which of slots 259/260 receive the input and output byte.

use std::time::{SystemTime, UNIX_EPOCH};

const STATE_LEN: usize = 261;
const HEADER_LEN: usize = 20;
const HEADER_KEY_OFFSET: usize = 7;
const SEED_LEN: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Encode,
    Decode,
}

/// Per-message cipher state.
struct Context {
    state: [u8; STATE_LEN],
}

impl Context {
    /// Consume the header of `data` and derive the state.
    ///
    /// Returns the offset of the payload, or `None` when the header lengths
    /// do not fit in `data`.
    fn from_header(key: &[u8], validate: &[u8], data: &[u8]) -> Option<(Self, usize)> {
        let first = *data.first()?;
        let header_len = (first ^ 0xEC) as usize + 2;
        if data.len() < header_len {
            return None;
        }

        let seed_len = (data[header_len - 1] ^ 0xEA) as usize;
        if data.len() < header_len + seed_len {
            return None;
        }

        let mut seed = [0u8; SEED_LEN];
        for (i, v) in validate.iter().take(SEED_LEN).enumerate() {
            seed[i] = *v;
        }

        let seed_bytes = &data[header_len..header_len + seed_len];
        for (i, &b) in seed_bytes.iter().enumerate() {
            let slot = (key[i % key.len()] as usize).wrapping_mul(i) & 7;
            seed[slot] ^= seed[i & 7] ^ b;
        }

        Some((Self::schedule(&seed), header_len + seed_len))
    }

    /// Key schedule: a shuffled walk over the permutation driven by `seed`.
    fn schedule(seed: &[u8; SEED_LEN]) -> Self {
        let mut state = [0u8; STATE_LEN];
        for (i, slot) in state.iter_mut().take(256).enumerate() {
            *slot = i as u8;
        }

        let mut n1 = 0usize;
        let mut n2 = 0usize;
        for i in (0..256).rev() {
            let t = pick_index(&state, i, seed, &mut n1, &mut n2);
            state.swap(i, t);
        }

        state[256] = state[1];
        state[257] = state[3];
        state[258] = state[5];
        state[259] = state[7];
        state[260] = state[n1 & 0xFF];

        Self { state }
    }

    fn apply(&mut self, data: &mut [u8], direction: Direction) {
        for byte in data.iter_mut() {
            *byte = self.step(*byte, direction);
        }
    }

    fn step(&mut self, d: u8, direction: Direction) -> u8 {
        let k = &mut self.state;
        let at = |v: u8| v as usize;

        let a = k[256];
        let b = k[257];
        let c = k[at(a)];
        k[256] = a.wrapping_add(1);
        k[257] = b.wrapping_add(c);

        let a = k[260];
        let b = k[at(k[257])];
        let c = k[at(a)];
        k[at(a)] = b;

        let a = k[at(k[259])];
        let b = k[257];
        k[at(b)] = a;

        let a = k[at(k[256])];
        let b = k[259];
        k[at(b)] = a;

        let a = k[256];
        k[at(a)] = c;

        let b = k[258];
        let a = k[at(c)];
        let c = k[259];
        let b = a.wrapping_add(b);
        k[258] = b;

        let a = b;
        let c = k[at(c)];
        let b = k[at(k[257])];
        let a = k[at(a)];
        let c = b.wrapping_add(c);
        let b = k[at(k[260])];
        let c = b.wrapping_add(c);
        let b = k[at(c)];
        let c = k[at(k[256])];
        let a = a.wrapping_add(c);
        let c = k[at(b)];
        let b = k[at(a)];

        let out = c ^ b ^ d;
        match direction {
            Direction::Decode => {
                k[260] = d;
                k[259] = out;
            }
            Direction::Encode => {
                k[260] = out;
                k[259] = d;
            }
        }
        out
    }
}

/// Draw a swap partner in `0..=cnt` from the running key state.
fn pick_index(state: &[u8; STATE_LEN], cnt: usize, seed: &[u8; SEED_LEN], n1: &mut usize, n2: &mut usize) -> usize {
    if cnt == 0 {
        return 0;
    }

    let mut mask = 1usize;
    while mask < cnt {
        mask = (mask << 1) + 1;
    }

    let mut rounds = 0;
    loop {
        *n1 = state[*n1 & 0xFF] as usize + seed[*n2] as usize;
        *n2 += 1;
        if *n2 >= SEED_LEN {
            *n2 = 0;
            *n1 += SEED_LEN;
        }

        let mut tmp = *n1 & mask;
        rounds += 1;
        if rounds > 11 {
            tmp %= cnt;
        }

        if tmp <= cnt {
            return tmp;
        }
    }
}

/// Encrypt `data` for a client that sent `validate` as its challenge.
///
/// Returns `None` when any input is empty.
pub fn encrypt(key: &[u8], validate: &[u8], data: &[u8]) -> Option<Vec<u8>> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;
    encrypt_with_seed(key, validate, data, !now)
}

/// [`encrypt`] with an explicit header seed.
pub fn encrypt_with_seed(key: &[u8], validate: &[u8], data: &[u8], seed: u32) -> Option<Vec<u8>> {
    if key.is_empty() || validate.is_empty() || data.is_empty() {
        return None;
    }

    let mut header = [0u8; HEADER_LEN];
    let mut rnd = seed;
    for (i, byte) in header.iter_mut().enumerate() {
        rnd = rnd.wrapping_mul(0x343FD).wrapping_add(0x269EC3);
        *byte = (rnd as u8) ^ key[i % key.len()] ^ validate[i % validate.len()];
    }

    header[0] = (HEADER_KEY_OFFSET as u8 - 2) ^ 0xEC;
    header[1] = 0;
    header[2] = 0;
    header[HEADER_KEY_OFFSET - 1] = (HEADER_LEN - HEADER_KEY_OFFSET) as u8 ^ 0xEA;

    let (mut ctx, offset) = Context::from_header(key, validate, &header)?;
    debug_assert_eq!(offset, HEADER_LEN);

    let mut body = data.to_vec();
    ctx.apply(&mut body, Direction::Encode);

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&body);
    Some(out)
}

/// Decrypt a message produced by [`encrypt`].
///
/// Returns `None` when any input is empty or the header lengths are
/// inconsistent with the message size.
pub fn decrypt(key: &[u8], validate: &[u8], data: &[u8]) -> Option<Vec<u8>> {
    if key.is_empty() || validate.is_empty() || data.is_empty() {
        return None;
    }

    let (mut ctx, offset) = Context::from_header(key, validate, data)?;
    let mut body = data[offset..].to_vec();
    ctx.apply(&mut body, Direction::Decode);
    Some(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: &[u8] = b"Yvcj3W";
    const VALIDATE: &[u8] = b"abcdefgh";

    #[test]
    fn test_header_layout() {
        let out = encrypt_with_seed(KEY, VALIDATE, b"payload", 0x1234_5678).unwrap();

        assert_eq!(out.len(), HEADER_LEN + 7);
        assert_eq!(out[0], 5 ^ 0xEC);
        assert_eq!(out[1], 0);
        assert_eq!(out[2], 0);
        assert_eq!(out[6], 13 ^ 0xEA);
    }

    #[test]
    fn test_round_trip() {
        let plain = b"\x7f\x00\x00\x01\x19\x64";
        let out = encrypt(KEY, VALIDATE, plain).unwrap();
        assert_ne!(&out[HEADER_LEN..], plain.as_slice());
        assert_eq!(decrypt(KEY, VALIDATE, &out).unwrap(), plain.to_vec());
    }

    #[test]
    fn test_wrong_validate_garbles() {
        let plain = b"some server list bytes";
        let out = encrypt_with_seed(KEY, VALIDATE, plain, 7).unwrap();
        assert_ne!(decrypt(KEY, b"hgfedcba", &out).unwrap(), plain.to_vec());
    }

    #[test]
    fn test_empty_inputs_rejected() {
        assert!(encrypt(b"", VALIDATE, b"x").is_none());
        assert!(encrypt(KEY, b"", b"x").is_none());
        assert!(encrypt(KEY, VALIDATE, b"").is_none());
        assert!(decrypt(KEY, VALIDATE, b"").is_none());
    }

    #[test]
    fn test_truncated_header_rejected() {
        // Declares a 7-byte header but carries 3 bytes.
        assert!(decrypt(KEY, VALIDATE, &[5 ^ 0xEC, 0, 0]).is_none());

        // Header fits but the seed length overruns.
        let mut short = vec![0u8; HEADER_KEY_OFFSET];
        short[0] = 5 ^ 0xEC;
        short[HEADER_KEY_OFFSET - 1] = 13 ^ 0xEA;
        assert!(decrypt(KEY, VALIDATE, &short).is_none());
    }

    #[test]
    fn test_header_only_message_decrypts_to_empty() {
        let out = encrypt_with_seed(KEY, VALIDATE, b"x", 1).unwrap();
        assert_eq!(decrypt(KEY, VALIDATE, &out[..HEADER_LEN]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_seed_changes_ciphertext() {
        let a = encrypt_with_seed(KEY, VALIDATE, b"same body", 1).unwrap();
        let b = encrypt_with_seed(KEY, VALIDATE, b"same body", 2).unwrap();
        assert_ne!(a, b);
        assert_eq!(decrypt(KEY, VALIDATE, &a), decrypt(KEY, VALIDATE, &b));
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            key in proptest::collection::vec(any::<u8>(), 1..16),
            validate in proptest::collection::vec(any::<u8>(), 8..=8),
            data in proptest::collection::vec(any::<u8>(), 1..512),
            seed in any::<u32>(),
        ) {
            let out = encrypt_with_seed(&key, &validate, &data, seed).unwrap();
            prop_assert_eq!(out.len(), data.len() + HEADER_LEN);
            prop_assert_eq!(decrypt(&key, &validate, &out).unwrap(), data);
        }
    }
}
