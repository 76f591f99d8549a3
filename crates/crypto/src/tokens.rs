//! Random tokens and constant-time comparison.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;

/// Bytes of entropy in a bearer token.
const TOKEN_BYTES: usize = 32;

/// Fill `len` bytes from the OS RNG.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Generate an unguessable URL-safe token (256 bits of entropy).
pub fn generate_token() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes(TOKEN_BYTES))
}

/// Compare two byte strings without early exit on the first differing byte.
///
/// Lengths are not secret; unequal lengths return false immediately.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
