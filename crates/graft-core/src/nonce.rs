//! Per-response CSP nonces.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

/// Number of random bytes behind each nonce.
pub const NONCE_BYTES: usize = 16;

/// Generates a fresh base64-encoded nonce from the OS random source.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}
