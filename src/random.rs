//! Cryptographic random values.
//!
//! All nonces, auto-generated key ids, and request correlation ids come from
//! the operating system's entropy source. Nothing here keeps state between
//! calls.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::Error;

/// Number of raw bytes behind an auto-generated key id.
pub const KID_BYTES: usize = 16;

/// Reads `n_bytes` from the OS entropy source and returns them
/// base64url-encoded without padding.
pub fn nonce(n_bytes: usize) -> Result<String, Error> {
    let mut buf = vec![0u8; n_bytes];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| Error::EntropyUnavailable(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

/// A fresh random key id, 16 raw bytes base64url-encoded.
pub fn key_id() -> Result<String, Error> {
    nonce(KID_BYTES)
}
