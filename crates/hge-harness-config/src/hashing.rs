// crates/hge-harness-config/src/hashing.rs
// ============================================================================
// Module: Configuration Hashing
// Description: Short content hash of a test case document.
// Purpose: Namespace log and coverage files per effective configuration.
// Dependencies: serde, serde_jcs, sha2
// ============================================================================

//! ## Overview
//! The hash is SHA-256 over the RFC 8785 canonical JSON form of the test case
//! document, so key order and number spelling do not change it. Only the
//! first eight hex characters are kept.

use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::error::ConfigError;

/// Number of hex characters kept from the digest.
pub const CONF_HASH_LEN: usize = 8;

/// Returns the RFC 8785 canonical JSON bytes for `value`.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] when the value cannot be expressed as JSON
/// (for example a non-finite number).
pub fn canonical_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ConfigError> {
    serde_jcs::to_vec(value)
        .map_err(|err| ConfigError::Invalid(format!("test case is not valid json: {err}")))
}

/// Computes the short configuration hash of a test case document.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] when canonicalization fails.
pub fn conf_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, ConfigError> {
    let bytes = canonical_json_bytes(value)?;
    let digest = Sha256::digest(&bytes);
    let mut hex = hex_encode(&digest);
    hex.truncate(CONF_HASH_LEN);
    Ok(hex)
}

/// Encodes bytes as lowercase hex.
fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
