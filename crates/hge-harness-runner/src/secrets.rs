// crates/hge-harness-runner/src/secrets.rs
// ============================================================================
// Module: Secrets
// Description: Random admin secrets and service passwords.
// Purpose: Give every test run throwaway credentials.
// Dependencies: rand
// ============================================================================

//! ## Overview
//! Random admin secrets and service passwords.

use rand::Rng;

/// Alphabet of generated secrets.
const SECRET_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of admin secrets and service passwords.
pub const SECRET_LEN: usize = 6;

/// Returns a random `[A-Z0-9]` string of `len` characters.
#[must_use]
pub fn random_secret(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(SECRET_ALPHABET[rng.gen_range(0..SECRET_ALPHABET.len())]))
        .collect()
}
