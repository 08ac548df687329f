//! Credential Hasher
//! Mission: One-way password hashing with bcrypt

use anyhow::{Context, Result};
use bcrypt::{hash, verify};
use tracing::warn;

/// Password hasher/verifier.
///
/// `verify` never short-circuits on a missing account: callers that have no
/// stored hash use [`CredentialHasher::verify_dummy`] so both paths pay the
/// same bcrypt cost.
pub struct CredentialHasher {
    cost: u32,
    dummy_hash: String,
}

impl CredentialHasher {
    pub fn new(cost: u32) -> Result<Self> {
        let dummy_hash = hash("inkpost-dummy-password", cost)
            .context("Failed to initialize credential hasher")?;
        Ok(Self { cost, dummy_hash })
    }

    pub fn hash(&self, plaintext: &str) -> Result<String> {
        hash(plaintext, self.cost).context("Failed to hash password")
    }

    /// Check a plaintext against a stored bcrypt hash.
    ///
    /// bcrypt compares digests in constant time; a malformed stored hash is
    /// treated as a mismatch.
    pub fn verify(&self, stored_hash: &str, plaintext: &str) -> bool {
        match verify(plaintext, stored_hash) {
            Ok(valid) => valid,
            Err(e) => {
                warn!("Stored password hash could not be parsed: {}", e);
                false
            }
        }
    }

    /// Burn one verification against a fixed hash. Always false.
    pub fn verify_dummy(&self, plaintext: &str) -> bool {
        let _ = verify(plaintext, &self.dummy_hash);
        false
    }
}

/// Constant-time byte comparison to prevent timing attacks.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
