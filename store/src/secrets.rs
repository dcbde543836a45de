//! API-key secret helpers: plaintext generation, the `fingerprint` lookup digest,
//! and the `hash` verification digest persisted on [`crate::models::ApiKey`].
//!
//! The store treats `hash`/`fingerprint` as opaque bytes — these helpers are how
//! a caller is expected to produce them before calling
//! [`crate::repositories::auth::AuthRepository::create_api_key`], mirroring the
//! password/secret hashing this codebase otherwise does with Argon2id.
use crate::errors::RepositoryError;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Argon2id memory cost in KiB. Lower than a master-password KDF since this hash
/// only ever needs to beat offline brute force on an already-high-entropy secret.
const ARGON2_MEMORY_COST: u32 = 19_456;
const ARGON2_ITERATIONS: u32 = 2;
const ARGON2_PARALLELISM: u32 = 1;

const PLAINTEXT_BYTES: usize = 32;

/// Generate a new plaintext API key as `prefix_<hex>`, e.g. `sk_live_1a2b3c...`.
pub fn generate_plaintext(prefix: &str) -> String {
    let mut bytes = [0u8; PLAINTEXT_BYTES];
    OsRng.fill_bytes(&mut bytes);
    format!("{prefix}_{}", hex::encode(bytes))
}

/// SHA-256 digest of the plaintext key, used as the indexed lookup column: the
/// fingerprint is the lookup key, the hash is never scanned for equality.
pub fn fingerprint(plaintext: &str) -> Vec<u8> {
    Sha256::digest(plaintext.as_bytes()).to_vec()
}

/// Argon2id hash of the plaintext key, stored as a PHC string's UTF-8 bytes.
pub fn hash(plaintext: &str) -> Result<Vec<u8>, RepositoryError> {
    let salt = SaltString::generate(&mut OsRng);
    let params = Params::new(ARGON2_MEMORY_COST, ARGON2_ITERATIONS, ARGON2_PARALLELISM, None)
        .map_err(|e| RepositoryError::Internal(format!("invalid argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let hash = argon2
        .hash_password(plaintext.as_bytes(), &salt)
        .map_err(|e| RepositoryError::Internal(format!("argon2 hashing failed: {e}")))?;
    Ok(hash.to_string().into_bytes())
}

/// Verify a plaintext key against a stored Argon2id hash. A malformed stored hash
/// is treated as a verification failure rather than propagated, since a caller
/// checking `verify(...)?` should only ever see `Ok(bool)`.
pub fn verify(plaintext: &str, stored_hash: &[u8]) -> Result<bool, RepositoryError> {
    let phc = std::str::from_utf8(stored_hash)
        .map_err(|e| RepositoryError::Internal(format!("stored hash is not valid utf-8: {e}")))?;
    let Ok(parsed) = PasswordHash::new(phc) else {
        return Ok(false);
    };
    Ok(Argon2::default()
        .verify_password(plaintext.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_plaintext_carries_prefix() {
        let key = generate_plaintext("sk_live");
        assert!(key.starts_with("sk_live_"));
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = fingerprint("same-secret");
        let b = fingerprint("same-secret");
        assert_eq!(a, b);
        assert_ne!(a, fingerprint("different-secret"));
    }

    #[test]
    fn hash_round_trips_through_verify() {
        let plaintext = generate_plaintext("sk_live");
        let stored = hash(&plaintext).unwrap();
        assert!(verify(&plaintext, &stored).unwrap());
        assert!(!verify("wrong-secret", &stored).unwrap());
    }

    #[test]
    fn verify_rejects_garbage_hash() {
        assert!(!verify("anything", b"not a phc string").unwrap());
    }
}
