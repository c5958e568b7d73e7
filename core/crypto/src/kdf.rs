//! Password-based key derivation.
//!
//! Two unrelated derivations live here and must stay separate:
//! - [`derive_key`]: PBKDF2-HMAC-SHA512, produces the key that unwraps the
//!   master key. Never leaves the process.
//! - [`login_hash`]: the legacy double SHA-512 sent to the server to
//!   authenticate. Never used as key material.

use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::keys::{DerivedKey, KEY_LENGTH};
use filenvault_common::{Error, Result};

/// Lowest iteration count accepted.
pub const MIN_ITERATIONS: u32 = 100_000;

/// Iteration count used unless configured otherwise.
pub const DEFAULT_ITERATIONS: u32 = 200_000;

/// Parameters for PBKDF2 key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Number of PBKDF2 rounds.
    pub iterations: u32,
}

impl KdfParams {
    /// Create parameters with a custom iteration count.
    ///
    /// # Errors
    /// - Returns error if `iterations` is below MIN_ITERATIONS
    pub fn new(iterations: u32) -> Result<Self> {
        if iterations < MIN_ITERATIONS {
            return Err(Error::InvalidInput(format!(
                "KDF iterations must be at least {}, got {}",
                MIN_ITERATIONS, iterations
            )));
        }
        Ok(Self { iterations })
    }

    /// The cheapest accepted parameters.
    pub fn minimum() -> Self {
        Self {
            iterations: MIN_ITERATIONS,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

/// Derive the master-key unwrapping key from a password and salt.
///
/// The salt is server data and is used as given.
///
/// # Postconditions
/// - Deterministic for identical inputs
///
/// # Errors
/// - Returns error if password is empty
pub fn derive_key(password: &[u8], salt: &str, params: &KdfParams) -> Result<DerivedKey> {
    if password.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }

    let mut key_bytes = [0u8; KEY_LENGTH];
    pbkdf2_hmac::<Sha512>(password, salt.as_bytes(), params.iterations, &mut key_bytes);

    Ok(DerivedKey::from_bytes(key_bytes))
}

fn sha512_hex(parts: &[&[u8]]) -> Zeroizing<String> {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    Zeroizing::new(hex::encode(hasher.finalize()))
}

/// Compute the login authentication hash.
///
/// `hex(SHA512(hex(SHA512(password || salt)) || salt))`
pub fn login_hash(password: &str, salt: &str) -> String {
    let first = sha512_hex(&[password.as_bytes(), salt.as_bytes()]);
    let second = sha512_hex(&[first.as_bytes(), salt.as_bytes()]);
    second.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let params = KdfParams::minimum();

        let key1 = derive_key(b"correct-horse", "abc123", &params).unwrap();
        let key2 = derive_key(b"correct-horse", "abc123", &params).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_derive_key_different_salt() {
        let params = KdfParams::minimum();

        let key1 = derive_key(b"correct-horse", "abc123", &params).unwrap();
        let key2 = derive_key(b"correct-horse", "abc124", &params).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_derive_key_different_password() {
        let params = KdfParams::minimum();

        let key1 = derive_key(b"password1", "salt", &params).unwrap();
        let key2 = derive_key(b"password2", "salt", &params).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_derive_key_empty_password_fails() {
        assert!(derive_key(b"", "salt", &KdfParams::minimum()).is_err());
    }

    #[test]
    fn test_params_floor() {
        assert!(KdfParams::new(99_999).is_err());
        assert_eq!(KdfParams::new(100_000).unwrap(), KdfParams::minimum());
        assert_eq!(KdfParams::default().iterations, DEFAULT_ITERATIONS);
    }

    #[test]
    fn test_login_hash_shape() {
        let hash = login_hash("correct-horse", "abc123");

        assert_eq!(hash.len(), 128);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, login_hash("correct-horse", "abc123"));
        assert_ne!(hash, login_hash("correct-horse", "abc124"));
    }

    #[test]
    fn test_login_hash_is_double_sha512() {
        let first = hex::encode(Sha512::digest(b"pwsalt"));
        let expected = hex::encode(Sha512::digest(format!("{}salt", first).as_bytes()));
        assert_eq!(login_hash("pw", "salt"), expected);
    }

    #[test]
    fn test_login_hash_unrelated_to_derived_key() {
        let derived = derive_key(b"correct-horse", "abc123", &KdfParams::minimum()).unwrap();
        let hash = login_hash("correct-horse", "abc123");
        assert!(!hash.contains(&hex::encode(derived.as_bytes())));
    }
}
