//! Field-level encryption for sensitive database values.
//!
//! Provides AES-256-GCM encryption for columns marked `encrypted`.
//! The key is loaded from a base64-encoded environment variable or a
//! secrets file; when neither is present the manager is not configured
//! and encrypt/decrypt are no-ops, so a proxy can come up without a key
//! and still read its data.
//!
//! Wire format: `ENC:` + base64(nonce || ciphertext || tag), with a
//! 96-bit random nonce per value.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::path::{Path, PathBuf};

use crate::error::ProxyError;

/// Prefix identifying encrypted values in storage.
pub const ENCRYPTED_PREFIX: &str = "ENC:";

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// GCM nonce size in bytes (96 bits).
const NONCE_SIZE: usize = 12;

/// Default secrets file mounted by Docker/Kubernetes.
const SECRETS_FILE: &str = "/run/secrets/encryption_key";

/// Check whether a value carries the encryption sentinel.
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}

/// Generate a fresh random key, base64-encoded for the environment.
pub fn generate_key() -> String {
    let key = Aes256Gcm::generate_key(OsRng);
    BASE64.encode(key)
}

/// Manager for the field-encryption key and operations.
///
/// Key sources, in priority order:
/// 1. The named environment variable (base64-encoded 32 bytes,
///    `PROXY_ENCRYPTION_KEY` by default).
/// 2. `/run/secrets/encryption_key` (raw 32 bytes).
#[derive(Clone)]
pub struct EncryptionManager {
    key: Option<[u8; KEY_SIZE]>,
}

impl std::fmt::Debug for EncryptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material, even in debug output.
        f.debug_struct("EncryptionManager")
            .field("configured", &self.key.is_some())
            .finish()
    }
}

impl EncryptionManager {
    /// Load the key from the default environment variable or secrets file.
    pub fn from_env() -> Self {
        Self::from_env_var("PROXY_ENCRYPTION_KEY")
    }

    /// Load the key from a custom environment variable name.
    pub fn from_env_var(env_var: &str) -> Self {
        Self::load(env_var, Path::new(SECRETS_FILE))
    }

    fn load(env_var: &str, secrets_path: &Path) -> Self {
        if let Ok(encoded) = std::env::var(env_var) {
            if let Ok(bytes) = BASE64.decode(encoded.trim()) {
                if let Ok(key) = <[u8; KEY_SIZE]>::try_from(bytes.as_slice()) {
                    return Self { key: Some(key) };
                }
            }
            tracing::warn!(env_var, "ignoring malformed encryption key in environment");
        }

        if secrets_path.exists() {
            if let Ok(bytes) = std::fs::read(secrets_path) {
                let trimmed: Vec<u8> = bytes
                    .strip_suffix(b"\n")
                    .map(<[u8]>::to_vec)
                    .unwrap_or(bytes);
                if let Ok(key) = <[u8; KEY_SIZE]>::try_from(trimmed.as_slice()) {
                    return Self { key: Some(key) };
                }
            }
            tracing::warn!(path = %secrets_path.display(), "ignoring malformed encryption key file");
        }

        Self { key: None }
    }

    /// Load from an explicit secrets file path (used in tests).
    pub fn from_secrets_file(env_var: &str, path: PathBuf) -> Self {
        Self::load(env_var, &path)
    }

    /// Build an unconfigured manager (all operations are no-ops).
    pub fn disabled() -> Self {
        Self { key: None }
    }

    /// Build a manager with an explicit key.
    pub fn with_key(key: [u8; KEY_SIZE]) -> Self {
        Self { key: Some(key) }
    }

    /// True when a key is available.
    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    /// Encrypt a value for storage.
    ///
    /// Returns the input unchanged when no key is configured, when the
    /// value is empty, or when it is already encrypted. Failures here
    /// are fatal to the enclosing write.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, ProxyError> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_string());
        };
        if plaintext.is_empty() || is_encrypted(plaintext) {
            return Ok(plaintext.to_string());
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| ProxyError::Encryption("encryption failed".to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(format!("{ENCRYPTED_PREFIX}{}", BASE64.encode(payload)))
    }

    /// Decrypt a stored value.
    ///
    /// Values without the `ENC:` sentinel pass through unchanged, which
    /// tolerates pre-encryption plaintext rows during migration.
    pub fn decrypt(&self, stored: &str) -> Result<String, ProxyError> {
        let Some(key) = &self.key else {
            return Ok(stored.to_string());
        };
        let Some(encoded) = stored.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(stored.to_string());
        };

        let payload = BASE64
            .decode(encoded)
            .map_err(|e| ProxyError::Encryption(format!("invalid encrypted payload: {e}")))?;
        if payload.len() < NONCE_SIZE + 16 {
            return Err(ProxyError::Encryption(
                "encrypted payload too short".to_string(),
            ));
        }

        let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProxyError::Encryption("decryption failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| ProxyError::Encryption("decrypted payload is not UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> EncryptionManager {
        EncryptionManager::with_key([7u8; KEY_SIZE])
    }

    #[test]
    fn test_round_trip() {
        let m = manager();
        let encrypted = m.encrypt("my-secret-password").unwrap();
        assert!(encrypted.starts_with(ENCRYPTED_PREFIX));
        assert_ne!(encrypted, "my-secret-password");
        assert_eq!(m.decrypt(&encrypted).unwrap(), "my-secret-password");
    }

    #[test]
    fn test_unique_nonce_per_value() {
        let m = manager();
        let a = m.encrypt("same").unwrap();
        let b = m.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_already_encrypted_not_double_encrypted() {
        let m = manager();
        let once = m.encrypt("value").unwrap();
        let twice = m.encrypt(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_plaintext_passes_through_decrypt() {
        let m = manager();
        assert_eq!(m.decrypt("legacy-plaintext").unwrap(), "legacy-plaintext");
    }

    #[test]
    fn test_unconfigured_is_noop() {
        let m = EncryptionManager::disabled();
        assert!(!m.is_configured());
        assert_eq!(m.encrypt("value").unwrap(), "value");
        assert_eq!(m.decrypt("value").unwrap(), "value");
    }

    #[test]
    fn test_wrong_key_fails_decrypt() {
        let encrypted = manager().encrypt("value").unwrap();
        let other = EncryptionManager::with_key([9u8; KEY_SIZE]);
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_unicode_round_trip() {
        let m = manager();
        let value = "päßwörd — 秘密 🔑";
        let encrypted = m.encrypt(value).unwrap();
        assert_eq!(m.decrypt(&encrypted).unwrap(), value);
    }

    #[test]
    fn test_generate_key_is_valid_base64_32_bytes() {
        let encoded = generate_key();
        let bytes = BASE64.decode(encoded).unwrap();
        assert_eq!(bytes.len(), KEY_SIZE);
    }

    #[test]
    fn test_secrets_file_key_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encryption_key");
        std::fs::write(&path, [3u8; KEY_SIZE]).unwrap();

        let m = EncryptionManager::from_secrets_file("GPROXY_TEST_NO_SUCH_KEY_VAR", path);
        assert!(m.is_configured());
    }
}
