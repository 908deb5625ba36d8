//! Token encryption at rest
//!
//! OAuth tokens are sealed with XChaCha20-Poly1305 before they reach the
//! database. Every call to [`Vault::encrypt`] draws a fresh 24-byte nonce, so
//! encrypting the same token twice yields different ciphertexts. The stored
//! form is `nonce || ciphertext || tag`.
//!
//! The key is a single process-wide 32-byte value, base64 encoded in the
//! environment or a key file. A missing or malformed key is a configuration
//! error: the vault never falls back to storing plaintext.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::config::VaultConfig;
use crate::error::{Result, VaultError};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

pub struct Vault {
    cipher: XChaCha20Poly1305,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Vault { .. }")
    }
}

impl Vault {
    /// Build a vault from a base64-encoded 32-byte key
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| VaultError::Key(format!("key is not valid base64: {}", e)))?,
        );

        if bytes.len() != KEY_LEN {
            return Err(VaultError::Key(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
            .into());
        }

        let cipher = XChaCha20Poly1305::new_from_slice(&bytes)
            .map_err(|e| VaultError::Key(format!("cipher init failed: {}", e)))?;

        Ok(Self { cipher })
    }

    /// Load the key named by the vault configuration.
    ///
    /// The environment variable takes precedence over the key file.
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        if let Ok(value) = std::env::var(&config.key_env) {
            let value = Zeroizing::new(value);
            return Self::from_base64_key(&value);
        }

        if let Some(path) = &config.key_file {
            let path = shellexpand::tilde(path).to_string();
            let contents = Zeroizing::new(std::fs::read_to_string(&path).map_err(|e| {
                VaultError::Key(format!("failed to read key file {}: {}", path, e))
            })?);
            return Self::from_base64_key(&contents);
        }

        Err(VaultError::Key(format!(
            "no encryption key: set {} or vault.key_file",
            config.key_env
        ))
        .into())
    }

    /// Generate a new random key, base64 encoded
    pub fn generate_key() -> String {
        let key = XChaCha20Poly1305::generate_key(&mut OsRng);
        STANDARD.encode(key.as_slice())
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| VaultError::Encrypt(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt and authenticate. Tampered or truncated input is an error.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::Decrypt(format!(
                "ciphertext too short ({} bytes)",
                ciphertext.len()
            ))
            .into());
        }

        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| VaultError::Decrypt("authentication tag mismatch".to_string()))?;

        Ok(Zeroizing::new(plaintext))
    }

    pub fn encrypt_secret(&self, secret: &SecretString) -> Result<Vec<u8>> {
        self.encrypt(secret.expose_secret().as_bytes())
    }

    pub fn decrypt_secret(&self, ciphertext: &[u8]) -> Result<SecretString> {
        let plaintext = self.decrypt(ciphertext)?;
        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| VaultError::Decrypt("plaintext is not UTF-8".to_string()))?;
        Ok(SecretString::from(text.to_string()))
    }
}
