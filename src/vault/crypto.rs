//! Key encryption.
//!
//! The master key is the SHA-256 digest of the configured secret. Every stored value gets its own
//! random 12-byte nonce, kept next to the ciphertext as the record's `iv`. Both are hex encoded.

use crate::core::error::{GatewayError, GatewayResult};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Ciphertext and nonce of one stored key, hex encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedValue {
    pub value: String,
    pub iv: String,
}

/// Authenticated encryption of key material under the vault master key
pub struct KeyCipher {
    cipher: ChaCha20Poly1305,
}

impl KeyCipher {
    /// Derive the master key from `secret`
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(digest.as_slice())),
        }
    }

    /// Encrypt `plaintext` under a fresh random nonce
    pub fn encrypt(&self, plaintext: &str) -> GatewayResult<EncryptedValue> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| GatewayError::internal(format!("Encryption failed: {}", e)))?;

        Ok(EncryptedValue {
            value: hex::encode(ciphertext),
            iv: hex::encode(nonce),
        })
    }

    /// Decrypt a stored value.
    ///
    /// Malformed hex, a nonce of the wrong size, a failed tag check (wrong secret or tampering)
    /// and non UTF-8 plaintext all report [`GatewayError::Decryption`] for `key_id`.
    pub fn decrypt(&self, key_id: &str, value: &str, iv: &str) -> GatewayResult<String> {
        let failed = || GatewayError::Decryption {
            key_id: key_id.to_string(),
        };

        let ciphertext = hex::decode(value).map_err(|_| failed())?;
        let nonce = hex::decode(iv).map_err(|_| failed())?;
        if nonce.len() != NONCE_LEN {
            return Err(failed());
        }

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| failed())?;

        String::from_utf8(plaintext).map_err(|_| failed())
    }
}

impl std::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCipher").field("key", &"[REDACTED]").finish()
    }
}
