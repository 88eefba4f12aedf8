//! Authenticated encryption for credentials at rest.
//!
//! Credentials are stored as hex-encoded `nonce || ciphertext || tag`
//! produced by AES-256-GCM with a fresh random 96-bit nonce per call.
//! The vault holds nothing beyond the key; plaintext only exists inside
//! the caller's scope.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};

use super::error::VaultError;

/// Expected length of the hex-encoded 256-bit key.
pub const KEY_HEX_LEN: usize = 64;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM cipher bound to a single key.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Builds a cipher from a 64-hex-character key.
    pub fn new(key_hex: &str) -> Result<Self, VaultError> {
        if key_hex.len() != KEY_HEX_LEN {
            return Err(VaultError::KeyFormat);
        }
        let key_bytes = hex::decode(key_hex).map_err(|_| VaultError::KeyFormat)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        Ok(Self { cipher })
    }

    /// Encrypts `plaintext`, returning hex-encoded `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| VaultError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(hex::encode(out))
    }

    /// Decrypts a hex-encoded `nonce || ciphertext || tag` blob.
    ///
    /// Returns `Auth` when the tag does not verify — the ciphertext was
    /// tampered with or a different key was used.
    pub fn decrypt(&self, ciphertext_hex: &str) -> Result<Vec<u8>, VaultError> {
        let raw = hex::decode(ciphertext_hex).map_err(|e| VaultError::Encoding(e.to_string()))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::Encoding("ciphertext too short".to_string()));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| VaultError::Auth)
    }
}
