//! AES-256-GCM for credential secrets.
//!
//! Wire form is base64 of `nonce (12 bytes) || ciphertext+tag`.

use crate::types::{Error, Result};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

pub struct SecretCipher {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Key from base64 (32 bytes decoded).
    pub fn from_base64(master_key: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(master_key.trim())
            .map_err(|_| Error::validation("master key is not valid base64"))?;
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::validation("master key must decode to 32 bytes"))?;
        Ok(Self { key })
    }

    /// Random key for a process that has no configured master key. Secrets
    /// encrypted elsewhere cannot be read with it.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::internal(format!("cipher init: {}", e)))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| Error::internal(format!("encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|_| Error::internal("credential secret is not valid base64"))?;
        if raw.len() <= NONCE_SIZE {
            return Err(Error::internal("credential secret too short"));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::internal("credential secret failed authentication"))?;
        String::from_utf8(plaintext).map_err(|_| Error::internal("credential secret is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = SecretCipher::ephemeral();
        let sealed = cipher.encrypt("hunter2").unwrap();
        assert_ne!(sealed, "hunter2");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let cipher = SecretCipher::ephemeral();
        assert_ne!(cipher.encrypt("x").unwrap(), cipher.encrypt("x").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = SecretCipher::ephemeral().encrypt("hunter2").unwrap();
        let err = SecretCipher::ephemeral().decrypt(&sealed).unwrap_err();
        assert_eq!(err.code(), "internal_error");
    }

    #[test]
    fn test_from_base64_checks_length() {
        let key = STANDARD.encode([7u8; 32]);
        assert!(SecretCipher::from_base64(&key).is_ok());
        assert!(SecretCipher::from_base64(&STANDARD.encode([7u8; 16])).is_err());
        assert!(SecretCipher::from_base64("not base64!").is_err());
    }
}
