//! AES-256-GCM sealing of embedding blobs.
//!
//! A sealed blob is `nonce || ciphertext`, with a fresh random 96-bit nonce
//! per write.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("sealed blob is shorter than its nonce")]
    Truncated,
    #[error("failed to seal embedding")]
    Seal,
    #[error("failed to open sealed embedding (wrong key or tampered data)")]
    Open,
}

pub struct EmbeddingCipher {
    cipher: Aes256Gcm,
}

impl EmbeddingCipher {
    /// Derive the 256-bit key as SHA-256 of `passphrase`.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key = Sha256::digest(passphrase.as_bytes());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Seal)?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, CipherError> {
        if blob.len() < NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Open)
    }
}

impl std::fmt::Debug for EmbeddingCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EmbeddingCipher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_then_open() {
        let cipher = EmbeddingCipher::from_passphrase("correct horse");
        let sealed = cipher.seal(b"embedding bytes").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"embedding bytes");
        assert_eq!(cipher.open(&sealed).unwrap(), b"embedding bytes");
    }

    #[test]
    fn test_nonce_is_fresh_per_seal() {
        let cipher = EmbeddingCipher::from_passphrase("k");
        assert_ne!(cipher.seal(b"x").unwrap(), cipher.seal(b"x").unwrap());
    }

    #[test]
    fn test_wrong_key_and_truncation() {
        let sealed = EmbeddingCipher::from_passphrase("a").seal(b"secret").unwrap();
        let other = EmbeddingCipher::from_passphrase("b");
        assert_eq!(other.open(&sealed), Err(CipherError::Open));
        assert_eq!(other.open(&sealed[..4]), Err(CipherError::Truncated));
    }
}
