//! Authenticated symmetric encryption for sharing envelopes.

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng as AesRng},
    Aes256Gcm, Key,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 12;

#[derive(Error, Debug)]
pub enum SymmetricError {
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("Invalid nonce length: expected {expected}, got {got}")]
    InvalidNonceLength { expected: usize, got: usize },
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
}

/// An AES-256-GCM ciphertext together with the nonce it was sealed under.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Sealed {
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Generate a fresh 256-bit content key.
pub fn generate_key() -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt `plaintext` under `key` with a random nonce.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Sealed, SymmetricError> {
    if key.len() != KEY_LENGTH {
        return Err(SymmetricError::InvalidKeyLength {
            expected: KEY_LENGTH,
            got: key.len(),
        });
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut AesRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| SymmetricError::EncryptionFailed(e.to_string()))?;
    Ok(Sealed {
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

/// Decrypt a sealed payload. Authentication failure (wrong key or tampered
/// ciphertext) is an error, never garbage plaintext.
pub fn decrypt(key: &[u8], sealed: &Sealed) -> Result<Vec<u8>, SymmetricError> {
    if key.len() != KEY_LENGTH {
        return Err(SymmetricError::InvalidKeyLength {
            expected: KEY_LENGTH,
            got: key.len(),
        });
    }
    if sealed.nonce.len() != NONCE_LENGTH {
        return Err(SymmetricError::InvalidNonceLength {
            expected: NONCE_LENGTH,
            got: sealed.nonce.len(),
        });
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = GenericArray::from_slice(&sealed.nonce);
    cipher
        .decrypt(nonce, sealed.ciphertext.as_ref())
        .map_err(|e| SymmetricError::DecryptionFailed(e.to_string()))
}
