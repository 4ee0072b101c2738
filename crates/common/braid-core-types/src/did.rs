use ed25519_dalek::VerifyingKey;
use multibase::Base;
use serde::{Deserialize, Serialize};
use std::convert::TryInto;
use std::fmt;
use thiserror::Error;

/// Multicodec prefix for an Ed25519 public key in a did:key identifier.
const ED25519_MULTICODEC_PREFIX: &[u8] = &[0xed, 0x01];

#[derive(Error, Debug)]
pub enum DidError {
    #[error("Invalid DID string: {0}")]
    InvalidDidString(String),
    #[error("Unsupported DID method: {0}")]
    UnsupportedDidMethod(String),
    #[error("Invalid multibase encoding: {0}")]
    InvalidMultibase(#[from] multibase::Error),
    #[error("Invalid multicodec prefix: expected 0xed01, got {0:?}")]
    InvalidMulticodecPrefix(Vec<u8>),
    #[error("Invalid key bytes length: expected {expected}, got {got}")]
    InvalidKeyBytesLength { expected: usize, got: usize },
    #[error("Invalid public key bytes")]
    InvalidKeyBytes(#[from] ed25519_dalek::SignatureError),
}

/// A decentralized identifier, self-certified by the Ed25519 public key it
/// encodes (did:key method). Validating a DID never requires a registry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Did {
    #[serde(with = "serde_bytes")]
    public_key_bytes: Vec<u8>,
}

impl Did {
    pub fn new(verifying_key: &VerifyingKey) -> Self {
        Did {
            public_key_bytes: verifying_key.to_bytes().to_vec(),
        }
    }

    /// Parse a `did:key:z...` string back into a DID, validating the method,
    /// multibase encoding, and multicodec prefix.
    pub fn from_did_string(did_str: &str) -> Result<Self, DidError> {
        let encoded_key = did_str
            .strip_prefix("did:key:")
            .ok_or_else(|| DidError::UnsupportedDidMethod(did_str.to_string()))?;

        let (base, decoded) = multibase::decode(encoded_key)?;
        if base != Base::Base58Btc {
            return Err(DidError::InvalidDidString(
                "Expected base58btc encoding (prefix 'z')".to_string(),
            ));
        }

        if !decoded.starts_with(ED25519_MULTICODEC_PREFIX) {
            return Err(DidError::InvalidMulticodecPrefix(
                decoded.get(..2).unwrap_or_default().to_vec(),
            ));
        }

        let key_bytes = &decoded[ED25519_MULTICODEC_PREFIX.len()..];
        if key_bytes.len() != ed25519_dalek::PUBLIC_KEY_LENGTH {
            return Err(DidError::InvalidKeyBytesLength {
                expected: ed25519_dalek::PUBLIC_KEY_LENGTH,
                got: key_bytes.len(),
            });
        }

        Ok(Did {
            public_key_bytes: key_bytes.to_vec(),
        })
    }

    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public_key_bytes
    }

    /// Recover the verifying key directly from the identifier.
    pub fn to_verifying_key(&self) -> Result<VerifyingKey, DidError> {
        let key_bytes: &[u8; 32] = self.public_key_bytes[..].try_into().map_err(|_| {
            DidError::InvalidKeyBytesLength {
                expected: ed25519_dalek::PUBLIC_KEY_LENGTH,
                got: self.public_key_bytes.len(),
            }
        })?;
        Ok(VerifyingKey::from_bytes(key_bytes)?)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut prefixed_key = ED25519_MULTICODEC_PREFIX.to_vec();
        prefixed_key.extend_from_slice(&self.public_key_bytes);
        write!(
            f,
            "did:key:{}",
            multibase::encode(Base::Base58Btc, prefixed_key)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::did_key::DidKey;

    #[test]
    fn did_string_round_trip() {
        let key = DidKey::new();
        let did = key.did().clone();
        let parsed = Did::from_did_string(&did.to_string()).unwrap();
        assert_eq!(did, parsed);
    }

    #[test]
    fn rejects_other_methods() {
        let err = Did::from_did_string("did:web:example.com").unwrap_err();
        assert!(matches!(err, DidError::UnsupportedDidMethod(_)));
    }

    #[test]
    fn rejects_wrong_multicodec() {
        // base58btc of bytes that do not start with 0xed01
        let bogus = format!(
            "did:key:{}",
            multibase::encode(Base::Base58Btc, [0x12u8, 0x20, 1, 2, 3])
        );
        let err = Did::from_did_string(&bogus).unwrap_err();
        assert!(matches!(err, DidError::InvalidMulticodecPrefix(_)));
    }
}
