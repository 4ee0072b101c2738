use crate::did::{Did, DidError};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DidKeyError {
    #[error("Signature verification failed")]
    VerificationError(#[from] ed25519_dalek::SignatureError),
    #[error("Invalid signature length: expected {expected}, got {got}")]
    InvalidSignatureLength { expected: usize, got: usize },
    #[error(transparent)]
    Did(#[from] DidError),
}

/// Manages an Ed25519 keypair (SigningKey + VerifyingKey) associated with a
/// did:key identity.
#[derive(Debug)]
pub struct DidKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    did: Did,
}

impl DidKey {
    /// Generate a fresh identity from the OS entropy source.
    pub fn new() -> Self {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        Self::from_signing_key(signing_key)
    }

    /// Rebuild an identity from stored secret key bytes. Handy for tests that
    /// need the same author on two replicas.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let did = Did::new(&verifying_key);
        DidKey {
            signing_key,
            verifying_key,
            did,
        }
    }

    pub fn did(&self) -> &Did {
        &self.did
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), DidKeyError> {
        self.verifying_key
            .verify(message, signature)
            .map_err(DidKeyError::VerificationError)
    }
}

impl Default for DidKey {
    fn default() -> Self {
        Self::new()
    }
}

/// Verify `signature_bytes` over `message` against the public key embedded in
/// `did`. This is the registry-free verification path every node read uses.
pub fn verify_with_did(
    did: &Did,
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), DidKeyError> {
    if signature_bytes.len() != ed25519_dalek::SIGNATURE_LENGTH {
        return Err(DidKeyError::InvalidSignatureLength {
            expected: ed25519_dalek::SIGNATURE_LENGTH,
            got: signature_bytes.len(),
        });
    }
    let signature = Signature::from_slice(signature_bytes)?;
    let verifying_key = did.to_verifying_key()?;
    verifying_key
        .verify(message, &signature)
        .map_err(DidKeyError::VerificationError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let key = DidKey::new();
        let sig = key.sign(b"message");
        key.verify(b"message", &sig).unwrap();
        assert!(key.verify(b"other", &sig).is_err());
    }

    #[test]
    fn verify_through_did_only() {
        let key = DidKey::new();
        let sig = key.sign(b"payload");
        verify_with_did(key.did(), b"payload", &sig.to_bytes()).unwrap();
    }

    #[test]
    fn rejects_short_signature() {
        let key = DidKey::new();
        let err = verify_with_did(key.did(), b"payload", &[0u8; 10]).unwrap_err();
        assert!(matches!(err, DidKeyError::InvalidSignatureLength { .. }));
    }

    #[test]
    fn deterministic_from_secret() {
        let a = DidKey::from_secret_bytes(&[7u8; 32]);
        let b = DidKey::from_secret_bytes(&[7u8; 32]);
        assert_eq!(a.did(), b.did());
        assert_eq!(a.sign(b"x").to_bytes(), b.sign(b"x").to_bytes());
    }
}
