use crate::merkle::MerkleRoot;
use braid_core_types::{
    to_canonical_bytes, verify_with_did, CanonicalError, Did, DidKey, DidKeyError,
    HybridTimestamp, NodeId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnchorError {
    #[error("Canonical encoding failed: {0}")]
    Canonical(#[from] CanonicalError),
    #[error("Anchor signature invalid: {0}")]
    SignatureInvalid(#[from] DidKeyError),
}

/// Commitment record for a published conversation, handed off to an external
/// anchoring collaborator. The network write itself happens elsewhere; this
/// record is what gets written.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChainAnchor {
    /// Root id of the anchored conversation.
    pub conversation: NodeId,
    /// Merkle root over the conversation's full node-id set at publish time.
    pub merkle_root: MerkleRoot,
    /// DID of the identity that published the conversation.
    pub publisher: Did,
    /// When the anchor was produced.
    pub timestamp: HybridTimestamp,
    /// Publisher's signature over the canonical encoding of the fields above.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Signing view: the anchor minus its signature, in canonical field order.
#[derive(Serialize)]
struct AnchorSigningView<'a> {
    conversation: &'a NodeId,
    merkle_root: &'a MerkleRoot,
    publisher: &'a Did,
    timestamp: &'a HybridTimestamp,
}

impl ChainAnchor {
    pub fn create(
        conversation: NodeId,
        merkle_root: MerkleRoot,
        publisher: &DidKey,
        timestamp: HybridTimestamp,
    ) -> Result<Self, AnchorError> {
        let view = AnchorSigningView {
            conversation: &conversation,
            merkle_root: &merkle_root,
            publisher: publisher.did(),
            timestamp: &timestamp,
        };
        let bytes = to_canonical_bytes(&view)?;
        let signature = publisher.sign(&bytes).to_bytes().to_vec();
        Ok(ChainAnchor {
            conversation,
            merkle_root,
            publisher: publisher.did().clone(),
            timestamp,
            signature,
        })
    }

    /// Verify the publisher's signature. The key comes straight out of the
    /// publisher DID.
    pub fn verify(&self) -> Result<(), AnchorError> {
        let view = AnchorSigningView {
            conversation: &self.conversation,
            merkle_root: &self.merkle_root,
            publisher: &self.publisher,
            timestamp: &self.timestamp,
        };
        let bytes = to_canonical_bytes(&view)?;
        verify_with_did(&self.publisher, &bytes, &self.signature)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::merkle_root;
    use braid_core_types::HashAlgorithm;

    #[test]
    fn anchor_round_trip() {
        let key = DidKey::new();
        let conversation = NodeId::digest(b"root", HashAlgorithm::Sha256).unwrap();
        let root = merkle_root(&[conversation.clone()]).unwrap();
        let anchor = ChainAnchor::create(
            conversation,
            root,
            &key,
            HybridTimestamp::new(1_700_000_000_000, 0),
        )
        .unwrap();
        anchor.verify().unwrap();
    }

    #[test]
    fn tampered_anchor_rejected() {
        let key = DidKey::new();
        let conversation = NodeId::digest(b"root", HashAlgorithm::Sha256).unwrap();
        let root = merkle_root(&[conversation.clone()]).unwrap();
        let mut anchor = ChainAnchor::create(
            conversation,
            root,
            &key,
            HybridTimestamp::new(1_700_000_000_000, 0),
        )
        .unwrap();
        anchor.timestamp = HybridTimestamp::new(1_700_000_000_001, 0);
        assert!(anchor.verify().is_err());
    }
}
