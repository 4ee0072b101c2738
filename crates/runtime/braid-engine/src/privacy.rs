//! The privacy lifecycle: LOCAL → SHARED → PUBLIC.
//!
//! Transitions are one-directional and checked before any mutation. Sharing
//! uses envelope encryption: the node set is sealed once under a fresh
//! content key, and the content key is wrapped separately for each recipient
//! via an ephemeral X25519 exchange. Publishing commits a Merkle root over
//! the conversation's node-id set; after that the lineage is frozen forever.

use crate::dag::{DagEngine, EngineError};
use braid_core_types::symmetric::{self, Sealed, SymmetricError};
use braid_core_types::{
    from_canonical_bytes, to_canonical_bytes, CanonicalError, Did, DidKey, HybridTimestamp,
    NodeId,
};
use braid_types::anchor::{AnchorError, ChainAnchor};
use braid_types::merkle::merkle_root;
use braid_types::node::SignedNode;
use braid_types::store::{NodeStore, StoreError, Visibility};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

#[derive(Error, Debug)]
pub enum PrivacyError {
    #[error("Invalid privacy transition: {from:?} -> {to:?}")]
    InvalidTransition { from: Visibility, to: Visibility },
    #[error("Conversation not found: {0}")]
    ConversationNotFound(NodeId),
    #[error("Cannot share with an empty recipient list")]
    NoRecipients,
    #[error("Envelope is not addressed to {0}")]
    NotARecipient(Did),
    #[error("Conversation {0} has no nodes to anchor")]
    NothingToAnchor(NodeId),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Symmetric(#[from] SymmetricError),
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    #[error(transparent)]
    Anchor(#[from] AnchorError),
}

/// A recipient's sharing identity: their DID plus the X25519 public key the
/// content key gets wrapped to.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RecipientKey {
    pub did: Did,
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
}

impl RecipientKey {
    /// Generate a fresh sharing keypair for `did`. The secret half stays
    /// with the recipient; only the public half travels.
    pub fn generate(did: Did) -> (Self, StaticSecret) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (
            RecipientKey {
                did,
                public_key: public.as_bytes().to_vec(),
            },
            secret,
        )
    }
}

/// The content key, wrapped for one recipient.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KeyWrap {
    pub recipient: Did,
    /// Sender-side ephemeral X25519 public key for this wrap.
    #[serde(with = "serde_bytes")]
    pub ephemeral_public_key: Vec<u8>,
    pub wrapped_key: Sealed,
}

/// An encrypted conversation plus one key wrap per recipient.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SharedEnvelope {
    pub conversation: NodeId,
    pub sharer: Did,
    pub created_at: HybridTimestamp,
    /// The conversation's full node set, sealed under the content key.
    pub payload: Sealed,
    pub recipients: Vec<KeyWrap>,
}

impl SharedEnvelope {
    /// Recipient-side open: unwrap the content key with the recipient's
    /// secret, then unseal the node set.
    pub fn open(
        &self,
        recipient: &Did,
        secret: &StaticSecret,
    ) -> Result<Vec<SignedNode>, PrivacyError> {
        let wrap = self
            .recipients
            .iter()
            .find(|wrap| wrap.recipient == *recipient)
            .ok_or_else(|| PrivacyError::NotARecipient(recipient.clone()))?;

        let ephemeral_bytes: [u8; 32] = wrap.ephemeral_public_key.as_slice().try_into().map_err(
            |_| {
                SymmetricError::InvalidKeyLength {
                    expected: 32,
                    got: wrap.ephemeral_public_key.len(),
                }
            },
        )?;
        let shared_secret = secret.diffie_hellman(&PublicKey::from(ephemeral_bytes));
        let content_key = symmetric::decrypt(shared_secret.as_bytes(), &wrap.wrapped_key)?;
        let plaintext = symmetric::decrypt(&content_key, &self.payload)?;
        Ok(from_canonical_bytes(&plaintext)?)
    }
}

/// State machine driver for a conversation's visibility.
pub struct PrivacyManager<S> {
    engine: DagEngine<S>,
}

impl<S: NodeStore + Clone> PrivacyManager<S> {
    pub fn new(engine: DagEngine<S>) -> Self {
        Self { engine }
    }

    /// Encrypt the conversation for the given recipients and move it to
    /// SHARED. Re-sharing an already-shared conversation is allowed (it is
    /// not a transition); sharing a published one is refused.
    pub async fn share_with(
        &self,
        conversation: &NodeId,
        recipients: &[RecipientKey],
        sharer: &DidKey,
    ) -> Result<SharedEnvelope, PrivacyError> {
        if recipients.is_empty() {
            return Err(PrivacyError::NoRecipients);
        }
        let mut record = self
            .engine
            .store()
            .conversation(conversation)
            .await?
            .ok_or_else(|| PrivacyError::ConversationNotFound(conversation.clone()))?;

        match record.visibility {
            Visibility::Local | Visibility::Shared => {}
            from => {
                return Err(PrivacyError::InvalidTransition {
                    from,
                    to: Visibility::Shared,
                })
            }
        }

        let nodes = self.engine.conversation_nodes(conversation).await?;
        let content_key = symmetric::generate_key();
        let payload = symmetric::encrypt(&content_key, &to_canonical_bytes(&nodes)?)?;

        let mut wraps = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let recipient_bytes: [u8; 32] =
                recipient.public_key.as_slice().try_into().map_err(|_| {
                    SymmetricError::InvalidKeyLength {
                        expected: 32,
                        got: recipient.public_key.len(),
                    }
                })?;
            let ephemeral = EphemeralSecret::random_from_rng(OsRng);
            let ephemeral_public = PublicKey::from(&ephemeral);
            let shared_secret = ephemeral.diffie_hellman(&PublicKey::from(recipient_bytes));
            let wrapped_key = symmetric::encrypt(shared_secret.as_bytes(), &content_key)?;
            wraps.push(KeyWrap {
                recipient: recipient.did.clone(),
                ephemeral_public_key: ephemeral_public.as_bytes().to_vec(),
                wrapped_key,
            });
        }

        if record.visibility == Visibility::Local {
            record.visibility = Visibility::Shared;
            self.engine
                .store()
                .update_conversation(record)
                .await?;
        }
        info!(conversation = %conversation, recipients = wraps.len(), "shared conversation");

        Ok(SharedEnvelope {
            conversation: conversation.clone(),
            sharer: sharer.did().clone(),
            created_at: self.engine.clock().now(),
            payload,
            recipients: wraps,
        })
    }

    /// Commit the conversation's Merkle root and move it to PUBLIC. The
    /// returned anchor record is handed to the external anchoring
    /// collaborator; the network write is not this crate's job. PUBLIC is
    /// permanent: every later mutation of this lineage is refused.
    pub async fn publish(
        &self,
        conversation: &NodeId,
        publisher: &DidKey,
    ) -> Result<ChainAnchor, PrivacyError> {
        let mut record = self
            .engine
            .store()
            .conversation(conversation)
            .await?
            .ok_or_else(|| PrivacyError::ConversationNotFound(conversation.clone()))?;

        if !record.visibility.can_transition_to(Visibility::Public) {
            return Err(PrivacyError::InvalidTransition {
                from: record.visibility,
                to: Visibility::Public,
            });
        }

        let ids = self.engine.conversation_node_ids(conversation).await?;
        let root = merkle_root(&ids)
            .ok_or_else(|| PrivacyError::NothingToAnchor(conversation.clone()))?;
        let anchor = ChainAnchor::create(
            conversation.clone(),
            root,
            publisher,
            self.engine.clock().now(),
        )?;

        record.visibility = Visibility::Public;
        record.anchor = Some(anchor.clone());
        self.engine.store().update_conversation(record).await?;
        info!(conversation = %conversation, merkle_root = %anchor.merkle_root, "published conversation");

        Ok(anchor)
    }

    /// Recompute the Merkle root of a published conversation and compare it
    /// to the anchored commitment. `false` means the frozen node set no
    /// longer reproduces what was published.
    pub async fn verify_published(&self, conversation: &NodeId) -> Result<bool, PrivacyError> {
        let record = self
            .engine
            .store()
            .conversation(conversation)
            .await?
            .ok_or_else(|| PrivacyError::ConversationNotFound(conversation.clone()))?;
        let anchor = match &record.anchor {
            Some(anchor) => anchor,
            None => return Ok(false),
        };
        anchor.verify()?;
        let ids = self.engine.conversation_node_ids(conversation).await?;
        Ok(merkle_root(&ids).as_ref() == Some(&anchor.merkle_root))
    }
}
