use braid_core_types::{
    to_canonical_bytes, verify_with_did, CanonicalError, Did, DidKey, DidKeyError, HashAlgorithm,
    HybridTimestamp, IdError, NodeId,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors related to constructing, signing, and verifying nodes
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Canonical encoding failed: {0}")]
    Canonical(#[from] CanonicalError),
    #[error("Id computation failed: {0}")]
    Id(#[from] IdError),
    #[error("Content hash mismatch for node {0}")]
    HashMismatch(NodeId),
    #[error("Invalid signature by {author}: {source}")]
    SignatureInvalid {
        author: Did,
        #[source]
        source: DidKeyError,
    },
    #[error("Node id has not been computed yet")]
    MissingId,
    #[error("Invalid node data: {0}")]
    InvalidNodeData(String),
}

/// Who produced a message.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// Message content: plain text, or an ordered list of structured blocks.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "content")]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flatten to displayable text. Structured blocks contribute their
    /// text-like fields; opaque blocks render as their type tag.
    pub fn display_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b.value.as_str() {
                    Some(s) => s.to_string(),
                    None => format!("[{}]", b.block_type),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContentBlock {
    pub block_type: String,
    pub value: serde_json::Value,
}

/// The payload variants a node can carry. A closed sum type so traversal
/// logic is exhaustively checked.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "content")]
pub enum NodeBody {
    /// Conversation entry point: no parents, owner is the node author.
    Root(RootBody),
    /// A chat message with exactly one parent (preceding message or root).
    Message(MessageBody),
    /// Replacement content for the single parent node. The original is never
    /// mutated; the edit supersedes it for rendering only.
    Edit(EditBody),
    /// Marks a branch point; exactly one parent, new branch identity.
    Fork(ForkBody),
    /// Joins two or more branch tips and records the resolution outcome.
    Merge(MergeBody),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RootBody {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MessageBody {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EditBody {
    pub content: MessageContent,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ForkBody {
    pub branch: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MergeBody {
    pub resolution: MergeResolution,
}

/// The deterministic outcome a merge policy computed over the merged tips.
/// Identical inputs must produce identical resolutions on every replica.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MergeResolution {
    /// Name of the policy that produced this resolution.
    pub policy: String,
    /// The tip the policy selected as the winner.
    pub winner: NodeId,
    /// All merged tips, sorted by id.
    pub merged_tips: Vec<NodeId>,
}

/// Discriminant of a node body, used for secondary indexing and queries.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Root,
    Message,
    Edit,
    Fork,
    Merge,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Message => "message",
            NodeKind::Edit => "edit",
            NodeKind::Fork => "fork",
            NodeKind::Merge => "merge",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata carried by every node
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NodeMetadata {
    /// Author-local hybrid timestamp.
    pub timestamp: HybridTimestamp,
    /// Root id of the conversation this node belongs to. `None` exactly for
    /// roots, whose conversation id is their own id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<NodeId>,
    /// Optional sequence number in the author's chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// An unsigned DAG node. The signature and content address are both computed
/// over the canonical encoding of this struct.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Node {
    pub body: NodeBody,
    /// Ids of the nodes this one causally depends on; empty only for roots.
    pub parents: Vec<NodeId>,
    pub author: Did,
    pub metadata: NodeMetadata,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self.body {
            NodeBody::Root(_) => NodeKind::Root,
            NodeBody::Message(_) => NodeKind::Message,
            NodeBody::Edit(_) => NodeKind::Edit,
            NodeBody::Fork(_) => NodeKind::Fork,
            NodeBody::Merge(_) => NodeKind::Merge,
        }
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>, NodeError> {
        Ok(to_canonical_bytes(self)?)
    }

    /// Structural arity rules for each variant.
    pub fn validate(&self) -> Result<(), NodeError> {
        let arity_ok = match self.body {
            NodeBody::Root(_) => self.parents.is_empty(),
            NodeBody::Message(_) | NodeBody::Edit(_) | NodeBody::Fork(_) => {
                self.parents.len() == 1
            }
            NodeBody::Merge(_) => self.parents.len() >= 2,
        };
        if !arity_ok {
            return Err(NodeError::InvalidNodeData(format!(
                "{} node has {} parents",
                self.kind(),
                self.parents.len()
            )));
        }
        match self.body {
            NodeBody::Root(_) if self.metadata.conversation.is_some() => {
                Err(NodeError::InvalidNodeData(
                    "root node must not carry a conversation reference".to_string(),
                ))
            }
            NodeBody::Root(_) => Ok(()),
            _ if self.metadata.conversation.is_none() => Err(NodeError::InvalidNodeData(format!(
                "{} node is missing its conversation reference",
                self.kind()
            ))),
            _ => Ok(()),
        }
    }
}

/// A signed node ready for inclusion in the graph
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SignedNode {
    pub node: Node,
    /// Ed25519 signature over the canonical encoding of `node`.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    /// Content address, computed over the same canonical encoding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
}

impl SignedNode {
    /// Sign `node` with the author's key and compute its content address
    /// under the given hash family.
    pub fn sign(node: Node, key: &DidKey, algorithm: HashAlgorithm) -> Result<Self, NodeError> {
        let bytes = node.canonical_bytes()?;
        let signature = key.sign(&bytes).to_bytes().to_vec();
        let id = NodeId::digest(&bytes, algorithm)?;
        Ok(SignedNode {
            node,
            signature,
            id: Some(id),
        })
    }

    /// Calculate the content address for this node. The hash family is taken
    /// from the existing id when present, so verification of foreign nodes
    /// follows whatever family their author chose.
    pub fn calculate_id(&self) -> Result<NodeId, NodeError> {
        let bytes = self.node.canonical_bytes()?;
        let algorithm = match &self.id {
            Some(id) => id.algorithm()?,
            None => HashAlgorithm::default(),
        };
        Ok(NodeId::digest(&bytes, algorithm)?)
    }

    /// Ensure the id is computed and stored
    pub fn ensure_id(&mut self) -> Result<NodeId, NodeError> {
        match &self.id {
            Some(id) => Ok(id.clone()),
            None => {
                let id = self.calculate_id()?;
                self.id = Some(id.clone());
                Ok(id)
            }
        }
    }

    pub fn require_id(&self) -> Result<&NodeId, NodeError> {
        self.id.as_ref().ok_or(NodeError::MissingId)
    }

    /// Root id of the conversation this node belongs to.
    pub fn conversation_id(&self) -> Result<NodeId, NodeError> {
        match &self.node.metadata.conversation {
            Some(conversation) => Ok(conversation.clone()),
            None => Ok(self.require_id()?.clone()),
        }
    }

    /// Recompute the content address and compare to the stored id. A
    /// mismatch is a tamper/corruption signal, not a recoverable condition.
    pub fn verify_id(&self) -> Result<(), NodeError> {
        let id = self.require_id()?;
        let bytes = self.node.canonical_bytes()?;
        if id.matches(&bytes)? {
            Ok(())
        } else {
            Err(NodeError::HashMismatch(id.clone()))
        }
    }

    /// Verify the author's signature over the canonical encoding. The
    /// verifying key is recovered from the author DID — no registry.
    pub fn verify_signature(&self) -> Result<(), NodeError> {
        let bytes = self.node.canonical_bytes()?;
        verify_with_did(&self.node.author, &bytes, &self.signature).map_err(|source| {
            NodeError::SignatureInvalid {
                author: self.node.author.clone(),
                source,
            }
        })
    }

    /// Full integrity check: content address and signature.
    pub fn verify(&self) -> Result<(), NodeError> {
        self.verify_id()?;
        self.verify_signature()
    }
}

/// Builder for creating new unsigned nodes
pub struct NodeBuilder {
    body: Option<NodeBody>,
    parents: Vec<NodeId>,
    author: Option<Did>,
    timestamp: Option<HybridTimestamp>,
    conversation: Option<NodeId>,
    sequence: Option<u64>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            body: None,
            parents: Vec::new(),
            author: None,
            timestamp: None,
            conversation: None,
            sequence: None,
        }
    }

    pub fn with_body(mut self, body: NodeBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_parent(mut self, parent: NodeId) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn with_parents(mut self, parents: Vec<NodeId>) -> Self {
        self.parents.extend(parents);
        self
    }

    pub fn with_author(mut self, author: Did) -> Self {
        self.author = Some(author);
        self
    }

    pub fn with_timestamp(mut self, timestamp: HybridTimestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_conversation(mut self, conversation: NodeId) -> Self {
        self.conversation = Some(conversation);
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn build(self) -> Result<Node, NodeError> {
        let body = self
            .body
            .ok_or_else(|| NodeError::InvalidNodeData("Body is required".to_string()))?;
        let author = self
            .author
            .ok_or_else(|| NodeError::InvalidNodeData("Author is required".to_string()))?;
        let timestamp = self
            .timestamp
            .ok_or_else(|| NodeError::InvalidNodeData("Timestamp is required".to_string()))?;

        let node = Node {
            body,
            parents: self.parents,
            author,
            metadata: NodeMetadata {
                timestamp,
                conversation: self.conversation,
                sequence: self.sequence,
            },
        };
        node.validate()?;
        Ok(node)
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core_types::HybridClock;

    fn root_node(key: &DidKey, clock: &HybridClock) -> Node {
        NodeBuilder::new()
            .with_body(NodeBody::Root(RootBody {
                title: "test".into(),
                metadata: None,
            }))
            .with_author(key.did().clone())
            .with_timestamp(clock.now())
            .build()
            .unwrap()
    }

    #[test]
    fn sign_then_verify() {
        let key = DidKey::new();
        let clock = HybridClock::new();
        let node = root_node(&key, &clock);
        let signed = SignedNode::sign(node, &key, HashAlgorithm::Sha256).unwrap();
        signed.verify().unwrap();
    }

    #[test]
    fn content_address_round_trip() {
        let key = DidKey::new();
        let clock = HybridClock::new();
        let node = root_node(&key, &clock);
        let signed = SignedNode::sign(node, &key, HashAlgorithm::Blake3).unwrap();
        assert_eq!(signed.calculate_id().unwrap(), *signed.require_id().unwrap());
    }

    #[test]
    fn tampering_breaks_the_address() {
        let key = DidKey::new();
        let clock = HybridClock::new();
        let node = root_node(&key, &clock);
        let mut signed = SignedNode::sign(node, &key, HashAlgorithm::Sha256).unwrap();
        if let NodeBody::Root(root) = &mut signed.node.body {
            root.title = "rewritten".into();
        }
        assert!(matches!(
            signed.verify_id().unwrap_err(),
            NodeError::HashMismatch(_)
        ));
    }

    #[test]
    fn foreign_author_signature_rejected() {
        let author = DidKey::new();
        let impostor = DidKey::new();
        let clock = HybridClock::new();
        let node = root_node(&author, &clock);
        let mut signed = SignedNode::sign(node, &author, HashAlgorithm::Sha256).unwrap();
        // Re-sign with a different key; the author field still names `author`.
        let bytes = signed.node.canonical_bytes().unwrap();
        signed.signature = impostor.sign(&bytes).to_bytes().to_vec();
        assert!(matches!(
            signed.verify_signature().unwrap_err(),
            NodeError::SignatureInvalid { .. }
        ));
    }

    #[test]
    fn arity_rules_enforced() {
        let key = DidKey::new();
        let clock = HybridClock::new();
        let root = root_node(&key, &clock);
        let root_id = SignedNode::sign(root, &key, HashAlgorithm::Sha256)
            .unwrap()
            .require_id()
            .unwrap()
            .clone();

        // A message with no parent is structurally invalid.
        let result = NodeBuilder::new()
            .with_body(NodeBody::Message(MessageBody {
                role: Role::User,
                content: MessageContent::Text("hi".into()),
            }))
            .with_author(key.did().clone())
            .with_conversation(root_id.clone())
            .with_timestamp(clock.now())
            .build();
        assert!(matches!(result, Err(NodeError::InvalidNodeData(_))));

        // A merge with a single parent is structurally invalid.
        let result = NodeBuilder::new()
            .with_body(NodeBody::Merge(MergeBody {
                resolution: MergeResolution {
                    policy: "last-writer-wins".into(),
                    winner: root_id.clone(),
                    merged_tips: vec![root_id.clone()],
                },
            }))
            .with_parent(root_id.clone())
            .with_author(key.did().clone())
            .with_conversation(root_id)
            .with_timestamp(clock.now())
            .build();
        assert!(matches!(result, Err(NodeError::InvalidNodeData(_))));
    }
}
