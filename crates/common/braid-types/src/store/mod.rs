//! The content-addressed object store.
//!
//! The store is the only shared mutable resource in the system; every other
//! layer is a pure function over its inputs. `put` is idempotent and
//! content-addressed, so racing writers converge on sibling nodes rather
//! than corrupting state.

use crate::anchor::ChainAnchor;
use crate::node::{NodeError, NodeKind, SignedNode};
use async_trait::async_trait;
use braid_core_types::{Did, HybridTimestamp, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;

#[cfg(feature = "persistence")]
pub mod rocksdb;

/// Error types related to store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Content hash mismatch for node {0}")]
    HashMismatch(NodeId),
    #[error("Dangling parent {parent} for node {child}")]
    DanglingParent { child: NodeId, parent: NodeId },
    #[error("Invalid node: {0}")]
    InvalidNode(String),
    #[error("Conversation not registered: {0}")]
    UnknownConversation(NodeId),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("Storage error: {0}")]
    Storage(String),
    #[cfg(feature = "persistence")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] ::rocksdb::Error),
}

/// Where a conversation sits in the privacy lifecycle. Transitions are
/// one-directional; `Public` is permanent.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Local,
    Shared,
    Public,
}

impl Visibility {
    /// Legal forward transitions: Local→Shared, Local→Public, Shared→Public.
    pub fn can_transition_to(self, next: Visibility) -> bool {
        matches!(
            (self, next),
            (Visibility::Local, Visibility::Shared)
                | (Visibility::Local, Visibility::Public)
                | (Visibility::Shared, Visibility::Public)
        )
    }
}

/// Mutable per-conversation registry entry. This is store-side state, not a
/// node: deleting it is what conversation deletion means, and the node set
/// below it becomes garbage once unreachable from every live record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConversationRecord {
    /// Id of the conversation's root node.
    pub root: NodeId,
    /// DID of the conversation owner (the root's author).
    pub owner: Did,
    pub visibility: Visibility,
    /// Set once the conversation is published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor: Option<ChainAnchor>,
    pub created_at: HybridTimestamp,
}

impl ConversationRecord {
    pub fn new(root: NodeId, owner: Did, created_at: HybridTimestamp) -> Self {
        Self {
            root,
            owner,
            visibility: Visibility::Local,
            anchor: None,
            created_at,
        }
    }
}

/// Filter for store queries. Empty filters match everything; results are
/// ordered ascending by `(timestamp, id)`.
#[derive(Clone, Debug, Default)]
pub struct NodeQuery {
    pub conversation: Option<NodeId>,
    pub authors: Option<Vec<Did>>,
    pub kinds: Option<Vec<NodeKind>>,
    /// Exclusive lower bound.
    pub since: Option<HybridTimestamp>,
    /// Inclusive upper bound.
    pub until: Option<HybridTimestamp>,
}

impl NodeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_conversation(mut self, conversation: NodeId) -> Self {
        self.conversation = Some(conversation);
        self
    }

    pub fn by_authors(mut self, authors: Vec<Did>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn of_kinds(mut self, kinds: Vec<NodeKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn since(mut self, since: HybridTimestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: HybridTimestamp) -> Self {
        self.until = Some(until);
        self
    }

    /// Whether a stored node matches this filter. The conversation term is
    /// matched against the node's conversation id (a root matches its own
    /// conversation).
    pub fn matches(&self, node: &SignedNode) -> bool {
        if let Some(conversation) = &self.conversation {
            match node.conversation_id() {
                Ok(id) if id == *conversation => {}
                _ => return false,
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&node.node.author) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&node.node.kind()) {
                return false;
            }
        }
        let timestamp = node.node.metadata.timestamp;
        if let Some(since) = &self.since {
            if timestamp <= *since {
                return false;
            }
        }
        if let Some(until) = &self.until {
            if timestamp > *until {
                return false;
            }
        }
        true
    }
}

/// Sort nodes into the canonical query order: ascending `(timestamp, id)`.
pub(crate) fn sort_by_time(nodes: &mut [SignedNode]) {
    nodes.sort_by(|a, b| {
        let time = a
            .node
            .metadata
            .timestamp
            .cmp(&b.node.metadata.timestamp);
        time.then_with(|| a.id.cmp(&b.id))
    });
}

/// Trait defining the interface for store backends
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Persist a signed node. Recomputes the content address (rejecting on
    /// mismatch), requires every parent to already exist, and is a no-op
    /// success for nodes already present.
    async fn put(&self, node: SignedNode) -> Result<NodeId, StoreError>;

    /// Retrieve a node by its id. Absence is an expected outcome, not an
    /// error.
    async fn get(&self, id: &NodeId) -> Result<Option<SignedNode>, StoreError>;

    async fn contains(&self, id: &NodeId) -> Result<bool, StoreError> {
        Ok(self.get(id).await?.is_some())
    }

    /// Filtered lookup across the secondary indices, ordered ascending by
    /// `(timestamp, id)`.
    async fn query(&self, query: &NodeQuery) -> Result<Vec<SignedNode>, StoreError>;

    /// Ids of the direct children of a node.
    async fn children(&self, id: &NodeId) -> Result<Vec<NodeId>, StoreError>;

    /// Current tip set of a conversation (nodes with no children).
    async fn tips(&self, conversation: &NodeId) -> Result<Vec<NodeId>, StoreError>;

    async fn register_conversation(&self, record: ConversationRecord) -> Result<(), StoreError>;

    async fn conversation(
        &self,
        root: &NodeId,
    ) -> Result<Option<ConversationRecord>, StoreError>;

    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>, StoreError>;

    /// Replace an existing conversation record (visibility/anchor changes).
    async fn update_conversation(&self, record: ConversationRecord) -> Result<(), StoreError>;

    /// Drop the conversation's registry record. Nodes stay in place until
    /// `collect_garbage` finds them unreachable. Returns whether a record
    /// existed.
    async fn delete_conversation(&self, root: &NodeId) -> Result<bool, StoreError>;

    /// Remove every node unreachable from all live conversation roots.
    /// Returns the number of nodes removed.
    async fn collect_garbage(&self) -> Result<usize, StoreError>;
}
