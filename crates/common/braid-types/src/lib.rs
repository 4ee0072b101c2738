//! braid-types
//! Node model, Merkle engine, and content-addressed store for the Braid
//! conversation DAG.

pub mod anchor;
pub mod merkle;
pub mod node;
pub mod store;
pub mod sync;

// Re-export core types for easier access
pub use anchor::{AnchorError, ChainAnchor};
pub use merkle::{merkle_root, MerkleProof, MerkleRoot, MerkleTree};
pub use node::{
    ContentBlock, EditBody, ForkBody, MergeBody, MergeResolution, MessageBody, MessageContent,
    Node, NodeBody, NodeBuilder, NodeError, NodeKind, NodeMetadata, Role, RootBody, SignedNode,
};
pub use store::memory::MemoryNodeStore;
pub use store::{ConversationRecord, NodeQuery, NodeStore, StoreError, Visibility};
pub use sync::{DeltaQuery, IngestReport};

#[cfg(feature = "persistence")]
pub use store::rocksdb::RocksDbNodeStore;

// Re-export the identity/crypto layer so downstream crates can use one
// import path.
pub use braid_core_types::{
    Did, DidKey, HashAlgorithm, HybridClock, HybridTimestamp, NodeId,
};
