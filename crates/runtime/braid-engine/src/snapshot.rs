//! Derived conversation materializations.
//!
//! A snapshot is a cache: it can always be rebuilt from the node set by
//! `DagEngine::traverse` and is never the source of truth for verification.

use braid_core_types::{Did, HybridTimestamp, NodeId};
use braid_types::node::{MessageContent, Role};
use serde::{Deserialize, Serialize};

/// One rendered message slot. `id` is the original message node; when the
/// slot has been edited, `rendered_from` points at the superseding edit node
/// whose content is shown.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RenderedMessage {
    pub id: NodeId,
    pub rendered_from: NodeId,
    pub role: Role,
    pub content: MessageContent,
    pub author: Did,
    pub timestamp: HybridTimestamp,
    pub edited: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub total_nodes: usize,
    pub message_count: usize,
    pub edit_count: usize,
    pub fork_count: usize,
    pub merge_count: usize,
}

/// Ordered view of a conversation from its root to one tip.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConversationSnapshot {
    pub conversation: NodeId,
    pub tip: NodeId,
    pub messages: Vec<RenderedMessage>,
    pub stats: SnapshotStats,
}

impl ConversationSnapshot {
    /// Plain-text transcript, mostly for logs and tests.
    pub fn transcript(&self) -> Vec<String> {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content.display_text()))
            .collect()
    }
}
