use crate::node::{NodeKind, SignedNode};
use crate::store::{sort_by_time, ConversationRecord, NodeQuery, NodeStore, StoreError};
use async_trait::async_trait;
use braid_core_types::NodeId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory implementation of the `NodeStore` trait. The default backend
/// for tests and single-process use.
#[derive(Debug, Clone, Default)]
pub struct MemoryNodeStore {
    /// Map of node id -> signed node
    nodes: Arc<RwLock<HashMap<NodeId, SignedNode>>>,
    /// Map of parent id -> set of child ids
    children: Arc<RwLock<HashMap<NodeId, HashSet<NodeId>>>>,
    /// Map of conversation root id -> current tip set
    tips: Arc<RwLock<HashMap<NodeId, HashSet<NodeId>>>>,
    /// Map of author DID string -> node ids
    by_author: Arc<RwLock<HashMap<String, HashSet<NodeId>>>>,
    /// Map of node kind -> node ids
    by_kind: Arc<RwLock<HashMap<NodeKind, HashSet<NodeId>>>>,
    /// Conversation registry
    conversations: Arc<RwLock<HashMap<NodeId, ConversationRecord>>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn put(&self, mut node: SignedNode) -> Result<NodeId, StoreError> {
        let id = node.ensure_id()?;
        node.verify_id()
            .map_err(|_| StoreError::HashMismatch(id.clone()))?;
        node.node
            .validate()
            .map_err(|e| StoreError::InvalidNode(e.to_string()))?;
        let conversation = node.conversation_id()?;

        let mut nodes = self.nodes.write().await;

        // Idempotent: re-putting an identical node is a no-op success.
        if nodes.contains_key(&id) {
            return Ok(id);
        }

        // Parents must already exist; the DAG is append-only with no
        // forward references.
        for parent in &node.node.parents {
            if !nodes.contains_key(parent) {
                return Err(StoreError::DanglingParent {
                    child: id.clone(),
                    parent: parent.clone(),
                });
            }
        }

        let mut tips = self.tips.write().await;
        let mut children = self.children.write().await;
        let mut by_author = self.by_author.write().await;
        let mut by_kind = self.by_kind.write().await;

        let conversation_tips = tips.entry(conversation).or_default();
        conversation_tips.insert(id.clone());
        for parent in &node.node.parents {
            conversation_tips.remove(parent);
            children
                .entry(parent.clone())
                .or_default()
                .insert(id.clone());
        }

        by_author
            .entry(node.node.author.to_string())
            .or_default()
            .insert(id.clone());
        by_kind
            .entry(node.node.kind())
            .or_default()
            .insert(id.clone());

        debug!(node = %id, kind = %node.node.kind(), "stored node");
        nodes.insert(id.clone(), node);
        Ok(id)
    }

    async fn get(&self, id: &NodeId) -> Result<Option<SignedNode>, StoreError> {
        let nodes = self.nodes.read().await;
        Ok(nodes.get(id).cloned())
    }

    async fn query(&self, query: &NodeQuery) -> Result<Vec<SignedNode>, StoreError> {
        let nodes = self.nodes.read().await;
        let mut matched: Vec<SignedNode> = nodes
            .values()
            .filter(|node| query.matches(node))
            .cloned()
            .collect();
        drop(nodes);
        sort_by_time(&mut matched);
        Ok(matched)
    }

    async fn children(&self, id: &NodeId) -> Result<Vec<NodeId>, StoreError> {
        let children = self.children.read().await;
        let mut result: Vec<NodeId> = children
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        result.sort();
        Ok(result)
    }

    async fn tips(&self, conversation: &NodeId) -> Result<Vec<NodeId>, StoreError> {
        let tips = self.tips.read().await;
        let mut result: Vec<NodeId> = tips
            .get(conversation)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        result.sort();
        Ok(result)
    }

    async fn register_conversation(&self, record: ConversationRecord) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().await;
        conversations.insert(record.root.clone(), record);
        Ok(())
    }

    async fn conversation(
        &self,
        root: &NodeId,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(root).cloned())
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>, StoreError> {
        let conversations = self.conversations.read().await;
        let mut records: Vec<ConversationRecord> = conversations.values().cloned().collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.root.cmp(&b.root))
        });
        Ok(records)
    }

    async fn update_conversation(&self, record: ConversationRecord) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().await;
        if !conversations.contains_key(&record.root) {
            return Err(StoreError::UnknownConversation(record.root.clone()));
        }
        conversations.insert(record.root.clone(), record);
        Ok(())
    }

    async fn delete_conversation(&self, root: &NodeId) -> Result<bool, StoreError> {
        let mut conversations = self.conversations.write().await;
        let existed = conversations.remove(root).is_some();
        if existed {
            debug!(conversation = %root, "deleted conversation record");
        }
        Ok(existed)
    }

    async fn collect_garbage(&self) -> Result<usize, StoreError> {
        let mut nodes = self.nodes.write().await;
        let mut tips = self.tips.write().await;
        let mut children = self.children.write().await;
        let mut by_author = self.by_author.write().await;
        let mut by_kind = self.by_kind.write().await;
        let conversations = self.conversations.read().await;

        // Mark: everything reachable from a live root through child edges.
        let mut live: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<NodeId> = conversations
            .keys()
            .filter(|root| nodes.contains_key(root))
            .cloned()
            .collect();
        while let Some(id) = queue.pop_front() {
            if !live.insert(id.clone()) {
                continue;
            }
            if let Some(child_ids) = children.get(&id) {
                queue.extend(child_ids.iter().cloned());
            }
        }

        // Sweep: drop everything else from the node map and all indices.
        let dead: Vec<NodeId> = nodes
            .keys()
            .filter(|id| !live.contains(*id))
            .cloned()
            .collect();
        for id in &dead {
            if let Some(node) = nodes.remove(id) {
                if let Some(set) = by_author.get_mut(&node.node.author.to_string()) {
                    set.remove(id);
                }
                if let Some(set) = by_kind.get_mut(&node.node.kind()) {
                    set.remove(id);
                }
            }
            children.remove(id);
        }
        for set in children.values_mut() {
            for id in &dead {
                set.remove(id);
            }
        }
        tips.retain(|conversation, _| conversations.contains_key(conversation));

        if !dead.is_empty() {
            debug!(removed = dead.len(), "garbage collected unreachable nodes");
        }
        Ok(dead.len())
    }
}
