//! The mutation algebra over conversation DAGs.
//!
//! Every operation canonicalizes, signs, and stores a new immutable node;
//! nothing here mutates existing nodes. The engine is constructed with an
//! explicit store (no singletons) and is logically serialized per
//! conversation by its caller — racing writers converge on sibling nodes
//! because the store's `put` is idempotent and content-addressed.

use crate::snapshot::{ConversationSnapshot, RenderedMessage, SnapshotStats};
use braid_core_types::{DidKey, HashAlgorithm, HybridClock, NodeId};
use braid_types::node::{
    EditBody, ForkBody, MergeBody, MergeResolution, MessageBody, MessageContent, NodeBody,
    NodeBuilder, NodeError, NodeKind, Role, RootBody, SignedNode,
};
use braid_types::store::{ConversationRecord, NodeQuery, NodeStore, StoreError, Visibility};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(NodeId),
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("Node {node} does not belong to conversation {conversation}")]
    ForeignNode {
        node: NodeId,
        conversation: NodeId,
    },
    #[error("Conversation {conversation} has {tips} tips; pick one explicitly")]
    AmbiguousTip {
        conversation: NodeId,
        tips: usize,
    },
    #[error("Conversation {0} is published and frozen; fork a new lineage instead")]
    ConversationFrozen(NodeId),
    #[error("Structural integrity failure at node {node}: {reason}")]
    IntegrityFailure { node: NodeId, reason: String },
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Pluggable conflict resolution for merges. The resolution must be a pure
/// function of the tip nodes so every replica computes the same result.
pub trait MergePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self, tips: &[SignedNode]) -> Result<MergeResolution, EngineError>;
}

/// Default policy: the tip with the later timestamp wins; timestamp ties go
/// to the lexicographically greater author DID, and identical author ties to
/// the greater node id so the result is always total.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastWriterWins;

impl MergePolicy for LastWriterWins {
    fn name(&self) -> &'static str {
        "last-writer-wins"
    }

    fn resolve(&self, tips: &[SignedNode]) -> Result<MergeResolution, EngineError> {
        let winner = tips
            .iter()
            .max_by(|a, b| {
                a.node
                    .metadata
                    .timestamp
                    .cmp(&b.node.metadata.timestamp)
                    .then_with(|| {
                        a.node
                            .author
                            .to_string()
                            .cmp(&b.node.author.to_string())
                    })
                    .then_with(|| a.id.cmp(&b.id))
            })
            .ok_or_else(|| {
                EngineError::InvalidOperation("merge requires at least one tip".to_string())
            })?;

        let mut merged_tips: Vec<NodeId> = tips
            .iter()
            .map(|tip| tip.require_id().cloned())
            .collect::<Result<_, _>>()?;
        merged_tips.sort();

        Ok(MergeResolution {
            policy: self.name().to_string(),
            winner: winner.require_id()?.clone(),
            merged_tips,
        })
    }
}

/// The DAG engine. Cheap to clone; clones share the store handle and the
/// author-local clock.
pub struct DagEngine<S> {
    store: S,
    clock: Arc<HybridClock>,
    algorithm: HashAlgorithm,
}

impl<S: Clone> Clone for DagEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: Arc::clone(&self.clock),
            algorithm: self.algorithm,
        }
    }
}

impl<S: NodeStore> DagEngine<S> {
    pub fn new(store: S) -> Self {
        Self::with_algorithm(store, HashAlgorithm::default())
    }

    pub fn with_algorithm(store: S, algorithm: HashAlgorithm) -> Self {
        Self {
            store,
            clock: Arc::new(HybridClock::new()),
            algorithm,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &HybridClock {
        &self.clock
    }

    /// Create a new conversation: a signed root node plus its registry
    /// record. Returns the conversation id (the root's id).
    pub async fn create_conversation(
        &self,
        author: &DidKey,
        title: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<NodeId, EngineError> {
        let timestamp = self.clock.now();
        let node = NodeBuilder::new()
            .with_body(NodeBody::Root(RootBody {
                title: title.to_string(),
                metadata,
            }))
            .with_author(author.did().clone())
            .with_timestamp(timestamp)
            .build()?;
        let signed = SignedNode::sign(node, author, self.algorithm)?;
        let root_id = self.store.put(signed).await?;
        self.store
            .register_conversation(ConversationRecord::new(
                root_id.clone(),
                author.did().clone(),
                timestamp,
            ))
            .await?;
        info!(conversation = %root_id, title, "created conversation");
        Ok(root_id)
    }

    /// Append a message. When the conversation has several tips (an
    /// unresolved fork) the caller must name the parent — the engine never
    /// silently picks a branch.
    pub async fn append_message(
        &self,
        conversation: &NodeId,
        parent: Option<&NodeId>,
        author: &DidKey,
        role: Role,
        content: MessageContent,
    ) -> Result<NodeId, EngineError> {
        self.require_mutable(conversation).await?;

        let parent = match parent {
            Some(parent) => {
                self.require_member(conversation, parent).await?;
                parent.clone()
            }
            None => {
                let tips = self.store.tips(conversation).await?;
                match tips.len() {
                    0 => return Err(EngineError::ConversationNotFound(conversation.clone())),
                    1 => tips.into_iter().next().expect("len checked"),
                    n => {
                        return Err(EngineError::AmbiguousTip {
                            conversation: conversation.clone(),
                            tips: n,
                        })
                    }
                }
            }
        };

        let node = NodeBuilder::new()
            .with_body(NodeBody::Message(MessageBody { role, content }))
            .with_parent(parent)
            .with_author(author.did().clone())
            .with_conversation(conversation.clone())
            .with_timestamp(self.clock.now())
            .build()?;
        let signed = SignedNode::sign(node, author, self.algorithm)?;
        let id = self.store.put(signed).await?;
        debug!(conversation = %conversation, node = %id, "appended message");
        Ok(id)
    }

    /// Fork at a node, establishing a new branch identity.
    pub async fn fork(
        &self,
        conversation: &NodeId,
        at: &NodeId,
        author: &DidKey,
        branch: &str,
    ) -> Result<NodeId, EngineError> {
        self.require_mutable(conversation).await?;
        self.require_member(conversation, at).await?;

        let node = NodeBuilder::new()
            .with_body(NodeBody::Fork(ForkBody {
                branch: branch.to_string(),
            }))
            .with_parent(at.clone())
            .with_author(author.did().clone())
            .with_conversation(conversation.clone())
            .with_timestamp(self.clock.now())
            .build()?;
        let signed = SignedNode::sign(node, author, self.algorithm)?;
        let id = self.store.put(signed).await?;
        debug!(conversation = %conversation, node = %id, branch, "forked branch");
        Ok(id)
    }

    /// Record replacement content for a message. The original node is left
    /// untouched in the store; the edit supersedes it for rendering only.
    pub async fn edit(
        &self,
        conversation: &NodeId,
        original: &NodeId,
        author: &DidKey,
        content: MessageContent,
    ) -> Result<NodeId, EngineError> {
        self.require_mutable(conversation).await?;
        let target = self.require_member(conversation, original).await?;
        if !matches!(target.node.kind(), NodeKind::Message | NodeKind::Edit) {
            return Err(EngineError::InvalidOperation(format!(
                "cannot edit a {} node",
                target.node.kind()
            )));
        }

        let node = NodeBuilder::new()
            .with_body(NodeBody::Edit(EditBody { content }))
            .with_parent(original.clone())
            .with_author(author.did().clone())
            .with_conversation(conversation.clone())
            .with_timestamp(self.clock.now())
            .build()?;
        let signed = SignedNode::sign(node, author, self.algorithm)?;
        let id = self.store.put(signed).await?;
        debug!(conversation = %conversation, original = %original, edit = %id, "recorded edit");
        Ok(id)
    }

    /// Merge two or more branch tips under the given policy.
    ///
    /// The merge node's timestamp is derived from its parents (latest parent
    /// timestamp, incremented) rather than read from the wall clock, so two
    /// replicas merging the same tips with the same author key produce
    /// bit-identical nodes.
    pub async fn merge(
        &self,
        conversation: &NodeId,
        tips: &[NodeId],
        author: &DidKey,
        policy: &dyn MergePolicy,
    ) -> Result<NodeId, EngineError> {
        self.require_mutable(conversation).await?;
        if tips.len() < 2 {
            return Err(EngineError::InvalidOperation(
                "merge requires at least two tips".to_string(),
            ));
        }

        let mut tip_nodes = Vec::with_capacity(tips.len());
        for tip in tips {
            tip_nodes.push(self.require_member(conversation, tip).await?);
        }
        let resolution = policy.resolve(&tip_nodes)?;

        let timestamp = tip_nodes
            .iter()
            .map(|node| node.node.metadata.timestamp)
            .max()
            .expect("at least two tips")
            .successor();
        self.clock.observe(&timestamp);

        let node = NodeBuilder::new()
            .with_body(NodeBody::Merge(MergeBody { resolution }))
            .with_parents(tips.to_vec())
            .with_author(author.did().clone())
            .with_conversation(conversation.clone())
            .with_timestamp(timestamp)
            .build()?;
        let signed = SignedNode::sign(node, author, self.algorithm)?;
        let id = self.store.put(signed).await?;
        debug!(conversation = %conversation, node = %id, policy = policy.name(), "merged branches");
        Ok(id)
    }

    /// Reconstruct the ordered message sequence from the root to `tip`.
    ///
    /// Structural nodes (root/fork/merge) are verified but skipped for
    /// rendering; each message slot shows its most recent edit. Any
    /// integrity failure on a visited node aborts the traversal — silently
    /// dropping a node would make the Merkle root irreproducible.
    pub async fn traverse(&self, tip: &NodeId) -> Result<ConversationSnapshot, EngineError> {
        let closure = self.ancestor_closure(tip).await?;
        let ordered = causal_order(&closure);

        let conversation = closure
            .get(tip)
            .ok_or_else(|| EngineError::NodeNotFound(tip.clone()))?
            .conversation_id()?;

        let mut stats = SnapshotStats::default();
        stats.total_nodes = closure.len();
        let mut messages = Vec::new();

        for id in &ordered {
            let node = &closure[id];
            match &node.node.body {
                NodeBody::Message(body) => {
                    stats.message_count += 1;
                    let (source, edited) = self.latest_edit(id).await?;
                    let (content, rendered_from) = match &source {
                        Some(edit) => match &edit.node.body {
                            NodeBody::Edit(edit_body) => {
                                (edit_body.content.clone(), edit.require_id()?.clone())
                            }
                            _ => (body.content.clone(), id.clone()),
                        },
                        None => (body.content.clone(), id.clone()),
                    };
                    messages.push(RenderedMessage {
                        id: id.clone(),
                        rendered_from,
                        role: body.role,
                        content,
                        author: node.node.author.clone(),
                        timestamp: node.node.metadata.timestamp,
                        edited,
                    });
                }
                NodeBody::Edit(_) => {}
                NodeBody::Fork(_) => stats.fork_count += 1,
                NodeBody::Merge(_) => stats.merge_count += 1,
                NodeBody::Root(_) => {}
            }
        }
        stats.edit_count = messages.iter().filter(|m| m.edited).count();

        Ok(ConversationSnapshot {
            conversation,
            tip: tip.clone(),
            messages,
            stats,
        })
    }

    /// Verify the full ancestor closure of `tip`: content addresses,
    /// signatures, and parent resolution. Returns the number of verified
    /// nodes.
    pub async fn verify_thread(&self, tip: &NodeId) -> Result<usize, EngineError> {
        Ok(self.ancestor_closure(tip).await?.len())
    }

    /// All node ids of a conversation, in `(timestamp, id)` order. This is
    /// the id set Merkle roots and exports are computed over.
    pub async fn conversation_nodes(
        &self,
        conversation: &NodeId,
    ) -> Result<Vec<SignedNode>, EngineError> {
        let record = self.store.conversation(conversation).await?;
        if record.is_none() {
            return Err(EngineError::ConversationNotFound(conversation.clone()));
        }
        let nodes = self
            .store
            .query(&NodeQuery::new().in_conversation(conversation.clone()))
            .await?;
        Ok(nodes)
    }

    pub async fn conversation_node_ids(
        &self,
        conversation: &NodeId,
    ) -> Result<Vec<NodeId>, EngineError> {
        let nodes = self.conversation_nodes(conversation).await?;
        let mut ids = Vec::with_capacity(nodes.len());
        for node in &nodes {
            ids.push(node.require_id()?.clone());
        }
        Ok(ids)
    }

    /// Start a fresh lineage from a published conversation. The frozen
    /// conversation stays exactly as anchored; continuation happens under a
    /// new root that records its origin.
    pub async fn fork_lineage(
        &self,
        origin: &NodeId,
        author: &DidKey,
        title: &str,
    ) -> Result<NodeId, EngineError> {
        let record = self
            .store
            .conversation(origin)
            .await?
            .ok_or_else(|| EngineError::ConversationNotFound(origin.clone()))?;
        let metadata = serde_json::json!({
            "forked_from": origin.to_string(),
            "origin_visibility": record.visibility,
        });
        self.create_conversation(author, title, Some(metadata))
            .await
    }

    /// Load the conversation record, requiring it to exist and to still be
    /// mutable (not published).
    async fn require_mutable(
        &self,
        conversation: &NodeId,
    ) -> Result<ConversationRecord, EngineError> {
        let record = self
            .store
            .conversation(conversation)
            .await?
            .ok_or_else(|| EngineError::ConversationNotFound(conversation.clone()))?;
        if record.visibility == Visibility::Public {
            return Err(EngineError::ConversationFrozen(conversation.clone()));
        }
        Ok(record)
    }

    /// Fetch a node, requiring it to exist and to belong to `conversation`.
    async fn require_member(
        &self,
        conversation: &NodeId,
        id: &NodeId,
    ) -> Result<SignedNode, EngineError> {
        let node = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| EngineError::NodeNotFound(id.clone()))?;
        if node.conversation_id()? != *conversation {
            return Err(EngineError::ForeignNode {
                node: id.clone(),
                conversation: conversation.clone(),
            });
        }
        Ok(node)
    }

    /// Collect and verify every ancestor of `tip`, including `tip` itself.
    async fn ancestor_closure(
        &self,
        tip: &NodeId,
    ) -> Result<HashMap<NodeId, SignedNode>, EngineError> {
        let mut closure: HashMap<NodeId, SignedNode> = HashMap::new();
        let mut queue = VecDeque::from([tip.clone()]);

        while let Some(id) = queue.pop_front() {
            if closure.contains_key(&id) {
                continue;
            }
            let node = match self.store.get(&id).await? {
                Some(node) => node,
                None if id == *tip => return Err(EngineError::NodeNotFound(id)),
                // A parent referenced by a stored node but absent from the
                // store: the replica is structurally broken.
                None => {
                    return Err(EngineError::IntegrityFailure {
                        node: id,
                        reason: "parent missing from store".to_string(),
                    })
                }
            };
            node.verify().map_err(|e| EngineError::IntegrityFailure {
                node: id.clone(),
                reason: e.to_string(),
            })?;
            queue.extend(node.node.parents.iter().cloned());
            closure.insert(id, node);
        }

        Ok(closure)
    }

    /// Resolve the newest edit for a message slot by following edit chains
    /// downward. Returns the superseding node (if any) and whether the slot
    /// was edited at all.
    async fn latest_edit(
        &self,
        message: &NodeId,
    ) -> Result<(Option<SignedNode>, bool), EngineError> {
        let mut current = message.clone();
        let mut chosen: Option<SignedNode> = None;
        let mut seen: HashSet<NodeId> = HashSet::new();

        loop {
            if !seen.insert(current.clone()) {
                // Cycles cannot occur in an append-only DAG, but a corrupt
                // children index must not hang the traversal.
                return Err(EngineError::IntegrityFailure {
                    node: current,
                    reason: "edit chain loops".to_string(),
                });
            }

            let mut best: Option<SignedNode> = None;
            for child_id in self.store.children(&current).await? {
                let child = match self.store.get(&child_id).await? {
                    Some(child) => child,
                    None => {
                        return Err(EngineError::IntegrityFailure {
                            node: child_id,
                            reason: "indexed child missing from store".to_string(),
                        })
                    }
                };
                if !matches!(child.node.kind(), NodeKind::Edit) {
                    continue;
                }
                child.verify().map_err(|e| EngineError::IntegrityFailure {
                    node: child_id.clone(),
                    reason: e.to_string(),
                })?;
                let replace = match &best {
                    None => true,
                    Some(current_best) => {
                        let ordering = child
                            .node
                            .metadata
                            .timestamp
                            .cmp(&current_best.node.metadata.timestamp)
                            .then_with(|| {
                                child
                                    .node
                                    .author
                                    .to_string()
                                    .cmp(&current_best.node.author.to_string())
                            })
                            .then_with(|| child.id.cmp(&current_best.id));
                        ordering.is_gt()
                    }
                };
                if replace {
                    best = Some(child);
                }
            }

            match best {
                Some(edit) => {
                    current = edit.require_id()?.clone();
                    chosen = Some(edit);
                }
                None => break,
            }
        }

        let edited = chosen.is_some();
        Ok((chosen, edited))
    }
}

/// Deterministic causal order over a verified closure: Kahn's algorithm with
/// the ready set kept sorted by `(timestamp, id)`, so every replica holding
/// the same closure produces the same sequence.
fn causal_order(closure: &HashMap<NodeId, SignedNode>) -> Vec<NodeId> {
    let mut in_degree: HashMap<&NodeId, usize> = HashMap::new();
    let mut children: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();

    for (id, node) in closure {
        in_degree.entry(id).or_insert(0);
        for parent in &node.node.parents {
            if closure.contains_key(parent) {
                *in_degree.entry(id).or_insert(0) += 1;
                children.entry(parent).or_default().push(id);
            }
        }
    }

    let mut ready: Vec<&NodeId> = in_degree
        .iter()
        .filter_map(|(id, degree)| (*degree == 0).then_some(*id))
        .collect();
    let sort_key = |id: &&NodeId| {
        let node = &closure[*id];
        (node.node.metadata.timestamp, (*id).clone())
    };
    ready.sort_by_key(sort_key);

    let mut ordered = Vec::with_capacity(closure.len());
    while let Some(id) = ready.first().cloned() {
        ready.remove(0);
        ordered.push(id.clone());
        for child in children.get(id).cloned().unwrap_or_default() {
            let degree = in_degree.get_mut(child).expect("child was registered");
            *degree -= 1;
            if *degree == 0 {
                ready.push(child);
            }
        }
        ready.sort_by_key(sort_key);
    }

    ordered
}
