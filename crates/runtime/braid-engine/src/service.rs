//! Facade exposed to the UI/service layer, implemented purely in terms of
//! the engine and store primitives.

use crate::dag::{DagEngine, EngineError};
use crate::snapshot::ConversationSnapshot;
use braid_core_types::{Did, DidKey, HybridTimestamp, NodeId};
use braid_types::node::{MessageContent, NodeBody, Role};
use braid_types::store::{NodeStore, Visibility};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Listing entry for a conversation: the registry record joined with the
/// root node's title.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConversationSummary {
    pub root: NodeId,
    pub title: String,
    pub owner: Did,
    pub visibility: Visibility,
    pub created_at: HybridTimestamp,
}

/// Service-layer API over the conversation store.
pub struct ConversationService<S> {
    engine: DagEngine<S>,
}

impl<S: NodeStore + Clone> ConversationService<S> {
    pub fn new(engine: DagEngine<S>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &DagEngine<S> {
        &self.engine
    }

    pub async fn create_conversation(
        &self,
        author: &DidKey,
        title: &str,
    ) -> Result<NodeId, EngineError> {
        self.engine.create_conversation(author, title, None).await
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, EngineError> {
        let records = self.engine.store().list_conversations().await?;
        let mut summaries = Vec::with_capacity(records.len());
        for record in records {
            match self.summary_for(&record.root).await? {
                Some(summary) => summaries.push(summary),
                // A record whose root node is gone is a half-deleted
                // conversation awaiting GC; skip it but say so.
                None => warn!(conversation = %record.root, "registry record without root node"),
            }
        }
        Ok(summaries)
    }

    pub async fn get_conversation(
        &self,
        id: &NodeId,
    ) -> Result<Option<ConversationSummary>, EngineError> {
        self.summary_for(id).await
    }

    /// Render the conversation's message list. With several live tips the
    /// latest tip by `(timestamp, id)` is rendered; reads may pick a branch,
    /// writes never do.
    pub async fn get_messages(
        &self,
        id: &NodeId,
    ) -> Result<Option<ConversationSnapshot>, EngineError> {
        if self.engine.store().conversation(id).await?.is_none() {
            return Ok(None);
        }
        let tips = self.engine.store().tips(id).await?;
        let mut best: Option<(HybridTimestamp, NodeId)> = None;
        for tip in tips {
            let node = self
                .engine
                .store()
                .get(&tip)
                .await?
                .ok_or_else(|| EngineError::NodeNotFound(tip.clone()))?;
            let key = (node.node.metadata.timestamp, tip);
            if best.as_ref().map(|current| key > *current).unwrap_or(true) {
                best = Some(key);
            }
        }
        match best {
            Some((_, tip)) => Ok(Some(self.engine.traverse(&tip).await?)),
            None => Ok(None),
        }
    }

    /// Append to the conversation's single tip. Callers facing an
    /// unresolved fork get `AmbiguousTip` and must go through the engine
    /// with an explicit parent.
    pub async fn append_message(
        &self,
        id: &NodeId,
        author: &DidKey,
        role: Role,
        content: MessageContent,
    ) -> Result<NodeId, EngineError> {
        self.engine
            .append_message(id, None, author, role, content)
            .await
    }

    /// Drop the conversation's registry record. The node set becomes
    /// garbage-collectable once unreachable; sweeping is the store's call.
    pub async fn delete_conversation(&self, id: &NodeId) -> Result<bool, EngineError> {
        Ok(self.engine.store().delete_conversation(id).await?)
    }

    async fn summary_for(
        &self,
        id: &NodeId,
    ) -> Result<Option<ConversationSummary>, EngineError> {
        let record = match self.engine.store().conversation(id).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        let root = match self.engine.store().get(&record.root).await? {
            Some(root) => root,
            None => return Ok(None),
        };
        let title = match &root.node.body {
            NodeBody::Root(body) => body.title.clone(),
            _ => String::new(),
        };
        Ok(Some(ConversationSummary {
            root: record.root,
            title,
            owner: record.owner,
            visibility: record.visibility,
            created_at: record.created_at,
        }))
    }
}
