//! Boundary contracts for the external transport/sync layer.
//!
//! The transport layer feeds remote nodes in and pulls deltas out; it owns
//! retries and backoff. Everything here is expressed over the store traits
//! so any backend works.

use crate::node::{NodeKind, SignedNode};
use crate::store::{NodeQuery, NodeStore, StoreError};
use braid_core_types::{Did, HybridTimestamp, NodeId};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Incremental pull filter: everything after `since`, optionally narrowed.
#[derive(Clone, Debug, Default)]
pub struct DeltaQuery {
    pub since: Option<HybridTimestamp>,
    pub conversation: Option<NodeId>,
    pub authors: Option<Vec<Did>>,
    pub kinds: Option<Vec<NodeKind>>,
}

impl From<DeltaQuery> for NodeQuery {
    fn from(delta: DeltaQuery) -> Self {
        NodeQuery {
            conversation: delta.conversation,
            authors: delta.authors,
            kinds: delta.kinds,
            since: delta.since,
            until: None,
        }
    }
}

/// Outcome of ingesting a batch of remote nodes. Rejections carry the reason;
/// `missing` lists parent ids the local replica must fetch before the
/// corresponding nodes can be retried.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub accepted: Vec<NodeId>,
    pub rejected: Vec<(NodeId, String)>,
    pub missing: Vec<NodeId>,
}

/// Ingest a batch of remote nodes.
///
/// Nodes are admitted in dependency order (the batch may arrive shuffled);
/// each one is signature-checked before storage. Integrity failures are
/// reported per node, never silently dropped — a silently missing node would
/// make the Merkle root irreproducible.
pub async fn ingest<S: NodeStore + ?Sized>(
    store: &S,
    nodes: Vec<SignedNode>,
) -> Result<IngestReport, StoreError> {
    let mut report = IngestReport::default();
    let mut pending: Vec<SignedNode> = Vec::with_capacity(nodes.len());

    // Verify integrity up front; only structurally sound nodes go into the
    // dependency-ordering loop.
    for mut node in nodes {
        let id = match node.ensure_id() {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "rejected remote node without computable id");
                continue;
            }
        };
        if let Err(e) = node.verify() {
            warn!(node = %id, error = %e, "rejected remote node");
            report.rejected.push((id, e.to_string()));
            continue;
        }
        pending.push(node);
    }

    // Admit until fixpoint: every pass stores the nodes whose parents are
    // now present. Anything left over is blocked on parents outside the
    // batch.
    let mut progress = true;
    while progress && !pending.is_empty() {
        progress = false;
        let mut still_pending = Vec::with_capacity(pending.len());
        for node in pending {
            let id = node.require_id()?.clone();
            match store.put(node.clone()).await {
                Ok(_) => {
                    debug!(node = %id, "ingested remote node");
                    report.accepted.push(id);
                    progress = true;
                }
                Err(StoreError::DanglingParent { .. }) => still_pending.push(node),
                Err(e) => {
                    warn!(node = %id, error = %e, "rejected remote node");
                    report.rejected.push((id, e.to_string()));
                    progress = true;
                }
            }
        }
        pending = still_pending;
    }

    if !pending.is_empty() {
        let mut missing = missing_dependencies(store, &pending).await?;
        for node in pending {
            let id = node.require_id()?.clone();
            report
                .rejected
                .push((id, "missing parent nodes".to_string()));
        }
        missing.sort();
        missing.dedup();
        report.missing = missing;
    }

    Ok(report)
}

/// Parent ids referenced by `nodes` that are neither stored locally nor
/// present in the batch itself.
pub async fn missing_dependencies<S: NodeStore + ?Sized>(
    store: &S,
    nodes: &[SignedNode],
) -> Result<Vec<NodeId>, StoreError> {
    let batch_ids: HashSet<&NodeId> = nodes.iter().filter_map(|n| n.id.as_ref()).collect();
    let mut missing = Vec::new();
    for node in nodes {
        for parent in &node.node.parents {
            if batch_ids.contains(parent) {
                continue;
            }
            if !store.contains(parent).await? {
                missing.push(parent.clone());
            }
        }
    }
    missing.sort();
    missing.dedup();
    Ok(missing)
}

/// Delta export for a peer: all local events matching the filter, in
/// `(timestamp, id)` order so the peer can advance its cursor.
pub async fn query_events<S: NodeStore + ?Sized>(
    store: &S,
    delta: &DeltaQuery,
) -> Result<Vec<SignedNode>, StoreError> {
    store.query(&NodeQuery::from(delta.clone())).await
}

/// The most recent event of a conversation, for catching a peer up.
pub async fn latest_event<S: NodeStore + ?Sized>(
    store: &S,
    conversation: &NodeId,
) -> Result<Option<SignedNode>, StoreError> {
    let nodes = store
        .query(&NodeQuery::new().in_conversation(conversation.clone()))
        .await?;
    Ok(nodes.into_iter().next_back())
}
