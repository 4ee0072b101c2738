#![cfg(feature = "persistence")]

use crate::node::SignedNode;
use crate::store::{sort_by_time, ConversationRecord, NodeQuery, NodeStore, StoreError};
use async_trait::async_trait;
use braid_core_types::NodeId;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, DB};
use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::TryFrom;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// ColumnFamily names for different types of data
const CF_NODES: &str = "nodes";
const CF_CHILDREN: &str = "children";
const CF_TIPS: &str = "tips";
const CF_AUTHORS: &str = "authors";
const CF_KINDS: &str = "kinds";
const CF_CONVERSATIONS: &str = "conversations";

/// RocksDB-backed implementation of the `NodeStore` trait.
pub struct RocksDbNodeStore {
    db: Arc<DB>,
}

impl RocksDbNodeStore {
    /// Open a database at the given path, creating it if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_NODES, Options::default()),
            ColumnFamilyDescriptor::new(CF_CHILDREN, Options::default()),
            ColumnFamilyDescriptor::new(CF_TIPS, Options::default()),
            ColumnFamilyDescriptor::new(CF_AUTHORS, Options::default()),
            ColumnFamilyDescriptor::new(CF_KINDS, Options::default()),
            ColumnFamilyDescriptor::new(CF_CONVERSATIONS, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Storage(format!("Column family not found: {}", name)))
    }

    fn serialize_node(node: &SignedNode) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(node).map_err(|e| StoreError::Storage(e.to_string()))
    }

    fn deserialize_node(bytes: &[u8]) -> Result<SignedNode, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Storage(e.to_string()))
    }

    fn id_to_key(id: &NodeId) -> Vec<u8> {
        id.to_bytes()
    }

    fn key_to_id(key: &[u8]) -> Result<NodeId, StoreError> {
        NodeId::try_from(key).map_err(|e| StoreError::Storage(e.to_string()))
    }

    /// Load a list-valued index entry (children/tips/authors/kinds).
    fn get_key_list(&self, cf: &ColumnFamily, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        match self.db.get_cf(cf, key)? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Storage(e.to_string()))
            }
            None => Ok(Vec::new()),
        }
    }

    fn put_key_list(
        &self,
        cf: &ColumnFamily,
        key: &[u8],
        list: &[Vec<u8>],
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(list).map_err(|e| StoreError::Storage(e.to_string()))?;
        self.db.put_cf(cf, key, bytes)?;
        Ok(())
    }

    fn push_key(&self, cf: &ColumnFamily, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        let mut list = self.get_key_list(cf, key)?;
        if !list.contains(&value) {
            list.push(value);
            self.put_key_list(cf, key, &list)?;
        }
        Ok(())
    }

    fn load_nodes(&self, keys: &[Vec<u8>]) -> Result<Vec<SignedNode>, StoreError> {
        let cf_nodes = self.cf_handle(CF_NODES)?;
        let mut nodes = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.db.get_cf(cf_nodes, key)? {
                nodes.push(Self::deserialize_node(&bytes)?);
            }
        }
        Ok(nodes)
    }
}

#[async_trait]
impl NodeStore for RocksDbNodeStore {
    async fn put(&self, mut node: SignedNode) -> Result<NodeId, StoreError> {
        let id = node.ensure_id()?;
        node.verify_id()
            .map_err(|_| StoreError::HashMismatch(id.clone()))?;
        node.node
            .validate()
            .map_err(|e| StoreError::InvalidNode(e.to_string()))?;
        let conversation = node.conversation_id()?;

        let cf_nodes = self.cf_handle(CF_NODES)?;
        let node_key = Self::id_to_key(&id);

        if self.db.get_cf(cf_nodes, &node_key)?.is_some() {
            return Ok(id);
        }

        for parent in &node.node.parents {
            let parent_key = Self::id_to_key(parent);
            if self.db.get_cf(cf_nodes, &parent_key)?.is_none() {
                return Err(StoreError::DanglingParent {
                    child: id.clone(),
                    parent: parent.clone(),
                });
            }
        }

        self.db
            .put_cf(cf_nodes, &node_key, Self::serialize_node(&node)?)?;

        // Update the tip set of the node's conversation.
        let cf_tips = self.cf_handle(CF_TIPS)?;
        let conversation_key = Self::id_to_key(&conversation);
        let mut tip_keys = self.get_key_list(cf_tips, &conversation_key)?;
        for parent in &node.node.parents {
            let parent_key = Self::id_to_key(parent);
            tip_keys.retain(|key| *key != parent_key);
        }
        if !tip_keys.contains(&node_key) {
            tip_keys.push(node_key.clone());
        }
        self.put_key_list(cf_tips, &conversation_key, &tip_keys)?;

        // Update the children index.
        let cf_children = self.cf_handle(CF_CHILDREN)?;
        for parent in &node.node.parents {
            self.push_key(cf_children, &Self::id_to_key(parent), node_key.clone())?;
        }

        // Update the author and kind indices.
        let cf_authors = self.cf_handle(CF_AUTHORS)?;
        self.push_key(
            cf_authors,
            node.node.author.to_string().as_bytes(),
            node_key.clone(),
        )?;
        let cf_kinds = self.cf_handle(CF_KINDS)?;
        self.push_key(cf_kinds, node.node.kind().as_str().as_bytes(), node_key)?;

        debug!(node = %id, kind = %node.node.kind(), "stored node");
        Ok(id)
    }

    async fn get(&self, id: &NodeId) -> Result<Option<SignedNode>, StoreError> {
        let cf_nodes = self.cf_handle(CF_NODES)?;
        match self.db.get_cf(cf_nodes, Self::id_to_key(id))? {
            Some(bytes) => Ok(Some(Self::deserialize_node(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn query(&self, query: &NodeQuery) -> Result<Vec<SignedNode>, StoreError> {
        // Narrow by the most selective available index, then filter.
        let candidates: Option<Vec<SignedNode>> = if let Some(authors) = &query.authors {
            let cf_authors = self.cf_handle(CF_AUTHORS)?;
            let mut nodes = Vec::new();
            for author in authors {
                let keys = self.get_key_list(cf_authors, author.to_string().as_bytes())?;
                nodes.extend(self.load_nodes(&keys)?);
            }
            Some(nodes)
        } else if let Some(kinds) = &query.kinds {
            let cf_kinds = self.cf_handle(CF_KINDS)?;
            let mut nodes = Vec::new();
            for kind in kinds {
                let keys = self.get_key_list(cf_kinds, kind.as_str().as_bytes())?;
                nodes.extend(self.load_nodes(&keys)?);
            }
            Some(nodes)
        } else {
            None
        };

        let mut matched: Vec<SignedNode> = match candidates {
            Some(nodes) => nodes.into_iter().filter(|n| query.matches(n)).collect(),
            None => {
                let cf_nodes = self.cf_handle(CF_NODES)?;
                let mut nodes = Vec::new();
                for item in self.db.iterator_cf(cf_nodes, rocksdb::IteratorMode::Start) {
                    let (_, value) = item?;
                    let node = Self::deserialize_node(&value)?;
                    if query.matches(&node) {
                        nodes.push(node);
                    }
                }
                nodes
            }
        };

        sort_by_time(&mut matched);
        matched.dedup_by(|a, b| a.id == b.id);
        Ok(matched)
    }

    async fn children(&self, id: &NodeId) -> Result<Vec<NodeId>, StoreError> {
        let cf_children = self.cf_handle(CF_CHILDREN)?;
        let keys = self.get_key_list(cf_children, &Self::id_to_key(id))?;
        let mut ids = keys
            .iter()
            .map(|key| Self::key_to_id(key))
            .collect::<Result<Vec<_>, _>>()?;
        ids.sort();
        Ok(ids)
    }

    async fn tips(&self, conversation: &NodeId) -> Result<Vec<NodeId>, StoreError> {
        let cf_tips = self.cf_handle(CF_TIPS)?;
        let keys = self.get_key_list(cf_tips, &Self::id_to_key(conversation))?;
        let mut ids = keys
            .iter()
            .map(|key| Self::key_to_id(key))
            .collect::<Result<Vec<_>, _>>()?;
        ids.sort();
        Ok(ids)
    }

    async fn register_conversation(&self, record: ConversationRecord) -> Result<(), StoreError> {
        let cf = self.cf_handle(CF_CONVERSATIONS)?;
        let bytes = serde_json::to_vec(&record).map_err(|e| StoreError::Storage(e.to_string()))?;
        self.db.put_cf(cf, Self::id_to_key(&record.root), bytes)?;
        Ok(())
    }

    async fn conversation(
        &self,
        root: &NodeId,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        let cf = self.cf_handle(CF_CONVERSATIONS)?;
        match self.db.get_cf(cf, Self::id_to_key(root))? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Storage(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationRecord>, StoreError> {
        let cf = self.cf_handle(CF_CONVERSATIONS)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_, value) = item?;
            let record: ConversationRecord =
                serde_json::from_slice(&value).map_err(|e| StoreError::Storage(e.to_string()))?;
            records.push(record);
        }
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.root.cmp(&b.root))
        });
        Ok(records)
    }

    async fn update_conversation(&self, record: ConversationRecord) -> Result<(), StoreError> {
        let cf = self.cf_handle(CF_CONVERSATIONS)?;
        let key = Self::id_to_key(&record.root);
        if self.db.get_cf(cf, &key)?.is_none() {
            return Err(StoreError::UnknownConversation(record.root.clone()));
        }
        let bytes = serde_json::to_vec(&record).map_err(|e| StoreError::Storage(e.to_string()))?;
        self.db.put_cf(cf, key, bytes)?;
        Ok(())
    }

    async fn delete_conversation(&self, root: &NodeId) -> Result<bool, StoreError> {
        let cf = self.cf_handle(CF_CONVERSATIONS)?;
        let key = Self::id_to_key(root);
        let existed = self.db.get_cf(cf, &key)?.is_some();
        if existed {
            self.db.delete_cf(cf, &key)?;
            debug!(conversation = %root, "deleted conversation record");
        }
        Ok(existed)
    }

    async fn collect_garbage(&self) -> Result<usize, StoreError> {
        let cf_nodes = self.cf_handle(CF_NODES)?;
        let cf_children = self.cf_handle(CF_CHILDREN)?;
        let cf_tips = self.cf_handle(CF_TIPS)?;
        let cf_authors = self.cf_handle(CF_AUTHORS)?;
        let cf_kinds = self.cf_handle(CF_KINDS)?;

        // Load the full node set with author/kind so indices can be swept.
        let mut nodes: HashMap<Vec<u8>, SignedNode> = HashMap::new();
        for item in self.db.iterator_cf(cf_nodes, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            nodes.insert(key.to_vec(), Self::deserialize_node(&value)?);
        }

        // Mark from live conversation roots.
        let live_roots = self.list_conversations().await?;
        let mut live: HashSet<Vec<u8>> = HashSet::new();
        let mut queue: VecDeque<Vec<u8>> = live_roots
            .iter()
            .map(|record| Self::id_to_key(&record.root))
            .filter(|key| nodes.contains_key(key))
            .collect();
        while let Some(key) = queue.pop_front() {
            if !live.insert(key.clone()) {
                continue;
            }
            for child in self.get_key_list(cf_children, &key)? {
                queue.push_back(child);
            }
        }

        // Sweep dead nodes and their index entries.
        let dead: Vec<Vec<u8>> = nodes
            .keys()
            .filter(|key| !live.contains(*key))
            .cloned()
            .collect();
        for key in &dead {
            let node = &nodes[key];
            self.db.delete_cf(cf_nodes, key)?;
            self.db.delete_cf(cf_children, key)?;

            let author_key = node.node.author.to_string();
            let mut author_list = self.get_key_list(cf_authors, author_key.as_bytes())?;
            author_list.retain(|k| k != key);
            self.put_key_list(cf_authors, author_key.as_bytes(), &author_list)?;

            let kind_key = node.node.kind().as_str();
            let mut kind_list = self.get_key_list(cf_kinds, kind_key.as_bytes())?;
            kind_list.retain(|k| k != key);
            self.put_key_list(cf_kinds, kind_key.as_bytes(), &kind_list)?;
        }

        // Surviving children lists must not reference swept nodes, and tip
        // sets of deleted conversations go away entirely.
        let dead_set: HashSet<&Vec<u8>> = dead.iter().collect();
        for key in live.iter() {
            let list = self.get_key_list(cf_children, key)?;
            let filtered: Vec<Vec<u8>> = list
                .into_iter()
                .filter(|child| !dead_set.contains(child))
                .collect();
            self.put_key_list(cf_children, key, &filtered)?;
        }
        let live_conversation_keys: HashSet<Vec<u8>> = live_roots
            .iter()
            .map(|record| Self::id_to_key(&record.root))
            .collect();
        let tip_keys: Vec<Vec<u8>> = self
            .db
            .iterator_cf(cf_tips, rocksdb::IteratorMode::Start)
            .map(|item| item.map(|(key, _)| key.to_vec()))
            .collect::<Result<_, _>>()?;
        for key in tip_keys {
            if !live_conversation_keys.contains(&key) {
                self.db.delete_cf(cf_tips, &key)?;
            }
        }

        if !dead.is_empty() {
            debug!(removed = dead.len(), "garbage collected unreachable nodes");
        }
        Ok(dead.len())
    }
}
