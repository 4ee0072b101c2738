#![cfg(feature = "persistence")]

use braid_types::store::rocksdb::RocksDbNodeStore;
use braid_types::store::{ConversationRecord, NodeQuery, NodeStore};
use braid_types::{
    DidKey, HashAlgorithm, HybridClock, MessageBody, MessageContent, NodeBody, NodeBuilder,
    NodeId, NodeKind, Role, RootBody, SignedNode,
};

fn signed_root(key: &DidKey, clock: &HybridClock, title: &str) -> SignedNode {
    let node = NodeBuilder::new()
        .with_body(NodeBody::Root(RootBody {
            title: title.to_string(),
            metadata: None,
        }))
        .with_author(key.did().clone())
        .with_timestamp(clock.now())
        .build()
        .unwrap();
    SignedNode::sign(node, key, HashAlgorithm::Sha256).unwrap()
}

fn signed_message(
    key: &DidKey,
    clock: &HybridClock,
    conversation: &NodeId,
    parent: &NodeId,
    text: &str,
) -> SignedNode {
    let node = NodeBuilder::new()
        .with_body(NodeBody::Message(MessageBody {
            role: Role::User,
            content: MessageContent::Text(text.to_string()),
        }))
        .with_parent(parent.clone())
        .with_author(key.did().clone())
        .with_conversation(conversation.clone())
        .with_timestamp(clock.now())
        .build()
        .unwrap();
    SignedNode::sign(node, key, HashAlgorithm::Sha256).unwrap()
}

#[tokio::test]
async fn nodes_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let key = DidKey::new();
    let clock = HybridClock::new();

    let root = signed_root(&key, &clock, "durable");
    let root_id = root.id.clone().unwrap();
    let m1 = signed_message(&key, &clock, &root_id, &root_id, "persisted");
    let m1_id = m1.id.clone().unwrap();

    {
        let store = RocksDbNodeStore::open(dir.path()).unwrap();
        store.put(root.clone()).await.unwrap();
        store.put(m1.clone()).await.unwrap();
        store
            .register_conversation(ConversationRecord::new(
                root_id.clone(),
                key.did().clone(),
                root.node.metadata.timestamp,
            ))
            .await
            .unwrap();
    }

    let store = RocksDbNodeStore::open(dir.path()).unwrap();
    let loaded = store.get(&m1_id).await.unwrap().unwrap();
    assert_eq!(loaded, m1);
    loaded.verify().unwrap();

    assert_eq!(store.tips(&root_id).await.unwrap(), vec![m1_id.clone()]);
    assert_eq!(store.children(&root_id).await.unwrap(), vec![m1_id]);
    assert_eq!(store.list_conversations().await.unwrap().len(), 1);
}

#[tokio::test]
async fn indices_and_gc() {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksDbNodeStore::open(dir.path()).unwrap();
    let key = DidKey::new();
    let clock = HybridClock::new();

    let root = signed_root(&key, &clock, "indexed");
    let root_id = store.put(root.clone()).await.unwrap();
    store
        .register_conversation(ConversationRecord::new(
            root_id.clone(),
            key.did().clone(),
            root.node.metadata.timestamp,
        ))
        .await
        .unwrap();
    let m1 = signed_message(&key, &clock, &root_id, &root_id, "hello");
    let m1_id = store.put(m1).await.unwrap();

    let messages = store
        .query(&NodeQuery::new().of_kinds(vec![NodeKind::Message]))
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.clone().unwrap(), m1_id);

    let by_author = store
        .query(&NodeQuery::new().by_authors(vec![key.did().clone()]))
        .await
        .unwrap();
    assert_eq!(by_author.len(), 2);

    store.delete_conversation(&root_id).await.unwrap();
    assert_eq!(store.collect_garbage().await.unwrap(), 2);
    assert!(store.get(&m1_id).await.unwrap().is_none());
    let leftover = store
        .query(&NodeQuery::new().of_kinds(vec![NodeKind::Message]))
        .await
        .unwrap();
    assert!(leftover.is_empty());
}
