use braid_engine::capsule::{self, CapsuleMode, RenderStatus};
use braid_engine::dag::{DagEngine, EngineError, LastWriterWins};
use braid_engine::privacy::{PrivacyManager, RecipientKey};
use braid_engine::service::ConversationService;
use braid_types::merkle::merkle_root;
use braid_types::node::{MessageContent, NodeKind, Role};
use braid_types::store::memory::MemoryNodeStore;
use braid_types::store::{ConversationRecord, NodeStore, Visibility};
use braid_types::sync::ingest;
use braid_types::{DidKey, NodeId};

fn text(s: &str) -> MessageContent {
    MessageContent::Text(s.to_string())
}

fn engine() -> DagEngine<MemoryNodeStore> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    DagEngine::new(MemoryNodeStore::new())
}

#[tokio::test]
async fn end_to_end_fork_and_merge() {
    let alice = DidKey::from_secret_bytes(&[1u8; 32]);
    let bob = DidKey::from_secret_bytes(&[2u8; 32]);
    let engine_a = engine();

    let conversation = engine_a
        .create_conversation(&alice, "hello thread", None)
        .await
        .unwrap();
    let m1 = engine_a
        .append_message(&conversation, None, &alice, Role::User, text("Hello"))
        .await
        .unwrap();

    // Identity B forks at m1 and answers on the branch.
    let fork = engine_a
        .fork(&conversation, &m1, &bob, "b1")
        .await
        .unwrap();
    let b1 = engine_a
        .append_message(
            &conversation,
            Some(&fork),
            &bob,
            Role::Assistant,
            text("Hi from B"),
        )
        .await
        .unwrap();

    // The original branch continues from m1 (explicit parent: the
    // conversation now has two tips).
    let m2 = engine_a
        .append_message(
            &conversation,
            Some(&m1),
            &alice,
            Role::User,
            text("How are you?"),
        )
        .await
        .unwrap();

    let merge = engine_a
        .merge(&conversation, &[m2.clone(), b1.clone()], &alice, &LastWriterWins)
        .await
        .unwrap();

    let merge_node = engine_a.store().get(&merge).await.unwrap().unwrap();
    assert_eq!(merge_node.node.parents, vec![m2.clone(), b1.clone()]);
    assert_eq!(merge_node.node.kind(), NodeKind::Merge);

    // Traversal from the merge tip sees all three messages.
    let snapshot = engine_a.traverse(&merge).await.unwrap();
    let transcript = snapshot.transcript();
    assert!(transcript.iter().any(|l| l.contains("Hello")));
    assert!(transcript.iter().any(|l| l.contains("How are you?")));
    assert!(transcript.iter().any(|l| l.contains("Hi from B")));
    assert_eq!(snapshot.stats.merge_count, 1);
    assert_eq!(snapshot.stats.fork_count, 1);

    // A second replica holding the same node set computes the same Merkle
    // root.
    let engine_b = engine();
    let nodes = engine_a.conversation_nodes(&conversation).await.unwrap();
    let report = ingest(engine_b.store(), nodes).await.unwrap();
    assert!(report.rejected.is_empty() && report.missing.is_empty());
    engine_b
        .store()
        .register_conversation(ConversationRecord::new(
            conversation.clone(),
            alice.did().clone(),
            merge_node.node.metadata.timestamp,
        ))
        .await
        .unwrap();

    let ids_a = engine_a.conversation_node_ids(&conversation).await.unwrap();
    let ids_b = engine_b.conversation_node_ids(&conversation).await.unwrap();
    assert_eq!(
        merkle_root(&ids_a).unwrap(),
        merkle_root(&ids_b).unwrap()
    );
}

#[tokio::test]
async fn append_refuses_to_pick_a_branch() {
    let alice = DidKey::new();
    let engine = engine();
    let conversation = engine
        .create_conversation(&alice, "forked", None)
        .await
        .unwrap();
    let m1 = engine
        .append_message(&conversation, None, &alice, Role::User, text("base"))
        .await
        .unwrap();

    // Two siblings of m1: an implicit fork.
    engine
        .append_message(&conversation, Some(&m1), &alice, Role::User, text("left"))
        .await
        .unwrap();
    engine
        .append_message(&conversation, Some(&m1), &alice, Role::User, text("right"))
        .await
        .unwrap();

    let err = engine
        .append_message(&conversation, None, &alice, Role::User, text("lost"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AmbiguousTip { tips: 2, .. }));
}

#[tokio::test]
async fn edit_preserves_the_original() {
    let alice = DidKey::new();
    let engine = engine();
    let conversation = engine
        .create_conversation(&alice, "edits", None)
        .await
        .unwrap();
    let m1 = engine
        .append_message(&conversation, None, &alice, Role::User, text("teh typo"))
        .await
        .unwrap();
    let m2 = engine
        .append_message(&conversation, None, &alice, Role::Assistant, text("noted"))
        .await
        .unwrap();

    let edit = engine
        .edit(&conversation, &m1, &alice, text("the typo, fixed"))
        .await
        .unwrap();

    // The original is still stored, byte-for-byte.
    let original = engine.store().get(&m1).await.unwrap().unwrap();
    original.verify().unwrap();
    assert!(matches!(
        original.node.body,
        braid_types::node::NodeBody::Message(_)
    ));

    // Traversal renders the edited content in the original's slot.
    let snapshot = engine.traverse(&m2).await.unwrap();
    assert_eq!(snapshot.messages.len(), 2);
    let slot = &snapshot.messages[0];
    assert_eq!(slot.id, m1);
    assert_eq!(slot.rendered_from, edit);
    assert!(slot.edited);
    assert_eq!(slot.content, text("the typo, fixed"));
    assert_eq!(snapshot.stats.edit_count, 1);

    // A later edit of the edit wins the slot.
    let second = engine
        .edit(&conversation, &edit, &alice, text("the typo, fixed again"))
        .await
        .unwrap();
    let snapshot = engine.traverse(&m2).await.unwrap();
    assert_eq!(snapshot.messages[0].rendered_from, second);
}

#[tokio::test]
async fn merge_is_bit_identical_across_replicas() {
    let alice = DidKey::from_secret_bytes(&[3u8; 32]);
    let bob = DidKey::from_secret_bytes(&[4u8; 32]);

    let engine_a = engine();
    let conversation = engine_a
        .create_conversation(&alice, "replicated", None)
        .await
        .unwrap();
    let m1 = engine_a
        .append_message(&conversation, None, &alice, Role::User, text("base"))
        .await
        .unwrap();
    let left = engine_a
        .append_message(&conversation, Some(&m1), &alice, Role::User, text("left"))
        .await
        .unwrap();
    let right = engine_a
        .append_message(&conversation, Some(&m1), &bob, Role::User, text("right"))
        .await
        .unwrap();

    // Replicate everything-but-the-merge to a second store.
    let engine_b = engine();
    let nodes = engine_a.conversation_nodes(&conversation).await.unwrap();
    ingest(engine_b.store(), nodes).await.unwrap();
    engine_b
        .store()
        .register_conversation(ConversationRecord::new(
            conversation.clone(),
            alice.did().clone(),
            braid_types::HybridTimestamp::new(0, 0),
        ))
        .await
        .unwrap();

    let tips = [left.clone(), right.clone()];
    let merge_a = engine_a
        .merge(&conversation, &tips, &alice, &LastWriterWins)
        .await
        .unwrap();
    let merge_b = engine_b
        .merge(&conversation, &tips, &alice, &LastWriterWins)
        .await
        .unwrap();

    // Same id, same canonical bytes, same signature.
    assert_eq!(merge_a, merge_b);
    let node_a = engine_a.store().get(&merge_a).await.unwrap().unwrap();
    let node_b = engine_b.store().get(&merge_b).await.unwrap().unwrap();
    assert_eq!(node_a, node_b);
    assert_eq!(
        node_a.node.canonical_bytes().unwrap(),
        node_b.node.canonical_bytes().unwrap()
    );
}

#[tokio::test]
async fn last_writer_wins_tiebreaks() {
    let alice = DidKey::from_secret_bytes(&[5u8; 32]);
    let engine_handle = engine();
    let conversation = engine_handle
        .create_conversation(&alice, "lww", None)
        .await
        .unwrap();
    let m1 = engine_handle
        .append_message(&conversation, None, &alice, Role::User, text("base"))
        .await
        .unwrap();
    let early = engine_handle
        .append_message(&conversation, Some(&m1), &alice, Role::User, text("early"))
        .await
        .unwrap();
    let late = engine_handle
        .append_message(&conversation, Some(&m1), &alice, Role::User, text("late"))
        .await
        .unwrap();

    // The clock is strictly monotonic, so `late` carries the greater
    // timestamp and must win regardless of argument order.
    let merge = engine_handle
        .merge(&conversation, &[early, late.clone()], &alice, &LastWriterWins)
        .await
        .unwrap();
    let node = engine_handle.store().get(&merge).await.unwrap().unwrap();
    match &node.node.body {
        braid_types::node::NodeBody::Merge(body) => {
            assert_eq!(body.resolution.winner, late);
            assert_eq!(body.resolution.policy, "last-writer-wins");
            let mut sorted = body.resolution.merged_tips.clone();
            sorted.sort();
            assert_eq!(body.resolution.merged_tips, sorted);
        }
        other => panic!("expected merge body, got {other:?}"),
    }
}

#[tokio::test]
async fn privacy_lifecycle_is_monotonic() {
    let alice = DidKey::new();
    let bob = DidKey::new();
    let engine_handle = engine();
    let manager = PrivacyManager::new(engine_handle.clone());

    let conversation = engine_handle
        .create_conversation(&alice, "lifecycle", None)
        .await
        .unwrap();
    engine_handle
        .append_message(&conversation, None, &alice, Role::User, text("psst"))
        .await
        .unwrap();

    // LOCAL -> SHARED via an envelope.
    let (recipient, secret) = RecipientKey::generate(bob.did().clone());
    let envelope = manager
        .share_with(&conversation, &[recipient], &alice)
        .await
        .unwrap();
    let record = engine_handle
        .store()
        .conversation(&conversation)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.visibility, Visibility::Shared);

    // The recipient can open the envelope and sees verifiable nodes.
    let nodes = envelope.open(bob.did(), &secret).unwrap();
    assert_eq!(nodes.len(), 2);
    for node in &nodes {
        node.verify().unwrap();
    }
    // A non-recipient cannot.
    let mallory = DidKey::new();
    let (_, mallory_secret) = RecipientKey::generate(mallory.did().clone());
    assert!(envelope.open(mallory.did(), &mallory_secret).is_err());

    // SHARED -> PUBLIC.
    let anchor = manager.publish(&conversation, &alice).await.unwrap();
    anchor.verify().unwrap();
    assert!(manager.verify_published(&conversation).await.unwrap());

    // PUBLIC is permanent: no way back, no further mutation.
    let (recipient2, _) = RecipientKey::generate(bob.did().clone());
    let err = manager
        .share_with(&conversation, &[recipient2], &alice)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        braid_engine::privacy::PrivacyError::InvalidTransition { .. }
    ));
    let err = manager.publish(&conversation, &alice).await.unwrap_err();
    assert!(matches!(
        err,
        braid_engine::privacy::PrivacyError::InvalidTransition { .. }
    ));
    let err = engine_handle
        .append_message(&conversation, None, &alice, Role::User, text("more"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ConversationFrozen(_)));

    let record = engine_handle
        .store()
        .conversation(&conversation)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.visibility, Visibility::Public);
    assert!(record.anchor.is_some());

    // The anchored root stays reproducible, and continuation means a new
    // lineage.
    assert!(manager.verify_published(&conversation).await.unwrap());
    let lineage = engine_handle
        .fork_lineage(&conversation, &alice, "lifecycle, continued")
        .await
        .unwrap();
    assert_ne!(lineage, conversation);
    engine_handle
        .append_message(&lineage, None, &alice, Role::User, text("onwards"))
        .await
        .unwrap();
}

#[tokio::test]
async fn direct_local_to_public_is_allowed() {
    let alice = DidKey::new();
    let engine_handle = engine();
    let manager = PrivacyManager::new(engine_handle.clone());
    let conversation = engine_handle
        .create_conversation(&alice, "straight to public", None)
        .await
        .unwrap();
    manager.publish(&conversation, &alice).await.unwrap();
    let record = engine_handle
        .store()
        .conversation(&conversation)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.visibility, Visibility::Public);
}

#[tokio::test]
async fn capsule_round_trip() {
    let alice = DidKey::new();
    let engine_handle = engine();
    let conversation = engine_handle
        .create_conversation(&alice, "exported", None)
        .await
        .unwrap();
    engine_handle
        .append_message(&conversation, None, &alice, Role::User, text("first"))
        .await
        .unwrap();
    engine_handle
        .append_message(&conversation, None, &alice, Role::Assistant, text("second"))
        .await
        .unwrap();

    let nodes = engine_handle.conversation_nodes(&conversation).await.unwrap();
    let document = capsule::export(&conversation, "exported", &nodes, CapsuleMode::Open).unwrap();

    let imported = capsule::import(&document);
    assert_eq!(imported.mode, Some(CapsuleMode::Open));
    let payload = imported.data.clone().unwrap();

    // Set-equality of ids and signatures with the original message nodes.
    let mut original: Vec<(String, String)> = nodes
        .iter()
        .filter(|n| n.node.kind() == NodeKind::Message)
        .map(|n| {
            (
                n.id.clone().unwrap().to_string(),
                hex::encode(&n.signature),
            )
        })
        .collect();
    let mut embedded: Vec<(String, String)> = payload
        .entries
        .iter()
        .map(|e| (e.id.clone(), e.signature.clone()))
        .collect();
    original.sort();
    embedded.sort();
    assert_eq!(original, embedded);

    // Rendering verifies and shows content in OPEN mode.
    let rendered = imported.render();
    assert_eq!(rendered.status, RenderStatus::Verified);
    assert_eq!(rendered.lines.len(), 2);

    // Caller-invoked cryptographic re-verification against the store's
    // nodes passes.
    assert!(imported.verify_against(&nodes).is_empty());

    // And fails once a node is tampered with.
    let mut tampered = nodes.clone();
    for node in &mut tampered {
        node.signature[0] ^= 0xff;
    }
    assert!(!imported.verify_against(&tampered).is_empty());
}

#[tokio::test]
async fn service_facade() {
    let alice = DidKey::new();
    let engine_handle = engine();
    let service = ConversationService::new(engine_handle.clone());

    let conversation = service
        .create_conversation(&alice, "service thread")
        .await
        .unwrap();
    service
        .append_message(&conversation, &alice, Role::User, text("hi there"))
        .await
        .unwrap();

    let summaries = service.list_conversations().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].title, "service thread");
    assert_eq!(summaries[0].owner, *alice.did());

    let summary = service.get_conversation(&conversation).await.unwrap().unwrap();
    assert_eq!(summary.visibility, Visibility::Local);

    let snapshot = service.get_messages(&conversation).await.unwrap().unwrap();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].content, text("hi there"));

    // Unknown lookups are absent results, not errors.
    let missing = NodeId::digest(b"nope", braid_types::HashAlgorithm::Sha256).unwrap();
    assert!(service.get_conversation(&missing).await.unwrap().is_none());
    assert!(service.get_messages(&missing).await.unwrap().is_none());

    assert!(service.delete_conversation(&conversation).await.unwrap());
    assert!(service.list_conversations().await.unwrap().is_empty());
    let removed = engine_handle.store().collect_garbage().await.unwrap();
    assert_eq!(removed, 2);
}
