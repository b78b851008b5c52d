//! Documents: entries, sharing, live events and close ordering.

mod common;

use common::{Harness, WAIT};
use futures::StreamExt;
use tether_bridge::{
    BridgeError, Entry, Event, HandleKind, OperationKind, ShareMode, Subscription,
};

async fn next_event(subscription: &mut Subscription) -> Event {
    tokio::time::timeout(WAIT, subscription.next())
        .await
        .expect("no event in time")
        .expect("subscription ended")
        .expect("event failed")
}

async fn assert_ended(subscription: &mut Subscription) {
    let next = tokio::time::timeout(WAIT, subscription.next())
        .await
        .expect("subscription still running");
    assert!(next.is_none(), "unexpected event {next:?}");
}

fn assert_failed<T: std::fmt::Debug>(
    result: tether_bridge::Result<T>,
    expected: OperationKind,
    prefix: &str,
) {
    match result {
        Err(BridgeError::OperationFailed { kind, message }) => {
            assert_eq!(kind, expected);
            assert!(message.starts_with(prefix), "{message}");
        }
        other => panic!("expected {expected} to fail, got {other:?}"),
    }
}

#[cfg(test)]
mod entry_tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_and_read_content() {
        let harness = Harness::new();
        let engine = harness.docs_engine().await;
        let author = harness.author(&engine).await;
        let doc = engine.create_doc().await.unwrap();
        assert_eq!(doc.namespace_id().len(), 64);

        let hash = doc.set(&author, b"notes/today", b"hello").await.unwrap();
        let entry: Entry = doc.get(b"notes/today").await.unwrap().unwrap();
        assert_eq!(entry.author, author.id());
        assert_eq!(entry.key_str(), Some("notes/today"));
        assert_eq!(entry.content_hash, hash);
        assert_eq!(entry.content_size, 5);
        assert!(entry.created_at().is_some());

        assert_eq!(doc.read_content(&hash).await.unwrap(), b"hello");
        assert_eq!(engine.read_content(&hash).await.unwrap(), b"hello");
        assert_eq!(doc.get(b"notes").await.unwrap(), None);

        doc.close().await.unwrap();
        engine.close().await.unwrap();
        harness.assert_released().await;
    }

    #[tokio::test]
    async fn test_get_many_and_delete_by_prefix() {
        let harness = Harness::new();
        let engine = harness.docs_engine().await;
        let author = harness.author(&engine).await;
        let doc = engine.create_doc().await.unwrap();

        for key in ["notes/c", "notes/a", "todo/x", "notes/b"] {
            doc.set(&author, key.as_bytes(), key.as_bytes()).await.unwrap();
        }

        let keys: Vec<String> = doc
            .get_many(b"notes/")
            .unwrap()
            .map(|entry| entry.unwrap().key_str().unwrap().to_string())
            .collect()
            .await;
        assert_eq!(keys, ["notes/a", "notes/b", "notes/c"]);

        assert_eq!(doc.delete(&author, b"notes/").await.unwrap(), 3);
        assert_eq!(doc.get(b"notes/a").await.unwrap(), None);
        assert_eq!(doc.get_many(b"").unwrap().count().await, 1);
        assert_eq!(doc.delete(&author, b"notes/").await.unwrap(), 0);

        drop(doc);
        drop(engine);
        harness.assert_released().await;
    }

    #[tokio::test]
    async fn test_writes_need_an_imported_author() {
        let harness = Harness::new();
        let engine = harness.docs_engine().await;
        let doc = engine.create_doc().await.unwrap();
        let stranger = harness.bridge.create_author().await.unwrap();

        assert_failed(
            doc.set(&stranger, b"k", b"v").await,
            OperationKind::DocSet,
            "author not found",
        );
        engine.import_author(&stranger).await.unwrap();
        doc.set(&stranger, b"k", b"v").await.unwrap();

        drop(doc);
        engine.close().await.unwrap();
        harness.assert_released().await;
    }

    #[tokio::test]
    async fn test_docs_must_be_enabled() {
        let harness = Harness::new();
        let engine = harness.engine().await;

        assert_failed(
            engine.create_doc().await,
            OperationKind::CreateDoc,
            "docs not enabled on this node",
        );
        assert_eq!(engine.live_documents(), 0);

        engine.close().await.unwrap();
        harness.assert_released().await;
    }
}

#[cfg(test)]
mod sharing_tests {
    use super::*;

    #[tokio::test]
    async fn test_joined_document_sees_remote_inserts() {
        let harness = Harness::new();
        let owner = harness.docs_engine().await;
        let peer = harness.docs_engine().await;
        let owner_id = owner.info().await.unwrap().node_id;
        let peer_id = peer.info().await.unwrap().node_id;

        let doc = owner.create_doc().await.unwrap();
        let mut owner_events = doc.subscribe().unwrap();
        let ticket = doc.share(ShareMode::Write).await.unwrap();

        let joined = peer.join_doc(&ticket).await.unwrap();
        assert_eq!(joined.namespace_id(), doc.namespace_id());
        assert_eq!(
            next_event(&mut owner_events).await,
            Event::NeighborUp { peer: peer_id.clone() }
        );
        assert_eq!(
            next_event(&mut owner_events).await,
            Event::SyncFinished { peer: peer_id.clone() }
        );

        let mut peer_events = joined.subscribe().unwrap();
        let author = harness.author(&owner).await;
        let hash = doc.set(&author, b"greeting", b"hi").await.unwrap();

        match next_event(&mut peer_events).await {
            Event::InsertRemote { from, entry } => {
                assert_eq!(from, owner_id);
                assert_eq!(entry.content_hash, hash);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            next_event(&mut peer_events).await,
            Event::ContentReady { hash: hash.clone() }
        );
        assert!(matches!(
            next_event(&mut owner_events).await,
            Event::InsertLocal { .. }
        ));
        assert_eq!(joined.read_content(&hash).await.unwrap(), b"hi");

        // The peer leaving ends its own feed and is seen by the owner.
        peer.close().await.unwrap();
        assert_ended(&mut peer_events).await;
        assert_eq!(
            next_event(&mut owner_events).await,
            Event::NeighborDown { peer: peer_id }
        );

        drop((peer_events, owner_events, joined, doc));
        drop((owner, peer));
        harness.assert_released().await;
    }

    #[tokio::test]
    async fn test_read_only_share_rejects_writes() {
        let harness = Harness::new();
        let owner = harness.docs_engine().await;
        let reader = harness.docs_engine().await;
        let owner_author = harness.author(&owner).await;
        let reader_author = harness.author(&reader).await;

        let doc = owner.create_doc().await.unwrap();
        doc.set(&owner_author, b"k", b"from owner").await.unwrap();
        let ticket = doc.share(ShareMode::Read).await.unwrap();

        let joined = reader.join_doc(&ticket).await.unwrap();
        assert_eq!(
            joined.get(b"k").await.unwrap().map(|e| e.author),
            Some(owner_author.id())
        );
        assert_failed(
            joined.set(&reader_author, b"k", b"from reader").await,
            OperationKind::DocSet,
            "document is read-only",
        );
        assert_failed(
            joined.share(ShareMode::Write).await,
            OperationKind::Share,
            "document is read-only",
        );
        joined.share(ShareMode::Read).await.unwrap();

        drop((joined, doc));
        drop((owner, reader));
        harness.assert_released().await;
    }

    #[tokio::test]
    async fn test_malformed_join_ticket() {
        let harness = Harness::new();
        let engine = harness.docs_engine().await;

        assert_failed(
            engine.join_doc("not a ticket").await,
            OperationKind::JoinDoc,
            "invalid ticket",
        );
        assert!(matches!(
            engine.join_doc("nul\0byte").await,
            Err(BridgeError::EncodingFailed(_))
        ));
        assert_eq!(engine.live_documents(), 0);

        drop(engine);
        harness.assert_released().await;
    }
}

#[cfg(test)]
mod close_tests {
    use super::*;

    fn assert_document_closed<T: std::fmt::Debug>(result: tether_bridge::Result<T>) {
        match result {
            Err(BridgeError::ResourceClosed(HandleKind::Document)) => {}
            other => panic!("expected a closed document, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_engine_close_closes_documents_first() {
        let harness = Harness::new();
        let engine = harness.docs_engine().await;
        let author = harness.author(&engine).await;
        let doc = engine.create_doc().await.unwrap();
        let mut events = doc.subscribe().unwrap();
        assert_eq!(engine.live_documents(), 1);

        engine.close().await.unwrap();
        assert!(doc.is_closed());
        assert_eq!(engine.live_documents(), 0);
        assert_ended(&mut events).await;

        let stats = harness.stats();
        assert_eq!(stats.doc_closes, 1);
        assert_eq!(stats.subscription_cancels, 1);
        assert_eq!(stats.node_closes, 1);

        let calls = stats.calls;
        assert_document_closed(doc.set(&author, b"k", b"v").await);
        assert_document_closed(doc.get(b"k").await);
        assert_document_closed(doc.get_many(b""));
        assert_document_closed(doc.subscribe());
        assert_document_closed(doc.share(ShareMode::Read).await);
        doc.close().await.unwrap();
        assert_eq!(harness.stats().calls, calls);

        drop(doc);
        assert_eq!(harness.stats().doc_closes, 1);
        harness.assert_released().await;
    }

    #[tokio::test]
    async fn test_dropping_the_engine_closes_documents() {
        let harness = Harness::new();
        let engine = harness.docs_engine().await;
        let doc = engine.create_doc().await.unwrap();
        let mut events = doc.subscribe().unwrap();

        drop(engine);
        assert!(doc.is_closed());
        assert_ended(&mut events).await;
        // Content reads go through the engine, which is gone.
        match doc.read_content("00").await {
            Err(BridgeError::ResourceClosed(_)) => {}
            other => panic!("unexpected result {other:?}"),
        }

        let stats = harness.stats();
        assert_eq!(stats.doc_closes, 1);
        assert_eq!(stats.node_destroys, 1);
        drop((events, doc));
        harness.assert_released().await;
    }

    #[tokio::test]
    async fn test_document_close_is_idempotent() {
        let harness = Harness::new();
        let engine = harness.docs_engine().await;
        let first = engine.create_doc().await.unwrap();
        let second = engine.create_doc().await.unwrap();
        assert_eq!(engine.live_documents(), 2);

        first.close().await.unwrap();
        first.close().await.unwrap();
        assert!(first.is_closed());
        assert_eq!(engine.live_documents(), 1);
        drop(first);
        assert_eq!(harness.stats().doc_closes, 1);

        drop(second);
        assert_eq!(engine.live_documents(), 0);
        assert_eq!(harness.stats().doc_closes, 2);

        engine.close().await.unwrap();
        assert_eq!(harness.stats().doc_closes, 2);
        harness.assert_released().await;
    }
}
