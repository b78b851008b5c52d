//! Ticket checks, local and native.

mod common;

use common::Harness;
use tether_bridge::{validate_structure, BlobFormat, BlobTicket, TicketInfo};

#[cfg(test)]
mod ticket_tests {
    use super::*;

    #[test]
    fn test_structural_check() {
        assert!(!validate_structure("").is_valid);
        assert!(!validate_structure("blob").is_valid);

        // Well shaped, but only the native decoder can say what it names.
        let info = validate_structure("blobAAAAAAAAAA");
        assert!(info.is_valid);
        assert_eq!(info.hash, None);
        assert_eq!(info.node_id, None);
        assert!(!info.is_recursive);

        assert!("blob".parse::<BlobTicket>().is_err());
    }

    #[tokio::test]
    async fn test_structural_and_native_checks_share_a_result_type() {
        let harness = Harness::new();
        let engine = harness.engine().await;
        let ticket = engine.put(b"shape").await.unwrap();

        let structural: TicketInfo = validate_structure(ticket.as_str());
        let native: TicketInfo = harness.bridge.validate_ticket(ticket.as_str()).await.unwrap();
        assert!(structural.is_valid && native.is_valid);
        assert_eq!(structural.hash, None);
        assert!(native.hash.is_some());

        let structural = validate_structure("blobAAAAAAAAAA");
        let native = harness.bridge.validate_ticket("blobAAAAAAAAAA").await.unwrap();
        assert!(structural.is_valid);
        assert_eq!(native, TicketInfo::invalid());

        engine.close().await.unwrap();
        harness.assert_released().await;
    }

    #[tokio::test]
    async fn test_garbage_is_invalid_not_an_error() {
        let harness = Harness::new();

        for garbage in ["", "blob", "blobAAAAAAAAAA", "doc1234567890", "nul\0inside"] {
            let info = harness.bridge.validate_ticket(garbage).await.unwrap();
            assert!(!info.is_valid, "{garbage:?} was accepted");
            assert_eq!(info.hash, None);
            assert_eq!(info.node_id, None);
        }
        harness.assert_clean().await;
    }

    #[tokio::test]
    async fn test_native_decoding_agrees_with_the_engine() {
        let harness = Harness::new();
        let engine = harness.engine().await;
        let node_id = engine.info().await.unwrap().node_id;

        let ticket = engine.put(b"addressed").await.unwrap();
        let info = harness.bridge.validate_ticket(ticket.as_str()).await.unwrap();
        assert!(info.is_valid);
        assert_eq!(info.node_id.as_deref(), Some(node_id.as_str()));

        let hash = info.hash.unwrap();
        let raw = engine.create_ticket(&hash, BlobFormat::Raw).await.unwrap();
        assert_eq!(raw, ticket);

        engine.close().await.unwrap();
        harness.assert_released().await;
    }

    #[tokio::test]
    async fn test_unknown_hash_cannot_be_ticketed() {
        let harness = Harness::new();
        let engine = harness.engine().await;

        let unknown = "ab".repeat(32);
        let err = engine
            .create_ticket(&unknown, BlobFormat::Raw)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("create_ticket failed: blob not found: {unknown}")
        );

        drop(engine);
        harness.assert_released().await;
    }
}
