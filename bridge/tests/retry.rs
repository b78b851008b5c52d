//! Retry helpers against injected native failures.

mod common;

use std::time::Duration;

use common::Harness;
use tether_bridge::{BridgeConfig, BridgeError, CancelToken, HandleKind, OperationKind, RetryPolicy};
use tether_native::FaultPoint;

fn quick_retries(max_attempts: u32) -> Harness {
    Harness::with_config(BridgeConfig {
        retry: RetryPolicy::new(max_attempts, Duration::from_millis(5)),
        ..BridgeConfig::default()
    })
}

#[cfg(test)]
mod retry_tests {
    use super::*;

    #[tokio::test]
    async fn test_put_recovers_from_transient_failures() {
        let harness = quick_retries(3);
        let engine = harness.engine().await;
        harness.native.inject_failures(FaultPoint::Put, 2);

        let ticket = engine
            .put_with_retry(b"third time lucky", &CancelToken::new())
            .await
            .unwrap();
        let bytes = engine
            .get_with_retry(ticket.as_str(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(bytes, b"third time lucky");

        engine.close().await.unwrap();
        harness.assert_released().await;
    }

    #[tokio::test]
    async fn test_retries_give_up_with_the_last_error() {
        let harness = quick_retries(3);
        let engine = harness.engine().await;
        harness.native.inject_failures(FaultPoint::Put, 3);

        match engine.put_with_retry(b"doomed", &CancelToken::new()).await {
            Err(BridgeError::MaxRetriesExceeded {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 3);
                match *last_error {
                    BridgeError::OperationFailed { kind, message } => {
                        assert_eq!(kind, OperationKind::Put);
                        assert_eq!(message, "injected failure: put");
                    }
                    other => panic!("unexpected last error {other:?}"),
                }
            }
            other => panic!("unexpected result {other:?}"),
        }

        // The faults were used up by the three attempts.
        engine.put(b"fine now").await.unwrap();
        engine.close().await.unwrap();
        harness.assert_released().await;
    }

    #[tokio::test]
    async fn test_closed_engine_uses_every_attempt_locally() {
        let harness = quick_retries(5);
        let engine = harness.engine().await;
        let ticket = engine.put(b"x").await.unwrap();
        engine.close().await.unwrap();

        let calls = harness.stats().calls;
        match engine.get_with_retry(ticket.as_str(), &CancelToken::new()).await {
            Err(BridgeError::MaxRetriesExceeded {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 5);
                assert!(matches!(
                    *last_error,
                    BridgeError::ResourceClosed(HandleKind::Engine)
                ));
            }
            other => panic!("unexpected result {other:?}"),
        }
        // Closed handles fail before reaching the native layer.
        assert_eq!(harness.stats().calls, calls);
        harness.assert_released().await;
    }

    #[tokio::test]
    async fn test_cancel_interrupts_the_backoff() {
        let harness = Harness::with_config(BridgeConfig {
            retry: RetryPolicy::new(3, Duration::from_secs(60)),
            ..BridgeConfig::default()
        });
        let engine = harness.engine().await;
        harness.native.inject_failures(FaultPoint::Put, 3);

        let token = CancelToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let result = tokio::time::timeout(
            common::WAIT,
            engine.put_with_retry(b"interrupted", &token),
        )
        .await
        .expect("backoff was not interrupted");
        assert!(matches!(result, Err(BridgeError::Cancelled)));

        drop(engine);
        harness.assert_released().await;
    }
}

#[cfg(test)]
mod property_tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_delays_double_from_the_initial_delay(
            initial_ms in 1u64..1_000,
            failures in 1u32..12,
        ) {
            let policy = RetryPolicy::new(failures + 1, Duration::from_millis(initial_ms));
            let delay = policy.delay_after(failures);
            prop_assert_eq!(delay, Duration::from_millis(initial_ms << (failures - 1)));
            if failures > 1 {
                prop_assert_eq!(delay, policy.delay_after(failures - 1) * 2);
            }
        }

        #[test]
        fn prop_total_backoff_is_bounded(initial_ms in 1u64..1_000, attempts in 1u32..10) {
            let policy = RetryPolicy::new(attempts, Duration::from_millis(initial_ms));
            // Pauses happen between attempts only.
            let total: Duration = (1..attempts).map(|n| policy.delay_after(n)).sum();
            let expected = initial_ms * ((1u64 << (attempts - 1)) - 1);
            prop_assert_eq!(total, Duration::from_millis(expected));
        }

        #[test]
        fn prop_always_failing_op_makes_exactly_n_attempts(attempts in 1u32..8, closed in any::<bool>()) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let policy = RetryPolicy::new(attempts, Duration::from_millis(10));
            let calls = &AtomicU32::new(0);

            let err = runtime
                .block_on(tether_bridge::retry(&policy, &CancelToken::new(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(if closed {
                        BridgeError::ResourceClosed(HandleKind::Document)
                    } else {
                        BridgeError::Timeout(OperationKind::DocGet)
                    })
                }))
                .unwrap_err();

            prop_assert_eq!(calls.load(Ordering::SeqCst), attempts);
            let exhausted = matches!(err, BridgeError::MaxRetriesExceeded { attempts: n, .. } if n == attempts);
            prop_assert!(exhausted, "{:?}", err);
        }
    }
}
