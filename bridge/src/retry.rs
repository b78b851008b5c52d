//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::cancel::{with_cancel, CancelToken};
use crate::error::{BridgeError, Result};

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included
    pub max_attempts: u32,
    /// Pause after the first failure; doubles after each further failure
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
        }
    }

    /// Pause after the `failures`-th consecutive failure (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.initial_delay.saturating_mul(factor)
    }
}

/// Run `op` until it succeeds or runs out of attempts.
///
/// Every failure counts as an attempt, whatever the error: `op` is opaque
/// here. Cancellation is checked before every attempt and interrupts both
/// a running attempt and the pause between attempts.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, cancel: &CancelToken, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        attempt += 1;

        let err = match with_cancel(cancel, op()).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "retried operation succeeded");
                }
                return Ok(value);
            }
            Err(err) => err,
        };
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        if attempt >= max_attempts {
            tracing::warn!(attempts = attempt, error = %err, "giving up");
            return Err(BridgeError::MaxRetriesExceeded {
                attempts: attempt,
                last_error: Box::new(err),
            });
        }

        let delay = policy.delay_after(attempt);
        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "attempt failed, backing off"
        );
        with_cancel(cancel, async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await?;
    }
}
