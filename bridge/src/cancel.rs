//! Cooperative cancellation.
//!
//! A [`CancelToken`] is a shared flag that bridged operations race against.
//! Cancelling only affects the waiting side: the native layer still runs
//! its callback, which the bridge then discards.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{BridgeError, Result};

/// Shared cancellation signal. Clones observe the same flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.flag.send_replace(true) {
            tracing::debug!("cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Run `fut` unless `token` is cancelled first.
///
/// Cancellation wins ties, and the losing future is dropped.
pub async fn with_cancel<T, F>(token: &CancelToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if token.is_cancelled() {
        return Err(BridgeError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(BridgeError::Cancelled),
        result = fut => result,
    }
}
