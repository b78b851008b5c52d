//! Live document subscriptions.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use uuid::Uuid;

use crate::document::DocInner;
use crate::error::Result;
use crate::stream::{BridgeStream, StreamCore};
use crate::types::Event;

/// A feed of [`Event`]s from one document.
///
/// Ends when the document closes or after [`cancel`](Self::cancel).
/// Dropping it before then cancels the native subscription.
pub struct Subscription {
    core: Arc<StreamCore<Event>>,
    stream: BridgeStream<Event>,
    document: Weak<DocInner>,
}

impl Subscription {
    pub(crate) fn new(core: Arc<StreamCore<Event>>, document: Weak<DocInner>) -> Self {
        Self {
            stream: BridgeStream::new(core.clone()),
            core,
            document,
        }
    }

    pub fn id(&self) -> Uuid {
        self.stream.id()
    }

    /// Stop the feed. Events already buffered can still be read.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    /// Whether the native side has delivered its last event.
    pub fn is_finished(&self) -> bool {
        self.core.is_terminated()
    }

    /// Events lost to a full buffer.
    pub fn dropped(&self) -> u64 {
        self.stream.dropped()
    }
}

impl Stream for Subscription {
    type Item = Result<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(document) = self.document.upgrade() {
            document.subscriptions.unregister(&self.id());
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("finished", &self.is_finished())
            .finish()
    }
}
