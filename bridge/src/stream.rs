//! Streaming event bridge.
//!
//! Native streams report 0..n items followed by exactly one terminal
//! callback. A [`StreamCore`] is the `userdata` target of such a stream:
//! item callbacks borrow it, the terminal callback consumes the reference
//! the native layer was handed. Items land in a bounded buffer that drops
//! its oldest entry on overflow, and a [`BridgeStream`] drains it lazily.
//!
//! Subscriptions additionally own a native handle. Its release follows the
//! first of two events: the terminal callback frees it, or the consumer
//! going away cancels it. Never both.

use std::collections::VecDeque;
use std::ffi::{c_char, c_void};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::task::AtomicWaker;
use futures::{Stream, StreamExt};
use tether_native::abi::{
    self, from_c_string, DocEntry, DocEvent, EntryStreamCallback, EventStreamCallback,
    ProgressCallback,
};
use tether_native::{NativeApi, OwnedBytes, SubscriptionPtr};
use uuid::Uuid;

use crate::error::{BridgeError, OperationKind, Result};
use crate::registry::Release;
use crate::types::{DownloadProgress, Entry, Event};

/// Native handle state of a streaming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    /// No native handle belongs to this stream
    Detached,
    /// Subscribed, handle not yet returned by the native call
    Pending,
    Live(SubscriptionPtr),
    /// Consumer left before the handle arrived
    CancelRequested,
    /// Terminal callback fired before the handle arrived
    Terminated,
    Released,
}

/// What the native side should do with a handle, decided under the lock.
enum Disposal {
    Keep,
    Cancel(SubscriptionPtr),
    Free(SubscriptionPtr),
}

struct Buffer<T, D> {
    items: VecDeque<Result<T>>,
    terminal: Option<std::result::Result<D, String>>,
    consumer_gone: bool,
    dropped: u64,
}

/// Shared state between native callbacks and the consumer.
pub(crate) struct StreamCore<T, D = ()> {
    id: Uuid,
    kind: OperationKind,
    api: Arc<dyn NativeApi>,
    capacity: usize,
    buffer: Mutex<Buffer<T, D>>,
    waker: AtomicWaker,
    handle: Mutex<HandleState>,
}

impl<T: Send + 'static, D: Send + 'static> StreamCore<T, D> {
    /// A stream without a native handle (queries, downloads).
    pub fn new(api: Arc<dyn NativeApi>, kind: OperationKind, capacity: usize) -> Arc<Self> {
        Self::build(api, kind, capacity, HandleState::Detached)
    }

    /// A stream whose native handle arrives through [`install`](Self::install).
    pub fn subscription(api: Arc<dyn NativeApi>, kind: OperationKind, capacity: usize) -> Arc<Self> {
        Self::build(api, kind, capacity, HandleState::Pending)
    }

    fn build(
        api: Arc<dyn NativeApi>,
        kind: OperationKind,
        capacity: usize,
        handle: HandleState,
    ) -> Arc<Self> {
        let core = Arc::new(Self {
            id: Uuid::new_v4(),
            kind,
            api,
            capacity: capacity.max(1),
            buffer: Mutex::new(Buffer {
                items: VecDeque::new(),
                terminal: None,
                consumer_gone: false,
                dropped: 0,
            }),
            waker: AtomicWaker::new(),
            handle: Mutex::new(handle),
        });
        tracing::trace!(op = %kind, stream = %core.id, "stream opened");
        core
    }

    /// A new reference for the native layer, returned by the terminal callback.
    fn userdata(self: &Arc<Self>) -> *mut c_void {
        Arc::into_raw(self.clone()) as *mut c_void
    }

    /// # Safety
    /// `userdata` must come from [`userdata`](Self::userdata) for these
    /// types and the terminal callback must not have run yet.
    unsafe fn borrow<'a>(userdata: *mut c_void) -> &'a Self {
        &*(userdata as *const Self)
    }

    /// # Safety
    /// As for [`borrow`](Self::borrow); the reference is consumed.
    unsafe fn take(userdata: *mut c_void) -> Arc<Self> {
        Arc::from_raw(userdata as *const Self)
    }

    fn push(&self, item: Result<T>) {
        {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            if buffer.consumer_gone {
                return;
            }
            if buffer.terminal.is_some() {
                tracing::warn!(op = %self.kind, stream = %self.id, "item after terminal ignored");
                return;
            }
            if buffer.items.len() >= self.capacity {
                buffer.items.pop_front();
                buffer.dropped += 1;
                tracing::debug!(
                    op = %self.kind,
                    stream = %self.id,
                    dropped = buffer.dropped,
                    "buffer full, dropped oldest item"
                );
            }
            buffer.items.push_back(item);
        }
        self.waker.wake();
    }

    fn terminate(&self, outcome: std::result::Result<D, String>) {
        {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            if buffer.terminal.is_some() {
                tracing::warn!(op = %self.kind, stream = %self.id, "duplicate terminal ignored");
                return;
            }
            match &outcome {
                Ok(_) => tracing::debug!(op = %self.kind, stream = %self.id, "stream completed"),
                Err(message) => {
                    tracing::debug!(op = %self.kind, stream = %self.id, error = %message, "stream failed")
                }
            }
            buffer.terminal = Some(outcome);
        }

        let disposal = self.transition(|state| match state {
            HandleState::Live(ptr) => (HandleState::Released, Disposal::Free(ptr)),
            HandleState::Pending | HandleState::CancelRequested => {
                (HandleState::Terminated, Disposal::Keep)
            }
            other => (other, Disposal::Keep),
        });
        self.dispose(disposal);
        self.waker.wake();
    }

    fn fail(&self, error: *const c_char) {
        // SAFETY: failure strings are valid C strings owned by the native side.
        let message = unsafe { from_c_string(error) }
            .unwrap_or_else(|| "unknown native failure".to_string());
        self.api.string_free(error as *mut c_char);
        self.terminate(Err(message));
    }

    fn transition(&self, step: impl FnOnce(HandleState) -> (HandleState, Disposal)) -> Disposal {
        let mut state = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let (next, disposal) = step(*state);
        *state = next;
        disposal
    }

    /// Native calls happen outside the lock: they may call back into us.
    fn dispose(&self, disposal: Disposal) {
        match disposal {
            Disposal::Keep => {}
            Disposal::Cancel(ptr) => {
                tracing::debug!(op = %self.kind, stream = %self.id, "cancelling subscription");
                self.api.subscription_cancel(ptr);
            }
            Disposal::Free(ptr) => {
                tracing::trace!(op = %self.kind, stream = %self.id, "freeing subscription");
                self.api.subscription_free(ptr);
            }
        }
    }

    /// Hand over the handle returned by the subscribe call.
    pub fn install(&self, ptr: SubscriptionPtr) {
        let disposal = self.transition(|state| match state {
            HandleState::Pending => (HandleState::Live(ptr), Disposal::Keep),
            HandleState::Terminated => (HandleState::Released, Disposal::Free(ptr)),
            HandleState::CancelRequested => (HandleState::Released, Disposal::Cancel(ptr)),
            other => {
                tracing::warn!(op = %self.kind, stream = %self.id, ?other, "unexpected handle");
                (other, Disposal::Keep)
            }
        });
        self.dispose(disposal);
    }

    /// Stop the native stream if it is still running.
    pub fn cancel(&self) {
        let disposal = self.transition(|state| match state {
            HandleState::Live(ptr) => (HandleState::Released, Disposal::Cancel(ptr)),
            HandleState::Pending => (HandleState::CancelRequested, Disposal::Keep),
            other => (other, Disposal::Keep),
        });
        self.dispose(disposal);
    }

    /// The native failure message, once the stream has failed.
    pub fn failure(&self) -> Option<String> {
        match &self
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .terminal
        {
            Some(Err(message)) => Some(message.clone()),
            _ => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .terminal
            .is_some()
    }
}

impl<T: Send + 'static, D: Send + 'static> Release for StreamCore<T, D> {
    fn release(&self) {
        self.cancel();
    }
}

// ============================================================================
// Callbacks
// ============================================================================

extern "C" fn entry_item(userdata: *mut c_void, entry: *const DocEntry) {
    // SAFETY: item callbacks only fire before the terminal one.
    let core = unsafe { StreamCore::<Entry>::borrow(userdata) };
    // SAFETY: the entry is live until freed below.
    let item = match unsafe { entry.as_ref() } {
        Some(entry) => unsafe { Entry::from_native(entry) },
        None => Err(BridgeError::DecodingFailed("null entry".into())),
    };
    core.api.entry_free(entry as *mut DocEntry);
    core.push(item);
}

extern "C" fn event_item(userdata: *mut c_void, event: DocEvent) {
    // SAFETY: see `entry_item`.
    let core = unsafe { StreamCore::<Event>::borrow(userdata) };
    // SAFETY: the event fields are live until freed below.
    let item = unsafe { Event::from_native(&event) };
    core.api.event_free(event);
    core.push(item);
}

extern "C" fn progress_item(userdata: *mut c_void, progress: abi::DownloadProgress) {
    // SAFETY: see `entry_item`.
    let core = unsafe { StreamCore::<DownloadProgress, Vec<u8>>::borrow(userdata) };
    core.push(Ok(progress.into()));
}

extern "C" fn stream_complete<T: Send + 'static>(userdata: *mut c_void) {
    // SAFETY: the terminal callback consumes the native layer's reference.
    let core = unsafe { StreamCore::<T>::take(userdata) };
    core.terminate(Ok(()));
}

extern "C" fn download_complete(userdata: *mut c_void, bytes: OwnedBytes) {
    // SAFETY: see `stream_complete`.
    let core = unsafe { StreamCore::<DownloadProgress, Vec<u8>>::take(userdata) };
    // SAFETY: the buffer is live until handed back below.
    let content = unsafe { bytes.as_slice() }.to_vec();
    core.api.bytes_free(bytes);
    core.terminate(Ok(content));
}

extern "C" fn stream_failure<T: Send + 'static, D: Send + 'static>(
    userdata: *mut c_void,
    error: *const c_char,
) {
    // SAFETY: see `stream_complete`.
    let core = unsafe { StreamCore::<T, D>::take(userdata) };
    core.fail(error);
}

impl StreamCore<Entry> {
    pub fn entry_callback(self: &Arc<Self>) -> EntryStreamCallback {
        EntryStreamCallback {
            userdata: self.userdata(),
            on_entry: entry_item,
            on_complete: stream_complete::<Entry>,
            on_failure: stream_failure::<Entry, ()>,
        }
    }
}

impl StreamCore<Event> {
    pub fn event_callback(self: &Arc<Self>) -> EventStreamCallback {
        EventStreamCallback {
            userdata: self.userdata(),
            on_event: event_item,
            on_complete: stream_complete::<Event>,
            on_failure: stream_failure::<Event, ()>,
        }
    }
}

impl StreamCore<DownloadProgress, Vec<u8>> {
    pub fn progress_callback(self: &Arc<Self>) -> ProgressCallback {
        ProgressCallback {
            userdata: self.userdata(),
            on_progress: progress_item,
            on_success: download_complete,
            on_failure: stream_failure::<DownloadProgress, Vec<u8>>,
        }
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// A lazily consumed native stream.
///
/// Yields items in native emission order. A native failure is yielded once
/// as [`BridgeError::StreamFailed`], after which the stream ends. Dropping
/// it early cancels the native side where that is possible.
pub struct BridgeStream<T: Send + 'static, D: Send + 'static = ()> {
    core: Arc<StreamCore<T, D>>,
    done: bool,
}

impl<T: Send + 'static, D: Send + 'static> BridgeStream<T, D> {
    pub(crate) fn new(core: Arc<StreamCore<T, D>>) -> Self {
        Self { core, done: false }
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    /// Items discarded so far because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.core
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dropped
    }

    /// Stop the native stream. Buffered items stay readable.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    /// Drain the remaining items and return the terminal value.
    pub async fn finish(mut self) -> Result<D> {
        while let Some(item) = self.next().await {
            item?;
        }
        let terminal = self
            .core
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .terminal
            .take();
        match terminal {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(BridgeError::StreamFailed(message)),
            None => Err(BridgeError::StreamFailed(
                "stream ended without an outcome".into(),
            )),
        }
    }
}

impl<T: Send + 'static, D: Send + 'static> Stream for BridgeStream<T, D> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        this.core.waker.register(cx.waker());

        let mut buffer = this.core.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(item) = buffer.items.pop_front() {
            return Poll::Ready(Some(item));
        }
        match &buffer.terminal {
            None => Poll::Pending,
            Some(Ok(_)) => {
                this.done = true;
                Poll::Ready(None)
            }
            Some(Err(message)) => {
                this.done = true;
                Poll::Ready(Some(Err(BridgeError::StreamFailed(message.clone()))))
            }
        }
    }
}

impl<T: Send + 'static, D: Send + 'static> Drop for BridgeStream<T, D> {
    fn drop(&mut self) {
        let terminated = {
            let mut buffer = self.core.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.consumer_gone = true;
            buffer.items.clear();
            buffer.terminal.is_some()
        };
        if !terminated && !self.done {
            tracing::debug!(op = %self.core.kind, stream = %self.core.id, "consumer dropped early");
            self.core.cancel();
        }
    }
}

impl<T: Send + 'static, D: Send + 'static> std::fmt::Debug for BridgeStream<T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeStream")
            .field("id", &self.core.id)
            .field("op", &self.core.kind)
            .field("done", &self.done)
            .finish()
    }
}
