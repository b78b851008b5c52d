//! Single-shot completion bridge.
//!
//! A [`Correlation`] is the target of one native callback. The bridge hands
//! `Arc::into_raw` of it to the native call as `userdata`; whichever branch
//! fires (success or failure) takes the `Arc` back, copies the payload,
//! frees the native buffer and resolves the paired [`Pending`] future.
//!
//! Dropping the [`Pending`] (cancellation, timeout, caller gone) marks the
//! correlation abandoned under the same lock that guards resolution, so a
//! late callback still frees its buffers but resolves nothing. Handles
//! created on behalf of an abandoned correlation are released on arrival.

use std::ffi::{c_char, c_void};
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tether_native::abi::{
    self, from_c_string, AuthorCreateCallback, BytesCallback, CloseCallback, DocCreateCallback,
    DocDelCallback, DocGetCallback, DocHandle, NodeCreateCallback, NodeHandle, NodeInfoCallback,
    StringCallback, TicketValidateCallback,
};
use tether_native::{AuthorId, AuthorSecret, DocEntry, DocPtr, NativeApi, NodePtr, OwnedBytes};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::cancel::{with_cancel, CancelToken};
use crate::error::{BridgeError, OperationKind, Result};
use crate::types::{copy_string, Author, Entry, NodeInfo, TicketInfo};

/// Per-call options for single-shot operations.
#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    /// Give up waiting after this long
    pub timeout: Option<Duration>,
    /// Give up waiting when this token is cancelled
    pub cancel: Option<CancelToken>,
}

impl OperationOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self {
            timeout: None,
            cancel: Some(cancel),
        }
    }

    /// These options, with `default` filling in a missing timeout.
    pub(crate) fn or_timeout(&self, default: Option<Duration>) -> Self {
        Self {
            timeout: self.timeout.or(default),
            cancel: self.cancel.clone(),
        }
    }
}

enum Slot<T> {
    Waiting(oneshot::Sender<Result<T>>),
    Abandoned,
    Resolved,
}

/// Releases a value nobody is waiting for anymore.
type Reclaim<T> = fn(&dyn NativeApi, T);

/// Target of exactly one native completion.
pub(crate) struct Correlation<T> {
    id: Uuid,
    kind: OperationKind,
    api: Arc<dyn NativeApi>,
    slot: Mutex<Slot<T>>,
    reclaim: Option<Reclaim<T>>,
}

impl<T: Send + 'static> Correlation<T> {
    pub fn new(api: Arc<dyn NativeApi>, kind: OperationKind) -> (Arc<Self>, Pending<T>) {
        Self::build(api, kind, None)
    }

    /// Like [`new`](Self::new), releasing late results with `reclaim`.
    pub fn reclaiming(
        api: Arc<dyn NativeApi>,
        kind: OperationKind,
        reclaim: Reclaim<T>,
    ) -> (Arc<Self>, Pending<T>) {
        Self::build(api, kind, Some(reclaim))
    }

    fn build(
        api: Arc<dyn NativeApi>,
        kind: OperationKind,
        reclaim: Option<Reclaim<T>>,
    ) -> (Arc<Self>, Pending<T>) {
        let (tx, rx) = oneshot::channel();
        let token = Arc::new(Self {
            id: Uuid::new_v4(),
            kind,
            api,
            slot: Mutex::new(Slot::Waiting(tx)),
            reclaim,
        });
        tracing::trace!(op = %kind, token = %token.id, "dispatching");
        let pending = Pending {
            token: token.clone(),
            rx,
        };
        (token, pending)
    }

    /// Hand the token to the native layer. Ownership comes back through
    /// exactly one of the callbacks.
    pub fn into_userdata(self: Arc<Self>) -> *mut c_void {
        Arc::into_raw(self) as *mut c_void
    }

    /// # Safety
    /// `userdata` must come from [`into_userdata`](Self::into_userdata) for
    /// this `T`, and is consumed.
    unsafe fn from_userdata(userdata: *mut c_void) -> Arc<Self> {
        Arc::from_raw(userdata as *const Self)
    }

    fn resolve(&self, result: Result<T>) {
        let slot = mem::replace(
            &mut *self.slot.lock().unwrap_or_else(PoisonError::into_inner),
            Slot::Resolved,
        );
        let unclaimed = match slot {
            Slot::Waiting(tx) => match tx.send(result) {
                Ok(()) => {
                    tracing::trace!(op = %self.kind, token = %self.id, "resolved");
                    return;
                }
                Err(result) => result,
            },
            Slot::Abandoned => {
                tracing::debug!(op = %self.kind, token = %self.id, "late completion discarded");
                result
            }
            Slot::Resolved => {
                tracing::warn!(op = %self.kind, token = %self.id, "duplicate completion ignored");
                result
            }
        };
        if let (Ok(value), Some(reclaim)) = (unclaimed, self.reclaim) {
            reclaim(self.api.as_ref(), value);
        }
    }

    fn fail(&self, error: *const c_char) {
        // SAFETY: failure strings are valid C strings owned by the native side.
        let message = unsafe { from_c_string(error) }
            .unwrap_or_else(|| "unknown native failure".to_string());
        self.api.string_free(error as *mut c_char);
        self.resolve(Err(BridgeError::native(self.kind, message)));
    }
}

impl<T> Correlation<T> {
    fn abandon(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*slot, Slot::Waiting(_)) {
            *slot = Slot::Abandoned;
            tracing::debug!(op = %self.kind, token = %self.id, "caller stopped waiting");
        }
    }
}

/// The waiting side of a [`Correlation`].
pub(crate) struct Pending<T> {
    token: Arc<Correlation<T>>,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T: Send + 'static> Pending<T> {
    pub fn kind(&self) -> OperationKind {
        self.token.kind
    }

    /// Wait, bounded by the options' timeout and cancel token.
    pub async fn wait(self, options: &OperationOptions) -> Result<T> {
        let kind = self.kind();
        let timed = async move {
            match options.timeout {
                Some(limit) => match tokio::time::timeout(limit, self).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::debug!(op = %kind, "timed out");
                        Err(BridgeError::Timeout(kind))
                    }
                },
                None => self.await,
            }
        };
        match &options.cancel {
            Some(cancel) => with_cancel(cancel, timed).await,
            None => timed.await,
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let kind = self.token.kind;
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(BridgeError::OperationFailed {
                    kind,
                    message: "native layer dropped the callback".into(),
                })
            })
        })
    }
}

impl<T> Drop for Pending<T> {
    fn drop(&mut self) {
        self.token.abandon();
        // Resolved but never polled: the value is ours to release.
        if let Ok(Ok(value)) = self.rx.try_recv() {
            if let Some(reclaim) = self.token.reclaim {
                tracing::debug!(op = %self.token.kind, token = %self.token.id, "unclaimed result released");
                reclaim(self.token.api.as_ref(), value);
            }
        }
    }
}

// ============================================================================
// Callback construction
// ============================================================================

macro_rules! trampoline {
    ($name:ident, $value:ty, |$token:ident $(, $arg:ident : $ty:ty)*| $body:expr) => {
        extern "C" fn $name(userdata: *mut c_void $(, $arg: $ty)*) {
            // SAFETY: `userdata` was produced by `into_userdata` for this
            // value type and this is the only callback that fires.
            let $token = unsafe { Correlation::<$value>::from_userdata(userdata) };
            let result: Result<$value> = $body;
            $token.resolve(result);
        }
    };
}

extern "C" fn on_failure<T: Send + 'static>(userdata: *mut c_void, error: *const c_char) {
    // SAFETY: see `trampoline!`.
    let token = unsafe { Correlation::<T>::from_userdata(userdata) };
    token.fail(error);
}

trampoline!(on_string, String, |token, value: *const c_char| {
    // SAFETY: the native side passes a valid string it owns.
    let copied = unsafe { copy_string(value, "result") };
    token.api.string_free(value as *mut c_char);
    copied
});

trampoline!(on_bytes, Vec<u8>, |token, bytes: OwnedBytes| {
    // SAFETY: the buffer is live until handed back below.
    let copied = unsafe { bytes.as_slice() }.to_vec();
    token.api.bytes_free(bytes);
    Ok(copied)
});

trampoline!(on_node, NodePtr, |token, handle: *mut NodeHandle| {
    NodePtr::from_raw(handle)
        .ok_or_else(|| BridgeError::ResourceCreationFailed("native returned a null node".into()))
});

trampoline!(on_complete, (), |token| {
    Ok(())
});

trampoline!(on_info, NodeInfo, |token, info: abi::NodeInfo| {
    // SAFETY: the strings are live until freed below.
    let copied = unsafe { NodeInfo::from_native(&info) };
    token.api.string_free(info.node_id as *mut c_char);
    token.api.string_free(info.relay_url as *mut c_char);
    copied
});

trampoline!(on_ticket, TicketInfo, |token, info: abi::TicketInfo| {
    // SAFETY: the strings are live until freed below.
    let copied = unsafe { TicketInfo::from_native(&info) };
    token.api.string_free(info.hash as *mut c_char);
    token.api.string_free(info.node_id as *mut c_char);
    Ok(copied)
});

trampoline!(on_author, Author, |token, secret: AuthorSecret, id: AuthorId| {
    Ok(Author::from_native(secret, id))
});

trampoline!(on_doc, (DocPtr, String), |token, handle: *mut DocHandle, namespace: *const c_char| {
    // SAFETY: the namespace string is live until freed below.
    let namespace_id = unsafe { copy_string(namespace, "namespace id") };
    token.api.string_free(namespace as *mut c_char);
    match (DocPtr::from_raw(handle), namespace_id) {
        (Some(doc), Ok(namespace_id)) => Ok((doc, namespace_id)),
        (Some(doc), Err(err)) => {
            token.api.doc_close(doc);
            Err(err)
        }
        (None, _) => Err(BridgeError::ResourceCreationFailed(
            "native returned a null document".into(),
        )),
    }
});

trampoline!(on_entry, Option<Entry>, |token, entry: *const DocEntry| {
    // SAFETY: the entry is live until freed below.
    let copied = unsafe { entry.as_ref().map(|e| Entry::from_native(e)).transpose() };
    token.api.entry_free(entry as *mut DocEntry);
    copied
});

trampoline!(on_count, u64, |token, count: u64| {
    Ok(count)
});

/// Callback structs pointing at a correlation.
impl Correlation<String> {
    pub fn string_callback(self: Arc<Self>) -> StringCallback {
        StringCallback {
            userdata: self.into_userdata(),
            on_success: on_string,
            on_failure: on_failure::<String>,
        }
    }
}

impl Correlation<Vec<u8>> {
    pub fn bytes_callback(self: Arc<Self>) -> BytesCallback {
        BytesCallback {
            userdata: self.into_userdata(),
            on_success: on_bytes,
            on_failure: on_failure::<Vec<u8>>,
        }
    }
}

impl Correlation<NodePtr> {
    pub fn node_callback(self: Arc<Self>) -> NodeCreateCallback {
        NodeCreateCallback {
            userdata: self.into_userdata(),
            on_success: on_node,
            on_failure: on_failure::<NodePtr>,
        }
    }
}

impl Correlation<()> {
    pub fn close_callback(self: Arc<Self>) -> CloseCallback {
        CloseCallback {
            userdata: self.into_userdata(),
            on_complete,
            on_failure: on_failure::<()>,
        }
    }
}

impl Correlation<NodeInfo> {
    pub fn info_callback(self: Arc<Self>) -> NodeInfoCallback {
        NodeInfoCallback {
            userdata: self.into_userdata(),
            on_success: on_info,
            on_failure: on_failure::<NodeInfo>,
        }
    }
}

impl Correlation<TicketInfo> {
    pub fn ticket_callback(self: Arc<Self>) -> TicketValidateCallback {
        TicketValidateCallback {
            userdata: self.into_userdata(),
            on_complete: on_ticket,
        }
    }
}

impl Correlation<Author> {
    pub fn author_callback(self: Arc<Self>) -> AuthorCreateCallback {
        AuthorCreateCallback {
            userdata: self.into_userdata(),
            on_success: on_author,
            on_failure: on_failure::<Author>,
        }
    }
}

impl Correlation<(DocPtr, String)> {
    pub fn doc_callback(self: Arc<Self>) -> DocCreateCallback {
        DocCreateCallback {
            userdata: self.into_userdata(),
            on_success: on_doc,
            on_failure: on_failure::<(DocPtr, String)>,
        }
    }
}

impl Correlation<Option<Entry>> {
    pub fn entry_callback(self: Arc<Self>) -> DocGetCallback {
        DocGetCallback {
            userdata: self.into_userdata(),
            on_success: on_entry,
            on_failure: on_failure::<Option<Entry>>,
        }
    }
}

impl Correlation<u64> {
    pub fn count_callback(self: Arc<Self>) -> DocDelCallback {
        DocDelCallback {
            userdata: self.into_userdata(),
            on_success: on_count,
            on_failure: on_failure::<u64>,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;

    use tether_native::MemoryEngine;

    use super::*;

    fn api() -> Arc<dyn NativeApi> {
        Arc::new(MemoryEngine::new().unwrap())
    }

    fn native_string(s: &str) -> *mut c_char {
        CString::new(s).unwrap().into_raw()
    }

    #[tokio::test]
    async fn success_resolves_the_pending_future() {
        let (token, pending) = Correlation::<u64>::new(api(), OperationKind::DocDelete);
        let callback = token.count_callback();
        (callback.on_success)(callback.userdata, 3);
        assert_eq!(pending.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failure_carries_the_operation_kind() {
        let (token, pending) = Correlation::<u64>::new(api(), OperationKind::DocDelete);
        let callback = token.count_callback();
        // Not issued by the engine, so its free is reported, not performed.
        let message = native_string("boom");
        (callback.on_failure)(callback.userdata, message);
        // SAFETY: the engine refused to free the unknown pointer.
        drop(unsafe { CString::from_raw(message) });

        match pending.await {
            Err(BridgeError::OperationFailed { kind, message }) => {
                assert_eq!(kind, OperationKind::DocDelete);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_completion_after_abandon_is_harmless() {
        let (token, pending) = Correlation::<u64>::new(api(), OperationKind::DocDelete);
        let callback = token.clone().count_callback();
        drop(pending);
        (callback.on_success)(callback.userdata, 1);
        assert!(matches!(*token.slot.lock().unwrap(), Slot::Resolved));
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_abandons_the_token() {
        let (token, pending) = Correlation::<u64>::new(api(), OperationKind::Put);
        let result = pending
            .wait(&OperationOptions::with_timeout(Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(BridgeError::Timeout(OperationKind::Put))));
        assert!(matches!(*token.slot.lock().unwrap(), Slot::Abandoned));
    }

    #[tokio::test]
    async fn cancel_abandons_the_token() {
        let (token, pending) = Correlation::<u64>::new(api(), OperationKind::Get);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = pending.wait(&OperationOptions::with_cancel(cancel)).await;
        assert!(matches!(result, Err(BridgeError::Cancelled)));
        assert!(matches!(*token.slot.lock().unwrap(), Slot::Abandoned));
    }
}
