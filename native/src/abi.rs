//! C-compatible boundary types.
//!
//! Everything a native engine hands across the boundary is described here:
//! opaque handles, owned output buffers, entry/event records and the
//! callback structs that carry a `userdata` pointer plus `extern "C"`
//! function pointers.
//!
//! # Memory Management
//!
//! - Strings, byte buffers, entries and events passed *into* a callback are
//!   owned by the native side
//! - The receiver must copy what it needs and hand the original back through
//!   the matching free call (`string_free`, `bytes_free`, `entry_free`,
//!   `event_free`) before the callback returns
//! - Handles are released with `node_destroy`/`node_close`, `doc_close`,
//!   `subscription_cancel`/`subscription_free`, exactly once
//!
//! # Threading
//!
//! Callbacks run on native worker threads, possibly before the call that
//! scheduled them has returned. `userdata` must therefore point at
//! something that is safe to touch from any thread.

use std::ffi::{c_char, c_void, CStr, CString};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};

use serde::{Deserialize, Serialize};

// ============================================================================
// Handles
// ============================================================================

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $handle:ident, $ptr:ident) => {
        $(#[$meta])*
        #[repr(C)]
        pub struct $handle {
            _private: [u8; 0],
        }

        /// Non-null pointer to a native handle.
        ///
        /// The pointer is only an address; it is never dereferenced outside
        /// the native layer that issued it.
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $ptr(NonNull<$handle>);

        // SAFETY: the pointer is an opaque token. Only the native layer that
        // produced it dereferences it, and that layer is thread-safe.
        unsafe impl Send for $ptr {}
        unsafe impl Sync for $ptr {}

        impl $ptr {
            /// Wrap a raw pointer, rejecting null.
            pub fn from_raw(raw: *mut $handle) -> Option<Self> {
                NonNull::new(raw).map(Self)
            }

            pub fn as_raw(self) -> *mut $handle {
                self.0.as_ptr()
            }

            /// Address of the handle, used as a table key.
            pub fn addr(self) -> usize {
                self.0.as_ptr() as usize
            }
        }

        impl fmt::Debug for $ptr {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($ptr), self.addr())
            }
        }
    };
}

opaque_handle!(
    /// Opaque handle to a running node.
    NodeHandle,
    NodePtr
);
opaque_handle!(
    /// Opaque handle to an open document.
    DocHandle,
    DocPtr
);
opaque_handle!(
    /// Opaque handle to a live document subscription.
    SubscriptionHandle,
    SubscriptionPtr
);

// ============================================================================
// Buffers
// ============================================================================

/// Bytes returned by the native layer (must be freed with `bytes_free`).
///
/// An empty buffer is represented by a null `data` pointer and owns nothing.
#[repr(C)]
#[derive(Debug)]
pub struct OwnedBytes {
    pub data: *mut u8,
    pub len: usize,
    pub capacity: usize,
}

impl OwnedBytes {
    /// Leak a vector across the boundary.
    pub fn from_vec(vec: Vec<u8>) -> Self {
        if vec.is_empty() {
            return Self::empty();
        }
        let mut vec = ManuallyDrop::new(vec);
        Self {
            data: vec.as_mut_ptr(),
            len: vec.len(),
            capacity: vec.capacity(),
        }
    }

    pub fn empty() -> Self {
        Self {
            data: ptr::null_mut(),
            len: 0,
            capacity: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.data.is_null()
    }

    /// View the buffer.
    ///
    /// # Safety
    /// - The buffer must come from [`OwnedBytes::from_vec`] and not have been
    ///   freed yet
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.data.is_null() {
            &[]
        } else {
            std::slice::from_raw_parts(self.data, self.len)
        }
    }

    /// Take the allocation back.
    ///
    /// # Safety
    /// - The buffer must come from [`OwnedBytes::from_vec`] and must not be
    ///   reclaimed twice
    pub unsafe fn into_vec(self) -> Vec<u8> {
        if self.data.is_null() {
            Vec::new()
        } else {
            Vec::from_raw_parts(self.data, self.len, self.capacity)
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Author secret key (32 bytes).
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuthorSecret {
    pub bytes: [u8; 32],
}

impl fmt::Debug for AuthorSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthorSecret(..)")
    }
}

/// Author public id (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AuthorId {
    pub bytes: [u8; 32],
}

/// A document entry as it crosses the boundary.
#[repr(C)]
#[derive(Debug)]
pub struct DocEntry {
    pub author_id: AuthorId,
    /// Key bytes (owned by the entry).
    pub key: OwnedBytes,
    /// Content hash as a hex string (owned by the entry).
    pub content_hash: *mut c_char,
    pub content_size: u64,
    /// Microseconds since the Unix epoch.
    pub timestamp: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocEventType {
    InsertLocal = 0,
    InsertRemote = 1,
    ContentReady = 2,
    PendingContentReady = 3,
    NeighborUp = 4,
    NeighborDown = 5,
    SyncFinished = 6,
}

/// A document event. Non-null fields are released together by `event_free`.
#[repr(C)]
#[derive(Debug)]
pub struct DocEvent {
    pub event_type: DocEventType,
    pub entry: *const DocEntry,
    pub peer_id: *const c_char,
    pub content_hash: *const c_char,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocShareMode {
    Read = 0,
    Write = 1,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlobFormat {
    /// A single blob.
    Raw = 0,
    /// A hash sequence (collection of blobs).
    HashSeq = 1,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    /// 0 if unknown.
    pub total: u64,
}

/// Node information. Non-null strings must be freed with `string_free`.
#[repr(C)]
#[derive(Debug)]
pub struct NodeInfo {
    pub node_id: *const c_char,
    pub relay_url: *const c_char,
    pub is_connected: bool,
}

/// Decoded ticket. Non-null strings must be freed with `string_free`.
#[repr(C)]
#[derive(Debug)]
pub struct TicketInfo {
    pub is_valid: bool,
    pub hash: *const c_char,
    pub node_id: *const c_char,
    pub is_recursive: bool,
}

impl TicketInfo {
    pub fn invalid() -> Self {
        Self {
            is_valid: false,
            hash: ptr::null(),
            node_id: ptr::null(),
            is_recursive: false,
        }
    }
}

/// Node creation options. Strings are borrowed for the duration of the call.
#[derive(Debug, Clone, Copy)]
pub struct NodeOptions<'a> {
    pub storage_path: &'a CStr,
    pub relay_enabled: bool,
    pub custom_relay_url: Option<&'a CStr>,
    pub docs_enabled: bool,
}

// ============================================================================
// Callbacks
// ============================================================================

pub type FailureFn = extern "C" fn(userdata: *mut c_void, error: *const c_char);

macro_rules! callback {
    ($(#[$meta:meta])* $name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        $(#[$meta])*
        #[repr(C)]
        #[derive(Clone, Copy)]
        pub struct $name {
            /// Opaque pointer passed back on every invocation.
            pub userdata: *mut c_void,
            $(pub $field: $ty,)*
        }

        // SAFETY: callbacks are invoked from native worker threads by
        // contract; whoever builds one guarantees `userdata` tolerates that.
        unsafe impl Send for $name {}
    };
}

callback!(
    /// Single-shot, string result (ticket, hash, share ticket).
    StringCallback {
        on_success: extern "C" fn(userdata: *mut c_void, result: *const c_char),
        on_failure: FailureFn,
    }
);

callback!(
    /// Single-shot, byte result.
    BytesCallback {
        on_success: extern "C" fn(userdata: *mut c_void, bytes: OwnedBytes),
        on_failure: FailureFn,
    }
);

callback!(
    /// Single-shot node creation.
    NodeCreateCallback {
        on_success: extern "C" fn(userdata: *mut c_void, handle: *mut NodeHandle),
        on_failure: FailureFn,
    }
);

callback!(
    /// Single-shot completion without a value.
    CloseCallback {
        on_complete: extern "C" fn(userdata: *mut c_void),
        on_failure: FailureFn,
    }
);

callback!(
    NodeInfoCallback {
        on_success: extern "C" fn(userdata: *mut c_void, info: NodeInfo),
        on_failure: FailureFn,
    }
);

callback!(
    /// Ticket validation. Always completes, never fails.
    TicketValidateCallback {
        on_complete: extern "C" fn(userdata: *mut c_void, info: TicketInfo),
    }
);

callback!(
    AuthorCreateCallback {
        on_success: extern "C" fn(userdata: *mut c_void, secret: AuthorSecret, id: AuthorId),
        on_failure: FailureFn,
    }
);

callback!(
    /// Document creation/join: handle plus namespace id string.
    DocCreateCallback {
        on_success: extern "C" fn(
            userdata: *mut c_void,
            handle: *mut DocHandle,
            namespace_id: *const c_char,
        ),
        on_failure: FailureFn,
    }
);

callback!(
    /// Document lookup. The entry is null when the key is absent.
    DocGetCallback {
        on_success: extern "C" fn(userdata: *mut c_void, entry: *const DocEntry),
        on_failure: FailureFn,
    }
);

callback!(
    DocDelCallback {
        on_success: extern "C" fn(userdata: *mut c_void, deleted: u64),
        on_failure: FailureFn,
    }
);

callback!(
    /// Download with 0..n progress reports, then bytes or failure.
    ProgressCallback {
        on_progress: extern "C" fn(userdata: *mut c_void, progress: DownloadProgress),
        on_success: extern "C" fn(userdata: *mut c_void, bytes: OwnedBytes),
        on_failure: FailureFn,
    }
);

callback!(
    /// Prefix query: 0..n entries, then complete or failure.
    EntryStreamCallback {
        on_entry: extern "C" fn(userdata: *mut c_void, entry: *const DocEntry),
        on_complete: extern "C" fn(userdata: *mut c_void),
        on_failure: FailureFn,
    }
);

callback!(
    /// Subscription: 0..n events, then complete or failure.
    EventStreamCallback {
        on_event: extern "C" fn(userdata: *mut c_void, event: DocEvent),
        on_complete: extern "C" fn(userdata: *mut c_void),
        on_failure: FailureFn,
    }
);

// ============================================================================
// Strings
// ============================================================================

/// Convert a Rust string to a C string pointer.
///
/// Interior null bytes are replaced so the message survives the crossing.
/// The result must be released with `string_free`.
pub fn to_c_string(s: impl Into<String>) -> *mut c_char {
    let s = s.into();
    let cs = CString::new(s).unwrap_or_else(|e| {
        let mut bytes = e.into_vec();
        bytes.retain(|b| *b != 0);
        // no interior nulls left
        CString::new(bytes).unwrap_or_default()
    });
    cs.into_raw()
}

/// Copy a C string into a Rust string.
/// Returns None if the pointer is null or not valid UTF-8.
///
/// # Safety
/// - `ptr` must be null or a valid null-terminated C string
pub unsafe fn from_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_bytes_roundtrip() {
        let owned = OwnedBytes::from_vec(b"hello".to_vec());
        assert!(!owned.is_null());
        unsafe {
            assert_eq!(owned.as_slice(), b"hello");
            assert_eq!(owned.into_vec(), b"hello".to_vec());
        }
    }

    #[test]
    fn empty_owned_bytes_are_null() {
        let owned = OwnedBytes::from_vec(Vec::new());
        assert!(owned.is_null());
        unsafe {
            assert!(owned.as_slice().is_empty());
        }
    }

    #[test]
    fn c_string_strips_interior_nulls() {
        let raw = to_c_string("bad\0message");
        unsafe {
            assert_eq!(from_c_string(raw).as_deref(), Some("badmessage"));
            drop(CString::from_raw(raw));
        }
    }

    #[test]
    fn null_pointers_are_rejected() {
        assert!(NodePtr::from_raw(ptr::null_mut()).is_none());
        unsafe {
            assert!(from_c_string(ptr::null()).is_none());
        }
    }
}
