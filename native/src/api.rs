//! The native entry points.
//!
//! [`NativeApi`] is the fixed surface a native engine exposes: one method per
//! entry point, each taking a callback struct from [`crate::abi`]. Async
//! methods return immediately and report through the callback exactly once
//! (single-shot) or as 0..n items followed by exactly one terminal callback
//! (streaming). A callback may fire on any thread, including the calling one
//! before the method returns.
//!
//! Handles passed in must be live: issued by this engine and not yet
//! released. Input strings and byte slices are only borrowed for the
//! duration of the call; implementations copy what they keep.

use std::ffi::{c_char, CStr};

use crate::abi::{
    AuthorCreateCallback, AuthorSecret, BlobFormat, BytesCallback, CloseCallback,
    DocCreateCallback, DocDelCallback, DocEntry, DocEvent, DocGetCallback, DocPtr, DocShareMode,
    EntryStreamCallback, EventStreamCallback, NodeCreateCallback, NodeInfoCallback, NodeOptions,
    NodePtr, OwnedBytes, ProgressCallback, StringCallback, SubscriptionPtr,
    TicketValidateCallback,
};

/// A callback-driven native engine.
pub trait NativeApi: Send + Sync + 'static {
    // ------------------------------------------------------------------
    // Node lifecycle
    // ------------------------------------------------------------------

    /// Create a node. Async, single-shot.
    fn node_create(&self, options: NodeOptions<'_>, callback: NodeCreateCallback);

    /// Destroy a node synchronously. The handle is invalid afterwards.
    fn node_destroy(&self, node: NodePtr);

    /// Shut a node down gracefully. Consumes the handle whatever the outcome.
    fn node_close(&self, node: NodePtr, callback: CloseCallback);

    fn node_info(&self, node: NodePtr, callback: NodeInfoCallback);

    // ------------------------------------------------------------------
    // Blobs
    // ------------------------------------------------------------------

    /// Store bytes and return a shareable blob ticket.
    fn put(&self, node: NodePtr, bytes: &[u8], callback: StringCallback);

    /// Fetch the bytes a blob ticket points at.
    fn get(&self, node: NodePtr, ticket: &CStr, callback: BytesCallback);

    /// Fetch with progress reports.
    fn get_with_progress(&self, node: NodePtr, ticket: &CStr, callback: ProgressCallback);

    /// Decode a ticket. Never fails: malformed input yields an invalid info.
    fn validate_ticket(&self, ticket: &CStr, callback: TicketValidateCallback);

    /// Mint a ticket for a blob already held by this node.
    fn blob_ticket_create(
        &self,
        node: NodePtr,
        hash: &CStr,
        format: BlobFormat,
        callback: StringCallback,
    );

    /// Pin a blob under a tag name.
    fn blob_tag_set(
        &self,
        node: NodePtr,
        tag: &CStr,
        hash: &CStr,
        format: BlobFormat,
        callback: CloseCallback,
    );

    fn blob_tag_delete(&self, node: NodePtr, tag: &CStr, callback: CloseCallback);

    // ------------------------------------------------------------------
    // Authors
    // ------------------------------------------------------------------

    fn author_create(&self, callback: AuthorCreateCallback);

    /// Register an author with a node so it can sign entries.
    fn author_import(&self, node: NodePtr, secret: AuthorSecret, callback: CloseCallback);

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    fn doc_create(&self, node: NodePtr, callback: DocCreateCallback);

    /// Join a document through a share ticket.
    fn doc_join(&self, node: NodePtr, ticket: &CStr, callback: DocCreateCallback);

    /// Write a value; reports the content hash.
    fn doc_set(
        &self,
        doc: DocPtr,
        author: AuthorSecret,
        key: &[u8],
        value: &[u8],
        callback: StringCallback,
    );

    /// Latest entry for an exact key.
    fn doc_get(&self, doc: DocPtr, key: &[u8], callback: DocGetCallback);

    /// Entries under a key prefix. Streaming.
    fn doc_get_many(&self, doc: DocPtr, prefix: &[u8], callback: EntryStreamCallback);

    /// Delete entries under a key prefix written by `author`; reports the count.
    fn doc_del(&self, doc: DocPtr, author: AuthorSecret, key: &[u8], callback: DocDelCallback);

    /// Read content bytes by hash. Served by the node, not the document.
    fn doc_read_content(&self, node: NodePtr, hash: &CStr, callback: BytesCallback);

    fn doc_share(&self, doc: DocPtr, mode: DocShareMode, callback: StringCallback);

    /// Close a document synchronously. Ends its subscriptions.
    fn doc_close(&self, doc: DocPtr);

    /// Subscribe to live events. Streaming; the returned handle must be
    /// released with exactly one of `subscription_cancel` (while live) or
    /// `subscription_free` (after the terminal callback). Returns `None`
    /// when the failure callback has already been invoked.
    fn doc_subscribe(&self, doc: DocPtr, callback: EventStreamCallback)
        -> Option<SubscriptionPtr>;

    /// Stop a live subscription and release its handle. The terminal
    /// callback still fires.
    fn subscription_cancel(&self, subscription: SubscriptionPtr);

    /// Release the handle of a subscription that has already terminated.
    fn subscription_free(&self, subscription: SubscriptionPtr);

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    /// Free a string handed out by this engine. Null is ignored.
    fn string_free(&self, s: *mut c_char);

    /// Free a byte buffer handed out by this engine. Null is ignored.
    fn bytes_free(&self, bytes: OwnedBytes);

    /// Free an entry and everything it owns. Null is ignored.
    fn entry_free(&self, entry: *mut DocEntry);

    /// Free every non-null field of an event.
    fn event_free(&self, event: DocEvent);
}
