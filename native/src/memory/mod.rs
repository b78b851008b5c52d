//! In-process reference engine.
//!
//! [`MemoryEngine`] implements [`NativeApi`] on top of its own multi-thread
//! tokio runtime, so callbacks arrive on foreign worker threads exactly like
//! they would from a real native library. Nodes created from one engine
//! share an in-process network: a node can fetch blobs another node holds
//! and join documents another node shares.
//!
//! Handles are synthetic addresses that are never reused, so a stale handle
//! is always detected. Every output handed to a callback is tracked until it
//! comes back through a free call (see [`EngineStats`]).

pub mod node;
pub mod replica;
pub mod store;
mod tracker;

use std::ffi::{c_char, c_void, CStr};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;

use crate::abi::{
    AuthorCreateCallback, AuthorSecret, BlobFormat, BytesCallback, CloseCallback,
    DocCreateCallback, DocDelCallback, DocEntry, DocEvent, DocGetCallback, DocHandle, DocPtr,
    DocShareMode, DownloadProgress, EntryStreamCallback, EventStreamCallback, FailureFn,
    NodeCreateCallback, NodeHandle, NodeInfo, NodeInfoCallback, NodeOptions, NodePtr, OwnedBytes,
    ProgressCallback, StringCallback, SubscriptionHandle, SubscriptionPtr, TicketInfo,
    TicketValidateCallback,
};
use crate::api::NativeApi;
use crate::error::{Error, Result};
use crate::ticket::{decode_id, encode_id, BlobTicket, DocTicket, Id32};

use self::node::{author_id, Node};
use self::replica::{EntryRecord, LiveEvent, Replica};
use self::tracker::{Counters, Faults, Gate, Tracker};

pub use self::tracker::{EngineStats, FaultPoint};

/// Relay assigned to nodes that enable relaying without naming one.
pub const DEFAULT_RELAY_URL: &str = "https://relay.tether.invalid";

/// Size of the steps in which downloads report progress.
const PROGRESS_CHUNK: usize = 64 * 1024;

const WORKER_THREADS: usize = 2;

/// An open document handle.
#[derive(Debug)]
struct OpenDoc {
    id: u64,
    node: Arc<Node>,
    replica: Arc<Replica>,
    mode: DocShareMode,
}

#[derive(Debug)]
struct LiveSubscription {
    cancel: Mutex<Option<oneshot::Sender<()>>>,
    terminated: AtomicBool,
}

#[derive(Debug, Clone)]
enum HandleEntry {
    Node(Arc<Node>),
    Doc(Arc<OpenDoc>),
    Subscription(Arc<LiveSubscription>),
}

#[derive(Debug, Default)]
struct Shared {
    tracker: Tracker,
    handles: DashMap<usize, HandleEntry>,
    next_handle: AtomicUsize,
    next_doc: AtomicU64,
    nodes: DashMap<Id32, Arc<Node>>,
    replicas: DashMap<Id32, Arc<Replica>>,
    gate: Gate,
    faults: Faults,
}

impl Shared {
    fn counters(&self) -> &Counters {
        &self.tracker.counters
    }

    fn enter(&self, op: &'static str) {
        tracing::trace!(op, "native call");
        Counters::bump(&self.counters().calls);
    }

    /// Wait out injected latency and held callbacks.
    async fn settle(&self) {
        if let Some(latency) = self.faults.latency() {
            tokio::time::sleep(latency).await;
        }
        self.gate.passed().await;
    }

    fn issue(&self, entry: HandleEntry) -> usize {
        // Word-aligned and never zero.
        let addr = (self.next_handle.fetch_add(1, Ordering::Relaxed) + 1) * 8;
        self.handles.insert(addr, entry);
        addr
    }

    fn lookup(&self, addr: usize) -> Option<HandleEntry> {
        self.handles.get(&addr).map(|e| e.value().clone())
    }

    fn node(&self, ptr: NodePtr) -> Result<Arc<Node>> {
        match self.lookup(ptr.addr()) {
            Some(HandleEntry::Node(node)) => Ok(node),
            _ => {
                self.counters().violation("stale node handle");
                Err(Error::InvalidHandle("node"))
            }
        }
    }

    fn doc(&self, ptr: DocPtr) -> Result<Arc<OpenDoc>> {
        match self.lookup(ptr.addr()) {
            Some(HandleEntry::Doc(doc)) => Ok(doc),
            _ => {
                self.counters().violation("stale document handle");
                Err(Error::InvalidHandle("document"))
            }
        }
    }

    /// Remove a handle of the expected kind from the table.
    fn release(&self, addr: usize, kind: &'static str) -> Option<HandleEntry> {
        let expected = |entry: &HandleEntry| {
            matches!(
                (kind, entry),
                ("node", HandleEntry::Node(_))
                    | ("document", HandleEntry::Doc(_))
                    | ("subscription", HandleEntry::Subscription(_))
            )
        };
        match self.handles.remove_if(&addr, |_, entry| expected(entry)) {
            Some((_, entry)) => Some(entry),
            None => {
                tracing::warn!(kind, addr, "release of unknown handle");
                self.counters().violation("stale handle released");
                None
            }
        }
    }

    fn fail(&self, userdata: *mut c_void, on_failure: FailureFn, err: &Error) {
        tracing::debug!(error = %err, "native operation failed");
        on_failure(userdata, self.tracker.string(err.to_string()));
    }

    /// Take a node off the network. Its subscriptions end.
    fn shut_down(&self, node: &Node) {
        if !node.shut_down() {
            return;
        }
        self.nodes.remove(&node.id);
        let replicas: Vec<Arc<Replica>> = self.replicas.iter().map(|r| r.value().clone()).collect();
        for replica in replicas {
            replica.leave(&node.id);
        }
        tracing::info!(node = %node.id_hex(), "node shut down");
    }

    fn fetch(&self, node: &Node, ticket: &str) -> Result<Vec<u8>> {
        node.ensure_running()?;
        let ticket: BlobTicket = ticket.parse()?;
        if let Some(content) = node.blobs.get(&ticket.hash) {
            return Ok(content.to_vec());
        }
        let provider = self
            .nodes
            .get(&ticket.node_id)
            .map(|n| n.value().clone())
            .filter(|n| n.is_running())
            .ok_or_else(|| Error::ProviderUnreachable(encode_id(&ticket.node_id)))?;
        let content = provider
            .blobs
            .get(&ticket.hash)
            .ok_or_else(|| Error::BlobNotFound(encode_id(&ticket.hash)))?;
        node.blobs.insert(ticket.hash, content.clone());
        Ok(content.to_vec())
    }

    fn open_doc(&self, node: Arc<Node>, replica: Arc<Replica>, mode: DocShareMode) -> Arc<OpenDoc> {
        Arc::new(OpenDoc {
            id: self.next_doc.fetch_add(1, Ordering::Relaxed) + 1,
            node,
            replica,
            mode,
        })
    }

    fn join(&self, node: Arc<Node>, ticket: &str) -> Result<Arc<OpenDoc>> {
        node.ensure_docs()?;
        let ticket: DocTicket = ticket.parse()?;
        let replica = self
            .replicas
            .get(&ticket.namespace)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::DocumentNotFound(encode_id(&ticket.namespace)))?;
        if ticket.node_id != node.id {
            let provider = self
                .nodes
                .get(&ticket.node_id)
                .map(|n| n.value().clone())
                .filter(|n| n.is_running())
                .ok_or_else(|| Error::ProviderUnreachable(encode_id(&ticket.node_id)))?;
            replica.join(&node, &provider);
        }
        Ok(self.open_doc(node, replica, ticket.mode))
    }

    fn deliver_entry(&self, callback: &EntryStreamCallback, record: &EntryRecord) {
        let entry = self.tracker.entry(record);
        (callback.on_entry)(callback.userdata, entry);
    }

    fn deliver_event(&self, callback: &EventStreamCallback, event: &LiveEvent) {
        let event = self.tracker.event(event);
        (callback.on_event)(callback.userdata, event);
    }

    fn report_progress(&self, callback: &ProgressCallback, progress: DownloadProgress) {
        (callback.on_progress)(callback.userdata, progress);
    }
}

/// Completion of a single-shot callback.
///
/// Callbacks are always handed over whole so that spawned tasks never
/// capture a bare `userdata` pointer.
trait Reply: Copy {
    type Value;

    fn succeed(self, shared: &Shared, value: Self::Value);

    fn fail(self, shared: &Shared, err: &Error);

    fn reply(self, shared: &Shared, result: Result<Self::Value>) {
        match result {
            Ok(value) => self.succeed(shared, value),
            Err(err) => self.fail(shared, &err),
        }
    }
}

macro_rules! forward_failure {
    () => {
        fn fail(self, shared: &Shared, err: &Error) {
            shared.fail(self.userdata, self.on_failure, err);
        }
    };
}

impl Reply for StringCallback {
    type Value = String;

    fn succeed(self, shared: &Shared, value: String) {
        (self.on_success)(self.userdata, shared.tracker.string(value));
    }

    forward_failure!();
}

impl Reply for BytesCallback {
    type Value = Vec<u8>;

    fn succeed(self, shared: &Shared, value: Vec<u8>) {
        (self.on_success)(self.userdata, shared.tracker.bytes(value));
    }

    forward_failure!();
}

impl Reply for CloseCallback {
    type Value = ();

    fn succeed(self, _shared: &Shared, _value: ()) {
        (self.on_complete)(self.userdata);
    }

    forward_failure!();
}

impl Reply for NodeCreateCallback {
    type Value = Arc<Node>;

    fn succeed(self, shared: &Shared, node: Arc<Node>) {
        let addr = shared.issue(HandleEntry::Node(node.clone()));
        tracing::info!(node = %node.id_hex(), addr, "node created");
        (self.on_success)(self.userdata, addr as *mut NodeHandle);
    }

    forward_failure!();
}

impl Reply for NodeInfoCallback {
    type Value = Arc<Node>;

    fn succeed(self, shared: &Shared, node: Arc<Node>) {
        let info = NodeInfo {
            node_id: shared.tracker.string(node.id_hex()),
            relay_url: match &node.relay_url {
                Some(url) => shared.tracker.string(url.as_str()),
                None => std::ptr::null_mut(),
            },
            is_connected: node.is_running(),
        };
        (self.on_success)(self.userdata, info);
    }

    forward_failure!();
}

impl Reply for AuthorCreateCallback {
    type Value = AuthorSecret;

    fn succeed(self, _shared: &Shared, secret: AuthorSecret) {
        (self.on_success)(self.userdata, secret, author_id(&secret));
    }

    forward_failure!();
}

impl Reply for DocCreateCallback {
    type Value = Arc<OpenDoc>;

    fn succeed(self, shared: &Shared, doc: Arc<OpenDoc>) {
        let namespace = shared.tracker.string(encode_id(&doc.replica.namespace));
        let addr = shared.issue(HandleEntry::Doc(doc));
        (self.on_success)(self.userdata, addr as *mut DocHandle, namespace);
    }

    forward_failure!();
}

impl Reply for DocGetCallback {
    type Value = Option<EntryRecord>;

    fn succeed(self, shared: &Shared, record: Option<EntryRecord>) {
        let entry = match record {
            Some(record) => shared.tracker.entry(&record),
            None => std::ptr::null_mut(),
        };
        (self.on_success)(self.userdata, entry);
    }

    forward_failure!();
}

impl Reply for DocDelCallback {
    type Value = u64;

    fn succeed(self, _shared: &Shared, deleted: u64) {
        (self.on_success)(self.userdata, deleted);
    }

    forward_failure!();
}

impl Reply for ProgressCallback {
    type Value = Vec<u8>;

    fn succeed(self, shared: &Shared, value: Vec<u8>) {
        (self.on_success)(self.userdata, shared.tracker.bytes(value));
    }

    forward_failure!();
}

impl Reply for EntryStreamCallback {
    type Value = ();

    fn succeed(self, _shared: &Shared, _value: ()) {
        (self.on_complete)(self.userdata);
    }

    forward_failure!();
}

impl Reply for EventStreamCallback {
    type Value = ();

    fn succeed(self, _shared: &Shared, _value: ()) {
        (self.on_complete)(self.userdata);
    }

    forward_failure!();
}

fn text(s: &CStr) -> String {
    s.to_string_lossy().into_owned()
}

fn check_writable(doc: &OpenDoc) -> Result<()> {
    match doc.mode {
        DocShareMode::Write => Ok(()),
        DocShareMode::Read => Err(Error::ReadOnly),
    }
}

/// The in-process engine.
///
/// # Example
///
/// ```
/// use tether_native::memory::MemoryEngine;
///
/// let engine = MemoryEngine::new().unwrap();
/// assert_eq!(engine.stats().live_handles, 0);
/// ```
#[derive(Debug)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
    handle: Handle,
    runtime: Option<Runtime>,
}

impl MemoryEngine {
    /// Start the engine and its worker threads.
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("tether-native")
            .enable_all()
            .build()
            .map_err(|e| Error::Runtime(e.to_string()))?;
        Ok(Self {
            shared: Arc::new(Shared::default()),
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    pub fn stats(&self) -> EngineStats {
        let counters = self.shared.counters();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStats {
            calls: load(&counters.calls),
            live_allocations: self.shared.tracker.live_allocations(),
            live_handles: self.shared.handles.len(),
            node_destroys: load(&counters.node_destroys),
            node_closes: load(&counters.node_closes),
            doc_closes: load(&counters.doc_closes),
            subscription_cancels: load(&counters.subscription_cancels),
            subscription_frees: load(&counters.subscription_frees),
            violations: load(&counters.violations),
        }
    }

    /// Hold back every callback until [`release_callbacks`](Self::release_callbacks).
    ///
    /// Work already waiting and work started while held completes in one
    /// burst on release.
    pub fn hold_callbacks(&self) {
        self.shared.gate.set_open(false);
    }

    pub fn release_callbacks(&self) {
        self.shared.gate.set_open(true);
    }

    /// Make the next `times` operations of one kind fail.
    pub fn inject_failures(&self, point: FaultPoint, times: u32) {
        self.shared.faults.inject(point, times);
    }

    /// End every live subscription from the native side, the way a lost
    /// connection would. Each one still reports its terminal callback.
    pub fn end_subscriptions(&self) {
        for replica in self.shared.replicas.iter() {
            replica.value().end_subscriptions();
        }
    }

    /// Delay every callback. `Duration::ZERO` turns the delay off.
    pub fn set_latency(&self, latency: Duration) {
        self.shared.faults.set_latency(latency);
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(task);
    }
}

impl Drop for MemoryEngine {
    fn drop(&mut self) {
        // Pending callbacks are dropped, not delivered.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl NativeApi for MemoryEngine {
    fn node_create(&self, options: NodeOptions<'_>, callback: NodeCreateCallback) {
        self.shared.enter("node_create");
        let storage_path = text(options.storage_path);
        let relay_url = match (options.relay_enabled, options.custom_relay_url) {
            (false, _) => None,
            (true, Some(url)) => Some(text(url)),
            (true, None) => Some(DEFAULT_RELAY_URL.to_string()),
        };
        let docs_enabled = options.docs_enabled;

        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = shared.faults.trip(FaultPoint::Create).and_then(|()| {
                if storage_path.trim().is_empty() {
                    return Err(Error::InvalidConfig("storage path is empty".into()));
                }
                let node = Arc::new(Node::new(relay_url, docs_enabled));
                shared.nodes.insert(node.id, node.clone());
                Ok(node)
            });
            callback.reply(&shared, result);
        });
    }

    fn node_destroy(&self, node: NodePtr) {
        self.shared.enter("node_destroy");
        if let Some(HandleEntry::Node(node)) = self.shared.release(node.addr(), "node") {
            Counters::bump(&self.shared.counters().node_destroys);
            self.shared.shut_down(&node);
        }
    }

    fn node_close(&self, node: NodePtr, callback: CloseCallback) {
        self.shared.enter("node_close");
        let Some(HandleEntry::Node(node)) = self.shared.release(node.addr(), "node") else {
            return callback.fail(&self.shared, &Error::InvalidHandle("node"));
        };
        Counters::bump(&self.shared.counters().node_closes);

        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            shared.shut_down(&node);
            let result = shared.faults.trip(FaultPoint::Close);
            callback.reply(&shared, result);
        });
    }

    fn node_info(&self, node: NodePtr, callback: NodeInfoCallback) {
        self.shared.enter("node_info");
        let node = match self.shared.node(node) {
            Ok(node) => node,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            callback.reply(&shared, Ok(node));
        });
    }

    fn put(&self, node: NodePtr, bytes: &[u8], callback: StringCallback) {
        self.shared.enter("put");
        let node = match self.shared.node(node) {
            Ok(node) => node,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let bytes = bytes.to_vec();
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = shared.faults.trip(FaultPoint::Put).and_then(|()| {
                node.ensure_running()?;
                let hash = node.blobs.add(bytes);
                Ok(BlobTicket::new(node.id, hash, BlobFormat::Raw).to_string())
            });
            callback.reply(&shared, result);
        });
    }

    fn get(&self, node: NodePtr, ticket: &CStr, callback: BytesCallback) {
        self.shared.enter("get");
        let node = match self.shared.node(node) {
            Ok(node) => node,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let ticket = text(ticket);
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = shared
                .faults
                .trip(FaultPoint::Get)
                .and_then(|()| shared.fetch(&node, &ticket));
            callback.reply(&shared, result);
        });
    }

    fn get_with_progress(&self, node: NodePtr, ticket: &CStr, callback: ProgressCallback) {
        self.shared.enter("get_with_progress");
        let node = match self.shared.node(node) {
            Ok(node) => node,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let ticket = text(ticket);
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = shared
                .faults
                .trip(FaultPoint::Get)
                .and_then(|()| shared.fetch(&node, &ticket));
            if let Ok(content) = &result {
                let total = content.len() as u64;
                for chunk_end in (PROGRESS_CHUNK..content.len())
                    .step_by(PROGRESS_CHUNK)
                    .chain(std::iter::once(content.len()))
                {
                    let progress = DownloadProgress {
                        downloaded: chunk_end as u64,
                        total,
                    };
                    shared.report_progress(&callback, progress);
                }
            }
            callback.reply(&shared, result);
        });
    }

    fn validate_ticket(&self, ticket: &CStr, callback: TicketValidateCallback) {
        self.shared.enter("validate_ticket");
        let ticket = text(ticket);
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let info = match ticket.parse::<BlobTicket>() {
                Ok(parsed) => TicketInfo {
                    is_valid: true,
                    hash: shared.tracker.string(encode_id(&parsed.hash)),
                    node_id: shared.tracker.string(encode_id(&parsed.node_id)),
                    is_recursive: parsed.recursive(),
                },
                Err(err) => {
                    tracing::debug!(error = %err, "ticket rejected");
                    TicketInfo::invalid()
                }
            };
            complete_validation(callback, info);
        });
    }

    fn blob_ticket_create(
        &self,
        node: NodePtr,
        hash: &CStr,
        format: BlobFormat,
        callback: StringCallback,
    ) {
        self.shared.enter("blob_ticket_create");
        let node = match self.shared.node(node) {
            Ok(node) => node,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let hash = text(hash);
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = node.ensure_running().and_then(|()| {
                let hash = decode_id(&hash)?;
                if !node.blobs.contains(&hash) {
                    return Err(Error::BlobNotFound(encode_id(&hash)));
                }
                Ok(BlobTicket::new(node.id, hash, format).to_string())
            });
            callback.reply(&shared, result);
        });
    }

    fn blob_tag_set(
        &self,
        node: NodePtr,
        tag: &CStr,
        hash: &CStr,
        format: BlobFormat,
        callback: CloseCallback,
    ) {
        self.shared.enter("blob_tag_set");
        let node = match self.shared.node(node) {
            Ok(node) => node,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let (tag, hash) = (text(tag), text(hash));
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = node
                .ensure_running()
                .and_then(|()| node.blobs.set_tag(&tag, decode_id(&hash)?, format));
            callback.reply(&shared, result);
        });
    }

    fn blob_tag_delete(&self, node: NodePtr, tag: &CStr, callback: CloseCallback) {
        self.shared.enter("blob_tag_delete");
        let node = match self.shared.node(node) {
            Ok(node) => node,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let tag = text(tag);
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = node.ensure_running().and_then(|()| {
                if node.blobs.delete_tag(&tag) {
                    Ok(())
                } else {
                    Err(Error::TagNotFound(tag))
                }
            });
            callback.reply(&shared, result);
        });
    }

    fn author_create(&self, callback: AuthorCreateCallback) {
        self.shared.enter("author_create");
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let secret = AuthorSecret {
                bytes: rand::random(),
            };
            callback.reply(&shared, Ok(secret));
        });
    }

    fn author_import(&self, node: NodePtr, secret: AuthorSecret, callback: CloseCallback) {
        self.shared.enter("author_import");
        let node = match self.shared.node(node) {
            Ok(node) => node,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = node.ensure_running().map(|()| {
                node.import_author(&secret);
            });
            callback.reply(&shared, result);
        });
    }

    fn doc_create(&self, node: NodePtr, callback: DocCreateCallback) {
        self.shared.enter("doc_create");
        let node = match self.shared.node(node) {
            Ok(node) => node,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = shared
                .faults
                .trip(FaultPoint::DocCreate)
                .and_then(|()| node.ensure_docs())
                .map(|()| {
                    let namespace: Id32 = rand::random();
                    let replica = Arc::new(Replica::new(namespace, &node));
                    shared.replicas.insert(namespace, replica.clone());
                    shared.open_doc(node, replica, DocShareMode::Write)
                });
            callback.reply(&shared, result);
        });
    }

    fn doc_join(&self, node: NodePtr, ticket: &CStr, callback: DocCreateCallback) {
        self.shared.enter("doc_join");
        let node = match self.shared.node(node) {
            Ok(node) => node,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let ticket = text(ticket);
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = shared.join(node, &ticket);
            callback.reply(&shared, result);
        });
    }

    fn doc_set(
        &self,
        doc: DocPtr,
        author: AuthorSecret,
        key: &[u8],
        value: &[u8],
        callback: StringCallback,
    ) {
        self.shared.enter("doc_set");
        let doc = match self.shared.doc(doc) {
            Ok(doc) => doc,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let (key, value) = (key.to_vec(), value.to_vec());
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = shared.faults.trip(FaultPoint::DocSet).and_then(|()| {
                doc.node.ensure_docs()?;
                check_writable(&doc)?;
                let author = doc.node.signing_author(&author)?;
                let record = doc.replica.insert(&doc.node, author, key, value);
                Ok(encode_id(&record.hash))
            });
            callback.reply(&shared, result);
        });
    }

    fn doc_get(&self, doc: DocPtr, key: &[u8], callback: DocGetCallback) {
        self.shared.enter("doc_get");
        let doc = match self.shared.doc(doc) {
            Ok(doc) => doc,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let key = key.to_vec();
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = shared
                .faults
                .trip(FaultPoint::DocGet)
                .and_then(|()| doc.node.ensure_docs())
                .map(|()| doc.replica.get(&key));
            callback.reply(&shared, result);
        });
    }

    fn doc_get_many(&self, doc: DocPtr, prefix: &[u8], callback: EntryStreamCallback) {
        self.shared.enter("doc_get_many");
        let doc = match self.shared.doc(doc) {
            Ok(doc) => doc,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let prefix = prefix.to_vec();
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = shared
                .faults
                .trip(FaultPoint::DocGet)
                .and_then(|()| doc.node.ensure_docs());
            if result.is_ok() {
                for record in doc.replica.get_many(&prefix) {
                    shared.deliver_entry(&callback, &record);
                }
            }
            callback.reply(&shared, result);
        });
    }

    fn doc_del(&self, doc: DocPtr, author: AuthorSecret, key: &[u8], callback: DocDelCallback) {
        self.shared.enter("doc_del");
        let doc = match self.shared.doc(doc) {
            Ok(doc) => doc,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let prefix = key.to_vec();
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = doc.node.ensure_docs().and_then(|()| {
                check_writable(&doc)?;
                let author = doc.node.signing_author(&author)?;
                Ok(doc.replica.delete(author, &prefix))
            });
            callback.reply(&shared, result);
        });
    }

    fn doc_read_content(&self, node: NodePtr, hash: &CStr, callback: BytesCallback) {
        self.shared.enter("doc_read_content");
        let node = match self.shared.node(node) {
            Ok(node) => node,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let hash = text(hash);
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = node.ensure_running().and_then(|()| {
                let hash = decode_id(&hash)?;
                node.blobs
                    .get(&hash)
                    .map(|content| content.to_vec())
                    .ok_or_else(|| Error::BlobNotFound(encode_id(&hash)))
            });
            callback.reply(&shared, result);
        });
    }

    fn doc_share(&self, doc: DocPtr, mode: DocShareMode, callback: StringCallback) {
        self.shared.enter("doc_share");
        let doc = match self.shared.doc(doc) {
            Ok(doc) => doc,
            Err(e) => return callback.fail(&self.shared, &e),
        };
        let shared = self.shared.clone();
        self.spawn(async move {
            shared.settle().await;
            let result = doc.node.ensure_docs().and_then(|()| {
                if mode == DocShareMode::Write {
                    check_writable(&doc)?;
                }
                let ticket = DocTicket {
                    namespace: doc.replica.namespace,
                    node_id: doc.node.id,
                    mode,
                };
                Ok(ticket.to_string())
            });
            callback.reply(&shared, result);
        });
    }

    fn doc_close(&self, doc: DocPtr) {
        self.shared.enter("doc_close");
        if let Some(HandleEntry::Doc(doc)) = self.shared.release(doc.addr(), "document") {
            Counters::bump(&self.shared.counters().doc_closes);
            doc.replica.close_doc(doc.id);
        }
    }

    fn doc_subscribe(
        &self,
        doc: DocPtr,
        callback: EventStreamCallback,
    ) -> Option<SubscriptionPtr> {
        self.shared.enter("doc_subscribe");
        let doc = match self
            .shared
            .doc(doc)
            .and_then(|doc| doc.node.ensure_docs().map(|()| doc))
            .and_then(|doc| self.shared.faults.trip(FaultPoint::Subscribe).map(|()| doc))
        {
            Ok(doc) => doc,
            Err(e) => {
                callback.fail(&self.shared, &e);
                return None;
            }
        };

        let (subscriber, mut events) = doc.replica.subscribe(doc.node.id, doc.id);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let live = Arc::new(LiveSubscription {
            cancel: Mutex::new(Some(cancel_tx)),
            terminated: AtomicBool::new(false),
        });
        let addr = self.shared.issue(HandleEntry::Subscription(live.clone()));

        let shared = self.shared.clone();
        self.spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            shared.settle().await;
                            shared.deliver_event(&callback, &event);
                        }
                        None => break,
                    },
                }
            }
            doc.replica.unsubscribe(subscriber);
            shared.settle().await;
            live.terminated.store(true, Ordering::Release);
            callback.reply(&shared, Ok(()));
        });

        SubscriptionPtr::from_raw(addr as *mut SubscriptionHandle)
    }

    fn subscription_cancel(&self, subscription: SubscriptionPtr) {
        self.shared.enter("subscription_cancel");
        if let Some(HandleEntry::Subscription(live)) =
            self.shared.release(subscription.addr(), "subscription")
        {
            Counters::bump(&self.shared.counters().subscription_cancels);
            let cancel = live
                .cancel
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(cancel) = cancel {
                let _ = cancel.send(());
            }
        }
    }

    fn subscription_free(&self, subscription: SubscriptionPtr) {
        self.shared.enter("subscription_free");
        if let Some(HandleEntry::Subscription(live)) =
            self.shared.release(subscription.addr(), "subscription")
        {
            Counters::bump(&self.shared.counters().subscription_frees);
            if !live.terminated.load(Ordering::Acquire) {
                self.shared.counters().violation("free of a live subscription");
            }
        }
    }

    fn string_free(&self, s: *mut c_char) {
        self.shared.tracker.free_string(s);
    }

    fn bytes_free(&self, bytes: OwnedBytes) {
        self.shared.tracker.free_bytes(bytes);
    }

    fn entry_free(&self, entry: *mut DocEntry) {
        self.shared.tracker.free_entry(entry);
    }

    fn event_free(&self, event: DocEvent) {
        self.shared.tracker.free_event(event);
    }
}

fn complete_validation(callback: TicketValidateCallback, info: TicketInfo) {
    (callback.on_complete)(callback.userdata, info);
}
