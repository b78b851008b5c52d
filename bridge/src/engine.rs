//! The engine wrapper.
//!
//! An [`Engine`] owns one native node. Data operations only hold the slot's
//! read lock for the instant of dispatch, so they run concurrently; close
//! is serialized by a per-engine async mutex and releases every open
//! document before the node itself.

use std::ffi::CString;
use std::sync::Arc;

use futures::StreamExt;
use tether_native::{BlobFormat, DocPtr, NativeApi, NodeOptions, NodePtr};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::completion::{Correlation, OperationOptions};
use crate::config::{BridgeConfig, EngineConfig};
use crate::document::Document;
use crate::error::{BridgeError, HandleKind, OperationKind, Result};
use crate::registry::{HandleRegistry, HandleSlot};
use crate::retry::retry;
use crate::stream::{BridgeStream, StreamCore};
use crate::ticket::BlobTicket;
use crate::types::{c_string, Author, DownloadProgress, NodeInfo};

fn destroy_node(api: &dyn NativeApi, node: NodePtr) {
    tracing::debug!(?node, "destroying node nobody claimed");
    api.node_destroy(node);
}

fn close_doc(api: &dyn NativeApi, doc: (DocPtr, String)) {
    tracing::debug!(doc = ?doc.0, "closing document nobody claimed");
    api.doc_close(doc.0);
}

/// State shared with the engine's documents.
pub(crate) struct EngineInner {
    pub(crate) id: Uuid,
    pub(crate) api: Arc<dyn NativeApi>,
    pub(crate) config: Arc<BridgeConfig>,
    pub(crate) slot: HandleSlot<NodePtr>,
    lifecycle: tokio::sync::Mutex<()>,
    pub(crate) documents: HandleRegistry,
}

impl EngineInner {
    pub(crate) fn options(&self, options: &OperationOptions) -> OperationOptions {
        options.or_timeout(self.config.operation_timeout)
    }

    /// Release documents, then take the node pointer. None if already closed.
    fn shut_down(&self) -> Option<NodePtr> {
        let node = self.slot.take()?;
        let released = self.documents.release_all();
        tracing::info!(engine = %self.id, documents = released, "engine closing");
        Some(node)
    }

    pub(crate) async fn read_content(
        &self,
        hash: &str,
        options: &OperationOptions,
    ) -> Result<Vec<u8>> {
        let hash = c_string(hash, "hash")?;
        let (token, pending) = Correlation::new(self.api.clone(), OperationKind::ReadContent);
        self.slot.with_open(|node| {
            self.api
                .doc_read_content(node, &hash, token.bytes_callback())
        })?;
        pending.wait(&self.options(options)).await
    }
}

/// A running native node.
///
/// Not `Clone`: the engine has exactly one owner, and dropping it destroys
/// the node (after its documents) unless [`close`](Engine::close) already
/// did.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub(crate) async fn create(
        api: Arc<dyn NativeApi>,
        config: Arc<BridgeConfig>,
        engine_config: &EngineConfig,
    ) -> Result<Self> {
        engine_config.validate()?;
        let storage_path = engine_config
            .storage_path
            .to_str()
            .ok_or_else(|| BridgeError::InvalidConfiguration("storage path is not UTF-8".into()))
            .and_then(|path| c_string(path, "storage path"))?;
        let relay_url = engine_config
            .custom_relay_url
            .as_deref()
            .map(|url| c_string(url, "relay url"))
            .transpose()?;
        let options = NodeOptions {
            storage_path: &storage_path,
            relay_enabled: engine_config.relay_enabled,
            custom_relay_url: relay_url.as_deref(),
            docs_enabled: engine_config.docs_enabled,
        };

        let (token, pending) =
            Correlation::reclaiming(api.clone(), OperationKind::Create, destroy_node);
        api.node_create(options, token.node_callback());
        let node = pending
            .wait(&OperationOptions::default().or_timeout(config.operation_timeout))
            .await?;

        let inner = Arc::new(EngineInner {
            id: Uuid::new_v4(),
            api,
            config,
            slot: HandleSlot::new(HandleKind::Engine, node),
            lifecycle: tokio::sync::Mutex::new(()),
            documents: HandleRegistry::new(),
        });
        tracing::info!(engine = %inner.id, ?node, "engine created");
        Ok(Self { inner })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.slot.is_open()
    }

    /// Documents opened through this engine and not yet closed.
    pub fn live_documents(&self) -> usize {
        self.inner.documents.live_count()
    }

    pub async fn info(&self) -> Result<NodeInfo> {
        let (token, pending) = Correlation::new(self.inner.api.clone(), OperationKind::Info);
        self.inner
            .slot
            .with_open(|node| self.inner.api.node_info(node, token.info_callback()))?;
        pending.wait(&self.inner.options(&OperationOptions::default())).await
    }

    // ------------------------------------------------------------------
    // Blobs
    // ------------------------------------------------------------------

    /// Store `bytes` and return a ticket others can fetch them with.
    pub async fn put(&self, bytes: &[u8]) -> Result<BlobTicket> {
        self.put_with_options(bytes, &OperationOptions::default())
            .await
    }

    pub async fn put_with_options(
        &self,
        bytes: &[u8],
        options: &OperationOptions,
    ) -> Result<BlobTicket> {
        let (token, pending) = Correlation::new(self.inner.api.clone(), OperationKind::Put);
        self.inner
            .slot
            .with_open(|node| self.inner.api.put(node, bytes, token.string_callback()))?;
        let ticket = pending.wait(&self.inner.options(options)).await?;
        BlobTicket::parse(ticket)
    }

    /// Fetch the bytes a ticket points at.
    pub async fn get(&self, ticket: impl AsRef<str>) -> Result<Vec<u8>> {
        self.get_with_options(ticket, &OperationOptions::default())
            .await
    }

    pub async fn get_with_options(
        &self,
        ticket: impl AsRef<str>,
        options: &OperationOptions,
    ) -> Result<Vec<u8>> {
        let ticket = c_string(ticket.as_ref(), "ticket")?;
        let (token, pending) = Correlation::new(self.inner.api.clone(), OperationKind::Get);
        self.inner
            .slot
            .with_open(|node| self.inner.api.get(node, &ticket, token.bytes_callback()))?;
        pending.wait(&self.inner.options(options)).await
    }

    /// [`put`](Self::put) under the configured retry policy.
    pub async fn put_with_retry(&self, bytes: &[u8], cancel: &CancelToken) -> Result<BlobTicket> {
        let options = OperationOptions {
            timeout: None,
            cancel: Some(cancel.clone()),
        };
        let options = &options;
        retry(&self.inner.config.retry, cancel, move || {
            self.put_with_options(bytes, options)
        })
        .await
    }

    /// [`get`](Self::get) under the configured retry policy.
    pub async fn get_with_retry(&self, ticket: &str, cancel: &CancelToken) -> Result<Vec<u8>> {
        let options = OperationOptions {
            timeout: None,
            cancel: Some(cancel.clone()),
        };
        let options = &options;
        retry(&self.inner.config.retry, cancel, move || {
            self.get_with_options(ticket, options)
        })
        .await
    }

    /// Start a download that reports progress before its bytes.
    ///
    /// [`BridgeStream::finish`] returns the content.
    pub fn download(&self, ticket: &str) -> Result<BridgeStream<DownloadProgress, Vec<u8>>> {
        let ticket = c_string(ticket, "ticket")?;
        let core = StreamCore::new(
            self.inner.api.clone(),
            OperationKind::GetWithProgress,
            self.inner.config.stream_buffer,
        );
        let stream = BridgeStream::new(core.clone());
        self.inner.slot.with_open(|node| {
            self.inner
                .api
                .get_with_progress(node, &ticket, core.progress_callback())
        })?;
        Ok(stream)
    }

    /// Fetch with progress, feeding every report to `sink`.
    pub async fn get_with_progress(
        &self,
        ticket: &str,
        mut sink: impl FnMut(DownloadProgress),
    ) -> Result<Vec<u8>> {
        let mut stream = self.download(ticket)?;
        while let Some(progress) = stream.next().await {
            sink(progress?);
        }
        stream.finish().await
    }

    /// Mint a ticket for a blob this node holds.
    pub async fn create_ticket(&self, hash: &str, format: BlobFormat) -> Result<BlobTicket> {
        let hash = c_string(hash, "hash")?;
        let (token, pending) =
            Correlation::new(self.inner.api.clone(), OperationKind::CreateTicket);
        self.inner.slot.with_open(|node| {
            self.inner
                .api
                .blob_ticket_create(node, &hash, format, token.string_callback())
        })?;
        let ticket = pending.wait(&self.inner.options(&OperationOptions::default())).await?;
        BlobTicket::parse(ticket)
    }

    /// Pin a blob under `tag`.
    pub async fn tag_set(&self, tag: &str, hash: &str, format: BlobFormat) -> Result<()> {
        let tag = c_string(tag, "tag")?;
        let hash = c_string(hash, "hash")?;
        let (token, pending) = Correlation::new(self.inner.api.clone(), OperationKind::TagSet);
        self.inner.slot.with_open(|node| {
            self.inner
                .api
                .blob_tag_set(node, &tag, &hash, format, token.close_callback())
        })?;
        pending.wait(&self.inner.options(&OperationOptions::default())).await
    }

    pub async fn tag_delete(&self, tag: &str) -> Result<()> {
        let tag = c_string(tag, "tag")?;
        let (token, pending) = Correlation::new(self.inner.api.clone(), OperationKind::TagDelete);
        self.inner.slot.with_open(|node| {
            self.inner
                .api
                .blob_tag_delete(node, &tag, token.close_callback())
        })?;
        pending.wait(&self.inner.options(&OperationOptions::default())).await
    }

    /// Read content by hash, as referenced by document entries.
    pub async fn read_content(&self, hash: &str) -> Result<Vec<u8>> {
        self.inner
            .read_content(hash, &OperationOptions::default())
            .await
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    /// Let `author` sign entries written through this node.
    pub async fn import_author(&self, author: &Author) -> Result<()> {
        let (token, pending) =
            Correlation::new(self.inner.api.clone(), OperationKind::ImportAuthor);
        self.inner.slot.with_open(|node| {
            self.inner
                .api
                .author_import(node, author.secret(), token.close_callback())
        })?;
        pending.wait(&self.inner.options(&OperationOptions::default())).await
    }

    pub async fn create_doc(&self) -> Result<Document> {
        self.open_doc(OperationKind::CreateDoc, None).await
    }

    /// Join a document shared with [`Document::share`].
    pub async fn join_doc(&self, ticket: &str) -> Result<Document> {
        let ticket = c_string(ticket, "ticket")?;
        self.open_doc(OperationKind::JoinDoc, Some(ticket)).await
    }

    async fn open_doc(&self, kind: OperationKind, ticket: Option<CString>) -> Result<Document> {
        let api = &self.inner.api;
        let (token, pending) = Correlation::reclaiming(api.clone(), kind, close_doc);
        self.inner.slot.with_open(|node| match &ticket {
            Some(ticket) => api.doc_join(node, ticket, token.doc_callback()),
            None => api.doc_create(node, token.doc_callback()),
        })?;
        let (doc, namespace_id) = pending
            .wait(&self.inner.options(&OperationOptions::default()))
            .await?;
        Document::attach(&self.inner, doc, namespace_id)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Close open documents, then shut the node down gracefully.
    ///
    /// Idempotent: closing a closed engine succeeds without a native call.
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let Some(node) = self.inner.shut_down() else {
            return Ok(());
        };
        let (token, pending) = Correlation::new(self.inner.api.clone(), OperationKind::Close);
        self.inner.api.node_close(node, token.close_callback());
        let result = pending
            .wait(&self.inner.options(&OperationOptions::default()))
            .await;
        match &result {
            Ok(()) => tracing::info!(engine = %self.inner.id, "engine closed"),
            Err(err) => tracing::warn!(engine = %self.inner.id, error = %err, "engine close failed"),
        }
        result
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(node) = self.inner.shut_down() {
            self.inner.api.node_destroy(node);
            tracing::info!(engine = %self.inner.id, "engine destroyed");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .field("documents", &self.inner.documents)
            .finish()
    }
}
