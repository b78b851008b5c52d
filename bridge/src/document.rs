//! The document wrapper.

use std::sync::{Arc, Weak};

use tether_native::{DocPtr, NativeApi};
use uuid::Uuid;

use crate::completion::{Correlation, OperationOptions};
use crate::config::BridgeConfig;
use crate::engine::EngineInner;
use crate::error::{BridgeError, HandleKind, OperationKind, Result};
use crate::registry::{HandleRegistry, HandleSlot, Release};
use crate::stream::{BridgeStream, StreamCore};
use crate::subscription::Subscription;
use crate::types::{Author, Entry, Hash, ShareMode};

pub(crate) struct DocInner {
    id: Uuid,
    namespace_id: String,
    api: Arc<dyn NativeApi>,
    config: Arc<BridgeConfig>,
    slot: HandleSlot<DocPtr>,
    lifecycle: tokio::sync::Mutex<()>,
    pub(crate) subscriptions: HandleRegistry,
    /// Content is served by the engine; the document does not keep it alive.
    engine: Weak<EngineInner>,
}

impl DocInner {
    fn options(&self) -> OperationOptions {
        OperationOptions::default().or_timeout(self.config.operation_timeout)
    }

    fn unregister(&self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.documents.unregister(&self.id);
        }
    }
}

impl Release for DocInner {
    /// End subscriptions, then close the native document. Once only.
    fn release(&self) {
        let Some(doc) = self.slot.take() else {
            return;
        };
        let ended = self.subscriptions.release_all();
        self.api.doc_close(doc);
        tracing::info!(document = %self.id, subscriptions = ended, "document closed");
    }
}

/// An open replicated key-value document.
pub struct Document {
    inner: Arc<DocInner>,
}

impl Document {
    /// Wrap a freshly opened document and register it with its engine.
    ///
    /// Fails, closing the document, if the engine closed in the meantime.
    pub(crate) fn attach(
        engine: &Arc<EngineInner>,
        doc: DocPtr,
        namespace_id: String,
    ) -> Result<Self> {
        let inner = Arc::new(DocInner {
            id: Uuid::new_v4(),
            namespace_id,
            api: engine.api.clone(),
            config: engine.config.clone(),
            slot: HandleSlot::new(HandleKind::Document, doc),
            lifecycle: tokio::sync::Mutex::new(()),
            subscriptions: HandleRegistry::new(),
            engine: Arc::downgrade(engine),
        });

        let child: Weak<dyn Release> = Arc::downgrade(&inner) as Weak<dyn Release>;
        let registered = engine
            .slot
            .with_open(|_| engine.documents.register(inner.id, child));
        if let Err(err) = registered {
            tracing::debug!(document = %inner.id, "engine closed while opening document");
            inner.release();
            return Err(err);
        }
        tracing::info!(
            document = %inner.id,
            engine = %engine.id,
            namespace = %inner.namespace_id,
            "document opened"
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Hex-encoded namespace id.
    pub fn namespace_id(&self) -> &str {
        &self.inner.namespace_id
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.slot.is_open()
    }

    pub fn live_subscriptions(&self) -> usize {
        self.inner.subscriptions.live_count()
    }

    /// Write `value` under `key`; returns the content hash.
    pub async fn set(&self, author: &Author, key: &[u8], value: &[u8]) -> Result<Hash> {
        let (token, pending) = Correlation::new(self.inner.api.clone(), OperationKind::DocSet);
        self.inner.slot.with_open(|doc| {
            self.inner
                .api
                .doc_set(doc, author.secret(), key, value, token.string_callback())
        })?;
        pending.wait(&self.inner.options()).await
    }

    /// Latest entry for exactly `key`.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        let (token, pending) = Correlation::new(self.inner.api.clone(), OperationKind::DocGet);
        self.inner
            .slot
            .with_open(|doc| self.inner.api.doc_get(doc, key, token.entry_callback()))?;
        pending.wait(&self.inner.options()).await
    }

    /// Entries whose key starts with `prefix`.
    pub fn get_many(&self, prefix: &[u8]) -> Result<BridgeStream<Entry>> {
        let core = StreamCore::new(
            self.inner.api.clone(),
            OperationKind::DocGetMany,
            self.inner.config.stream_buffer,
        );
        let stream = BridgeStream::new(core.clone());
        self.inner.slot.with_open(|doc| {
            self.inner
                .api
                .doc_get_many(doc, prefix, core.entry_callback())
        })?;
        Ok(stream)
    }

    /// Delete `author`'s entries under the prefix `key`; returns how many.
    pub async fn delete(&self, author: &Author, key: &[u8]) -> Result<u64> {
        let (token, pending) = Correlation::new(self.inner.api.clone(), OperationKind::DocDelete);
        self.inner.slot.with_open(|doc| {
            self.inner
                .api
                .doc_del(doc, author.secret(), key, token.count_callback())
        })?;
        pending.wait(&self.inner.options()).await
    }

    /// Read entry content through the engine.
    pub async fn read_content(&self, hash: &str) -> Result<Vec<u8>> {
        self.inner.slot.with_open(|_| ())?;
        let engine = self
            .inner
            .engine
            .upgrade()
            .ok_or(BridgeError::ResourceClosed(HandleKind::Engine))?;
        engine.read_content(hash, &OperationOptions::default()).await
    }

    /// A ticket others can join this document with.
    pub async fn share(&self, mode: ShareMode) -> Result<String> {
        let (token, pending) = Correlation::new(self.inner.api.clone(), OperationKind::Share);
        self.inner
            .slot
            .with_open(|doc| self.inner.api.doc_share(doc, mode, token.string_callback()))?;
        pending.wait(&self.inner.options()).await
    }

    /// Live events of this document until the subscription is dropped,
    /// cancelled or the document closes.
    pub fn subscribe(&self) -> Result<Subscription> {
        let core = StreamCore::subscription(
            self.inner.api.clone(),
            OperationKind::Subscribe,
            self.inner.config.stream_buffer,
        );
        let subscription = Subscription::new(core.clone(), Arc::downgrade(&self.inner));
        let child: Weak<dyn Release> = Arc::downgrade(&core) as Weak<dyn Release>;

        let handle = self.inner.slot.with_open(|doc| {
            self.inner.subscriptions.register(subscription.id(), child);
            self.inner.api.doc_subscribe(doc, core.event_callback())
        })?;
        match handle {
            Some(handle) => {
                core.install(handle);
                tracing::debug!(document = %self.inner.id, subscription = %subscription.id(), "subscribed");
                Ok(subscription)
            }
            None => {
                let message = core
                    .failure()
                    .unwrap_or_else(|| "subscription refused".to_string());
                Err(BridgeError::native(OperationKind::Subscribe, message))
            }
        }
    }

    /// End subscriptions and close the document.
    ///
    /// Idempotent: closing a closed document succeeds without a native call.
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.release();
        self.inner.unregister();
        Ok(())
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        self.inner.release();
        self.inner.unregister();
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.inner.id)
            .field("namespace_id", &self.inner.namespace_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
