//! Tether Bridge - async Rust over a callback-driven native engine.
//!
//! The native layer ([`tether_native::NativeApi`]) reports every result
//! through C callbacks on its own worker threads. This crate turns those
//! into futures and streams while owning the native handles:
//!
//! - single-shot calls resolve exactly once, even when the caller gave up
//!   waiting (cancellation, timeout) before the callback arrived
//! - multi-event calls become bounded, lazily consumed streams that cancel
//!   the native side when dropped
//! - every handle is released exactly once, children before parents
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tether_bridge::{Bridge, EngineConfig};
//! use tether_native::MemoryEngine;
//!
//! # async fn run() -> tether_bridge::Result<()> {
//! let native = Arc::new(MemoryEngine::new().expect("runtime"));
//! let bridge = Bridge::new(native);
//!
//! let engine = bridge.create_engine(&EngineConfig::new("/tmp/tether")).await?;
//! let ticket = engine.put(b"hello").await?;
//! assert_eq!(engine.get(&ticket).await?, b"hello");
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod cancel;
mod completion;
pub mod config;
mod document;
mod engine;
pub mod error;
mod registry;
pub mod retry;
mod stream;
mod subscription;
pub mod ticket;
pub mod types;

use std::sync::Arc;

use tether_native::NativeApi;

pub use cancel::{with_cancel, CancelToken};
pub use completion::OperationOptions;
pub use config::{BridgeConfig, ConfigError, EngineConfig};
pub use document::Document;
pub use engine::Engine;
pub use error::{BridgeError, HandleKind, OperationKind, Result};
pub use retry::{retry, RetryPolicy};
pub use stream::BridgeStream;
pub use subscription::Subscription;
pub use ticket::{validate_structure, BlobTicket};
pub use types::{
    Author, BlobFormat, DownloadProgress, Entry, Event, Hash, NodeInfo, ShareMode, TicketInfo,
};

use crate::completion::Correlation;
use crate::types::c_string;

/// Entry point: a native engine plus the bridge settings.
#[derive(Clone)]
pub struct Bridge {
    api: Arc<dyn NativeApi>,
    config: Arc<BridgeConfig>,
}

impl Bridge {
    /// Bridge with default settings.
    pub fn new(api: Arc<dyn NativeApi>) -> Self {
        Self::with_config(api, BridgeConfig::default())
    }

    pub fn with_config(api: Arc<dyn NativeApi>, config: BridgeConfig) -> Self {
        Self {
            api,
            config: Arc::new(config),
        }
    }

    /// Bridge configured from `.env` and the process environment.
    pub fn from_env(api: Arc<dyn NativeApi>) -> Result<Self> {
        Ok(Self::with_config(api, BridgeConfig::load()?))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn options(&self) -> OperationOptions {
        OperationOptions::default().or_timeout(self.config.operation_timeout)
    }

    /// Start a native node.
    pub async fn create_engine(&self, config: &EngineConfig) -> Result<Engine> {
        Engine::create(self.api.clone(), self.config.clone(), config).await
    }

    /// Decode a ticket through the native layer.
    ///
    /// Malformed input is not an error: it yields an invalid [`TicketInfo`].
    pub async fn validate_ticket(&self, ticket: &str) -> Result<TicketInfo> {
        let Ok(ticket) = c_string(ticket, "ticket") else {
            return Ok(TicketInfo::invalid());
        };
        let (token, pending) = Correlation::new(self.api.clone(), OperationKind::ValidateTicket);
        self.api.validate_ticket(&ticket, token.ticket_callback());
        pending.wait(&self.options()).await
    }

    /// Generate a new author key pair.
    pub async fn create_author(&self) -> Result<Author> {
        let (token, pending) = Correlation::new(self.api.clone(), OperationKind::CreateAuthor);
        self.api.author_create(token.author_callback());
        pending.wait(&self.options()).await
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .finish()
    }
}
