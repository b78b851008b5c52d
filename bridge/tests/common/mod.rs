//! Shared test harness: a memory engine, a bridge over it and helpers to
//! check that nothing crossing the boundary was leaked.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use tether_bridge::{Author, Bridge, BridgeConfig, Engine, EngineConfig};
use tether_native::{EngineStats, MemoryEngine};
use tracing_subscriber::EnvFilter;

/// Upper bound for anything that should happen "soon".
pub const WAIT: Duration = Duration::from_secs(5);

/// Install a `RUST_LOG`-filtered subscriber once per test binary.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct Harness {
    pub native: Arc<MemoryEngine>,
    pub bridge: Bridge,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        init_tracing();
        let native = Arc::new(MemoryEngine::new().expect("memory engine"));
        let bridge = Bridge::with_config(native.clone(), config);
        Self { native, bridge }
    }

    pub fn storage() -> EngineConfig {
        EngineConfig::new(format!("/tmp/tether-test-{}", uuid::Uuid::new_v4()))
    }

    /// An engine without documents.
    pub async fn engine(&self) -> Engine {
        self.bridge
            .create_engine(&Self::storage())
            .await
            .expect("create engine")
    }

    pub async fn docs_engine(&self) -> Engine {
        self.bridge
            .create_engine(&Self::storage().with_docs())
            .await
            .expect("create docs engine")
    }

    /// A new author, imported into `engine`.
    pub async fn author(&self, engine: &Engine) -> Author {
        let author = self.bridge.create_author().await.expect("create author");
        engine.import_author(&author).await.expect("import author");
        author
    }

    pub fn stats(&self) -> EngineStats {
        self.native.stats()
    }

    /// Wait until every native output came back and no stale handle was used.
    pub async fn assert_clean(&self) {
        let native = self.native.clone();
        eventually("native outputs freed", move || {
            native.stats().live_allocations == 0
        })
        .await;
        let stats = self.stats();
        assert_eq!(stats.violations, 0, "boundary violations: {stats:?}");
    }

    /// As [`assert_clean`](Self::assert_clean), and no handle left open.
    pub async fn assert_released(&self) {
        self.assert_clean().await;
        let native = self.native.clone();
        eventually("native handles released", move || {
            native.stats().live_handles == 0
        })
        .await;
    }
}

/// Poll `check` until it holds, failing the test after [`WAIT`].
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
