//! # Tether Native
//!
//! The native side of the Tether boundary.
//!
//! This crate defines what crosses the boundary between an async Rust
//! program and a callback-driven native engine (a content-addressed blob
//! store with document sync), and ships an in-process engine that honours
//! the same contract.
//!
//! ## Core Concepts
//!
//! ### Boundary Types
//!
//! [`abi`] holds the `#[repr(C)]` vocabulary:
//! - Opaque handles ([`NodePtr`], [`DocPtr`], [`SubscriptionPtr`])
//! - Native-owned outputs ([`OwnedBytes`], C strings, [`DocEntry`], [`DocEvent`])
//! - Callback structs carrying a `userdata` pointer and `extern "C"` functions
//!
//! ### Entry Points
//!
//! [`NativeApi`] is one method per native entry point. Async entry points
//! report through their callback struct exactly once, or as a stream of
//! items followed by one terminal callback.
//!
//! ### Reference Engine
//!
//! [`MemoryEngine`] runs the entry points on its own worker threads and keeps
//! score of handles and allocations, so consumers can check their release
//! discipline:
//!
//! ```rust
//! use tether_native::{FaultPoint, MemoryEngine};
//!
//! let engine = MemoryEngine::new().unwrap();
//! engine.inject_failures(FaultPoint::Put, 1);
//!
//! let stats = engine.stats();
//! assert_eq!(stats.live_allocations, 0);
//! assert_eq!(stats.violations, 0);
//! ```
//!
//! ## Tickets
//!
//! [`ticket`] defines the textual blob and document tickets nodes hand out.

pub mod abi;
pub mod api;
pub mod error;
pub mod memory;
pub mod ticket;

// Re-export main types at crate root
pub use abi::{
    AuthorId, AuthorSecret, BlobFormat, DocEntry, DocEvent, DocEventType, DocPtr, DocShareMode,
    DownloadProgress, NodeOptions, NodePtr, OwnedBytes, SubscriptionPtr,
};
pub use api::NativeApi;
pub use error::{Error, Result};
pub use memory::{EngineStats, FaultPoint, MemoryEngine};
pub use ticket::{BlobTicket, DocTicket};
