//! Ownership of native handles.
//!
//! A [`HandleSlot`] owns one native pointer behind a closed flag. Every
//! operation goes through [`HandleSlot::with_open`], which holds a read lock
//! only for the instant the native call is dispatched; release takes the
//! write lock, so it waits for in-flight dispatches and happens exactly once.
//!
//! A [`HandleRegistry`] tracks the live children of a resource (documents of
//! an engine, subscriptions of a document) so they can be released before
//! their parent.

use std::sync::{PoisonError, RwLock, Weak};

use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{BridgeError, HandleKind, Result};

/// One native pointer and its closed flag.
#[derive(Debug)]
pub(crate) struct HandleSlot<P: Copy> {
    kind: HandleKind,
    ptr: RwLock<Option<P>>,
}

impl<P: Copy> HandleSlot<P> {
    pub fn new(kind: HandleKind, ptr: P) -> Self {
        Self {
            kind,
            ptr: RwLock::new(Some(ptr)),
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn is_open(&self) -> bool {
        self.ptr
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run `dispatch` with the pointer, or fail without touching it.
    pub fn with_open<R>(&self, dispatch: impl FnOnce(P) -> R) -> Result<R> {
        let guard = self.ptr.read().unwrap_or_else(PoisonError::into_inner);
        match *guard {
            Some(ptr) => Ok(dispatch(ptr)),
            None => Err(BridgeError::ResourceClosed(self.kind)),
        }
    }

    /// Flip the slot to closed, handing out the pointer the first time only.
    pub fn take(&self) -> Option<P> {
        self.ptr
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Close the slot and free the pointer. Returns false if already closed.
    pub fn release(&self, free: impl FnOnce(P)) -> bool {
        match self.take() {
            Some(ptr) => {
                free(ptr);
                true
            }
            None => false,
        }
    }
}

/// Something that owns native handles and can let go of them synchronously.
pub(crate) trait Release: Send + Sync {
    fn release(&self);
}

/// Live children of one resource, keyed by id.
#[derive(Default)]
pub(crate) struct HandleRegistry {
    children: DashMap<Uuid, Weak<dyn Release>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, child: Weak<dyn Release>) {
        self.children.insert(id, child);
        tracing::debug!(handle = %id, "handle registered");
    }

    pub fn unregister(&self, id: &Uuid) {
        if self.children.remove(id).is_some() {
            tracing::debug!(handle = %id, "handle unregistered");
        }
    }

    /// Children that are still alive.
    pub fn live_count(&self) -> usize {
        self.children
            .iter()
            .filter(|child| child.value().strong_count() > 0)
            .count()
    }

    /// Release every child. Returns how many were still alive.
    pub fn release_all(&self) -> usize {
        let ids: Vec<Uuid> = self.children.iter().map(|child| *child.key()).collect();
        let mut released = 0;
        for id in ids {
            // Removed before releasing: children unregister themselves.
            let Some((_, child)) = self.children.remove(&id) else {
                continue;
            };
            if let Some(child) = child.upgrade() {
                child.release();
                released += 1;
            }
        }
        if released > 0 {
            tracing::info!(released, "released child handles");
        }
        released
    }
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("children", &self.children.len())
            .finish()
    }
}
