//! Blob store - the content-addressed container behind one node.
//!
//! Blobs are keyed by their BLAKE3 hash. Tags pin a hash under a name.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::abi::BlobFormat;
use crate::error::{Error, Result};
use crate::ticket::{encode_id, Id32};

/// Hash content the way the store addresses it.
pub fn hash_bytes(bytes: &[u8]) -> Id32 {
    *blake3::hash(bytes).as_bytes()
}

/// A pinned hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub hash: Id32,
    pub format: BlobFormat,
}

#[derive(Debug, Default)]
pub struct BlobStore {
    blobs: RwLock<HashMap<Id32, Arc<Vec<u8>>>>,
    tags: RwLock<HashMap<String, Tag>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add bytes, returning their hash. Adding the same content twice is a no-op.
    pub fn add(&self, bytes: Vec<u8>) -> Id32 {
        let hash = hash_bytes(&bytes);
        self.insert(hash, Arc::new(bytes));
        hash
    }

    /// Insert content fetched from elsewhere under its known hash.
    pub fn insert(&self, hash: Id32, bytes: Arc<Vec<u8>>) {
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(hash)
            .or_insert(bytes);
    }

    pub fn get(&self, hash: &Id32) -> Option<Arc<Vec<u8>>> {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .cloned()
    }

    pub fn contains(&self, hash: &Id32) -> bool {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(hash)
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pin a stored blob under `name`, replacing any previous tag.
    pub fn set_tag(&self, name: &str, hash: Id32, format: BlobFormat) -> Result<()> {
        if !self.contains(&hash) {
            return Err(Error::BlobNotFound(encode_id(&hash)));
        }
        self.tags
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Tag { hash, format });
        Ok(())
    }

    /// Remove a tag. Returns whether it existed.
    pub fn delete_tag(&self, name: &str) -> bool {
        self.tags
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn tag(&self, name: &str) -> Option<Tag> {
        self.tags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }
}
