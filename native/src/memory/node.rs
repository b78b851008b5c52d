//! One node of the in-process network.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashSet;

use super::store::BlobStore;
use crate::abi::{AuthorId, AuthorSecret};
use crate::error::{Error, Result};
use crate::ticket::{encode_id, Id32};

/// Derive the public id of an author from its secret.
///
/// Stand-in for real key derivation: the id is the BLAKE3 hash of the secret.
pub fn author_id(secret: &AuthorSecret) -> AuthorId {
    AuthorId {
        bytes: *blake3::hash(&secret.bytes).as_bytes(),
    }
}

#[derive(Debug)]
pub struct Node {
    pub id: Id32,
    pub relay_url: Option<String>,
    pub docs_enabled: bool,
    pub blobs: BlobStore,
    authors: DashSet<AuthorId>,
    shut_down: AtomicBool,
}

impl Node {
    pub fn new(relay_url: Option<String>, docs_enabled: bool) -> Self {
        Self {
            id: rand::random(),
            relay_url,
            docs_enabled,
            blobs: BlobStore::new(),
            authors: DashSet::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn id_hex(&self) -> String {
        encode_id(&self.id)
    }

    pub fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(Error::NodeShutDown)
        } else {
            Ok(())
        }
    }

    pub fn ensure_docs(&self) -> Result<()> {
        self.ensure_running()?;
        if self.docs_enabled {
            Ok(())
        } else {
            Err(Error::DocsDisabled)
        }
    }

    /// Mark the node as shut down. Returns false if it already was.
    pub fn shut_down(&self) -> bool {
        !self.shut_down.swap(true, Ordering::AcqRel)
    }

    pub fn is_running(&self) -> bool {
        !self.shut_down.load(Ordering::Acquire)
    }

    pub fn import_author(&self, secret: &AuthorSecret) -> AuthorId {
        let id = author_id(secret);
        self.authors.insert(id);
        id
    }

    /// Resolve the author for a write, which must have been imported.
    pub fn signing_author(&self, secret: &AuthorSecret) -> Result<AuthorId> {
        let id = author_id(secret);
        if self.authors.contains(&id) {
            Ok(id)
        } else {
            Err(Error::AuthorNotFound(encode_id(&id.bytes)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authors_must_be_imported() {
        let node = Node::new(None, true);
        let secret = AuthorSecret { bytes: [7; 32] };
        assert!(matches!(
            node.signing_author(&secret),
            Err(Error::AuthorNotFound(_))
        ));

        let id = node.import_author(&secret);
        assert_eq!(node.signing_author(&secret).unwrap(), id);
    }

    #[test]
    fn shut_down_is_one_way() {
        let node = Node::new(None, false);
        assert!(node.ensure_running().is_ok());
        assert!(matches!(node.ensure_docs(), Err(Error::DocsDisabled)));
        assert!(node.shut_down());
        assert!(!node.shut_down());
        assert_eq!(node.ensure_running(), Err(Error::NodeShutDown));
    }
}
