//! Owned values copied out of native memory.
//!
//! Nothing here points into native memory: every constructor copies what it
//! needs, and the caller hands the original back to the native layer.

use std::ffi::CString;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_native::abi::{self, from_c_string};
use tether_native::{AuthorId, AuthorSecret, DocEntry, DocEvent, DocEventType};

use crate::error::{BridgeError, Result};

pub use tether_native::{BlobFormat, DocShareMode as ShareMode};

/// Hex-encoded BLAKE3 content hash.
pub type Hash = String;

/// Copy a native string, failing on null or invalid UTF-8.
///
/// # Safety
/// `ptr` must be null or a valid null-terminated string.
pub(crate) unsafe fn copy_string(ptr: *const std::ffi::c_char, what: &str) -> Result<String> {
    from_c_string(ptr).ok_or_else(|| BridgeError::DecodingFailed(format!("{what} is missing")))
}

/// Copy a string for the native layer, which cannot carry null bytes.
pub(crate) fn c_string(s: &str, what: &str) -> Result<CString> {
    CString::new(s).map_err(|_| BridgeError::EncodingFailed(format!("{what} contains a null byte")))
}

/// A document entry. Content is read separately by hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Hex-encoded author id
    pub author: String,
    pub key: Vec<u8>,
    pub content_hash: Hash,
    pub content_size: u64,
    /// Microseconds since the Unix epoch
    pub timestamp: u64,
}

impl Entry {
    /// # Safety
    /// `entry` must point at a live native entry.
    pub(crate) unsafe fn from_native(entry: &DocEntry) -> Result<Self> {
        Ok(Self {
            author: hex::encode(entry.author_id.bytes),
            key: entry.key.as_slice().to_vec(),
            content_hash: copy_string(entry.content_hash, "content hash")?,
            content_size: entry.content_size,
            timestamp: entry.timestamp,
        })
    }

    /// The key as text, if it is UTF-8.
    pub fn key_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.key).ok()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(i64::try_from(self.timestamp).ok()?)
    }
}

/// A live document event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    /// An entry written through this node
    InsertLocal { entry: Entry },
    /// An entry received from a peer
    InsertRemote { from: String, entry: Entry },
    ContentReady { hash: Hash },
    PendingContentReady,
    NeighborUp { peer: String },
    NeighborDown { peer: String },
    SyncFinished { peer: String },
}

impl Event {
    /// # Safety
    /// Every non-null pointer in `event` must be live.
    pub(crate) unsafe fn from_native(event: &DocEvent) -> Result<Self> {
        let entry = || match event.entry.as_ref() {
            Some(entry) => Entry::from_native(entry),
            None => Err(BridgeError::DecodingFailed("event entry is missing".into())),
        };
        let peer = || copy_string(event.peer_id, "peer id");

        Ok(match event.event_type {
            DocEventType::InsertLocal => Event::InsertLocal { entry: entry()? },
            DocEventType::InsertRemote => Event::InsertRemote {
                from: peer()?,
                entry: entry()?,
            },
            DocEventType::ContentReady => Event::ContentReady {
                hash: copy_string(event.content_hash, "content hash")?,
            },
            DocEventType::PendingContentReady => Event::PendingContentReady,
            DocEventType::NeighborUp => Event::NeighborUp { peer: peer()? },
            DocEventType::NeighborDown => Event::NeighborDown { peer: peer()? },
            DocEventType::SyncFinished => Event::SyncFinished { peer: peer()? },
        })
    }

    /// The entry carried by insert events.
    pub fn entry(&self) -> Option<&Entry> {
        match self {
            Event::InsertLocal { entry } | Event::InsertRemote { entry, .. } => Some(entry),
            _ => None,
        }
    }
}

/// Information about a running node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: String,
    pub relay_url: Option<String>,
    pub is_connected: bool,
}

impl NodeInfo {
    /// # Safety
    /// Non-null strings in `info` must be live.
    pub(crate) unsafe fn from_native(info: &abi::NodeInfo) -> Result<Self> {
        Ok(Self {
            node_id: copy_string(info.node_id, "node id")?,
            relay_url: from_c_string(info.relay_url),
            is_connected: info.is_connected,
        })
    }
}

/// A decoded ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketInfo {
    pub is_valid: bool,
    pub hash: Option<Hash>,
    pub node_id: Option<String>,
    /// Whether the ticket names a collection
    pub is_recursive: bool,
}

impl TicketInfo {
    pub fn invalid() -> Self {
        Self {
            is_valid: false,
            hash: None,
            node_id: None,
            is_recursive: false,
        }
    }

    /// # Safety
    /// Non-null strings in `info` must be live.
    pub(crate) unsafe fn from_native(info: &abi::TicketInfo) -> Self {
        let hash = from_c_string(info.hash);
        let node_id = from_c_string(info.node_id);
        if !info.is_valid || hash.is_none() || node_id.is_none() {
            return Self::invalid();
        }
        Self {
            is_valid: true,
            hash,
            node_id,
            is_recursive: info.is_recursive,
        }
    }
}

/// Progress of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub downloaded: u64,
    /// None while the size is unknown
    pub total: Option<u64>,
}

impl From<abi::DownloadProgress> for DownloadProgress {
    fn from(progress: abi::DownloadProgress) -> Self {
        Self {
            downloaded: progress.downloaded,
            total: (progress.total > 0).then_some(progress.total),
        }
    }
}

impl DownloadProgress {
    /// Completed fraction in `0.0..=1.0`, when the size is known.
    pub fn fraction(&self) -> Option<f64> {
        self.total
            .map(|total| (self.downloaded as f64 / total as f64).min(1.0))
    }
}

/// An author key pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Author {
    secret: [u8; 32],
    id: [u8; 32],
}

impl Author {
    pub(crate) fn from_native(secret: AuthorSecret, id: AuthorId) -> Self {
        Self {
            secret: secret.bytes,
            id: id.bytes,
        }
    }

    /// Rebuild an author from its hex-encoded secret and id.
    pub fn from_hex(secret: &str, id: &str) -> Result<Self> {
        let decode = |s: &str| -> Result<[u8; 32]> {
            hex::decode(s)
                .map_err(|e| BridgeError::DecodingFailed(e.to_string()))?
                .try_into()
                .map_err(|_| BridgeError::DecodingFailed("expected 32 bytes".into()))
        };
        Ok(Self {
            secret: decode(secret)?,
            id: decode(id)?,
        })
    }

    pub fn id(&self) -> String {
        hex::encode(self.id)
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret)
    }

    pub(crate) fn secret(&self) -> AuthorSecret {
        AuthorSecret { bytes: self.secret }
    }
}

impl fmt::Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Author").field("id", &self.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> Entry {
        Entry {
            author: "ab".repeat(32),
            key: b"notes/1".to_vec(),
            content_hash: "cd".repeat(32),
            content_size: 5,
            timestamp: 1_706_745_600_000_000,
        }
    }

    #[test]
    fn entry_timestamp_is_microseconds() {
        let created = entry().created_at().unwrap();
        assert_eq!(created.timestamp(), 1_706_745_600);
        assert_eq!(entry().key_str(), Some("notes/1"));
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let event = Event::InsertLocal { entry: entry() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "insertLocal");
        assert_eq!(json["entry"]["contentSize"], 5);
        assert_eq!(event.entry(), Some(&entry()));

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
        assert!(Event::PendingContentReady.entry().is_none());
    }

    #[test]
    fn unknown_totals_have_no_fraction() {
        let progress = DownloadProgress::from(abi::DownloadProgress {
            downloaded: 10,
            total: 0,
        });
        assert_eq!(progress.total, None);
        assert_eq!(progress.fraction(), None);

        let progress = DownloadProgress::from(abi::DownloadProgress {
            downloaded: 5,
            total: 10,
        });
        assert_eq!(progress.fraction(), Some(0.5));
    }

    #[test]
    fn author_hex_roundtrip_hides_the_secret() {
        let author = Author::from_hex(&"01".repeat(32), &"02".repeat(32)).unwrap();
        assert_eq!(author.id(), "02".repeat(32));
        assert!(!format!("{author:?}").contains(&"01".repeat(32)));
        assert!(Author::from_hex("zz", "00").is_err());
    }
}
