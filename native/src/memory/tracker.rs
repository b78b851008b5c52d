//! Bookkeeping of everything the reference engine hands out.
//!
//! Each native-owned output (string, byte buffer, entry) is recorded when it
//! crosses the boundary and removed when it comes back through a free call.
//! Frees of unknown pointers and uses of released handles are counted as
//! violations instead of being dereferenced.

use std::ffi::{c_char, CString};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;

use super::replica::{EntryRecord, LiveEvent};
use crate::abi::{to_c_string, DocEntry, DocEvent, DocEventType, OwnedBytes};
use crate::error::{Error, Result};
use crate::ticket::encode_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alloc {
    String,
    Bytes,
    Entry,
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Entry points invoked, free calls excluded.
    pub calls: u64,
    /// Native-owned outputs not yet freed.
    pub live_allocations: usize,
    /// Node, document and subscription handles not yet released.
    pub live_handles: usize,
    pub node_destroys: u64,
    pub node_closes: u64,
    pub doc_closes: u64,
    pub subscription_cancels: u64,
    pub subscription_frees: u64,
    /// Stale handles used and unknown pointers freed.
    pub violations: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub calls: AtomicU64,
    pub node_destroys: AtomicU64,
    pub node_closes: AtomicU64,
    pub doc_closes: AtomicU64,
    pub subscription_cancels: AtomicU64,
    pub subscription_frees: AtomicU64,
    pub violations: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn violation(&self, what: &str) {
        tracing::warn!(what, "native boundary violation");
        Self::bump(&self.violations);
    }
}

#[derive(Debug, Default)]
pub(crate) struct Tracker {
    live: DashMap<usize, Alloc>,
    pub counters: Counters,
}

impl Tracker {
    pub fn string(&self, s: impl Into<String>) -> *mut c_char {
        let ptr = to_c_string(s);
        self.live.insert(ptr as usize, Alloc::String);
        ptr
    }

    pub fn bytes(&self, bytes: Vec<u8>) -> OwnedBytes {
        let owned = OwnedBytes::from_vec(bytes);
        if !owned.is_null() {
            self.live.insert(owned.data as usize, Alloc::Bytes);
        }
        owned
    }

    /// Box an entry. Its key and hash belong to the entry and go with it.
    pub fn entry(&self, record: &EntryRecord) -> *mut DocEntry {
        let entry = Box::new(DocEntry {
            author_id: record.author,
            key: OwnedBytes::from_vec(record.key.clone()),
            content_hash: to_c_string(encode_id(&record.hash)),
            content_size: record.size,
            timestamp: record.timestamp,
        });
        let ptr = Box::into_raw(entry);
        self.live.insert(ptr as usize, Alloc::Entry);
        ptr
    }

    pub fn event(&self, event: &LiveEvent) -> DocEvent {
        let none = std::ptr::null();
        let (event_type, entry, peer_id, content_hash) = match event {
            LiveEvent::InsertLocal(record) => {
                (DocEventType::InsertLocal, self.entry(record) as *const _, none, none)
            }
            LiveEvent::InsertRemote { from, entry } => (
                DocEventType::InsertRemote,
                self.entry(entry) as *const _,
                self.string(encode_id(from)) as *const _,
                none,
            ),
            LiveEvent::ContentReady(hash) => (
                DocEventType::ContentReady,
                std::ptr::null(),
                none,
                self.string(encode_id(hash)) as *const _,
            ),
            LiveEvent::PendingContentReady => {
                (DocEventType::PendingContentReady, std::ptr::null(), none, none)
            }
            LiveEvent::NeighborUp(peer) => (
                DocEventType::NeighborUp,
                std::ptr::null(),
                self.string(encode_id(peer)) as *const _,
                none,
            ),
            LiveEvent::NeighborDown(peer) => (
                DocEventType::NeighborDown,
                std::ptr::null(),
                self.string(encode_id(peer)) as *const _,
                none,
            ),
            LiveEvent::SyncFinished(peer) => (
                DocEventType::SyncFinished,
                std::ptr::null(),
                self.string(encode_id(peer)) as *const _,
                none,
            ),
        };
        DocEvent {
            event_type,
            entry,
            peer_id,
            content_hash,
        }
    }

    fn reclaim(&self, addr: usize, kind: Alloc) -> bool {
        if self.live.remove_if(&addr, |_, k| *k == kind).is_some() {
            true
        } else {
            self.counters.violation("free of unknown pointer");
            false
        }
    }

    pub fn free_string(&self, s: *mut c_char) {
        if s.is_null() {
            return;
        }
        if self.reclaim(s as usize, Alloc::String) {
            // SAFETY: the pointer was produced by `CString::into_raw` and was
            // still registered, so this is its only reclamation.
            unsafe { drop(CString::from_raw(s)) };
        }
    }

    pub fn free_bytes(&self, bytes: OwnedBytes) {
        if bytes.is_null() {
            return;
        }
        if self.reclaim(bytes.data as usize, Alloc::Bytes) {
            // SAFETY: registered buffers come from `OwnedBytes::from_vec`.
            unsafe { drop(bytes.into_vec()) };
        }
    }

    pub fn free_entry(&self, entry: *mut DocEntry) {
        if entry.is_null() {
            return;
        }
        if self.reclaim(entry as usize, Alloc::Entry) {
            // SAFETY: registered entries come from `Box::into_raw` in `entry`,
            // and their fields from `from_vec`/`to_c_string`.
            unsafe {
                let entry = Box::from_raw(entry);
                drop(entry.key.into_vec());
                if !entry.content_hash.is_null() {
                    drop(CString::from_raw(entry.content_hash));
                }
            }
        }
    }

    pub fn free_event(&self, event: DocEvent) {
        self.free_entry(event.entry as *mut DocEntry);
        self.free_string(event.peer_id as *mut c_char);
        self.free_string(event.content_hash as *mut c_char);
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }
}

/// Holds callbacks back while closed.
#[derive(Debug)]
pub(crate) struct Gate {
    open: watch::Sender<bool>,
}

impl Default for Gate {
    fn default() -> Self {
        let (open, _) = watch::channel(true);
        Self { open }
    }
}

impl Gate {
    pub fn set_open(&self, open: bool) {
        self.open.send_replace(open);
    }

    pub async fn passed(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Create,
    Close,
    Put,
    Get,
    DocCreate,
    DocSet,
    DocGet,
    Subscribe,
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultPoint::Create => "create",
            FaultPoint::Close => "close",
            FaultPoint::Put => "put",
            FaultPoint::Get => "get",
            FaultPoint::DocCreate => "doc_create",
            FaultPoint::DocSet => "doc_set",
            FaultPoint::DocGet => "doc_get",
            FaultPoint::Subscribe => "subscribe",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Faults {
    pending: DashMap<FaultPoint, u32>,
    latency_ms: AtomicU64,
}

impl Faults {
    pub fn inject(&self, point: FaultPoint, times: u32) {
        *self.pending.entry(point).or_insert(0) += times;
    }

    /// Fail if a failure is pending for `point`, consuming it.
    pub fn trip(&self, point: FaultPoint) -> Result<()> {
        let mut tripped = false;
        if let Some(mut left) = self.pending.get_mut(&point) {
            if *left > 0 {
                *left -= 1;
                tripped = true;
            }
        }
        if tripped {
            Err(Error::Injected(point.to_string()))
        } else {
            Ok(())
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn latency(&self) -> Option<Duration> {
        match self.latency_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frees_are_tracked() {
        let tracker = Tracker::default();
        let s = tracker.string("hello");
        let b = tracker.bytes(vec![1, 2, 3]);
        assert_eq!(tracker.live_allocations(), 2);

        tracker.free_string(s);
        tracker.free_bytes(b);
        assert_eq!(tracker.live_allocations(), 0);
        assert_eq!(tracker.counters.violations.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn double_free_is_a_violation_not_a_crash() {
        let tracker = Tracker::default();
        let s = tracker.string("once");
        tracker.free_string(s);
        tracker.free_string(s);
        assert_eq!(tracker.counters.violations.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn events_release_all_fields() {
        let tracker = Tracker::default();
        let record = EntryRecord {
            author: crate::abi::AuthorId { bytes: [1; 32] },
            key: b"k".to_vec(),
            hash: [2; 32],
            size: 1,
            timestamp: 10,
        };
        let event = tracker.event(&LiveEvent::InsertRemote {
            from: [3; 32],
            entry: record,
        });
        assert_eq!(tracker.live_allocations(), 2);
        tracker.free_event(event);
        assert_eq!(tracker.live_allocations(), 0);
    }

    #[test]
    fn faults_trip_the_requested_number_of_times() {
        let faults = Faults::default();
        faults.inject(FaultPoint::Put, 2);
        assert!(faults.trip(FaultPoint::Put).is_err());
        assert!(faults.trip(FaultPoint::Get).is_ok());
        assert!(faults.trip(FaultPoint::Put).is_err());
        assert!(faults.trip(FaultPoint::Put).is_ok());
    }
}
