//! Document replicas shared by the nodes of the in-process network.
//!
//! A replica holds the latest entry per `(key, author)` and fans live
//! events out to the subscriptions opened on any member node. Entries only
//! carry the content hash; the content itself lives in the member nodes'
//! blob stores.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::node::Node;
use super::store::hash_bytes;
use crate::abi::AuthorId;
use crate::ticket::Id32;

/// A stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub author: AuthorId,
    pub key: Vec<u8>,
    pub hash: Id32,
    pub size: u64,
    /// Microseconds since the Unix epoch.
    pub timestamp: u64,
}

/// An event delivered to subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    InsertLocal(EntryRecord),
    InsertRemote { from: Id32, entry: EntryRecord },
    ContentReady(Id32),
    PendingContentReady,
    NeighborUp(Id32),
    NeighborDown(Id32),
    SyncFinished(Id32),
}

#[derive(Debug)]
struct Subscriber {
    node_id: Id32,
    doc_id: u64,
    tx: mpsc::UnboundedSender<LiveEvent>,
}

#[derive(Debug)]
pub struct Replica {
    pub namespace: Id32,
    entries: RwLock<BTreeMap<(Vec<u8>, AuthorId), EntryRecord>>,
    members: DashMap<Id32, Weak<Node>>,
    subscribers: DashMap<u64, Subscriber>,
    next_subscriber: AtomicU64,
    last_timestamp: AtomicU64,
}

impl Replica {
    pub fn new(namespace: Id32, owner: &Arc<Node>) -> Self {
        let replica = Self {
            namespace,
            entries: RwLock::new(BTreeMap::new()),
            members: DashMap::new(),
            subscribers: DashMap::new(),
            next_subscriber: AtomicU64::new(1),
            last_timestamp: AtomicU64::new(0),
        };
        replica.members.insert(owner.id, Arc::downgrade(owner));
        replica
    }

    pub fn is_member(&self, node_id: &Id32) -> bool {
        self.members.contains_key(node_id)
    }

    fn live_members(&self) -> Vec<Arc<Node>> {
        self.members
            .iter()
            .filter_map(|m| m.value().upgrade())
            .filter(|n| n.is_running())
            .collect()
    }

    /// Strictly increasing timestamps, so "latest" is well defined.
    fn next_timestamp(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let mut last = self.last_timestamp.load(Ordering::Acquire);
        loop {
            let next = now.max(last + 1);
            match self.last_timestamp.compare_exchange(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Write a value on behalf of `writer`, syncing content to every member.
    pub fn insert(
        &self,
        writer: &Node,
        author: AuthorId,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> EntryRecord {
        let hash = hash_bytes(&value);
        let content = Arc::new(value);
        writer.blobs.insert(hash, content.clone());
        for member in self.live_members() {
            member.blobs.insert(hash, content.clone());
        }

        let record = EntryRecord {
            author,
            key: key.clone(),
            hash,
            size: content.len() as u64,
            timestamp: self.next_timestamp(),
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((key, author), record.clone());

        for sub in self.subscribers.iter() {
            if sub.node_id == writer.id {
                let _ = sub.tx.send(LiveEvent::InsertLocal(record.clone()));
            } else {
                let _ = sub.tx.send(LiveEvent::InsertRemote {
                    from: writer.id,
                    entry: record.clone(),
                });
                let _ = sub.tx.send(LiveEvent::ContentReady(hash));
            }
        }
        record
    }

    /// Latest entry for an exact key, across authors.
    pub fn get(&self, key: &[u8]) -> Option<EntryRecord> {
        self.get_many(key)
            .into_iter()
            .filter(|e| e.key == key)
            .max_by_key(|e| e.timestamp)
    }

    /// Every entry under a key prefix, ordered by key then author.
    pub fn get_many(&self, prefix: &[u8]) -> Vec<EntryRecord> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .range((prefix.to_vec(), AuthorId { bytes: [0; 32] })..)
            .take_while(|((key, _), _)| key.starts_with(prefix))
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Remove the entries of `author` under a key prefix.
    pub fn delete(&self, author: AuthorId, prefix: &[u8]) -> u64 {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(key, a), _| !(*a == author && key.starts_with(prefix)));
        (before - entries.len()) as u64
    }

    /// Add `node` as a member, pulling content from `via`.
    pub fn join(&self, node: &Arc<Node>, via: &Node) {
        let hashes: Vec<Id32> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.hash)
            .collect();
        for hash in hashes {
            if let Some(content) = via.blobs.get(&hash) {
                node.blobs.insert(hash, content);
            }
        }

        let newly_joined = self
            .members
            .insert(node.id, Arc::downgrade(node))
            .is_none();
        if newly_joined {
            self.notify_others(node.id, LiveEvent::NeighborUp(node.id));
            self.notify_others(node.id, LiveEvent::SyncFinished(node.id));
        }
    }

    /// Drop a member that shut down.
    pub fn leave(&self, node_id: &Id32) {
        if self.members.remove(node_id).is_some() {
            self.subscribers.retain(|_, s| s.node_id != *node_id);
            self.notify_others(*node_id, LiveEvent::NeighborDown(*node_id));
        }
    }

    fn notify_others(&self, node_id: Id32, event: LiveEvent) {
        for sub in self.subscribers.iter() {
            if sub.node_id != node_id {
                let _ = sub.tx.send(event.clone());
            }
        }
    }

    pub fn subscribe(&self, node_id: Id32, doc_id: u64) -> (u64, mpsc::UnboundedReceiver<LiveEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, Subscriber { node_id, doc_id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    /// End the subscriptions opened through one document handle.
    pub fn close_doc(&self, doc_id: u64) {
        self.subscribers.retain(|_, s| s.doc_id != doc_id);
    }

    pub fn end_subscriptions(&self) {
        self.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author(n: u8) -> AuthorId {
        AuthorId { bytes: [n; 32] }
    }

    #[test]
    fn latest_entry_wins_across_authors() {
        let node = Arc::new(Node::new(None, true));
        let replica = Replica::new([1; 32], &node);

        replica.insert(&node, author(1), b"k".to_vec(), b"first".to_vec());
        let second = replica.insert(&node, author(2), b"k".to_vec(), b"second".to_vec());

        assert_eq!(replica.get(b"k").unwrap(), second);
        assert_eq!(replica.get_many(b"k").len(), 2);
        assert!(replica.get(b"missing").is_none());
    }

    #[test]
    fn prefix_queries_and_deletes() {
        let node = Arc::new(Node::new(None, true));
        let replica = Replica::new([1; 32], &node);
        for key in ["a/1", "a/2", "b/1"] {
            replica.insert(&node, author(1), key.as_bytes().to_vec(), key.as_bytes().to_vec());
        }
        replica.insert(&node, author(2), b"a/3".to_vec(), b"x".to_vec());

        let keys: Vec<_> = replica.get_many(b"a/").into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![b"a/1".to_vec(), b"a/2".to_vec(), b"a/3".to_vec()]);

        assert_eq!(replica.delete(author(1), b"a/"), 2);
        assert_eq!(replica.get_many(b"a/").len(), 1);
    }

    #[test]
    fn events_distinguish_local_and_remote() {
        let a = Arc::new(Node::new(None, true));
        let b = Arc::new(Node::new(None, true));
        let replica = Replica::new([1; 32], &a);
        replica.join(&b, &a);

        let (_, mut local) = replica.subscribe(a.id, 1);
        let (_, mut remote) = replica.subscribe(b.id, 2);
        let record = replica.insert(&a, author(1), b"k".to_vec(), b"v".to_vec());

        assert_eq!(local.try_recv().unwrap(), LiveEvent::InsertLocal(record.clone()));
        assert_eq!(
            remote.try_recv().unwrap(),
            LiveEvent::InsertRemote {
                from: a.id,
                entry: record.clone()
            }
        );
        assert_eq!(remote.try_recv().unwrap(), LiveEvent::ContentReady(record.hash));
        assert!(b.blobs.contains(&record.hash));
    }

    #[test]
    fn closing_a_doc_ends_its_subscriptions() {
        let node = Arc::new(Node::new(None, true));
        let replica = Replica::new([1; 32], &node);
        let (_, mut rx) = replica.subscribe(node.id, 7);
        replica.close_doc(7);
        assert_eq!(replica.subscriber_count(), 0);
        assert!(rx.try_recv().is_err());
    }
}
