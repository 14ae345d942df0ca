//! Connection registry
//!
//! The set of live connections eligible for broadcast. Mutation happens
//! under a short-lived lock; broadcasting works on a copied snapshot so no
//! socket I/O ever runs while the lock is held.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use crate::error::PeerWriteError;

/// Process-unique connection identifier (time ordered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One live client connection
#[derive(Debug)]
pub struct ConnectionEntry {
    id: ConnectionId,
    remote_address: String,
    /// Outbound frames, drained by the connection's writer task
    outbox: mpsc::Sender<Bytes>,
    closed: watch::Sender<bool>,
}

impl ConnectionEntry {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Queue a frame without waiting
    pub fn try_deliver(&self, frame: Bytes) -> Result<(), PeerWriteError> {
        if self.is_closed() {
            return Err(PeerWriteError::Gone);
        }
        self.outbox.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => PeerWriteError::Lagging,
            TrySendError::Closed(_) => PeerWriteError::Gone,
        })
    }

    /// Raise the close signal; the writer and reader of this connection stop
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Watch for the close signal
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Shared map of live connections
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<BTreeMap<ConnectionId, Arc<ConnectionEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign an identifier and insert the connection
    pub fn register(
        &self,
        remote_address: impl Into<String>,
        outbox: mpsc::Sender<Bytes>,
    ) -> Arc<ConnectionEntry> {
        let (closed, _) = watch::channel(false);
        let entry = Arc::new(ConnectionEntry {
            id: ConnectionId::generate(),
            remote_address: remote_address.into(),
            outbox,
            closed,
        });

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(entry.id, entry.clone());
        debug!(id = %entry.id, addr = %entry.remote_address, total = entries.len(), "Registered connection");
        entry
    }

    /// Remove a connection; removing an unknown id is a no-op
    pub fn deregister(&self, id: ConnectionId) -> Option<Arc<ConnectionEntry>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let removed = entries.remove(&id);
        if removed.is_some() {
            debug!(id = %id, total = entries.len(), "Deregistered connection");
        }
        removed
    }

    /// Point-in-time copy of the membership, in accept order
    pub fn snapshot(&self) -> Vec<Arc<ConnectionEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raise the close signal on every registered connection
    ///
    /// Entries stay registered; each handler deregisters itself on exit.
    pub fn close_all(&self) -> usize {
        let snapshot = self.snapshot();
        for entry in &snapshot {
            entry.close();
        }
        snapshot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox(capacity: usize) -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        mpsc::channel(capacity)
    }

    #[test]
    fn test_register_and_snapshot() {
        let registry = Registry::new();
        let (tx, _rx) = outbox(4);

        let a = registry.register("127.0.0.1:1000", tx.clone());
        let b = registry.register("127.0.0.1:1001", tx.clone());
        let c = registry.register("127.0.0.1:1002", tx);

        assert_eq!(registry.len(), 3);
        let ids: Vec<ConnectionId> = registry.snapshot().iter().map(|e| e.id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        for entry in [&a, &b, &c] {
            assert!(ids.contains(&entry.id()));
        }
    }

    #[test]
    fn test_ids_unique() {
        let registry = Registry::new();
        let (tx, _rx) = outbox(1);
        let mut ids: Vec<ConnectionId> = (0..100)
            .map(|i| registry.register(format!("10.0.0.1:{}", i), tx.clone()).id())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_deregister_idempotent() {
        let registry = Registry::new();
        let (tx, _rx) = outbox(4);
        let entry = registry.register("127.0.0.1:1000", tx);

        assert!(registry.deregister(entry.id()).is_some());
        assert!(registry.deregister(entry.id()).is_none());
        assert!(registry.is_empty());
        assert!(!registry.contains(entry.id()));
    }

    #[test]
    fn test_snapshot_outlives_removal() {
        let registry = Registry::new();
        let (tx, mut rx) = outbox(4);
        let entry = registry.register("127.0.0.1:1000", tx);

        let snapshot = registry.snapshot();
        registry.deregister(entry.id());
        entry.close();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot[0].try_deliver(Bytes::from_static(b"late")),
            Err(PeerWriteError::Gone)
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_try_deliver_full_queue() {
        let registry = Registry::new();
        let (tx, _rx) = outbox(1);
        let entry = registry.register("127.0.0.1:1000", tx);

        assert_eq!(entry.try_deliver(Bytes::from_static(b"1")), Ok(()));
        let err = entry.try_deliver(Bytes::from_static(b"2")).unwrap_err();
        assert_eq!(err, PeerWriteError::Lagging);
        assert_eq!(err.to_string(), "outbound queue full");
    }

    #[test]
    fn test_close_all() {
        let registry = Registry::new();
        let (tx, _rx) = outbox(4);
        let a = registry.register("127.0.0.1:1000", tx.clone());
        let b = registry.register("127.0.0.1:1001", tx);
        let signal = a.closed_signal();

        assert_eq!(registry.close_all(), 2);
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(signal.has_changed().unwrap());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_mutation() {
        let registry = Arc::new(Registry::new());
        let (tx, _rx) = outbox(1);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let entry = registry.register(format!("10.0.{}.{}:1", t, i), tx.clone());
                        let _ = registry.snapshot();
                        registry.deregister(entry.id());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
