//! Thread-safe handle to a replica with update notification.
//!
//! The sync provider and the offline layer both observe one replica. Every
//! applied delta is pushed, with its origin, to each subscriber in the
//! order it was applied.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::document::{
    Delta, DocumentContent, DocumentError, DocumentId, DocumentReplica, EditOp, ReplicaId,
    TextField, Version,
};

/// Where an applied delta came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Produced by an edit on this replica.
    Local,
    /// Received from the network.
    Remote,
    /// Replayed from the local durable store.
    Offline,
}

#[derive(Debug, Clone)]
pub struct DocumentUpdate {
    pub origin: UpdateOrigin,
    pub delta: Delta,
}

struct Inner {
    document_id: DocumentId,
    replica: Mutex<DocumentReplica>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DocumentUpdate>>>,
}

/// Cloneable handle to one document replica.
#[derive(Clone)]
pub struct SharedDocument {
    inner: Arc<Inner>,
}

impl SharedDocument {
    pub fn new(document_id: DocumentId, replica: DocumentReplica) -> Self {
        Self {
            inner: Arc::new(Inner {
                document_id,
                replica: Mutex::new(replica),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fresh replica with a random id.
    pub fn open(document_id: DocumentId) -> Self {
        Self::new(document_id, DocumentReplica::with_random_id())
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.inner.document_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.inner.replica.lock().replica_id()
    }

    /// Apply an edit synchronously. Subscribers are notified before this returns.
    pub fn apply_local_edit(&self, op: &EditOp) -> Result<Delta, DocumentError> {
        let mut replica = self.inner.replica.lock();
        let delta = replica.apply_local_edit(op)?;
        if !delta.is_empty() {
            self.notify(DocumentUpdate { origin: UpdateOrigin::Local, delta: delta.clone() });
        }
        Ok(delta)
    }

    pub fn apply_remote(&self, delta: &Delta, origin: UpdateOrigin) -> Result<(), DocumentError> {
        if delta.is_empty() {
            return Ok(());
        }
        let mut replica = self.inner.replica.lock();
        replica.apply_remote_delta(delta)?;
        self.notify(DocumentUpdate { origin, delta: delta.clone() });
        Ok(())
    }

    pub fn encode_full_state(&self) -> Delta {
        self.inner.replica.lock().encode_full_state()
    }

    pub fn content(&self) -> DocumentContent {
        self.inner.replica.lock().content()
    }

    pub fn text(&self, field: TextField) -> String {
        self.inner.replica.lock().text(field)
    }

    pub fn version(&self) -> Version {
        self.inner.replica.lock().version()
    }

    /// Receive every delta applied from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DocumentUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    // Called with the replica lock held so delivery order matches apply order.
    fn notify(&self, update: DocumentUpdate) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }
}

impl std::fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDocument")
            .field("document_id", &self.inner.document_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> SharedDocument {
        SharedDocument::open(DocumentId::new("shared-test").unwrap())
    }

    #[test]
    fn test_subscribers_see_updates_in_order() {
        let shared = doc();
        let mut rx = shared.subscribe();

        let d1 = shared.apply_local_edit(&EditOp::insert(TextField::Body, 0, "a")).unwrap();
        let other = doc();
        let remote = other.apply_local_edit(&EditOp::insert(TextField::Title, 0, "t")).unwrap();
        shared.apply_remote(&remote, UpdateOrigin::Remote).unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.origin, UpdateOrigin::Local);
        assert_eq!(first.delta, d1);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.origin, UpdateOrigin::Remote);
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.content().title, "t");
    }

    #[test]
    fn test_failed_apply_does_not_notify() {
        let shared = doc();
        let mut rx = shared.subscribe();
        let bad = Delta::from_bytes(b"garbage".to_vec());
        assert!(shared.apply_remote(&bad, UpdateOrigin::Remote).is_err());
        assert!(shared.apply_local_edit(&EditOp::delete(TextField::Body, 3, 1)).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let shared = doc();
        let rx = shared.subscribe();
        let _keep = shared.subscribe();
        drop(rx);
        shared.apply_local_edit(&EditOp::insert(TextField::Body, 0, "x")).unwrap();
        assert_eq!(shared.subscriber_count(), 1);
    }
}
