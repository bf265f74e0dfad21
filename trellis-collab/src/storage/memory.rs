//! In-process snapshot store. Survives room restarts, not process restarts.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{SnapshotStore, StoreError};
use crate::document::DocumentId;

#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<DocumentId, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.snapshots.read().get(id).cloned())
    }

    fn save(&self, id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError> {
        self.snapshots.write().insert(id.clone(), snapshot.to_vec());
        Ok(())
    }

    fn delete(&self, id: &DocumentId) -> Result<(), StoreError> {
        self.snapshots.write().remove(id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<DocumentId>, StoreError> {
        let mut ids: Vec<DocumentId> = self.snapshots.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_delete() {
        let store = MemorySnapshotStore::new();
        let a = DocumentId::new("a").unwrap();
        let b = DocumentId::new("b").unwrap();
        store.save(&b, b"two").unwrap();
        store.save(&a, b"one").unwrap();
        store.save(&a, b"uno").unwrap();

        assert_eq!(store.load(&a).unwrap().as_deref(), Some(&b"uno"[..]));
        assert_eq!(store.list().unwrap(), vec![a.clone(), b.clone()]);

        store.delete(&a).unwrap();
        assert_eq!(store.load(&a).unwrap(), None);
        assert_eq!(store.len(), 1);
    }
}
