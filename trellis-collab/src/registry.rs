//! Maps document ids to their running room actors.
//!
//! At most one actor runs per document id. An entry is removed when its
//! actor exits; a handle found closed (the actor is stopping) is replaced
//! by a fresh actor, which reloads the snapshot the old one flushed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;

use crate::document::DocumentId;
use crate::room::{RoomConfig, RoomError, RoomHandle, RoomInfo, SessionRegistration};
use crate::storage::SnapshotStore;

const CONNECT_ATTEMPTS: usize = 3;

struct RoomEntry {
    handle: RoomHandle,
    generation: u64,
}

struct Inner {
    rooms: RwLock<HashMap<DocumentId, RoomEntry>>,
    store: Arc<dyn SnapshotStore>,
    config: RoomConfig,
    generations: AtomicU64,
}

#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<Inner>,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn SnapshotStore>, config: RoomConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                rooms: RwLock::new(HashMap::new()),
                store,
                config,
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// The live room for `id`, spawning one if needed.
    pub async fn get_or_spawn(&self, id: &DocumentId) -> RoomHandle {
        {
            let rooms = self.inner.rooms.read().await;
            if let Some(entry) = rooms.get(id) {
                if !entry.handle.is_closed() {
                    return entry.handle.clone();
                }
            }
        }

        let mut rooms = self.inner.rooms.write().await;
        if let Some(entry) = rooms.get(id) {
            if !entry.handle.is_closed() {
                return entry.handle.clone();
            }
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let (handle, join) =
            RoomHandle::spawn(id.clone(), self.inner.store.clone(), self.inner.config.clone());
        rooms.insert(id.clone(), RoomEntry { handle: handle.clone(), generation });
        log::info!("spawned {} (generation {generation})", id.room_name());

        let registry: Weak<Inner> = Arc::downgrade(&self.inner);
        let id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = join.await {
                log::error!("{} actor panicked: {e}", id.room_name());
            }
            if let Some(inner) = registry.upgrade() {
                let mut rooms = inner.rooms.write().await;
                if rooms.get(&id).is_some_and(|entry| entry.generation == generation) {
                    rooms.remove(&id);
                }
            }
        });
        handle
    }

    /// Join the room for `id`. Retries if the room stopped in between.
    pub async fn connect(&self, id: &DocumentId) -> Result<SessionRegistration, RoomError> {
        let mut last_err = RoomError::Closed(id.to_string());
        for _ in 0..CONNECT_ATTEMPTS {
            let handle = self.get_or_spawn(id).await;
            match handle.connect().await {
                Ok(registration) => return Ok(registration),
                Err(e) => {
                    log::debug!("connect to {} raced with shutdown: {e}", id.room_name());
                    last_err = e;
                    tokio::task::yield_now().await;
                }
            }
        }
        Err(last_err)
    }

    /// The live room for `id`, without spawning.
    pub async fn get(&self, id: &DocumentId) -> Option<RoomHandle> {
        let rooms = self.inner.rooms.read().await;
        rooms
            .get(id)
            .filter(|entry| !entry.handle.is_closed())
            .map(|entry| entry.handle.clone())
    }

    /// Room status. Rooms without a running actor report as inactive.
    pub async fn info(&self, id: &DocumentId) -> RoomInfo {
        match self.get(id).await {
            Some(handle) => handle.info().await.unwrap_or_else(|_| RoomInfo::inactive(id)),
            None => RoomInfo::inactive(id),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.inner.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self.inner.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Flush and stop every room.
    pub async fn shutdown_all(&self) {
        let handles: Vec<RoomHandle> = {
            let mut rooms = self.inner.rooms.write().await;
            rooms.drain().map(|(_, entry)| entry.handle).collect()
        };
        for handle in handles {
            if let Err(e) = handle.shutdown().await {
                log::debug!("{} already stopped: {e}", handle.document_id().room_name());
            }
        }
    }
}
