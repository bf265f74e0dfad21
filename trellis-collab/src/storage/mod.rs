//! Durable storage for document state.
//!
//! ```text
//! server side                              client side
//! ┌──────────┐  snapshot   ┌──────────────┐   ┌───────────────┐  frames  ┌────────────┐
//! │ RoomActor│ ──────────► │ SnapshotStore│   │ OfflineHandle │ ───────► │ LocalStore │
//! └──────────┘  (full)     └──────┬───────┘   └───────────────┘ (append) └─────┬──────┘
//!                                 │                                             │
//!                  memory / files / rocksdb                        memory / files
//! ```
//!
//! Both traits are synchronous. Async callers go through
//! [`load_snapshot`]/[`save_snapshot`] and the local helpers, which run the
//! store on the blocking pool.

pub mod file;
pub mod local;
pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

use std::sync::Arc;

use crate::document::DocumentId;

pub use file::FileSnapshotStore;
pub use local::{FileLocalStore, LocalStore, MemoryLocalStore};
pub use memory::MemorySnapshotStore;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksSnapshotStore, StoreConfig};

/// Storage failures. Surfaced to status observers, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("corrupt data: {0}")]
    Corrupt(String),
    #[error("invalid store key {0:?}")]
    InvalidKey(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("storage task failed: {0}")]
    Task(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Task(e.to_string())
    }
}

/// Latest full state per document, owned by rooms.
pub trait SnapshotStore: Send + Sync {
    fn load(&self, id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError>;
    fn save(&self, id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, id: &DocumentId) -> Result<(), StoreError>;
    fn list(&self) -> Result<Vec<DocumentId>, StoreError>;
}

pub async fn load_snapshot(
    store: &Arc<dyn SnapshotStore>,
    id: &DocumentId,
) -> Result<Option<Vec<u8>>, StoreError> {
    let store = store.clone();
    let id = id.clone();
    tokio::task::spawn_blocking(move || store.load(&id)).await?
}

pub async fn save_snapshot(
    store: &Arc<dyn SnapshotStore>,
    id: &DocumentId,
    snapshot: Vec<u8>,
) -> Result<(), StoreError> {
    let store = store.clone();
    let id = id.clone();
    tokio::task::spawn_blocking(move || store.save(&id, &snapshot)).await?
}

/// FNV-1a over 4-byte words, seeded with the payload length.
pub(crate) fn checksum(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    hash ^= bytes.len() as u32;
    hash = hash.wrapping_mul(0x0100_0193);
    for chunk in bytes.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        hash ^= u32::from_le_bytes(word);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

pub(crate) fn compress(bytes: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(bytes)
}

pub(crate) fn decompress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::Compression(e.to_string()))
}
