//! Client-side durable mirror of a replica.
//!
//! Each key holds an ordered log of entries (deltas, or one full state after
//! compaction). The file backend stores one log per key:
//! ```text
//! ┌──────────┬──────────┬─────────────┐┌──────────┬── ...
//! │ len u32  │ fnv u32  │ LZ4 payload ││ len u32  │
//! └──────────┴──────────┴─────────────┘└──────────┴── ...
//! ```
//! A torn or corrupt tail (e.g. a crash mid-append) ends the log; the
//! valid prefix is kept and the tail is truncated on the next load.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use super::{checksum, compress, decompress, StoreError};

const FRAME_HEADER: usize = 8;
const MAX_KEY_LEN: usize = 200;

/// Ordered, keyed entry log.
pub trait LocalStore: Send + Sync {
    /// All entries in append order. Missing keys yield an empty list.
    fn load(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError>;
    fn append(&self, key: &str, entry: &[u8]) -> Result<(), StoreError>;
    /// Atomically replace the whole log with a single entry.
    fn replace(&self, key: &str, entry: &[u8]) -> Result<(), StoreError>;
    fn clear(&self, key: &str) -> Result<(), StoreError>;
}

pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

pub(crate) async fn load_entries(
    store: &Arc<dyn LocalStore>,
    key: &str,
) -> Result<Vec<Vec<u8>>, StoreError> {
    let store = store.clone();
    let key = key.to_string();
    tokio::task::spawn_blocking(move || store.load(&key)).await?
}

pub(crate) async fn append_entry(
    store: &Arc<dyn LocalStore>,
    key: &str,
    entry: Vec<u8>,
) -> Result<(), StoreError> {
    let store = store.clone();
    let key = key.to_string();
    tokio::task::spawn_blocking(move || store.append(&key, &entry)).await?
}

pub(crate) async fn replace_entries(
    store: &Arc<dyn LocalStore>,
    key: &str,
    entry: Vec<u8>,
) -> Result<(), StoreError> {
    let store = store.clone();
    let key = key.to_string();
    tokio::task::spawn_blocking(move || store.replace(&key, &entry)).await?
}

pub(crate) async fn clear_entries(
    store: &Arc<dyn LocalStore>,
    key: &str,
) -> Result<(), StoreError> {
    let store = store.clone();
    let key = key.to_string();
    tokio::task::spawn_blocking(move || store.clear(&key)).await?
}

#[derive(Default)]
pub struct MemoryLocalStore {
    logs: Mutex<HashMap<String, Vec<Vec<u8>>>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_count(&self, key: &str) -> usize {
        self.logs.lock().get(key).map_or(0, Vec::len)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.logs.lock().contains_key(key)
    }
}

impl LocalStore for MemoryLocalStore {
    fn load(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        validate_key(key)?;
        Ok(self.logs.lock().get(key).cloned().unwrap_or_default())
    }

    fn append(&self, key: &str, entry: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        self.logs.lock().entry(key.to_string()).or_default().push(entry.to_vec());
        Ok(())
    }

    fn replace(&self, key: &str, entry: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        self.logs.lock().insert(key.to_string(), vec![entry.to_vec()]);
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.logs.lock().remove(key);
        Ok(())
    }
}

/// One append-only file per key.
pub struct FileLocalStore {
    dir: PathBuf,
    sync_writes: bool,
    // Serializes writers so frames are never interleaved.
    write_lock: Mutex<()>,
}

impl FileLocalStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, sync_writes: false, write_lock: Mutex::new(()) })
    }

    /// fsync after every append.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.log"))
    }

    fn frame(entry: &[u8]) -> Result<Vec<u8>, StoreError> {
        let payload = compress(entry);
        let len = u32::try_from(payload.len())
            .map_err(|_| StoreError::Corrupt(format!("entry of {} bytes too large", entry.len())))?;
        let mut out = Vec::with_capacity(FRAME_HEADER + payload.len());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&checksum(&payload).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Parse frames, returning entries and the length of the valid prefix.
    fn parse(bytes: &[u8]) -> (Vec<Vec<u8>>, usize) {
        let mut entries = Vec::new();
        let mut offset = 0;
        while bytes.len() - offset >= FRAME_HEADER {
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[offset..offset + 4]);
            let len = u32::from_le_bytes(word) as usize;
            word.copy_from_slice(&bytes[offset + 4..offset + 8]);
            let expected = u32::from_le_bytes(word);

            let start = offset + FRAME_HEADER;
            let Some(end) = start.checked_add(len).filter(|end| *end <= bytes.len()) else {
                break;
            };
            let payload = &bytes[start..end];
            if checksum(payload) != expected {
                break;
            }
            match decompress(payload) {
                Ok(entry) => entries.push(entry),
                Err(_) => break,
            }
            offset = end;
        }
        (entries, offset)
    }
}

impl LocalStore for FileLocalStore {
    fn load(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        validate_key(key)?;
        let _guard = self.write_lock.lock();
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let (entries, valid) = Self::parse(&bytes);
        if valid < bytes.len() {
            log::warn!(
                "local store {key}: dropping {} bytes of torn or corrupt tail after {} entries",
                bytes.len() - valid,
                entries.len()
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(valid as u64)?;
        }
        Ok(entries)
    }

    fn append(&self, key: &str, entry: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        let frame = Self::frame(entry)?;
        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(key))?;
        file.write_all(&frame)?;
        if self.sync_writes {
            file.sync_data()?;
        }
        Ok(())
    }

    fn replace(&self, key: &str, entry: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        let frame = Self::frame(entry)?;
        let _guard = self.write_lock.lock();
        let tmp = self.dir.join(format!(".{key}.{}.tmp", Uuid::new_v4().simple()));
        let result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&frame)?;
            file.sync_all()?;
            fs::rename(&tmp, self.path_for(key))
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let _guard = self.write_lock.lock();
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
