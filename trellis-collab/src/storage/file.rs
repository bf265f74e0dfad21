//! Snapshot store with one file per document.
//!
//! File layout:
//! ```text
//! ┌───────┬─────────┬────────────┬───────────────────────────────┐
//! │ magic │ version │ checksum   │ LZ4 payload (size-prepended)  │
//! │ 4 B   │ 1 B     │ u32 LE     │ variable                      │
//! └───────┴─────────┴────────────┴───────────────────────────────┘
//! ```
//! Writes go to a temporary file that is synced and then renamed over the
//! previous snapshot, so a crash leaves either the old or the new state.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::{checksum, compress, decompress, SnapshotStore, StoreError};
use crate::document::DocumentId;

const MAGIC: &[u8; 4] = b"TRSN";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 9;
const EXTENSION: &str = "snap";

pub struct FileSnapshotStore {
    dir: PathBuf,
    sync_writes: bool,
}

impl FileSnapshotStore {
    /// Open (creating if needed) a snapshot directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        log::info!("snapshot store opened at {}", dir.display());
        Ok(Self { dir, sync_writes: true })
    }

    /// Skip fsync on save. Faster, loses the latest writes on power failure.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &DocumentId) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", id.as_str()))
    }

    fn encode(snapshot: &[u8]) -> Vec<u8> {
        let payload = compress(snapshot);
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&checksum(&payload).to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(StoreError::Corrupt("missing snapshot header".into()));
        }
        if bytes[4] != FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!("unknown snapshot version {}", bytes[4])));
        }
        let mut sum = [0u8; 4];
        sum.copy_from_slice(&bytes[5..9]);
        let payload = &bytes[HEADER_LEN..];
        if u32::from_le_bytes(sum) != checksum(payload) {
            return Err(StoreError::Corrupt("snapshot checksum mismatch".into()));
        }
        decompress(payload)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self, id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(id)) {
            Ok(bytes) => Self::decode(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError> {
        let target = self.path_for(id);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", id.as_str(), Uuid::new_v4().simple()));
        let encoded = Self::encode(snapshot);

        let written = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            if self.sync_writes {
                file.sync_all()?;
            }
            fs::rename(&tmp, &target)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        if self.sync_writes {
            // Persist the rename itself. Not supported on every platform.
            if let Ok(dir) = fs::File::open(&self.dir) {
                let _ = dir.sync_all();
            }
        }
        log::debug!("saved snapshot {id} ({} bytes, {} on disk)", snapshot.len(), encoded.len());
        Ok(())
    }

    fn delete(&self, id: &DocumentId) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<DocumentId>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| DocumentId::new(s).ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
