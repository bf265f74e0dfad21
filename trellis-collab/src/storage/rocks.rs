//! RocksDB-backed snapshot store (cargo feature `rocksdb`).
//!
//! Column families:
//! - `snapshots`: full document state, LZ4 compressed, keyed by document id
//! - `metadata`: [`SnapshotMetadata`] per document (bincode)
//!
//! Snapshot and metadata are written in one batch.

use std::path::PathBuf;
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{compress, decompress, SnapshotStore, StoreError};
use crate::document::DocumentId;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";
const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync every write batch
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("trellis_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
        }
    }
}

impl StoreConfig {
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub snapshot_size: u64,
    pub compressed_size: u64,
    pub saves: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub struct RocksSnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksSnapshotStore {
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            descriptors,
        )?;
        log::info!("rocksdb snapshot store opened at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4 compressed.
        opts.set_compression_type(DBCompressionType::None);
        if name == CF_METADATA {
            opts.optimize_for_point_lookup(config.block_cache_size as u64);
        }
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    pub fn metadata(&self, id: &DocumentId) -> Result<Option<SnapshotMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, id.as_str().as_bytes())? {
            Some(bytes) => {
                let (meta, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }
}

impl SnapshotStore for RocksSnapshotStore {
    fn load(&self, id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, id.as_str().as_bytes())? {
            Some(compressed) => decompress(&compressed).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let compressed = compress(snapshot);

        let previous = self.metadata(id).ok().flatten();
        let meta = SnapshotMetadata {
            snapshot_size: snapshot.len() as u64,
            compressed_size: compressed.len() as u64,
            saves: previous.map_or(1, |m| m.saves + 1),
            updated_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let meta_bytes = bincode::serde::encode_to_vec(&meta, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let key = id.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snapshots, key, &compressed);
        batch.put_cf(cf_meta, key, &meta_bytes);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn delete(&self, id: &DocumentId) -> Result<(), StoreError> {
        let key = id.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_SNAPSHOTS)?, key);
        batch.delete_cf(self.cf(CF_METADATA)?, key);
        self.db.write(batch)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = std::str::from_utf8(&key)
                .ok()
                .and_then(|s| DocumentId::new(s).ok())
                .ok_or_else(|| StoreError::Corrupt("invalid document key".into()))?;
            ids.push(id);
        }
        Ok(ids)
    }
}
