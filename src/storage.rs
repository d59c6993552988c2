//! Durable key-value storage underneath the ledger
//!
//! The engine only needs three primitives: point reads, ordered prefix scans
//! and atomic multi-key writes. Each query in the engine is a single read or a
//! single scan, and each mutation is a single [`WriteBatch`], which is what
//! gives readers a consistent view without taking the engine's write lock.

use crate::config::{CompressionType, StorageConfig};
use crate::errors::{LotteryResult, StorageError};
use rocksdb::{Direction, IteratorMode, Options, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// A set of puts and deletes applied all-or-nothing
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

#[derive(Debug, Clone)]
enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Abstract durable store the ledger is written against
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> LotteryResult<Option<Vec<u8>>>;

    /// All entries whose key starts with `prefix`, in ascending key order
    fn scan_prefix(&self, prefix: &[u8]) -> LotteryResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply every operation in `batch` atomically
    fn write(&self, batch: WriteBatch) -> LotteryResult<()>;
}

/// Ordered in-memory store for tests and ephemeral runs
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StorageError {
    StorageError::ReadFailed("memory store lock poisoned".to_string())
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> LotteryResult<Option<Vec<u8>>> {
        let data = self.data.read().map_err(|_| poisoned())?;
        Ok(data.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> LotteryResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.read().map_err(|_| poisoned())?;
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, batch: WriteBatch) -> LotteryResult<()> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::WriteFailed("memory store lock poisoned".to_string()))?;
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => {
                    data.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    data.remove(&k);
                }
            }
        }
        Ok(())
    }
}

/// RocksDB-backed store; write batches are atomic at the database level
#[derive(Clone)]
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> LotteryResult<Self> {
        Self::open_with_config(path, &StorageConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: &StorageConfig) -> LotteryResult<Self> {
        let path = path.as_ref();
        if config.clear_on_start && path.exists() {
            tracing::warn!(path = %path.display(), "Clearing ledger store on start");
            DB::destroy(&Options::default(), path)
                .map_err(|e| StorageError::DatabaseOpenFailed(e.to_string()))?;
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        opts.set_compression_type(match config.compression_type {
            CompressionType::None => rocksdb::DBCompressionType::None,
            CompressionType::Snappy => rocksdb::DBCompressionType::Snappy,
            CompressionType::Lz4 => rocksdb::DBCompressionType::Lz4,
            CompressionType::Zstd => rocksdb::DBCompressionType::Zstd,
        });

        let db = DB::open(&opts, path).map_err(|e| StorageError::DatabaseOpenFailed(e.to_string()))?;
        tracing::debug!(path = %path.display(), "Opened ledger store");
        Ok(Self { db: Arc::new(db) })
    }
}

impl KvStore for RocksStore {
    fn get(&self, key: &[u8]) -> LotteryResult<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|e| StorageError::ReadFailed(e.to_string()).into())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> LotteryResult<Vec<(Vec<u8>, Vec<u8>)>> {
        // Iterators read from an implicit snapshot, so one scan is consistent.
        let mut rows = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    fn write(&self, batch: WriteBatch) -> LotteryResult<()> {
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => rocks_batch.put(k, v),
                BatchOp::Delete(k) => rocks_batch.delete(k),
            }
        }
        self.db
            .write(rocks_batch)
            .map_err(|e| StorageError::WriteFailed(e.to_string()).into())
    }
}
