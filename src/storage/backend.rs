//! Raw ordered byte-range storage underneath every store.
//!
//! A backend knows nothing about codecs: it maps encoded key bytes to encoded
//! value bytes, keeps them ordered by key, and applies batches atomically.
//! Two implementations exist and are selected once, when a store is built:
//!
//! - [`MemoryBackend`](super::memory::MemoryBackend): a `BTreeMap` that never
//!   touches disk
//! - [`PagedBackend`](super::paged::PagedBackend): a sled tree inside the
//!   context's database directory

use std::path::PathBuf;
use thiserror::Error;

/// Backend storage errors.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Lazy ordered iterator over `(key, value)` byte pairs.
pub type BackendIter = Box<dyn Iterator<Item = BackendResult<(Vec<u8>, Vec<u8>)>>>;

/// Selects the backend for a store. Fixed at build time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageHint {
    /// Volatile; reopening observes no prior state.
    UseInMemory,
    /// Persisted to the context's paged store; reopening observes the last flush.
    UsePagedStore,
}

/// Configuration for a storage context.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Directory holding one paged database per context. `None` allows
    /// in-memory stores only.
    pub data_dir: Option<PathBuf>,

    /// Page cache size of the paged database in megabytes.
    pub cache_size_mb: u64,

    /// Interval of the background flush of dirty stores, in milliseconds.
    /// 0 disables it; stores are then flushed explicitly and on close.
    pub flush_interval_ms: u64,
}

impl StorageConfig {
    pub fn persistent(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Default::default()
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            cache_size_mb: 64,
            flush_interval_ms: 0,
        }
    }
}

/// A single mutation inside a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Mutations applied to a backend as one atomic unit.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ops: Vec::with_capacity(capacity),
        }
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { key });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// An ordered byte-range store.
pub trait Backend: Send + Sync {
    /// Which hint produced this backend.
    fn hint(&self) -> StorageHint;

    /// Point lookup.
    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>>;

    fn contains(&self, key: &[u8]) -> BackendResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> BackendResult<()>;

    fn delete(&self, key: &[u8]) -> BackendResult<()>;

    /// Applies every operation of `batch` or none of them.
    fn apply(&self, batch: WriteBatch) -> BackendResult<()>;

    /// Iterates all entries in ascending key order.
    fn iter(&self) -> BackendIter;

    /// Removes every entry.
    fn clear(&self) -> BackendResult<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes previously applied writes durable. No-op for volatile backends.
    fn flush(&self) -> BackendResult<()>;
}
