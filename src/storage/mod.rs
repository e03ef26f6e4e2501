//! Incremental storage engine for sync indices.
//!
//! Stores are created through a [`StorageContext`] and come in two shapes:
//!
//! 1. **[`KvStore`]**: ordered key-value map with a dirty overlay. Writes land
//!    in the overlay and become visible immediately; `flush` moves them to the
//!    backend as one atomic batch.
//! 2. **[`FlatStore`]**: a single record materialized at most once from disk
//!    or from a creator closure.
//!
//! Each store picks its backend once, at build time, from a [`StorageHint`]:
//! a volatile `BTreeMap` or a sled tree inside the context's database.

pub mod backend;
pub mod context;
pub mod flat;
pub mod flusher;
pub mod kv;
pub mod memory;
pub mod paged;

pub use backend::{
    Backend, BackendError, BackendIter, BackendResult, BatchOp, StorageConfig, StorageHint,
    WriteBatch,
};
pub use context::{StorageContext, StorageStats, StoreKind, StoreStats};
pub use flat::{FlatStore, FlatStoreBuilder};
pub use flusher::Flusher;
pub use kv::{KvIter, KvStore, KvStoreBuilder};
pub use memory::MemoryBackend;
pub use paged::PagedBackend;

use thiserror::Error;

use crate::codec::CodecError;

/// Storage engine errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Store already open: {0}")]
    AlreadyOpen(String),

    #[error("Storage context is closed")]
    Closed,
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Backend(BackendError::Sled(err))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A store the context flushes on save and close.
pub(crate) trait PersistentStore: Send + Sync {
    fn name(&self) -> &str;

    /// Writes pending state to the backend; returns the number of records written.
    fn save(&self) -> StorageResult<usize>;
}
