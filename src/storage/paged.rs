//! Sled-backed persistent backend.
//!
//! Every context owns one sled database at `<data_dir>/<context>.db`. Each
//! persistent KV store is a sled tree named `kv.<store>`; persistent flat
//! stores share the tree `flat`, one record per store name. Sled's page cache
//! and log structure provide point lookup, ordered iteration and deletion
//! that survive a process restart.

use std::io::ErrorKind;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::backend::{
    Backend, BackendError, BackendIter, BackendResult, BatchOp, StorageHint, WriteBatch,
};

/// Tree prefix for KV stores.
pub(crate) const KV_TREE_PREFIX: &str = "kv.";

/// Tree holding every flat store record.
pub(crate) const FLAT_TREE: &str = "flat";

const LOCK_RETRY_STEP: Duration = Duration::from_millis(20);
const LOCK_RETRY_LIMIT: Duration = Duration::from_secs(5);

/// Opens (or creates) the paged database of a context.
pub(crate) fn open_database(path: &Path, cache_size_mb: u64) -> BackendResult<sled::Db> {
    debug!("Opening paged store at {:?}", path);

    std::fs::create_dir_all(path)?;

    let config = sled::Config::new()
        .path(path)
        .cache_capacity(cache_size_mb * 1024 * 1024);

    // sled releases the file lock of a dropped database from a background
    // thread, so a reopen right after a close can briefly find it held.
    let started = Instant::now();
    let mut attempts = 0u32;
    let db = loop {
        match config.open() {
            Ok(db) => break db,
            Err(e) if is_lock_contention(&e) && started.elapsed() < LOCK_RETRY_LIMIT => {
                attempts += 1;
                debug!("Paged store at {:?} still locked, retry {}", path, attempts);
                thread::sleep(LOCK_RETRY_STEP);
            }
            Err(e) => {
                return Err(BackendError::Config(format!(
                    "Failed to open paged store: {}",
                    e
                )))
            }
        }
    };

    info!(
        "Paged store opened at {:?} with cache_size={}MB, recovered={}",
        path,
        cache_size_mb,
        db.was_recovered()
    );

    Ok(db)
}

/// Whether `error` is sled failing to take the database file lock.
fn is_lock_contention(error: &sled::Error) -> bool {
    match error {
        sled::Error::Io(io) => {
            io.kind() == ErrorKind::WouldBlock
                || io.to_string().contains("could not acquire lock")
        }
        _ => false,
    }
}

/// A persistent backend over one sled tree.
#[derive(Clone)]
pub struct PagedBackend {
    tree: sled::Tree,
}

impl PagedBackend {
    /// Opens the tree `name` inside `db`.
    pub fn open(db: &sled::Db, name: &str) -> BackendResult<Self> {
        let tree = db.open_tree(name)?;
        Ok(Self { tree })
    }

    pub fn tree_name(&self) -> String {
        String::from_utf8_lossy(&self.tree.name()).into_owned()
    }
}

impl Backend for PagedBackend {
    fn hint(&self) -> StorageHint {
        StorageHint::UsePagedStore
    }

    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn contains(&self, key: &[u8]) -> BackendResult<bool> {
        Ok(self.tree.contains_key(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> BackendResult<()> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> BackendResult<()> {
        self.tree.remove(key)?;
        Ok(())
    }

    fn apply(&self, batch: WriteBatch) -> BackendResult<()> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => sled_batch.insert(key, value),
                BatchOp::Delete { key } => sled_batch.remove(key),
            }
        }
        self.tree.apply_batch(sled_batch)?;
        Ok(())
    }

    fn iter(&self) -> BackendIter {
        Box::new(self.tree.iter().map(|item| {
            item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                .map_err(BackendError::from)
        }))
    }

    fn clear(&self) -> BackendResult<()> {
        self.tree.clear()?;
        Ok(())
    }

    fn len(&self) -> usize {
        self.tree.len()
    }

    fn flush(&self) -> BackendResult<()> {
        let bytes = self.tree.flush()?;
        debug!("Flushed {} bytes of {}", bytes, self.tree_name());
        Ok(())
    }
}
