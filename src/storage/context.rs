//! Storage context: owner and lifecycle of a set of stores.
//!
//! A context is named; its persistent stores live in one sled database at
//! `<data_dir>/<name>.db`, opened lazily by the first store that needs it.
//! Stores are handed out as `Arc`s and tracked weakly, so the context can
//! flush every live store on [`StorageContext::save`], on the optional
//! periodic flusher tick, and when it is closed or dropped.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::storage::backend::{Backend, StorageConfig, StorageHint};
use crate::storage::flat::FlatStoreBuilder;
use crate::storage::flusher::Flusher;
use crate::storage::kv::KvStoreBuilder;
use crate::storage::memory::MemoryBackend;
use crate::storage::paged::{self, PagedBackend, FLAT_TREE, KV_TREE_PREFIX};
use crate::storage::{PersistentStore, StorageError, StorageResult};

/// Live stores of a context, keyed by `kv.<name>` or `flat.<name>`.
pub(crate) type Registry = Arc<DashMap<String, Weak<dyn PersistentStore>>>;

type DisposeHook = Box<dyn FnOnce() + Send>;

/// Saves every live store in `stores`, pruning entries whose store is gone.
///
/// Every store is attempted; the first failure is returned.
pub(crate) fn save_all(stores: &Registry) -> StorageResult<usize> {
    let mut live: Vec<Arc<dyn PersistentStore>> = Vec::new();
    stores.retain(|_, weak| match weak.upgrade() {
        Some(store) => {
            live.push(store);
            true
        }
        None => false,
    });

    let mut written = 0;
    let mut first_error = None;
    for store in &live {
        match store.save() {
            Ok(count) => written += count,
            Err(e) => {
                warn!("Failed to save store {}: {}", store.name(), e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(written),
    }
}

/// Kind of a persisted store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum StoreKind {
    Kv,
    Flat,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Kv => write!(f, "kv"),
            StoreKind::Flat => write!(f, "flat"),
        }
    }
}

/// Committed state of one persisted store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreStats {
    pub name: String,
    pub kind: StoreKind,
    /// Committed entries; pending overlay changes are not counted.
    pub entries: usize,
}

/// Summary of a context's paged database.
#[derive(Clone, Debug, Default)]
pub struct StorageStats {
    pub context: String,
    pub stores: Vec<StoreStats>,
    pub size_on_disk: u64,
}

/// Owner of a set of named stores.
pub struct StorageContext {
    name: String,
    config: StorageConfig,
    db: Mutex<Option<sled::Db>>,
    stores: Registry,
    flusher: Mutex<Option<Flusher>>,
    /// `None` once close has run the registered hooks.
    dispose_hooks: Mutex<Option<Vec<DisposeHook>>>,
    closed: AtomicBool,
}

impl StorageContext {
    /// Creates a context. The paged database is not opened until a
    /// persistent store is built.
    pub fn open(name: &str, config: StorageConfig) -> StorageResult<Self> {
        validate_name("context", name)?;

        let ctx = Self {
            name: name.to_string(),
            config,
            db: Mutex::new(None),
            stores: Registry::default(),
            flusher: Mutex::new(None),
            dispose_hooks: Mutex::new(Some(Vec::new())),
            closed: AtomicBool::new(false),
        };
        if ctx.config.flush_interval_ms > 0 {
            *ctx.flusher.lock() = Some(Flusher::start(
                ctx.name.clone(),
                Arc::clone(&ctx.stores),
                Duration::from_millis(ctx.config.flush_interval_ms),
            ));
        }

        info!(
            "Storage context {} opened (data_dir={:?}, flush_interval_ms={})",
            ctx.name, ctx.config.data_dir, ctx.config.flush_interval_ms
        );
        Ok(ctx)
    }

    /// A context that only supports in-memory stores.
    pub fn in_memory(name: &str) -> StorageResult<Self> {
        Self::open(name, StorageConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Path of the paged database, if the context has a data directory.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.config
            .data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.db", self.name)))
    }

    /// Starts building a key-value store.
    pub fn create_kv_store<K, V>(&self, name: &str, hint: StorageHint) -> KvStoreBuilder<'_, K, V>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        KvStoreBuilder::new(self, name.to_string(), hint)
    }

    /// Starts building a single-record store.
    pub fn create_flat_store<T>(&self, name: &str, hint: StorageHint) -> FlatStoreBuilder<'_, T>
    where
        T: Send + 'static,
    {
        FlatStoreBuilder::new(self, name.to_string(), hint)
    }

    /// Registers `hook` to run once the context has been closed and its
    /// stores flushed. Runs immediately on a closed context.
    pub fn on_dispose(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.dispose_hooks.lock();
        match hooks.as_mut() {
            Some(pending) => pending.push(Box::new(hook)),
            None => {
                drop(hooks);
                hook();
            }
        }
    }

    /// Flushes every live store. Returns the number of records written.
    pub fn save(&self) -> StorageResult<usize> {
        self.ensure_open()?;
        let written = save_all(&self.stores)?;
        debug!("Saved context {}: {} records", self.name, written);
        Ok(written)
    }

    /// Flushes all stores, stops the flusher and runs dispose hooks.
    ///
    /// Closing twice is a no-op. Stores handed out earlier stay readable;
    /// new stores can no longer be created.
    pub fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let flusher = self.flusher.lock().take();
        if let Some(mut flusher) = flusher {
            flusher.stop();
        }

        let result = save_all(&self.stores).and_then(|written| {
            if let Some(db) = self.db.lock().take() {
                db.flush()?;
            }
            Ok(written)
        });

        let hooks = self.dispose_hooks.lock().take();
        for hook in hooks.into_iter().flatten() {
            hook();
        }

        match &result {
            Ok(written) => info!(
                "Storage context {} closed ({} records flushed)",
                self.name, written
            ),
            Err(e) => warn!("Storage context {} closed with error: {}", self.name, e),
        }
        result.map(|_| ())
    }

    /// Lists the persisted stores of this context with their committed sizes.
    ///
    /// A context without a data directory has no persisted stores.
    pub fn stats(&self) -> StorageResult<StorageStats> {
        self.ensure_open()?;
        if self.config.data_dir.is_none() {
            return Ok(StorageStats {
                context: self.name.clone(),
                ..Default::default()
            });
        }

        let db = self.database()?;
        let mut stores = Vec::new();
        for tree_name in db.tree_names() {
            let tree_name = String::from_utf8_lossy(&tree_name).into_owned();
            if let Some(store) = tree_name.strip_prefix(KV_TREE_PREFIX) {
                let tree = db.open_tree(&tree_name)?;
                stores.push(StoreStats {
                    name: store.to_string(),
                    kind: StoreKind::Kv,
                    entries: tree.len(),
                });
            } else if tree_name == FLAT_TREE {
                let tree = db.open_tree(FLAT_TREE)?;
                for key in tree.iter().keys() {
                    stores.push(StoreStats {
                        name: String::from_utf8_lossy(&key?).into_owned(),
                        kind: StoreKind::Flat,
                        entries: 1,
                    });
                }
            }
        }
        stores.sort_by(|a, b| (a.kind, &a.name).cmp(&(b.kind, &b.name)));

        Ok(StorageStats {
            context: self.name.clone(),
            stores,
            size_on_disk: db.size_on_disk()?,
        })
    }

    /// Deletes the persisted data of a store that is not currently open.
    ///
    /// Returns whether anything was deleted.
    pub fn drop_store(&self, name: &str, kind: StoreKind) -> StorageResult<bool> {
        self.ensure_open()?;
        let key = registry_key(kind, name);
        if let Some(weak) = self.stores.get(&key) {
            if weak.strong_count() > 0 {
                return Err(StorageError::AlreadyOpen(name.to_string()));
            }
        }

        let db = self.database()?;
        let dropped = match kind {
            StoreKind::Kv => db.drop_tree(format!("{}{}", KV_TREE_PREFIX, name))?,
            StoreKind::Flat => db.open_tree(FLAT_TREE)?.remove(name)?.is_some(),
        };
        db.flush()?;

        info!("Dropped {} store {} from {}: {}", kind, name, self.name, dropped);
        Ok(dropped)
    }

    pub(crate) fn kv_backend(
        &self,
        name: &str,
        hint: StorageHint,
    ) -> StorageResult<Arc<dyn Backend>> {
        self.ensure_open()?;
        validate_name("store", name)?;
        match hint {
            StorageHint::UseInMemory => Ok(Arc::new(MemoryBackend::new())),
            StorageHint::UsePagedStore => {
                let db = self.database()?;
                let backend = PagedBackend::open(&db, &format!("{}{}", KV_TREE_PREFIX, name))?;
                Ok(Arc::new(backend))
            }
        }
    }

    pub(crate) fn flat_backend(
        &self,
        name: &str,
        hint: StorageHint,
    ) -> StorageResult<Arc<dyn Backend>> {
        self.ensure_open()?;
        validate_name("store", name)?;
        match hint {
            StorageHint::UseInMemory => Ok(Arc::new(MemoryBackend::new())),
            StorageHint::UsePagedStore => {
                let db = self.database()?;
                Ok(Arc::new(PagedBackend::open(&db, FLAT_TREE)?))
            }
        }
    }

    /// Tracks a newly built store. Fails if a live store already uses `key`.
    pub(crate) fn register(
        &self,
        key: String,
        store: Weak<dyn PersistentStore>,
    ) -> StorageResult<()> {
        match self.stores.entry(key) {
            Entry::Occupied(mut entry) => {
                if entry.get().strong_count() > 0 {
                    return Err(StorageError::AlreadyOpen(entry.key().clone()));
                }
                entry.insert(store);
            }
            Entry::Vacant(entry) => {
                entry.insert(store);
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn database(&self) -> StorageResult<sled::Db> {
        let mut slot = self.db.lock();
        if let Some(db) = slot.as_ref() {
            return Ok(db.clone());
        }

        let path = self.database_path().ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "context {} has no data directory for paged stores",
                self.name
            ))
        })?;
        let db = paged::open_database(&path, self.config.cache_size_mb)?;
        *slot = Some(db.clone());
        Ok(db)
    }
}

impl Drop for StorageContext {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close storage context {}: {}", self.name, e);
        }
    }
}

pub(crate) fn registry_key(kind: StoreKind, name: &str) -> String {
    format!("{}.{}", kind, name)
}

fn validate_name(what: &str, name: &str) -> StorageResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(StorageError::InvalidArgument(format!(
            "invalid {} name: {:?}",
            what, name
        )));
    }
    Ok(())
}
