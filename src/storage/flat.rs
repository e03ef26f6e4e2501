//! Single-record store.
//!
//! The record is materialized at most once per store instance: from the
//! persisted bytes when present, otherwise from the creator. Materialization
//! runs under the store's mutex, so racing first readers agree on one value
//! and the creator never runs twice.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::codec::{Codec, CodecBuffer, CodecContext};
use crate::storage::backend::{Backend, StorageHint};
use crate::storage::context::{registry_key, StorageContext, StoreKind};
use crate::storage::{PersistentStore, StorageError, StorageResult};

type Creator<T> = Box<dyn Fn() -> T + Send + Sync>;

struct FlatState<T> {
    value: Option<T>,
    /// Set when `value` differs from the persisted record.
    modified: bool,
}

pub struct FlatStore<T> {
    name: String,
    codec: Arc<dyn Codec<T>>,
    creator: Creator<T>,
    backend: Arc<dyn Backend>,
    state: Mutex<FlatState<T>>,
}

impl<T> FlatStore<T>
where
    T: Send + 'static,
{
    pub(crate) fn new(
        name: String,
        codec: Arc<dyn Codec<T>>,
        creator: Creator<T>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            name,
            codec,
            creator,
            backend,
            state: Mutex::new(FlatState {
                value: None,
                modified: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hint(&self) -> StorageHint {
        self.backend.hint()
    }

    /// Returns a copy of the record, materializing it on first access.
    pub fn get(&self) -> StorageResult<T>
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Runs `f` against the record without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> StorageResult<R> {
        let mut state = self.state.lock();
        let value = self.materialize(&mut state)?;
        Ok(f(&*value))
    }

    /// Replaces the record with `transform(current)`.
    ///
    /// The record is moved into `transform`; if it panics the next access
    /// materializes the record again.
    pub fn modify(&self, transform: impl FnOnce(T) -> T) -> StorageResult<()> {
        let mut state = self.state.lock();
        self.materialize(&mut state)?;
        let Some(value) = state.value.take() else {
            return Ok(());
        };
        state.value = Some(transform(value));
        state.modified = true;
        Ok(())
    }

    /// Edits the record in place.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> StorageResult<R> {
        let mut state = self.state.lock();
        let result = f(self.materialize(&mut state)?);
        state.modified = true;
        Ok(result)
    }

    /// Forgets the materialized record and any unsaved change.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.value = None;
        state.modified = false;
    }

    /// Recomputes the record through the creator.
    pub fn reindex(&self) {
        let mut state = self.state.lock();
        state.value = Some((self.creator)());
        state.modified = true;
        debug!("Reindexed flat store {}", self.name);
    }

    pub fn is_modified(&self) -> bool {
        self.state.lock().modified
    }

    /// Persists the record when modified, or always when `force` is set.
    ///
    /// Returns whether a record was written. A store that was never
    /// materialized has nothing to write.
    pub fn save(&self, force: bool) -> StorageResult<bool> {
        let mut state = self.state.lock();
        if !(state.modified || force) {
            return Ok(false);
        }
        let Some(value) = state.value.as_ref() else {
            return Ok(false);
        };

        let ctx = CodecContext::new(&self.name);
        let mut buf = CodecBuffer::new();
        self.codec.encode(&ctx, &mut buf, value)?;
        self.backend.put(self.name.as_bytes(), buf.written())?;
        self.backend.flush()?;
        state.modified = false;

        debug!("Saved flat store {} ({} bytes)", self.name, buf.written().len());
        Ok(true)
    }

    /// Borrows the record in place, loading or creating it when absent.
    fn materialize<'a>(&self, state: &'a mut FlatState<T>) -> StorageResult<&'a mut T> {
        let value = match state.value.take() {
            Some(value) => value,
            None => self.load(&mut state.modified)?,
        };
        Ok(state.value.insert(value))
    }

    fn load(&self, modified: &mut bool) -> StorageResult<T> {
        match self.backend.get(self.name.as_bytes())? {
            Some(bytes) => {
                let ctx = CodecContext::new(&self.name);
                let value = self.codec.decode(&ctx, &mut CodecBuffer::wrap(bytes))?;
                debug!("Loaded flat store {}", self.name);
                Ok(value)
            }
            None => {
                *modified = true;
                debug!("Creating flat store {}", self.name);
                Ok((self.creator)())
            }
        }
    }
}

impl<T> PersistentStore for FlatStore<T>
where
    T: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn save(&self) -> StorageResult<usize> {
        Ok(usize::from(FlatStore::save(self, false)?))
    }
}

impl<T> Drop for FlatStore<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.modified {
            return;
        }
        let Some(value) = state.value.as_ref() else {
            return;
        };

        let ctx = CodecContext::new(&self.name);
        let mut buf = CodecBuffer::new();
        let result = self
            .codec
            .encode(&ctx, &mut buf, value)
            .map_err(StorageError::from)
            .and_then(|_| {
                self.backend.put(self.name.as_bytes(), buf.written())?;
                self.backend.flush()?;
                Ok(())
            });
        if let Err(e) = result {
            warn!("Failed to save flat store {} on drop: {}", self.name, e);
        }
    }
}

/// Builder returned by [`StorageContext::create_flat_store`].
pub struct FlatStoreBuilder<'c, T> {
    ctx: &'c StorageContext,
    name: String,
    hint: StorageHint,
    creator: Option<Creator<T>>,
    codec: Option<Arc<dyn Codec<T>>>,
}

impl<'c, T> FlatStoreBuilder<'c, T>
where
    T: Send + 'static,
{
    pub(crate) fn new(ctx: &'c StorageContext, name: String, hint: StorageHint) -> Self {
        Self {
            ctx,
            name,
            hint,
            creator: None,
            codec: None,
        }
    }

    pub fn with_creator(mut self, creator: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.creator = Some(Box::new(creator));
        self
    }

    pub fn with_codec<C: Codec<T> + 'static>(mut self, codec: C) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    pub fn build(self) -> StorageResult<Arc<FlatStore<T>>> {
        let creator = self.creator.ok_or_else(|| {
            StorageError::InvalidArgument(format!("flat store {} has no creator", self.name))
        })?;
        let codec = self.codec.ok_or_else(|| {
            StorageError::InvalidArgument(format!("flat store {} has no codec", self.name))
        })?;

        let backend = self.ctx.flat_backend(&self.name, self.hint)?;
        let store = Arc::new(FlatStore::new(self.name.clone(), codec, creator, backend));
        let weak: Weak<dyn PersistentStore> = Arc::<FlatStore<T>>::downgrade(&store);
        self.ctx.register(registry_key(StoreKind::Flat, &self.name), weak)?;

        debug!("Built flat store {} with {:?}", self.name, self.hint);
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{of_string, IntListCodec};
    use crate::storage::memory::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn counting_store(
        backend: Arc<dyn Backend>,
        calls: Arc<AtomicUsize>,
    ) -> FlatStore<Vec<i32>> {
        FlatStore::new(
            "targets".to_string(),
            Arc::new(IntListCodec),
            Box::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                vec![1, 2, 3]
            }),
            backend,
        )
    }

    #[test]
    fn test_creator_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(counting_store(
            Arc::new(MemoryBackend::new()),
            Arc::clone(&calls),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.get().unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_modify_and_mutate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = counting_store(Arc::new(MemoryBackend::new()), calls);

        store.modify(|mut v| {
            v.push(4);
            v
        })
        .unwrap();
        let len = store.mutate(|v| {
            v.retain(|x| x % 2 == 0);
            v.len()
        })
        .unwrap();
        assert_eq!(len, 2);
        assert_eq!(store.get().unwrap(), vec![2, 4]);
        assert!(store.is_modified());
    }

    #[test]
    fn test_panicking_reader_keeps_record() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = counting_store(Arc::new(MemoryBackend::new()), Arc::clone(&calls));

        let read = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            store.with(|_| -> usize { panic!("reader failed") })
        }));
        assert!(read.is_err());
        let edit = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            store.mutate(|v| {
                v.push(4);
                panic!("writer failed")
            })
        }));
        assert!(edit.is_err());

        assert_eq!(store.get().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_save_then_reset_reloads_record() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let store = counting_store(Arc::clone(&backend), Arc::clone(&calls));

        store.modify(|_| vec![9]).unwrap();
        assert!(store.save(false).unwrap());
        assert!(!store.save(false).unwrap());
        assert!(store.save(true).unwrap());

        store.modify(|_| vec![10]).unwrap();
        store.reset();
        assert_eq!(store.get().unwrap(), vec![9]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reindex_recomputes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = counting_store(Arc::new(MemoryBackend::new()), Arc::clone(&calls));

        store.modify(|_| Vec::new()).unwrap();
        store.reindex();
        assert_eq!(store.get().unwrap(), vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_existing_record_skips_creator() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        backend.put(b"greeting", &[5, b'h', b'e', b'l', b'l', b'o']).unwrap();

        let store: FlatStore<String> = FlatStore::new(
            "greeting".to_string(),
            Arc::new(of_string()),
            Box::new(|| -> String { panic!("creator must not run") }),
            backend,
        );
        assert_eq!(store.with(|s| s.len()).unwrap(), 5);
        assert!(!store.is_modified());
    }
}
