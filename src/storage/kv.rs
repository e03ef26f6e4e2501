//! Key-value store with a dirty overlay over a committed backend.
//!
//! Every key resolves through two layers. The overlay holds puts and
//! tombstones recorded since the last flush and always wins; the backend
//! holds the committed state. Iteration merges both layers in encoded key
//! order, so a removed key is never observed whether or not it has been
//! flushed yet.

use moka::sync::Cache;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::sync::{Arc, Weak};
use std::vec::IntoIter;
use tracing::{debug, warn};

use crate::codec::{Codec, CodecBuffer, CodecContext};
use crate::storage::backend::{Backend, BackendIter, StorageHint, WriteBatch};
use crate::storage::context::{registry_key, StorageContext, StoreKind};
use crate::storage::{PersistentStore, StorageError, StorageResult};

/// Pending change of a key.
#[derive(Clone, Debug)]
enum Dirty<V> {
    Put(V),
    Delete,
}

#[derive(Clone, Debug)]
struct DirtyEntry<K, V> {
    key: K,
    state: Dirty<V>,
}

/// Overlay keyed by encoded key bytes, so its order matches the backend's.
type Overlay<K, V> = BTreeMap<Vec<u8>, DirtyEntry<K, V>>;

/// Decoded committed values per store, absent keys included.
const COMMITTED_CACHE_CAPACITY: u64 = 4096;

/// An ordered key-value store.
///
/// All methods take `&self`. A store is expected to have one logical writer
/// at a time; readers may run concurrently with it and never see a half
/// applied flush, because `flush` holds the overlay write lock until the
/// backend batch has landed.
pub struct KvStore<K, V> {
    name: String,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    backend: Arc<dyn Backend>,
    overlay: RwLock<Overlay<K, V>>,
    /// Mirrors the backend for keys read since the last write. Only updated
    /// with the overlay lock held, so it never disagrees with a flush.
    committed: Cache<Vec<u8>, Option<V>>,
}

impl<K, V> KvStore<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        name: String,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            name,
            key_codec,
            value_codec,
            backend,
            overlay: RwLock::new(BTreeMap::new()),
            committed: Cache::new(COMMITTED_CACHE_CAPACITY),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hint(&self) -> StorageHint {
        self.backend.hint()
    }

    /// Number of keys with a change not yet flushed.
    pub fn dirty_len(&self) -> usize {
        self.overlay.read().len()
    }

    /// Returns the resolved value of `key`.
    pub fn get(&self, key: &K) -> StorageResult<Option<V>> {
        let encoded = self.encode_key(key)?;
        let overlay = self.overlay.read();
        self.resolve(&overlay, &encoded)
    }

    pub fn contains(&self, key: &K) -> StorageResult<bool> {
        let encoded = self.encode_key(key)?;
        let overlay = self.overlay.read();
        match overlay.get(&encoded) {
            Some(entry) => Ok(matches!(entry.state, Dirty::Put(_))),
            None => Ok(self.backend.contains(&encoded)?),
        }
    }

    /// Records `value` for `key`, replacing any committed value or pending
    /// tombstone.
    pub fn put(&self, key: K, value: V) -> StorageResult<()> {
        let encoded = self.encode_key(&key)?;
        self.overlay.write().insert(
            encoded,
            DirtyEntry {
                key,
                state: Dirty::Put(value),
            },
        );
        Ok(())
    }

    /// Records a tombstone for `key`.
    ///
    /// With `use_return` the previously resolved value is returned, which
    /// costs a lookup; without it the result is always `None`.
    pub fn remove(&self, key: &K, use_return: bool) -> StorageResult<Option<V>> {
        let encoded = self.encode_key(key)?;
        let mut overlay = self.overlay.write();
        let previous = if use_return {
            self.resolve(&overlay, &encoded)?
        } else {
            None
        };
        overlay.insert(
            encoded,
            DirtyEntry {
                key: key.clone(),
                state: Dirty::Delete,
            },
        );
        Ok(previous)
    }

    /// Returns the value of `key`, storing `create(&key)` first if absent.
    pub fn compute_if_absent<F>(&self, key: K, create: F) -> StorageResult<V>
    where
        F: FnOnce(&K) -> V,
    {
        let encoded = self.encode_key(&key)?;
        let mut overlay = self.overlay.write();
        if let Some(value) = self.resolve(&overlay, &encoded)? {
            return Ok(value);
        }
        let value = create(&key);
        overlay.insert(
            encoded,
            DirtyEntry {
                key,
                state: Dirty::Put(value.clone()),
            },
        );
        Ok(value)
    }

    /// Replaces the value of `key` with `remap(&key, current)`. Returning
    /// `None` removes the key.
    pub fn compute<F>(&self, key: K, remap: F) -> StorageResult<Option<V>>
    where
        F: FnOnce(&K, Option<V>) -> Option<V>,
    {
        let encoded = self.encode_key(&key)?;
        let mut overlay = self.overlay.write();
        let current = self.resolve(&overlay, &encoded)?;
        let next = remap(&key, current);
        let state = match &next {
            Some(value) => Dirty::Put(value.clone()),
            None => Dirty::Delete,
        };
        overlay.insert(encoded, DirtyEntry { key, state });
        Ok(next)
    }

    /// Removes every key from both layers.
    pub fn clear(&self) -> StorageResult<()> {
        let mut overlay = self.overlay.write();
        overlay.clear();
        self.committed.invalidate_all();
        self.backend.clear()?;
        debug!("Cleared store {}", self.name);
        Ok(())
    }

    /// Lazily iterates resolved entries in encoded key order.
    ///
    /// The overlay is snapshotted when the iterator is created; the committed
    /// layer is read as the iterator advances.
    pub fn iter(&self) -> KvIter<K, V> {
        let overlay = self.overlay.read();
        let dirty: Vec<(Vec<u8>, DirtyEntry<K, V>)> = overlay
            .iter()
            .map(|(k, entry)| (k.clone(), entry.clone()))
            .collect();
        let committed = self.backend.iter();
        drop(overlay);

        KvIter {
            store: self.name.clone(),
            key_codec: Arc::clone(&self.key_codec),
            value_codec: Arc::clone(&self.value_codec),
            dirty: dirty.into_iter().peekable(),
            committed: committed.peekable(),
            done: false,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = StorageResult<K>> {
        self.iter().map(|entry| entry.map(|(k, _)| k))
    }

    pub fn values(&self) -> impl Iterator<Item = StorageResult<V>> {
        self.iter().map(|entry| entry.map(|(_, v)| v))
    }

    /// Writes the overlay to the backend as one batch and clears it.
    ///
    /// Returns the number of entries written. Flushing a clean store does
    /// nothing and returns 0.
    pub fn flush(&self) -> StorageResult<usize> {
        let mut overlay = self.overlay.write();
        if overlay.is_empty() {
            return Ok(0);
        }

        let ctx = CodecContext::new(&self.name);
        let mut batch = WriteBatch::with_capacity(overlay.len());
        let mut buf = CodecBuffer::new();
        for (key, entry) in overlay.iter() {
            match &entry.state {
                Dirty::Put(value) => {
                    buf.clear();
                    self.value_codec.encode(&ctx, &mut buf, value)?;
                    batch.put(key.clone(), buf.written().to_vec());
                }
                Dirty::Delete => batch.delete(key.clone()),
            }
        }

        let count = batch.len();
        let applied = self.backend.apply(batch).and_then(|_| self.backend.flush());
        if let Err(e) = applied {
            self.committed.invalidate_all();
            return Err(e.into());
        }
        for (key, entry) in std::mem::take(&mut *overlay) {
            let value = match entry.state {
                Dirty::Put(value) => Some(value),
                Dirty::Delete => None,
            };
            self.committed.insert(key, value);
        }

        debug!("Flushed {} entries of store {}", count, self.name);
        Ok(count)
    }

    /// Drops every pending change without writing it.
    pub fn discard(&self) -> usize {
        let mut overlay = self.overlay.write();
        let count = overlay.len();
        overlay.clear();
        if count > 0 {
            debug!("Discarded {} pending entries of store {}", count, self.name);
        }
        count
    }

    fn encode_key(&self, key: &K) -> StorageResult<Vec<u8>> {
        let ctx = CodecContext::new(&self.name);
        let mut buf = CodecBuffer::new();
        self.key_codec.encode(&ctx, &mut buf, key)?;
        Ok(buf.into_bytes())
    }

    fn resolve(&self, overlay: &Overlay<K, V>, encoded: &[u8]) -> StorageResult<Option<V>> {
        if let Some(entry) = overlay.get(encoded) {
            return Ok(match &entry.state {
                Dirty::Put(value) => Some(value.clone()),
                Dirty::Delete => None,
            });
        }
        if let Some(cached) = self.committed.get(encoded) {
            return Ok(cached);
        }
        let value = match self.backend.get(encoded)? {
            Some(bytes) => {
                let ctx = CodecContext::new(&self.name);
                let mut buf = CodecBuffer::wrap(bytes);
                Some(self.value_codec.decode(&ctx, &mut buf)?)
            }
            None => None,
        };
        self.committed.insert(encoded.to_vec(), value.clone());
        Ok(value)
    }
}

impl<K, V> PersistentStore for KvStore<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn save(&self) -> StorageResult<usize> {
        self.flush()
    }
}

impl<K, V> Drop for KvStore<K, V> {
    fn drop(&mut self) {
        let overlay = self.overlay.get_mut();
        if overlay.is_empty() {
            return;
        }

        let ctx = CodecContext::new(&self.name);
        let mut batch = WriteBatch::with_capacity(overlay.len());
        for (key, entry) in std::mem::take(overlay) {
            match entry.state {
                Dirty::Put(value) => {
                    let mut buf = CodecBuffer::new();
                    if let Err(e) = self.value_codec.encode(&ctx, &mut buf, &value) {
                        warn!("Dropping unencodable entry of store {}: {}", self.name, e);
                        continue;
                    }
                    batch.put(key, buf.into_bytes());
                }
                Dirty::Delete => batch.delete(key),
            }
        }

        let result = self
            .backend
            .apply(batch)
            .and_then(|_| self.backend.flush());
        if let Err(e) = result {
            warn!("Failed to flush store {} on drop: {}", self.name, e);
        }
    }
}

/// Merge iterator returned by [`KvStore::iter`].
pub struct KvIter<K, V> {
    store: String,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    dirty: Peekable<IntoIter<(Vec<u8>, DirtyEntry<K, V>)>>,
    committed: Peekable<BackendIter>,
    done: bool,
}

enum Step {
    Dirty,
    Shadowed,
    Committed,
    Failed,
    End,
}

impl<K, V> KvIter<K, V> {
    fn decode_committed(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<(K, V)> {
        let ctx = CodecContext::new(&self.store);
        let key = self.key_codec.decode(&ctx, &mut CodecBuffer::wrap(key))?;
        let value = self.value_codec.decode(&ctx, &mut CodecBuffer::wrap(value))?;
        Ok((key, value))
    }
}

impl<K, V> Iterator for KvIter<K, V> {
    type Item = StorageResult<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let step = match (self.dirty.peek(), self.committed.peek()) {
                (_, Some(Err(_))) => Step::Failed,
                (None, None) => Step::End,
                (Some(_), None) => Step::Dirty,
                (None, Some(Ok(_))) => Step::Committed,
                (Some((dirty_key, _)), Some(Ok((committed_key, _)))) => {
                    match dirty_key.cmp(committed_key) {
                        Ordering::Less => Step::Dirty,
                        Ordering::Equal => Step::Shadowed,
                        Ordering::Greater => Step::Committed,
                    }
                }
            };

            match step {
                Step::End => self.done = true,
                Step::Failed => {
                    self.done = true;
                    if let Some(Err(e)) = self.committed.next() {
                        return Some(Err(StorageError::Backend(e)));
                    }
                }
                Step::Committed => {
                    if let Some(Ok((key, value))) = self.committed.next() {
                        let entry = self.decode_committed(key, value);
                        if entry.is_err() {
                            self.done = true;
                        }
                        return Some(entry);
                    }
                }
                Step::Dirty | Step::Shadowed => {
                    if matches!(step, Step::Shadowed) {
                        self.committed.next();
                    }
                    if let Some((_, entry)) = self.dirty.next() {
                        if let Dirty::Put(value) = entry.state {
                            return Some(Ok((entry.key, value)));
                        }
                    }
                }
            }
        }
        None
    }
}

/// Builder returned by [`StorageContext::create_kv_store`].
pub struct KvStoreBuilder<'c, K, V> {
    ctx: &'c StorageContext,
    name: String,
    hint: StorageHint,
    key_codec: Option<Arc<dyn Codec<K>>>,
    value_codec: Option<Arc<dyn Codec<V>>>,
}

impl<'c, K, V> KvStoreBuilder<'c, K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(ctx: &'c StorageContext, name: String, hint: StorageHint) -> Self {
        Self {
            ctx,
            name,
            hint,
            key_codec: None,
            value_codec: None,
        }
    }

    pub fn with_key_codec<C: Codec<K> + 'static>(mut self, codec: C) -> Self {
        self.key_codec = Some(Arc::new(codec));
        self
    }

    pub fn with_value_codec<C: Codec<V> + 'static>(mut self, codec: C) -> Self {
        self.value_codec = Some(Arc::new(codec));
        self
    }

    /// Opens the backend and registers the store with its context.
    pub fn build(self) -> StorageResult<Arc<KvStore<K, V>>> {
        let key_codec = self.key_codec.ok_or_else(|| {
            StorageError::InvalidArgument(format!("kv store {} has no key codec", self.name))
        })?;
        let value_codec = self.value_codec.ok_or_else(|| {
            StorageError::InvalidArgument(format!("kv store {} has no value codec", self.name))
        })?;

        let backend = self.ctx.kv_backend(&self.name, self.hint)?;
        let store = Arc::new(KvStore::new(
            self.name.clone(),
            key_codec,
            value_codec,
            backend,
        ));
        let weak: Weak<dyn PersistentStore> = Arc::<KvStore<K, V>>::downgrade(&store);
        self.ctx.register(registry_key(StoreKind::Kv, &self.name), weak)?;

        debug!("Built kv store {} with {:?}", self.name, self.hint);
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{of_int, of_string, CodecError};
    use crate::storage::memory::MemoryBackend;

    fn store() -> KvStore<i32, String> {
        KvStore::new(
            "test".to_string(),
            Arc::new(of_int()),
            Arc::new(of_string()),
            Arc::new(MemoryBackend::new()),
        )
    }

    fn entries(store: &KvStore<i32, String>) -> Vec<(i32, String)> {
        store.iter().collect::<StorageResult<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_overlay_wins_over_committed() {
        let store = store();
        store.put(1, "old".to_string()).unwrap();
        assert_eq!(store.flush().unwrap(), 1);

        store.put(1, "new".to_string()).unwrap();
        assert_eq!(store.get(&1).unwrap(), Some("new".to_string()));

        store.remove(&1, false).unwrap();
        assert_eq!(store.get(&1).unwrap(), None);
        assert!(!store.contains(&1).unwrap());
        assert!(entries(&store).is_empty());
    }

    #[test]
    fn test_remove_returns_previous_only_when_asked() {
        let store = store();
        store.put(7, "seven".to_string()).unwrap();
        store.flush().unwrap();

        assert_eq!(store.remove(&7, false).unwrap(), None);
        store.put(7, "seven".to_string()).unwrap();
        assert_eq!(store.remove(&7, true).unwrap(), Some("seven".to_string()));
        assert_eq!(store.remove(&7, true).unwrap(), None);
    }

    #[test]
    fn test_merge_iteration_order() {
        let store = store();
        for i in [5, 1, 3] {
            store.put(i, format!("c{}", i)).unwrap();
        }
        store.flush().unwrap();
        store.put(2, "d2".to_string()).unwrap();
        store.put(3, "d3".to_string()).unwrap();
        store.remove(&5, false).unwrap();

        assert_eq!(
            entries(&store),
            vec![
                (1, "c1".to_string()),
                (2, "d2".to_string()),
                (3, "d3".to_string()),
            ]
        );
        assert_eq!(
            store.keys().collect::<StorageResult<Vec<_>>>().unwrap(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_flush_is_idempotent() {
        let store = store();
        store.put(1, "one".to_string()).unwrap();
        store.remove(&2, false).unwrap();
        assert_eq!(store.dirty_len(), 2);

        assert_eq!(store.flush().unwrap(), 2);
        assert_eq!(store.dirty_len(), 0);
        assert_eq!(store.flush().unwrap(), 0);
        assert_eq!(entries(&store), vec![(1, "one".to_string())]);
    }

    #[test]
    fn test_compute_variants() {
        let store = store();
        let value = store
            .compute_if_absent(1, |k| format!("made-{}", k))
            .unwrap();
        assert_eq!(value, "made-1");
        let value = store.compute_if_absent(1, |_| "other".to_string()).unwrap();
        assert_eq!(value, "made-1");

        let next = store
            .compute(1, |_, current| current.map(|v| v + "!"))
            .unwrap();
        assert_eq!(next, Some("made-1!".to_string()));

        assert_eq!(store.compute(1, |_, _| None).unwrap(), None);
        assert!(!store.contains(&1).unwrap());
    }

    #[test]
    fn test_discard_and_clear() {
        let store = store();
        store.put(1, "one".to_string()).unwrap();
        store.flush().unwrap();
        store.put(2, "two".to_string()).unwrap();

        assert_eq!(store.discard(), 1);
        assert_eq!(entries(&store), vec![(1, "one".to_string())]);

        store.put(3, "three".to_string()).unwrap();
        store.clear().unwrap();
        assert!(entries(&store).is_empty());
        assert_eq!(store.dirty_len(), 0);
    }

    #[test]
    fn test_iterator_snapshot_ignores_later_writes() {
        let store = store();
        store.put(1, "one".to_string()).unwrap();
        let iter = store.iter();
        store.put(2, "two".to_string()).unwrap();

        let seen: Vec<i32> = iter.map(|e| e.unwrap().0).collect();
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn test_committed_reads_are_cached() {
        let backend = Arc::new(MemoryBackend::new());
        let store: KvStore<i32, String> = KvStore::new(
            "cached".to_string(),
            Arc::new(of_int()),
            Arc::new(of_string()),
            Arc::clone(&backend) as Arc<dyn Backend>,
        );
        let key = |k: i32| {
            crate::codec::encode_to_vec(&of_int(), &CodecContext::default(), &k).unwrap()
        };

        store.put(1, "one".to_string()).unwrap();
        store.put(2, "two".to_string()).unwrap();
        store.flush().unwrap();
        assert_eq!(store.get(&3).unwrap(), None);

        // Bytes written behind the store are not seen for cached keys.
        backend.put(&key(1), &[0x05, b'a']).unwrap();
        backend.put(&key(3), &[0x05, b'a']).unwrap();
        assert_eq!(store.get(&1).unwrap(), Some("one".to_string()));
        assert_eq!(store.get(&3).unwrap(), None);

        store.remove(&2, false).unwrap();
        store.flush().unwrap();
        assert_eq!(store.get(&2).unwrap(), None);
        assert_eq!(backend.get(&key(2)).unwrap(), None);

        store.clear().unwrap();
        store.put(1, "uno".to_string()).unwrap();
        store.flush().unwrap();
        assert_eq!(store.get(&1).unwrap(), Some("uno".to_string()));
        assert_eq!(store.get(&3).unwrap(), None);
    }

    #[test]
    fn test_corrupt_committed_value_surfaces() {
        let backend = Arc::new(MemoryBackend::new());
        let encoded_key =
            crate::codec::encode_to_vec(&of_int(), &CodecContext::default(), &1).unwrap();
        backend.put(&encoded_key, &[0x05, b'a']).unwrap();

        let store: KvStore<i32, String> = KvStore::new(
            "broken".to_string(),
            Arc::new(of_int()),
            Arc::new(of_string()),
            backend,
        );
        assert!(matches!(
            store.get(&1),
            Err(StorageError::Codec(CodecError::Underflow { .. }))
        ));
        let mut iter = store.iter();
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }
}
