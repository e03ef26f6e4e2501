//! Volatile backend over a shared `BTreeMap`.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use super::backend::{Backend, BackendIter, BackendResult, BatchOp, StorageHint, WriteBatch};

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory ordered byte store. Contents vanish with the last handle.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    map: Arc<RwLock<Map>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn hint(&self) -> StorageHint {
        StorageHint::UseInMemory
    }

    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn contains(&self, key: &[u8]) -> BackendResult<bool> {
        Ok(self.map.read().contains_key(key))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> BackendResult<()> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> BackendResult<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn apply(&self, batch: WriteBatch) -> BackendResult<()> {
        let mut map = self.map.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn iter(&self) -> BackendIter {
        Box::new(MemoryIter {
            map: Arc::clone(&self.map),
            cursor: None,
            done: false,
        })
    }

    fn clear(&self) -> BackendResult<()> {
        self.map.write().clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }

    fn flush(&self) -> BackendResult<()> {
        Ok(())
    }
}

/// Cursor-based iterator: each step takes the read lock and seeks past the
/// last key returned, so no lock is held between calls.
struct MemoryIter {
    map: Arc<RwLock<Map>>,
    cursor: Option<Vec<u8>>,
    done: bool,
}

impl Iterator for MemoryIter {
    type Item = BackendResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let map = self.map.read();
        let next = match &self.cursor {
            None => map.iter().next(),
            Some(last) => map
                .range::<[u8], _>((Bound::Excluded(last.as_slice()), Bound::Unbounded))
                .next(),
        };
        match next {
            Some((k, v)) => {
                let entry = (k.clone(), v.clone());
                drop(map);
                self.cursor = Some(entry.0.clone());
                Some(Ok(entry))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}
