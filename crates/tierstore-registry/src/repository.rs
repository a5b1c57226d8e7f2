//! Repository abstraction for id-keyed records
//!
//! Every subsystem keeps its policies, rules, checks, and task records in
//! a repository rather than a raw map-plus-lock, so the storage backing
//! (in-memory for tests, persistent in production) stays swappable. The
//! lock inside the in-memory implementation is held only for map access,
//! never across I/O.

use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Keyed record store
pub trait Repository<K, V>: Send + Sync {
    /// Fetch a record by key
    fn get(&self, key: &K) -> Option<V>;

    /// Insert or replace a record
    fn put(&self, key: K, value: V);

    /// Remove a record, returning it if present
    fn remove(&self, key: &K) -> Option<V>;

    /// Snapshot all records
    fn list(&self) -> Vec<V>;

    /// Number of records
    fn len(&self) -> usize;

    /// Whether the repository holds no records
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutate a record in place under the repository lock. Returns false
    /// if the key is absent. The closure must not perform I/O.
    fn modify(&self, key: &K, f: &mut dyn FnMut(&mut V)) -> bool;
}

/// In-memory repository backed by a `BTreeMap` behind a `RwLock`
pub struct MemoryRepository<K, V> {
    items: RwLock<BTreeMap<K, V>>,
}

impl<K: Ord, V> MemoryRepository<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<K: Ord, V> Default for MemoryRepository<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Repository<K, V> for MemoryRepository<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        self.items.read().get(key).cloned()
    }

    fn put(&self, key: K, value: V) {
        self.items.write().insert(key, value);
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.items.write().remove(key)
    }

    fn list(&self) -> Vec<V> {
        self.items.read().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.items.read().len()
    }

    fn modify(&self, key: &K, f: &mut dyn FnMut(&mut V)) -> bool {
        let mut items = self.items.write();
        match items.get_mut(key) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        }
    }
}
