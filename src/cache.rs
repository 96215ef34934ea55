use std::hash::Hash;

use indexmap::IndexMap;
use parking_lot::Mutex;

/// A bounded least-recently-used cache that is safe to share between threads.
///
/// Entries are kept in an [`IndexMap`] ordered from least to most recently used; a hit moves
/// the entry to the back and an insert past capacity evicts from the front. A capacity of zero
/// disables caching entirely.
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    entries: Mutex<IndexMap<K, V>>,
}

impl<K: Hash + Eq, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(IndexMap::with_capacity(capacity.min(64))),
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a key and marks it as most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let idx = entries.get_index_of(key)?;
        let last = entries.len().checked_sub(1)?;
        entries.move_index(idx, last);
        entries.get_index(last).map(|(_, value)| value.clone())
    }

    /// Inserts a value, evicting the least recently used entry when full.
    pub fn insert(&self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        entries.shift_remove(&key);
        while entries.len() >= self.capacity {
            if entries.shift_remove_index(0).is_none() {
                break;
            }
            tracing::trace!(capacity = self.capacity, "evicted least recently used entry");
        }
        entries.insert(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().shift_remove(key)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Returns the cached value or builds, stores and returns a new one.
    ///
    /// The lock is not held while `build` runs, so two threads may build the same entry.
    pub fn get_or_try_insert<E, F: FnOnce() -> Result<V, E>>(&self, key: K, build: F) -> Result<V, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = build()?;
        self.insert(key, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_evicts_least_recently_used() {
        let cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1), "touching a makes b the oldest");
        cache.insert("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_zero_capacity_disables_caching() {
        let cache = LruCache::new(0);
        cache.insert("a", 1);
        assert!(cache.is_empty());
        let built: Result<i32, ()> = cache.get_or_try_insert("a", || Ok(5));
        assert_eq!(built, Ok(5));
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_reinsert_replaces_value() {
        let cache = LruCache::new(3);
        cache.insert("a", 1);
        cache.insert("a", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a"), Some(2));
    }
}
