//! Bounded In-Memory Cache
//!
//! A small least-recently-used cache behind a single mutex. Used for
//! recently read run records and for parsed workflow definitions.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

/// Thread-safe LRU cache with a fixed capacity.
///
/// Values are cloned out on read so no lock is held by callers.
/// A capacity of zero disables caching entirely.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    inner: Mutex<CacheState<K, V>>,
    capacity: usize,
}

#[derive(Debug)]
struct CacheState<K, V> {
    entries: HashMap<K, V>,
    /// Keys from least to most recently used
    order: VecDeque<K>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a clone of the cached value and marks it recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.lock();
        let value = state.entries.get(key).cloned()?;
        touch(&mut state.order, key);
        Some(value)
    }

    /// Inserts or replaces a value, evicting the least recently used
    /// entry when the cache is full.
    pub fn insert(&self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }

        let mut state = self.lock();
        if state.entries.insert(key.clone(), value).is_some() {
            touch(&mut state.order, &key);
            return;
        }

        state.order.push_back(key);
        while state.entries.len() > self.capacity {
            match state.order.pop_front() {
                Some(oldest) => {
                    state.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Removes a single entry.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.lock();
        let removed = state.entries.remove(key);
        if removed.is_some() {
            state.order.retain(|k| k != key);
        }
        removed
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn touch<K: PartialEq + Clone>(order: &mut VecDeque<K>, key: &K) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        if let Some(k) = order.remove(pos) {
            order.push_back(k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache = BoundedCache::new(2);
        cache.insert("a".to_string(), 1);

        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);

        // Touch "a" so "b" becomes the eviction candidate
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn test_replace_does_not_grow() {
        let cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("a", 10);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a"), Some(10));
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = BoundedCache::new(4);
        cache.insert(1, "one");
        cache.insert(2, "two");

        assert_eq!(cache.remove(&1), Some("one"));
        assert_eq!(cache.remove(&1), None);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_caches_nothing() {
        let cache = BoundedCache::new(0);
        cache.insert("a", 1);
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 0);
    }
}
