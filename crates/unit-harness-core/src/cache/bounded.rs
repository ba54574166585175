//! Fixed-capacity FIFO cache for compiled artifacts.
//!
//! The map and its companion queue of keys live under one mutex, so an
//! eviction and the insertion that triggered it are a single step and
//! the two structures never diverge in size.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use super::Cache;

/// Default number of entries kept.
pub const DEFAULT_CAPACITY: usize = 100;

struct Inner<K, V> {
    map: HashMap<K, V>,
    queue: VecDeque<K>,
}

/// A cache holding at most `capacity` entries, evicting the oldest
/// inserted key first.
///
/// Overwriting an existing key replaces its value in place and does not
/// refresh its position in the queue.
pub struct BoundedCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                map: HashMap::with_capacity(capacity),
                queue: VecDeque::with_capacity(capacity),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        // A panic while holding the lock cannot leave map and queue out of
        // step: each mutation below touches both before returning.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Keys in eviction order, oldest first.
    pub fn keys(&self) -> Vec<K> {
        self.lock().queue.iter().cloned().collect()
    }
}

impl<K, V> Default for BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<K, V> Cache<K, V> for BoundedCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn add_or_update(&self, key: K, value: V) {
        let mut inner = self.lock();
        if let Some(slot) = inner.map.get_mut(&key) {
            *slot = value;
            return;
        }
        while inner.queue.len() >= self.capacity {
            match inner.queue.pop_front() {
                Some(oldest) => {
                    inner.map.remove(&oldest);
                }
                None => break,
            }
        }
        inner.queue.push_back(key.clone());
        inner.map.insert(key, value);
        debug_assert_eq!(inner.map.len(), inner.queue.len());
    }

    fn try_get(&self, key: &K) -> Option<V> {
        self.lock().map.get(key).cloned()
    }

    fn try_remove(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        let removed = inner.map.remove(key);
        if removed.is_some() {
            inner.queue.retain(|k| k != key);
        }
        removed
    }

    fn get_all(&self) -> Vec<V> {
        self.lock().map.values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.lock().map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_capacity_plus_one_evicts_oldest() {
        let cache: BoundedCache<String, usize> = BoundedCache::new(3);
        for i in 0..4 {
            cache.add_or_update(format!("k{}", i), i);
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.try_get(&"k0".to_string()), None);
        assert_eq!(cache.keys(), vec!["k1", "k2", "k3"]);
    }

    #[test]
    fn test_default_capacity() {
        let cache: BoundedCache<usize, usize> = BoundedCache::default();
        for i in 0..=DEFAULT_CAPACITY {
            cache.add_or_update(i, i);
        }
        assert_eq!(cache.len(), DEFAULT_CAPACITY);
        assert!(!cache.contains_key(&0));
        assert!(cache.contains_key(&DEFAULT_CAPACITY));
    }

    #[test]
    fn test_update_does_not_enqueue_twice() {
        let cache: BoundedCache<&str, i32> = BoundedCache::new(2);
        cache.add_or_update("a", 1);
        cache.add_or_update("a", 2);
        cache.add_or_update("b", 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.try_get(&"a"), Some(2));
        assert_eq!(cache.keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_remove_keeps_queue_in_step() {
        let cache: BoundedCache<&str, i32> = BoundedCache::new(2);
        cache.add_or_update("a", 1);
        cache.add_or_update("b", 2);
        assert_eq!(cache.try_remove(&"a"), Some(1));
        cache.add_or_update("c", 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.keys(), vec!["b", "c"]);
    }

    #[test]
    fn test_concurrent_inserts_never_exceed_capacity() {
        let cache: Arc<BoundedCache<String, usize>> = Arc::new(BoundedCache::new(10));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        cache.add_or_update(format!("{}-{}", t, i), i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 10);
        assert_eq!(cache.keys().len(), 10);
    }
}
