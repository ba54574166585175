//! Thread-safe keyed caches.
//!
//! [`Cache`] is the common contract: last-writer-wins `add_or_update`,
//! `try_get`, `try_remove`, and a weakly consistent `get_all` snapshot.
//! Implementations are safe for concurrent readers and writers without
//! external locking.
//!
//! | Type | Backing | Use |
//! |------|---------|-----|
//! | [`KeyedCache`] | `DashMap` | compiled-unit index, metadata categories, lookups |
//! | [`BoundedCache`] | map + FIFO queue under one lock | recently compiled artifacts |
//! | [`TranslationCache`] | [`KeyedCache`] | translated text by language and content hash |
//! | [`ClusterMappingCache`] | [`KeyedCache`] | cross-region cluster name mappings |

pub mod bounded;
pub mod lookup;

pub use bounded::BoundedCache;
pub use lookup::{ClusterMappingCache, FragmentScriptCache, TranslationCache};

use std::hash::Hash;

use dashmap::DashMap;

/// Common contract of every cache in the harness.
pub trait Cache<K, V>: Send + Sync {
    /// Insert or overwrite the value for `key`. One writer wins entirely.
    fn add_or_update(&self, key: K, value: V);

    fn try_get(&self, key: &K) -> Option<V>;

    fn try_remove(&self, key: &K) -> Option<V>;

    /// Snapshot of all values. Writes racing with the snapshot may or may
    /// not be reflected.
    fn get_all(&self) -> Vec<V>;

    fn len(&self) -> usize;

    fn contains_key(&self, key: &K) -> bool {
        self.try_get(key).is_some()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A concurrent map with an optional key normalizer.
///
/// Every key passed in is normalized before it touches the map, so a
/// case-insensitive cache stores and finds `"CpuCheck"` and `"cpucheck"`
/// under the same entry.
pub struct KeyedCache<K, V> {
    map: DashMap<K, V>,
    normalize: Option<fn(&K) -> K>,
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
            normalize: None,
        }
    }

    pub fn with_normalizer(normalize: fn(&K) -> K) -> Self {
        Self {
            map: DashMap::new(),
            normalize: Some(normalize),
        }
    }

    fn key(&self, key: &K) -> K {
        match self.normalize {
            Some(f) => f(key),
            None => key.clone(),
        }
    }

    /// Snapshot of all `(key, value)` pairs, keys in normalized form.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

impl<V: Clone> KeyedCache<String, V> {
    /// A string-keyed cache that ignores case.
    pub fn case_insensitive() -> Self {
        Self::with_normalizer(|k| k.to_lowercase())
    }
}

impl<K, V> Default for KeyedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Cache<K, V> for KeyedCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn add_or_update(&self, key: K, value: V) {
        let key = self.key(&key);
        self.map.insert(key, value);
    }

    fn try_get(&self, key: &K) -> Option<V> {
        self.map.get(&self.key(key)).map(|v| v.value().clone())
    }

    fn try_remove(&self, key: &K) -> Option<V> {
        self.map.remove(&self.key(key)).map(|(_, v)| v)
    }

    fn get_all(&self) -> Vec<V> {
        self.map.iter().map(|e| e.value().clone()).collect()
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(&self.key(key))
    }
}
