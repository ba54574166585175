//! Small lookup caches that save redundant outbound calls.

use std::collections::HashMap;

use super::{Cache, KeyedCache};
use crate::models::content_hash;

/// Translated text keyed by `(target language, sha256(content))`.
///
/// Hashing the content keeps keys small and lets two callers asking for
/// the same text share one translation.
pub struct TranslationCache {
    inner: KeyedCache<(String, String), Vec<String>>,
}

impl TranslationCache {
    pub fn new() -> Self {
        Self {
            inner: KeyedCache::with_normalizer(|(lang, hash)| (lang.to_lowercase(), hash.clone())),
        }
    }

    pub fn key(language: &str, content: &str) -> (String, String) {
        (language.to_string(), content_hash(content))
    }

    pub fn add_or_update(&self, language: &str, content: &str, translated: Vec<String>) {
        self.inner
            .add_or_update(Self::key(language, content), translated);
    }

    pub fn try_get(&self, language: &str, content: &str) -> Option<Vec<String>> {
        self.inner.try_get(&Self::key(language, content))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new()
    }
}

/// One cluster mapping row, e.g. `{ "publicCloud": "wawsus", "usgov": "wawsusgov" }`.
pub type ClusterMapping = HashMap<String, String>;

/// Cross-region cluster name mappings keyed by region, ignoring case.
pub struct ClusterMappingCache {
    inner: KeyedCache<String, Vec<ClusterMapping>>,
}

impl ClusterMappingCache {
    pub fn new() -> Self {
        Self {
            inner: KeyedCache::case_insensitive(),
        }
    }

    pub fn add_or_update(&self, region: &str, mappings: Vec<ClusterMapping>) {
        self.inner.add_or_update(region.to_string(), mappings);
    }

    pub fn try_get(&self, region: &str) -> Option<Vec<ClusterMapping>> {
        self.inner.try_get(&region.to_string())
    }

    /// Look up `target` for the row whose `source` column equals `cluster`.
    pub fn map_cluster(&self, region: &str, source: &str, cluster: &str, target: &str) -> Option<String> {
        self.try_get(region)?.into_iter().find_map(|row| {
            let matches = row
                .get(source)
                .map(|v| v.eq_ignore_ascii_case(cluster))
                .unwrap_or(false);
            if matches {
                row.get(target).cloned()
            } else {
                None
            }
        })
    }
}

impl Default for ClusterMappingCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Fragment source text keyed by fragment identifier, ignoring case.
pub type FragmentScriptCache = KeyedCache<String, String>;
