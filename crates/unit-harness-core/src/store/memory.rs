//! In-memory store implementations for tests and embedded hosts.
//!
//! Uses `HashMap` behind `std::sync::RwLock`. [`InMemorySourceStore`]
//! can be told to fail its next fetches, which is how the poller and
//! retry paths are exercised without a real backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{BlobStore, SourceStore, UnitSourceResolver, DEFAULT_CONTAINER};
use crate::models::{MetadataEntity, UnitKind, UnitSource};

// ═══════════════════════════════════════════════════════════════════════
// Source store
// ═══════════════════════════════════════════════════════════════════════

/// In-memory [`SourceStore`] keyed by lower-cased `(partition, row)`.
pub struct InMemorySourceStore {
    rows: RwLock<HashMap<(String, String), MetadataEntity>>,
    failures_pending: AtomicUsize,
    fetches: AtomicUsize,
}

impl InMemorySourceStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            failures_pending: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` fetches fail with a transient error.
    pub fn fail_next_fetches(&self, n: usize) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Number of fetch calls made so far, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn key(entity: &MetadataEntity) -> (String, String) {
        (
            entity.partition_key.to_lowercase(),
            entity.row_key.to_lowercase(),
        )
    }
}

impl Default for InMemorySourceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceStore for InMemorySourceStore {
    async fn fetch_rows_by_category(
        &self,
        category: &str,
        modified_since: DateTime<Utc>,
    ) -> Result<Vec<MetadataEntity>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let pending = self.failures_pending.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures_pending.store(pending - 1, Ordering::SeqCst);
            bail!("source store unavailable (simulated)");
        }

        let category = category.to_lowercase();
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        let mut result: Vec<MetadataEntity> = rows
            .iter()
            .filter(|((partition, _), row)| {
                *partition == category && row.last_modified >= modified_since
            })
            .map(|(_, row)| row.clone())
            .collect();
        result.sort_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.row_key.cmp(&b.row_key))
        });
        Ok(result)
    }

    async fn upsert(&self, entity: &MetadataEntity) -> Result<()> {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        rows.insert(Self::key(entity), entity.clone());
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Blob store
// ═══════════════════════════════════════════════════════════════════════

/// In-memory [`BlobStore`] keyed by `container/name`.
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = blobs.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn blob_key(container: &str, name: &str) -> String {
    format!("{}/{}", container, name)
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get_bytes_by_name(
        &self,
        name: &str,
        container: Option<&str>,
    ) -> Result<Option<Vec<u8>>> {
        let key = blob_key(container.unwrap_or(DEFAULT_CONTAINER), name);
        let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(blobs.get(&key).cloned())
    }

    async fn put_bytes(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.write().unwrap_or_else(|e| e.into_inner());
        blobs.insert(blob_key(DEFAULT_CONTAINER, name), bytes.to_vec());
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Source resolver
// ═══════════════════════════════════════════════════════════════════════

/// In-memory [`UnitSourceResolver`] keyed by `(kind, lower-cased id)`.
pub struct InMemorySourceResolver {
    sources: RwLock<HashMap<(UnitKind, String), UnitSource>>,
}

impl InMemorySourceResolver {
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, source: UnitSource) {
        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
        sources.insert((source.kind, source.id.to_lowercase()), source);
    }
}

impl Default for InMemorySourceResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UnitSourceResolver for InMemorySourceResolver {
    async fn resolve(&self, kind: UnitKind, id: &str) -> Result<Option<UnitSource>> {
        let sources = self.sources.read().unwrap_or_else(|e| e.into_inner());
        Ok(sources.get(&(kind, id.to_lowercase())).cloned())
    }
}
