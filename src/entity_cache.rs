//! In-process snapshot of metadata entities, refreshed from a
//! [`SourceStore`].
//!
//! # Refresh protocol
//!
//! Each category carries a startup flag, set at construction. A refresh
//! of a flagged (or never loaded) category fetches every row and replaces
//! the snapshot outright, then clears the flag. Any other refresh fetches
//! rows modified in the last `lookback` and merges them into the current
//! snapshot with [`merge_incremental`].
//!
//! Refreshes of one category are serialized; different categories refresh
//! concurrently. A snapshot is published as a whole, so readers see either
//! the previous or the new list, never a partial one.
//!
//! # Removed rows
//!
//! A row that comes back disabled is recorded as removed, with its
//! modification time, until a later refresh returns it enabled again.
//! Compiled units are evicted against this record (see
//! [`MetadataEntityCache::removed_rows`]).
//!
//! # Failure semantics
//!
//! Fetches go through [`retry_async`]. A poll cycle that still fails is
//! logged and leaves the previous snapshot in place. A read of a category
//! that was never loaded triggers a direct refresh and surfaces its
//! failure as [`UnitError::DependencyFailure`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use unit_harness_core::cache::{Cache, KeyedCache};
use unit_harness_core::filter::entity_is_applicable;
use unit_harness_core::merge::{merge_incremental, replace_category};
use unit_harness_core::models::{MetadataEntity, ResourceContext};
use unit_harness_core::store::{SourceStore, EPOCH};

use crate::config::Config;
use crate::error::UnitError;
use crate::retry::{retry_async, RetryPolicy};

/// Poller settings.
#[derive(Debug, Clone)]
pub struct EntityCacheSettings {
    pub interval: Duration,
    pub lookback: Duration,
    pub categories: Vec<String>,
    pub retry: RetryPolicy,
}

impl EntityCacheSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.poller.interval_secs),
            lookback: Duration::from_secs(config.poller.lookback_secs),
            categories: config.poller.categories.clone(),
            retry: RetryPolicy::from_config(&config.retry),
        }
    }
}

impl Default for EntityCacheSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            lookback: Duration::from_secs(300),
            categories: vec!["unit".to_string(), "fragment".to_string()],
            retry: RetryPolicy::default(),
        }
    }
}

/// How a refresh was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Replace,
    Merge,
}

impl std::fmt::Display for RefreshMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshMode::Replace => f.write_str("replace"),
            RefreshMode::Merge => f.write_str("merge"),
        }
    }
}

/// Result of one category refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub mode: RefreshMode,
    pub fetched: usize,
    pub cached: usize,
    /// Rows newly recorded as disabled.
    pub removed: usize,
}

pub struct MetadataEntityCache {
    store: Arc<dyn SourceStore>,
    snapshots: KeyedCache<String, Arc<Vec<MetadataEntity>>>,
    startup: Mutex<HashSet<String>>,
    /// category → lower-cased row key → when the row was removed.
    removed: Mutex<HashMap<String, HashMap<String, DateTime<Utc>>>>,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    settings: EntityCacheSettings,
}

impl MetadataEntityCache {
    pub fn new(store: Arc<dyn SourceStore>, settings: EntityCacheSettings) -> Self {
        let startup = settings
            .categories
            .iter()
            .map(|c| c.to_lowercase())
            .collect();
        Self {
            store,
            snapshots: KeyedCache::case_insensitive(),
            startup: Mutex::new(startup),
            removed: Mutex::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &EntityCacheSettings {
        &self.settings
    }

    /// Full load of every configured category. Failures are logged; the
    /// affected category stays flagged and is fully loaded by the next
    /// poll or read.
    pub async fn start(self: &Arc<Self>) {
        let started = Instant::now();
        self.poll_once().await;
        info!(
            categories = self.settings.categories.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "metadata cache loaded"
        );
    }

    /// Refresh every configured category concurrently, logging failures.
    /// Returns the number of categories that failed.
    pub async fn poll_once(self: &Arc<Self>) -> usize {
        let started = Instant::now();
        let mut tasks = JoinSet::new();
        for category in self.settings.categories.clone() {
            let cache = Arc::clone(self);
            tasks.spawn(async move {
                let result = cache.refresh_category(&category).await;
                (category, result)
            });
        }

        let mut failures = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((category, Err(e))) => {
                    failures += 1;
                    warn!(%category, error = %e, "metadata poll failed");
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, "metadata poll task aborted");
                }
            }
        }
        debug!(
            failures,
            latency_ms = started.elapsed().as_millis() as u64,
            "metadata poll cycle finished"
        );
        failures
    }

    /// Refresh one category now, bypassing the timer.
    pub async fn refresh_now(&self, category: &str) -> Result<RefreshOutcome, UnitError> {
        self.refresh_category(category).await
    }

    /// Replace or merge one category; see the module docs.
    pub async fn refresh_category(&self, category: &str) -> Result<RefreshOutcome, UnitError> {
        let key = category.to_lowercase();
        let lock = self.refresh_lock(&key);
        let _guard = lock.lock().await;

        let current = self.snapshots.try_get(&key);
        let mode = if current.is_none() || self.is_flagged(&key) {
            RefreshMode::Replace
        } else {
            RefreshMode::Merge
        };

        let since = match mode {
            RefreshMode::Replace => EPOCH,
            RefreshMode::Merge => {
                let lookback = chrono::Duration::from_std(self.settings.lookback)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));
                Utc::now() - lookback
            }
        };

        let started = Instant::now();
        let operation = format!("fetch metadata '{}'", key);
        let store = Arc::clone(&self.store);
        let rows = retry_async(&self.settings.retry, &operation, || {
            let store = Arc::clone(&store);
            let key = key.clone();
            async move { store.fetch_rows_by_category(&key, since).await }
        })
        .await?;

        let fetched = rows.len();
        let mut gone: HashMap<String, DateTime<Utc>> = HashMap::new();
        for row in rows.iter().filter(|r| r.is_disabled) {
            let at = gone.entry(row.row_key.to_lowercase()).or_insert(row.last_modified);
            *at = (*at).max(row.last_modified);
        }

        let snapshot = match (mode, current) {
            (RefreshMode::Merge, Some(current)) => merge_incremental(&current, rows),
            _ => replace_category(rows),
        };
        let live: HashSet<String> = snapshot.iter().map(|r| r.row_key.to_lowercase()).collect();
        let removed = self.record_removed(&key, gone, &live);

        let cached = snapshot.len();
        self.snapshots.add_or_update(key.clone(), Arc::new(snapshot));
        if mode == RefreshMode::Replace {
            self.clear_flag(&key);
        }

        info!(
            category = %key,
            %mode,
            fetched,
            cached,
            removed,
            latency_ms = started.elapsed().as_millis() as u64,
            "metadata category refreshed"
        );
        Ok(RefreshOutcome {
            mode,
            fetched,
            cached,
            removed,
        })
    }

    /// Merge `gone` into the removal record of `key` and forget rows that
    /// are live again. Returns how many rows were newly recorded.
    fn record_removed(
        &self,
        key: &str,
        gone: HashMap<String, DateTime<Utc>>,
        live: &HashSet<String>,
    ) -> usize {
        let mut removed = self.removed.lock().unwrap_or_else(|e| e.into_inner());
        let record = removed.entry(key.to_string()).or_default();
        record.retain(|row_key, _| !live.contains(row_key));
        let mut added = 0;
        for (row_key, at) in gone {
            match record.get_mut(&row_key) {
                Some(existing) => *existing = (*existing).max(at),
                None => {
                    record.insert(row_key, at);
                    added += 1;
                }
            }
        }
        added
    }

    /// Rows of `category` currently recorded as disabled, lower-cased row
    /// key to the time of removal.
    pub fn removed_rows(&self, category: &str) -> HashMap<String, DateTime<Utc>> {
        self.removed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&category.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_removed(&self, category: &str, row_key: &str) -> bool {
        self.removed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&category.to_lowercase())
            .is_some_and(|rows| rows.contains_key(&row_key.to_lowercase()))
    }

    /// Forget a removal, for a row that was just written back enabled.
    pub fn clear_removed(&self, category: &str, row_key: &str) {
        if let Some(rows) = self
            .removed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&category.to_lowercase())
        {
            rows.remove(&row_key.to_lowercase());
        }
    }

    /// Entities of `category` applicable to the resource in `ctx`, ordered
    /// by name. Internal-only rows are hidden from external clients.
    pub async fn get_entities_by_category(
        &self,
        ctx: &ResourceContext,
        category: &str,
    ) -> Result<Vec<MetadataEntity>, UnitError> {
        let snapshot = self.snapshot_or_load(category).await?;
        let mut entities: Vec<MetadataEntity> = snapshot
            .iter()
            .filter(|e| ctx.client_is_internal || !e.is_internal)
            .filter(|e| entity_is_applicable(&ctx.resource, e))
            .cloned()
            .collect();
        entities.sort_by_cached_key(|e| e.name.to_lowercase());
        Ok(entities)
    }

    /// Current snapshot of a category, loading it first if absent.
    pub async fn snapshot_or_load(&self, category: &str) -> Result<Arc<Vec<MetadataEntity>>, UnitError> {
        let key = category.to_lowercase();
        if let Some(snapshot) = self.snapshots.try_get(&key) {
            debug!(category = %key, "metadata cache hit");
            return Ok(snapshot);
        }
        debug!(category = %key, "metadata cache miss");
        self.refresh_category(&key).await?;
        self.snapshots
            .try_get(&key)
            .ok_or_else(|| UnitError::not_found("category", key))
    }

    /// Current snapshot of a category without loading.
    pub fn snapshot(&self, category: &str) -> Option<Arc<Vec<MetadataEntity>>> {
        self.snapshots.try_get(&category.to_lowercase())
    }

    fn refresh_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.refresh_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    fn is_flagged(&self, key: &str) -> bool {
        self.startup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    fn clear_flag(&self, key: &str) {
        self.startup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration};
    use unit_harness_core::filter::{AppType, PlatformType, StackType, StampType};
    use unit_harness_core::models::{AppResource, ResourceInstance};
    use unit_harness_core::store::memory::InMemorySourceStore;

    fn settings() -> EntityCacheSettings {
        EntityCacheSettings {
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
            ..EntityCacheSettings::default()
        }
    }

    fn row(id: &str, name: &str, ts: DateTime<Utc>) -> MetadataEntity {
        MetadataEntity::new("unit", id, name, ts).with_resource("Microsoft.Web", "sites")
    }

    fn app_ctx(internal: bool) -> ResourceContext {
        ResourceContext::new(
            ResourceInstance::App(AppResource {
                name: "site".into(),
                app_type: AppType::WEB_APP,
                platform: PlatformType::WINDOWS,
                stack: StackType::NONE,
                stamp: StampType::PUBLIC,
            }),
            internal,
        )
    }

    fn names(rows: &[MetadataEntity]) -> Vec<String> {
        rows.iter().map(|r| r.row_key.clone()).collect()
    }

    #[tokio::test]
    async fn test_first_refresh_replaces_then_merges() {
        let store = Arc::new(InMemorySourceStore::new());
        let now = Utc::now();
        store.upsert(&row("a", "A", now - ChronoDuration::days(2))).await.unwrap();
        store.upsert(&row("b", "B", now - ChronoDuration::days(2))).await.unwrap();

        let cache = Arc::new(MetadataEntityCache::new(store.clone(), settings()));
        let first = cache.refresh_now("unit").await.unwrap();
        assert_eq!(first.mode, RefreshMode::Replace);
        assert_eq!(first.cached, 2);

        store
            .upsert(&row("a", "A2", now).with_disabled(false))
            .await
            .unwrap();
        store
            .upsert(&row("c", "C", now).with_disabled(true))
            .await
            .unwrap();
        let second = cache.refresh_now("unit").await.unwrap();
        assert_eq!(second.mode, RefreshMode::Merge);
        assert_eq!(second.fetched, 2);

        let snapshot = cache.snapshot("UNIT").unwrap();
        assert_eq!(names(&snapshot), vec!["a", "b"]);
        assert_eq!(snapshot[0].name, "A2");
        assert_eq!(second.removed, 1);
        assert!(cache.is_removed("unit", "C"));
    }

    #[tokio::test]
    async fn test_removed_rows_track_disable_and_reenable() {
        let store = Arc::new(InMemorySourceStore::new());
        let now = Utc::now();
        store.upsert(&row("a", "A", now - ChronoDuration::seconds(30))).await.unwrap();
        store.upsert(&row("b", "B", now - ChronoDuration::seconds(30))).await.unwrap();

        let cache = Arc::new(MetadataEntityCache::new(store.clone(), settings()));
        cache.refresh_now("unit").await.unwrap();
        assert!(cache.removed_rows("unit").is_empty());

        store.upsert(&row("A", "A", now).with_disabled(true)).await.unwrap();
        let outcome = cache.refresh_now("unit").await.unwrap();
        assert_eq!(outcome.removed, 1);
        assert_eq!(names(&cache.snapshot("unit").unwrap()), vec!["b"]);
        let removed = cache.removed_rows("UNIT");
        assert_eq!(removed.get("a"), Some(&now));

        store
            .upsert(&row("a", "A", now + ChronoDuration::seconds(1)))
            .await
            .unwrap();
        cache.refresh_now("unit").await.unwrap();
        assert!(!cache.is_removed("unit", "a"));
        assert_eq!(names(&cache.snapshot("unit").unwrap()), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failed_startup_keeps_flag_for_next_poll() {
        let store = Arc::new(InMemorySourceStore::new());
        store.upsert(&row("a", "A", Utc::now())).await.unwrap();
        store.fail_next_fetches(3);

        let cache = Arc::new(MetadataEntityCache::new(
            store.clone(),
            EntityCacheSettings {
                categories: vec!["unit".into()],
                ..settings()
            },
        ));
        cache.start().await;
        assert!(cache.snapshot("unit").is_none());

        assert_eq!(cache.poll_once().await, 0);
        assert_eq!(cache.snapshot("unit").unwrap().len(), 1);
        assert_eq!(store.fetch_count(), 4);
    }

    #[tokio::test]
    async fn test_poll_failure_keeps_previous_snapshot() {
        let store = Arc::new(InMemorySourceStore::new());
        store.upsert(&row("a", "A", Utc::now())).await.unwrap();
        let cache = Arc::new(MetadataEntityCache::new(
            store.clone(),
            EntityCacheSettings {
                categories: vec!["unit".into()],
                ..settings()
            },
        ));
        cache.start().await;

        store.fail_next_fetches(10);
        assert_eq!(cache.poll_once().await, 1);
        assert_eq!(cache.snapshot("unit").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_miss_loads_category() {
        let store = Arc::new(InMemorySourceStore::new());
        let now = Utc::now();
        store.upsert(&row("z", "zeta", now)).await.unwrap();
        store.upsert(&row("a", "Alpha", now)).await.unwrap();
        store
            .upsert(&MetadataEntity::new("unit", "kv", "Vault", now).with_resource("Microsoft.KeyVault", "vaults"))
            .await
            .unwrap();
        let mut hidden = row("h", "Hidden", now);
        hidden.is_internal = true;
        store.upsert(&hidden).await.unwrap();

        let cache = MetadataEntityCache::new(store, settings());
        let external = cache.get_entities_by_category(&app_ctx(false), "unit").await.unwrap();
        assert_eq!(names(&external), vec!["a", "z"]);

        let internal = cache.get_entities_by_category(&app_ctx(true), "unit").await.unwrap();
        assert_eq!(names(&internal), vec!["a", "h", "z"]);
    }

    #[tokio::test]
    async fn test_read_miss_surfaces_dependency_failure() {
        let store = Arc::new(InMemorySourceStore::new());
        store.fail_next_fetches(10);
        let cache = MetadataEntityCache::new(store.clone(), settings());
        let err = cache
            .get_entities_by_category(&app_ctx(true), "unit")
            .await
            .unwrap_err();
        match err {
            UnitError::DependencyFailure(e) => assert_eq!(e.attempt_count(), 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.fetch_count(), 3);
    }
}
