//! Public entry point: compile, index, list and invoke units.
//!
//! [`UnitCacheOrchestrator`] ties the compiler to the caches and the
//! external collaborators:
//!
//! | Operation | Path |
//! |-----------|------|
//! | [`publish`](UnitCacheOrchestrator::publish) | gather fragments → compile (or reuse a cached artifact) → index → upload artifact → upsert metadata row |
//! | [`list_applicable_units`](UnitCacheOrchestrator::list_applicable_units) | index view, filtered by resource and visibility |
//! | [`get_unit`](UnitCacheOrchestrator::get_unit) | index → stored artifact → source resolver |
//! | [`invoke_unit`](UnitCacheOrchestrator::invoke_unit) | `get_unit` → bind args → run on a blocking thread |
//! | [`warm_category`](UnitCacheOrchestrator::warm_category) | evict units whose rows were disabled, then compile every enabled row whose compiled copy is missing or stale |
//!
//! Units and fragments are separate namespaces throughout: in the index,
//! in blob names and in source resolution.
//!
//! Compilation and invocation run under `spawn_blocking`; foreground calls
//! never wait on the background poller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use unit_harness_core::cache::{BoundedCache, Cache, ClusterMappingCache, FragmentScriptCache, TranslationCache};
use unit_harness_core::models::{content_hash, MetadataEntity, ResourceContext, UnitKind, UnitMetadata, UnitSource};
use unit_harness_core::store::memory::{InMemoryBlobStore, InMemorySourceResolver, InMemorySourceStore};
use unit_harness_core::store::{artifact_blob_name, BlobStore, SourceStore, UnitSourceResolver};

use crate::compiler::{referenced_modules, LuaUnitCompiler, UnitCompiler};
use crate::entity_cache::{EntityCacheSettings, MetadataEntityCache, RefreshOutcome};
use crate::error::UnitError;
use crate::retry::{retry_async, RetryPolicy};
use crate::unit::CompiledUnit;
use crate::unit_index::{is_visible, UnitIndex};

/// Lookup caches shared with adapters that call translation or
/// cluster-mapping services.
#[derive(Default)]
pub struct LookupCaches {
    pub translations: TranslationCache,
    pub cluster_mappings: ClusterMappingCache,
}

/// Counts from one [`UnitCacheOrchestrator::warm_category`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WarmReport {
    pub evicted: usize,
    pub compiled: usize,
    pub failed: usize,
    pub skipped: usize,
    pub missing: usize,
}

pub struct UnitCacheOrchestrator {
    compiler: Arc<dyn UnitCompiler>,
    index: UnitIndex,
    artifacts: BoundedCache<String, Arc<CompiledUnit>>,
    fragment_scripts: FragmentScriptCache,
    lookups: LookupCaches,
    entities: Arc<MetadataEntityCache>,
    source_store: Arc<dyn SourceStore>,
    blobs: Arc<dyn BlobStore>,
    resolver: Arc<dyn UnitSourceResolver>,
    retry: RetryPolicy,
    invoke_timeout: Option<Duration>,
}

/// Builder for [`UnitCacheOrchestrator`]. Unset collaborators default to
/// the in-memory implementations.
pub struct OrchestratorBuilder {
    compiler: Option<Arc<dyn UnitCompiler>>,
    source_store: Option<Arc<dyn SourceStore>>,
    blobs: Option<Arc<dyn BlobStore>>,
    resolver: Option<Arc<dyn UnitSourceResolver>>,
    settings: EntityCacheSettings,
    artifact_capacity: usize,
    invoke_timeout: Option<Duration>,
}

impl OrchestratorBuilder {
    pub fn compiler(mut self, compiler: Arc<dyn UnitCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn source_store(mut self, store: Arc<dyn SourceStore>) -> Self {
        self.source_store = Some(store);
        self
    }

    pub fn blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn UnitSourceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn settings(mut self, settings: EntityCacheSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn artifact_capacity(mut self, capacity: usize) -> Self {
        self.artifact_capacity = capacity;
        self
    }

    pub fn invoke_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    pub fn build(self) -> UnitCacheOrchestrator {
        let source_store = self
            .source_store
            .unwrap_or_else(|| Arc::new(InMemorySourceStore::new()));
        let retry = self.settings.retry;
        let entities = Arc::new(MetadataEntityCache::new(
            Arc::clone(&source_store),
            self.settings,
        ));
        UnitCacheOrchestrator {
            compiler: self
                .compiler
                .unwrap_or_else(|| Arc::new(LuaUnitCompiler::default())),
            index: UnitIndex::new(),
            artifacts: BoundedCache::new(self.artifact_capacity),
            fragment_scripts: FragmentScriptCache::case_insensitive(),
            lookups: LookupCaches::default(),
            entities,
            source_store,
            blobs: self.blobs.unwrap_or_else(|| Arc::new(InMemoryBlobStore::new())),
            resolver: self
                .resolver
                .unwrap_or_else(|| Arc::new(InMemorySourceResolver::new())),
            retry,
            invoke_timeout: self.invoke_timeout,
        }
    }
}

impl UnitCacheOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder {
            compiler: None,
            source_store: None,
            blobs: None,
            resolver: None,
            settings: EntityCacheSettings::default(),
            artifact_capacity: unit_harness_core::cache::bounded::DEFAULT_CAPACITY,
            invoke_timeout: None,
        }
    }

    pub fn entities(&self) -> &Arc<MetadataEntityCache> {
        &self.entities
    }

    pub fn index(&self) -> &UnitIndex {
        &self.index
    }

    pub fn lookups(&self) -> &LookupCaches {
        &self.lookups
    }

    // ═══════════════════════════════════════════════════════════════════
    // Publishing
    // ═══════════════════════════════════════════════════════════════════

    /// Compile and index a pushed source, then store its artifact and
    /// metadata row.
    ///
    /// A source that fails to compile is still indexed and returned with
    /// its diagnostics; nothing is uploaded for it. An upload failure is
    /// returned as [`UnitError::DependencyFailure`], but the unit stays
    /// indexed and usable in this process.
    pub async fn publish(&self, source: UnitSource) -> Result<Arc<CompiledUnit>, UnitError> {
        if source.kind == UnitKind::Fragment {
            self.fragment_scripts
                .add_or_update(source.id.clone(), source.text.clone());
        }

        let unit = self.compile_and_index(&source).await?;
        let Some(metadata) = unit.metadata.clone().filter(|_| unit.is_compilation_successful()) else {
            return Ok(unit);
        };

        let (module, _) = unit.artifact_bytes()?;
        let blob_name = artifact_blob_name(source.kind, &source.id);
        let blobs = Arc::clone(&self.blobs);
        retry_async(&self.retry, &format!("upload artifact '{}'", blob_name), || {
            let blobs = Arc::clone(&blobs);
            let name = blob_name.clone();
            let bytes = module.clone();
            async move { blobs.put_bytes(&name, &bytes).await }
        })
        .await?;

        let mut entity = MetadataEntity::from_metadata(&source, &metadata, unit.compiled_at);
        entity.dependencies = unit.references.clone();
        let store = Arc::clone(&self.source_store);
        retry_async(&self.retry, &format!("upsert metadata '{}'", source.id), || {
            let store = Arc::clone(&store);
            let entity = entity.clone();
            async move { store.upsert(&entity).await }
        })
        .await?;
        self.entities.clear_removed(source.kind.category(), &source.id);

        info!(unit_id = %source.id, blob = %blob_name, "published unit");
        Ok(unit)
    }

    /// Compile `source` (or reuse an identical cached compilation) and
    /// index the result.
    pub async fn compile_and_index(&self, source: &UnitSource) -> Result<Arc<CompiledUnit>, UnitError> {
        let fragments = self.gather_fragments(source).await?;
        let key = artifact_key(source, &fragments);

        let unit = match self.artifacts.try_get(&key) {
            Some(unit) => {
                debug!(unit_id = %source.id, "artifact cache hit");
                unit
            }
            None => {
                debug!(unit_id = %source.id, "artifact cache miss");
                let compiler = Arc::clone(&self.compiler);
                let owned = source.clone();
                let unit = tokio::task::spawn_blocking(move || compiler.compile(&owned, &fragments))
                    .await
                    .map_err(|e| UnitError::Internal(anyhow::anyhow!("compile task failed: {}", e)))?;
                let unit = Arc::new(unit);
                self.artifacts.add_or_update(key, Arc::clone(&unit));
                unit
            }
        };

        self.index.insert(Arc::clone(&unit));
        Ok(unit)
    }

    /// Fragment sources `source` needs, from the fragment cache or the
    /// resolver. Unknown names are left out; the compiler reports them.
    async fn gather_fragments(&self, source: &UnitSource) -> Result<HashMap<String, String>, UnitError> {
        let mut pending: Vec<String> = source.references.clone();
        pending.extend(referenced_modules(&source.text));

        let mut fragments = HashMap::new();
        while let Some(name) = pending.pop() {
            let key = name.to_lowercase();
            let is_self = source.kind == UnitKind::Fragment && name.eq_ignore_ascii_case(&source.id);
            if fragments.contains_key(&key) || is_self {
                continue;
            }
            let text = match self.fragment_scripts.try_get(&name) {
                Some(text) => Some(text),
                None => match self.resolve(UnitKind::Fragment, &name).await? {
                    Some(found) => {
                        self.fragment_scripts
                            .add_or_update(found.id.clone(), found.text.clone());
                        Some(found.text)
                    }
                    None => None,
                },
            };
            if let Some(text) = text {
                pending.extend(referenced_modules(&text));
                fragments.insert(key, text);
            }
        }
        Ok(fragments)
    }

    async fn resolve(&self, kind: UnitKind, id: &str) -> Result<Option<UnitSource>, UnitError> {
        let resolver = Arc::clone(&self.resolver);
        let operation = format!("resolve {} source '{}'", kind.category(), id);
        let found = retry_async(&self.retry, &operation, || {
            let resolver = Arc::clone(&resolver);
            let id = id.to_string();
            async move { resolver.resolve(kind, &id).await }
        })
        .await?;
        Ok(found)
    }

    /// Drop a unit from the index. Returns the removed unit.
    pub fn remove_unit(&self, id: &str) -> Option<Arc<CompiledUnit>> {
        self.remove(UnitKind::Unit, id)
    }

    /// Drop a unit or fragment from the index, and a fragment's source
    /// from the fragment cache.
    pub fn remove(&self, kind: UnitKind, id: &str) -> Option<Arc<CompiledUnit>> {
        if kind == UnitKind::Fragment {
            self.fragment_scripts.try_remove(&id.to_string());
        }
        let removed = self.index.remove(kind, id);
        if let Some(unit) = &removed {
            info!(unit_id = %unit.id, kind = kind.category(), "removed unit");
        }
        removed
    }

    /// Evict indexed entries of `category` whose rows were disabled. An
    /// entry compiled after its row was disabled is kept.
    fn evict_removed(&self, category: &str) -> usize {
        let Some(kind) = UnitKind::from_category(category) else {
            return 0;
        };
        let mut evicted = 0;
        for (id, removed_at) in self.entities.removed_rows(category) {
            let stale = self
                .index
                .get(kind, &id)
                .is_some_and(|unit| unit.compiled_at <= removed_at);
            if stale && self.remove(kind, &id).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    // ═══════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════

    /// Metadata of ready units applicable to the resource, ordered by
    /// display name.
    pub fn list_applicable_units(&self, ctx: &ResourceContext) -> Vec<UnitMetadata> {
        self.index
            .resource_units(ctx)
            .iter()
            .filter_map(|u| u.metadata.clone())
            .collect()
    }

    /// Metadata of ready system units. Empty for external clients.
    pub fn list_system_units(&self, ctx: &ResourceContext) -> Vec<UnitMetadata> {
        self.index
            .system_units(ctx)
            .iter()
            .filter_map(|u| u.metadata.clone())
            .collect()
    }

    pub fn get_system_unit(&self, id: &str, ctx: &ResourceContext) -> Option<Arc<CompiledUnit>> {
        self.index.system_unit(id, ctx)
    }

    /// Look a unit up by id, loading it from the blob store or the source
    /// resolver when it is not indexed yet.
    ///
    /// Units that failed to compile are returned regardless of the
    /// resource so their diagnostics can be read. A unit whose row is
    /// disabled is not reloaded.
    pub async fn get_unit(&self, id: &str, ctx: &ResourceContext) -> Result<Arc<CompiledUnit>, UnitError> {
        let unit = match self.index.get(UnitKind::Unit, id) {
            Some(unit) => unit,
            None if self.entities.is_removed(UnitKind::Unit.category(), id) => {
                return Err(UnitError::not_found("unit", id));
            }
            None => self.load_unit(id).await?,
        };
        if is_visible(&unit, ctx) {
            Ok(unit)
        } else {
            Err(UnitError::not_found("unit", id))
        }
    }

    async fn load_unit(&self, id: &str) -> Result<Arc<CompiledUnit>, UnitError> {
        let blob_name = artifact_blob_name(UnitKind::Unit, id);
        let blobs = Arc::clone(&self.blobs);
        let bytes = retry_async(&self.retry, &format!("download artifact '{}'", blob_name), || {
            let blobs = Arc::clone(&blobs);
            let name = blob_name.clone();
            async move { blobs.get_bytes_by_name(&name, None).await }
        })
        .await?;

        if let Some(bytes) = bytes {
            let compiler = Arc::clone(&self.compiler);
            let owned_id = id.to_string();
            let loaded = tokio::task::spawn_blocking(move || compiler.load_artifact(&owned_id, &bytes))
                .await
                .map_err(|e| UnitError::Internal(anyhow::anyhow!("artifact load task failed: {}", e)))?;
            match loaded {
                Ok(unit) if unit.kind == UnitKind::Unit => {
                    debug!(unit_id = %id, "loaded unit from stored artifact");
                    let unit = Arc::new(unit);
                    self.index.insert(Arc::clone(&unit));
                    return Ok(unit);
                }
                Ok(_) => warn!(unit_id = %id, "stored artifact is not a unit; recompiling from source"),
                Err(e) => warn!(unit_id = %id, error = %e, "stored artifact unusable; recompiling from source"),
            }
        }

        match self.resolve(UnitKind::Unit, id).await? {
            Some(source) => self.compile_and_index(&source).await,
            None => Err(UnitError::not_found("unit", id)),
        }
    }

    /// Invoke a unit's entry point for a resource.
    pub async fn invoke_unit(
        &self,
        id: &str,
        ctx: &ResourceContext,
        args: Vec<Value>,
    ) -> Result<Value, UnitError> {
        let unit = self.get_unit(id, ctx).await?;
        unit.ensure_ready()?;

        let started = Instant::now();
        let deadline = self.invoke_timeout.map(|t| started + t);
        let compiler = Arc::clone(&self.compiler);
        let ctx = ctx.clone();
        let invoked = Arc::clone(&unit);
        let result = tokio::task::spawn_blocking(move || compiler.invoke(&invoked, args, Some(&ctx), deadline))
            .await
            .map_err(|e| UnitError::Internal(anyhow::anyhow!("invoke task failed: {}", e)))?;

        let latency_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(unit_id = %unit.id, latency_ms, "unit invoked"),
            Err(e) => warn!(unit_id = %unit.id, latency_ms, code = e.code(), error = %e, "unit invocation failed"),
        }
        result
    }

    /// Cached metadata rows of `category` applicable to the resource.
    pub async fn list_applicable_entities(
        &self,
        ctx: &ResourceContext,
        category: &str,
    ) -> Result<Vec<MetadataEntity>, UnitError> {
        self.entities.get_entities_by_category(ctx, category).await
    }

    /// Source text of every ready fragment, keyed by fragment id.
    pub fn fragment_references(&self) -> HashMap<String, String> {
        self.index
            .fragments()
            .iter()
            .filter_map(|f| {
                self.fragment_scripts
                    .try_get(&f.id)
                    .map(|text| (f.id.clone(), text))
            })
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Refresh
    // ═══════════════════════════════════════════════════════════════════

    /// Refresh one category now and evict the units its disabled rows
    /// name.
    pub async fn refresh_now(&self, category: &str) -> Result<RefreshOutcome, UnitError> {
        let outcome = self.entities.refresh_now(category).await?;
        self.evict_removed(category);
        Ok(outcome)
    }

    /// Evict units whose rows were disabled, then compile every
    /// enabled row of `category` whose compiled copy is missing or older
    /// than the row. Categories that hold neither units nor fragments are
    /// left alone.
    pub async fn warm_category(&self, category: &str) -> Result<WarmReport, UnitError> {
        let Some(kind) = UnitKind::from_category(category) else {
            debug!(%category, "not a unit category; nothing to warm");
            return Ok(WarmReport::default());
        };
        let rows = self.entities.snapshot_or_load(category).await?;
        let mut report = WarmReport {
            evicted: self.evict_removed(category),
            ..WarmReport::default()
        };

        for row in rows.iter() {
            if let Some(existing) = self.index.get(kind, &row.row_key) {
                let same_source = row
                    .content_hash
                    .as_deref()
                    .is_some_and(|h| !existing.source_hash.is_empty() && h == existing.source_hash);
                if same_source || existing.compiled_at >= row.last_modified {
                    report.skipped += 1;
                    continue;
                }
            }

            let source = match self.resolve(kind, &row.row_key).await {
                Ok(Some(source)) => source,
                Ok(None) => {
                    warn!(unit_id = %row.row_key, %category, "no source for metadata row");
                    report.missing += 1;
                    continue;
                }
                Err(e) => {
                    warn!(unit_id = %row.row_key, error = %e, "source lookup failed");
                    report.missing += 1;
                    continue;
                }
            };
            if source.kind == UnitKind::Fragment {
                self.fragment_scripts
                    .add_or_update(source.id.clone(), source.text.clone());
            }
            let unit = self.compile_and_index(&source).await?;
            if unit.is_compilation_successful() {
                report.compiled += 1;
            } else {
                report.failed += 1;
            }
        }

        debug!(%category, ?report, "warmed category");
        Ok(report)
    }

    /// [`warm_category`](Self::warm_category) for every configured
    /// category, fragments first. Failures are logged.
    pub async fn warm_all(&self) {
        let mut categories = self.entities.settings().categories.clone();
        categories.sort_by_key(|c| c != UnitKind::Fragment.category());
        for category in categories {
            if let Err(e) = self.warm_category(&category).await {
                warn!(%category, error = %e, "warming category failed");
            }
        }
    }
}

/// Cache key for a compilation: the source plus every fragment text.
fn artifact_key(source: &UnitSource, fragments: &HashMap<String, String>) -> String {
    let mut names: Vec<&String> = fragments.keys().collect();
    names.sort();
    let mut material = format!("{}\n{:?}\n{}\n", source.id.to_lowercase(), source.kind, source.text);
    for name in names {
        material.push_str(name);
        material.push('\n');
        material.push_str(&fragments[name]);
        material.push('\n');
    }
    content_hash(&material)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use unit_harness_core::filter::{AppType, PlatformType, StackType, StampType};
    use unit_harness_core::models::{AppResource, ResourceInstance};
    use unit_harness_core::store::EPOCH;

    const CPU: &str = r#"
unit = {
  definition = { id = "cpu", name = "High CPU", author = "ops" },
  resource_filter = { kind = "app", internal_only = false },
}
function unit.run() return "cpu ok" end
"#;

    fn ctx() -> ResourceContext {
        ResourceContext::external(ResourceInstance::App(AppResource {
            name: "site".into(),
            app_type: AppType::WEB_APP,
            platform: PlatformType::WINDOWS,
            stack: StackType::NONE,
            stamp: StampType::PUBLIC,
        }))
    }

    fn fast_settings() -> EntityCacheSettings {
        EntityCacheSettings {
            retry: RetryPolicy::new(2, Duration::from_millis(1)),
            ..EntityCacheSettings::default()
        }
    }

    #[tokio::test]
    async fn test_publish_uploads_and_upserts() {
        let store = Arc::new(InMemorySourceStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let orchestrator = UnitCacheOrchestrator::builder()
            .source_store(store.clone())
            .blob_store(blobs.clone())
            .settings(fast_settings())
            .build();

        let unit = orchestrator.publish(UnitSource::unit("cpu", CPU)).await.unwrap();
        assert!(unit.is_compilation_successful());
        assert_eq!(blobs.names(), vec!["units/cpu/cpu.luac"]);

        let rows = store.fetch_rows_by_category("unit", EPOCH).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "High CPU");
        assert_eq!(rows[0].resource_type.as_deref(), Some("sites"));

        let listed = orchestrator.list_applicable_units(&ctx());
        assert_eq!(listed.len(), 1);
        assert_eq!(
            orchestrator.invoke_unit("CPU", &ctx(), vec![]).await.unwrap(),
            json!("cpu ok")
        );
    }

    #[tokio::test]
    async fn test_failed_unit_is_indexed_but_not_listed() {
        let orchestrator = UnitCacheOrchestrator::builder().build();
        let unit = orchestrator
            .publish(UnitSource::unit("bad", "unit = {"))
            .await
            .unwrap();
        assert!(!unit.is_compilation_successful());
        assert!(orchestrator.list_applicable_units(&ctx()).is_empty());

        let found = orchestrator.get_unit("bad", &ctx()).await.unwrap();
        assert!(!found.diagnostics.is_empty());
        let err = orchestrator.invoke_unit("bad", &ctx(), vec![]).await.unwrap_err();
        assert!(matches!(err, UnitError::InvalidOperation { .. }));
    }

    #[tokio::test]
    async fn test_identical_source_reuses_artifact() {
        let orchestrator = UnitCacheOrchestrator::builder().build();
        let first = orchestrator.compile_and_index(&UnitSource::unit("cpu", CPU)).await.unwrap();
        let second = orchestrator.compile_and_index(&UnitSource::unit("cpu", CPU)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_get_unit_falls_back_to_stored_artifact() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let publisher = UnitCacheOrchestrator::builder().blob_store(blobs.clone()).build();
        publisher.publish(UnitSource::unit("cpu", CPU)).await.unwrap();

        let reader = UnitCacheOrchestrator::builder().blob_store(blobs).build();
        let unit = reader.get_unit("cpu", &ctx()).await.unwrap();
        assert!(unit.is_compilation_successful());
        assert_eq!(reader.list_applicable_units(&ctx()).len(), 1);
    }

    #[tokio::test]
    async fn test_get_unit_falls_back_to_resolver() {
        let resolver = Arc::new(InMemorySourceResolver::new());
        resolver.insert(UnitSource::unit("cpu", CPU));
        let orchestrator = UnitCacheOrchestrator::builder().resolver(resolver).build();
        assert!(orchestrator.get_unit("cpu", &ctx()).await.is_ok());
        assert!(matches!(
            orchestrator.get_unit("nope", &ctx()).await,
            Err(UnitError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_fragments_from_resolver_and_references_view() {
        let resolver = Arc::new(InMemorySourceResolver::new());
        resolver.insert(UnitSource::fragment("util", "return { name = 'util' }"));
        let orchestrator = UnitCacheOrchestrator::builder().resolver(resolver).build();

        let unit = orchestrator
            .publish(UnitSource::unit(
                "uses",
                r#"
local util = require("util")
unit = { definition = { id = "uses", name = "Uses", author = "ops" }, system_filter = {} }
function unit.run() return util.name end
"#,
            ))
            .await
            .unwrap();
        assert!(unit.is_compilation_successful(), "{:?}", unit.diagnostics);

        orchestrator
            .publish(UnitSource::fragment("util", "return { name = 'util' }"))
            .await
            .unwrap();
        let refs = orchestrator.fragment_references();
        assert_eq!(refs.get("util").map(String::as_str), Some("return { name = 'util' }"));
    }

    #[tokio::test]
    async fn test_upload_failure_is_dependency_failure() {
        struct FailingBlobs;

        #[async_trait::async_trait]
        impl BlobStore for FailingBlobs {
            async fn get_bytes_by_name(&self, _: &str, _: Option<&str>) -> anyhow::Result<Option<Vec<u8>>> {
                Ok(None)
            }
            async fn put_bytes(&self, _: &str, _: &[u8]) -> anyhow::Result<()> {
                anyhow::bail!("blob store offline")
            }
        }

        let orchestrator = UnitCacheOrchestrator::builder()
            .blob_store(Arc::new(FailingBlobs))
            .settings(fast_settings())
            .build();
        let err = orchestrator.publish(UnitSource::unit("cpu", CPU)).await.unwrap_err();
        match err {
            UnitError::DependencyFailure(e) => assert_eq!(e.attempt_count(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(orchestrator.list_applicable_units(&ctx()).len(), 1);
    }

    #[tokio::test]
    async fn test_warm_category_compiles_missing_units() {
        let store = Arc::new(InMemorySourceStore::new());
        let resolver = Arc::new(InMemorySourceResolver::new());
        resolver.insert(UnitSource::unit("cpu", CPU));
        store
            .upsert(&MetadataEntity::new("unit", "cpu", "High CPU", chrono::Utc::now()))
            .await
            .unwrap();
        store
            .upsert(&MetadataEntity::new("unit", "ghost", "Ghost", chrono::Utc::now()))
            .await
            .unwrap();

        let orchestrator = UnitCacheOrchestrator::builder()
            .source_store(store)
            .resolver(resolver)
            .settings(fast_settings())
            .build();
        let report = orchestrator.warm_category("unit").await.unwrap();
        assert_eq!(report.compiled, 1);
        assert_eq!(report.missing, 1);

        let again = orchestrator.warm_category("unit").await.unwrap();
        assert_eq!(again.skipped, 1);
        assert_eq!(again.compiled, 0);
    }

    #[tokio::test]
    async fn test_disabled_row_evicts_unit() {
        let store = Arc::new(InMemorySourceStore::new());
        let orchestrator = UnitCacheOrchestrator::builder()
            .source_store(store.clone())
            .settings(EntityCacheSettings {
                categories: vec!["unit".into()],
                ..fast_settings()
            })
            .build();
        orchestrator.publish(UnitSource::unit("cpu", CPU)).await.unwrap();
        orchestrator.entities().start().await;
        orchestrator.warm_all().await;
        assert_eq!(orchestrator.list_applicable_units(&ctx()).len(), 1);

        let disabled_at = chrono::Utc::now() + chrono::Duration::seconds(1);
        store
            .upsert(&MetadataEntity::new("unit", "CPU", "High CPU", disabled_at).with_disabled(true))
            .await
            .unwrap();
        assert_eq!(orchestrator.entities().poll_once().await, 0);
        let report = orchestrator.warm_category("unit").await.unwrap();
        assert_eq!(report.evicted, 1);

        assert!(orchestrator.list_applicable_units(&ctx()).is_empty());
        assert!(matches!(
            orchestrator.invoke_unit("cpu", &ctx(), vec![]).await,
            Err(UnitError::NotFound { .. })
        ));

        // Publishing again brings it back.
        orchestrator
            .publish(UnitSource::unit("cpu", CPU.replace("cpu ok", "cpu back")))
            .await
            .unwrap();
        assert_eq!(
            orchestrator.invoke_unit("cpu", &ctx(), vec![]).await.unwrap(),
            json!("cpu back")
        );
    }

    #[tokio::test]
    async fn test_refresh_now_evicts_disabled_rows() {
        let store = Arc::new(InMemorySourceStore::new());
        let orchestrator = UnitCacheOrchestrator::builder()
            .source_store(store.clone())
            .settings(fast_settings())
            .build();
        orchestrator.compile_and_index(&UnitSource::unit("cpu", CPU)).await.unwrap();
        assert_eq!(orchestrator.list_applicable_units(&ctx()).len(), 1);

        let disabled_at = chrono::Utc::now() + chrono::Duration::seconds(1);
        store
            .upsert(&MetadataEntity::new("unit", "cpu", "High CPU", disabled_at).with_disabled(true))
            .await
            .unwrap();
        let outcome = orchestrator.refresh_now("unit").await.unwrap();
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.cached, 0);
        assert!(orchestrator.list_applicable_units(&ctx()).is_empty());
    }

    #[tokio::test]
    async fn test_unit_and_fragment_with_same_id() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let orchestrator = UnitCacheOrchestrator::builder().blob_store(blobs.clone()).build();
        orchestrator.publish(UnitSource::unit("cpu", CPU)).await.unwrap();
        orchestrator
            .publish(UnitSource::fragment("cpu", "return { share = 1 }"))
            .await
            .unwrap();

        assert_eq!(orchestrator.list_applicable_units(&ctx()).len(), 1);
        assert_eq!(
            orchestrator.invoke_unit("cpu", &ctx(), vec![]).await.unwrap(),
            json!("cpu ok")
        );
        assert_eq!(
            blobs.names(),
            vec!["units/cpu/cpu.fragment.luac", "units/cpu/cpu.luac"]
        );
        assert!(orchestrator.fragment_references().contains_key("cpu"));

        let requires_namesake = orchestrator
            .publish(UnitSource::unit(
                "cpu",
                r#"
local shared = require("cpu")
unit = {
  definition = { id = "cpu", name = "High CPU", author = "ops" },
  resource_filter = { kind = "app", internal_only = false },
}
function unit.run() return shared.share end
"#,
            ))
            .await
            .unwrap();
        assert!(requires_namesake.is_compilation_successful(), "{:?}", requires_namesake.diagnostics);
        assert_eq!(
            orchestrator.invoke_unit("cpu", &ctx(), vec![]).await.unwrap(),
            json!(1)
        );
    }

    #[tokio::test]
    async fn test_remove_unit() {
        let orchestrator = UnitCacheOrchestrator::builder().build();
        orchestrator.compile_and_index(&UnitSource::unit("cpu", CPU)).await.unwrap();
        assert!(orchestrator.remove_unit("CPU").is_some());
        assert!(orchestrator.list_applicable_units(&ctx()).is_empty());
    }
}
