//! Process lifecycle: wire the collaborators from config, load the
//! metadata cache, warm the compiled units, and run the background poller.
//!
//! ```text
//! UnitHost::start ──▶ stores + compiler ──▶ orchestrator
//!        │                                      │
//!        │                entities.start() + warm_all()
//!        ▼
//!   poll loop: every interval ─▶ poll_once ─▶ warm_all
//!        ▲
//!   shutdown() ── watch channel
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use unit_harness_core::store::memory::{InMemoryBlobStore, InMemorySourceStore};
use unit_harness_core::store::{BlobStore, SourceStore, UnitSourceResolver};

use crate::blob_store::FsBlobStore;
use crate::compiler::LuaUnitCompiler;
use crate::config::{Config, StoreKind};
use crate::entity_cache::EntityCacheSettings;
use crate::lua_runtime::HostOptions;
use crate::orchestrator::UnitCacheOrchestrator;
use crate::retry::RetryPolicy;
use crate::source_fs::FsSourceResolver;
use crate::sqlite_store::SqliteSourceStore;

pub struct UnitHost {
    orchestrator: Arc<UnitCacheOrchestrator>,
    shutdown: watch::Sender<bool>,
    poller: Option<JoinHandle<()>>,
}

impl UnitHost {
    /// Build every collaborator named in `config`, load the metadata
    /// cache, compile what it lists, and spawn the poller when enabled.
    pub async fn start(config: &Config) -> Result<Self> {
        let orchestrator = Arc::new(build_orchestrator(config).await?);

        orchestrator.entities().start().await;
        orchestrator.warm_all().await;

        let (shutdown, rx) = watch::channel(false);
        let poller = if config.poller.enabled {
            let interval = Duration::from_secs(config.poller.interval_secs);
            Some(tokio::spawn(poll_loop(Arc::clone(&orchestrator), interval, rx)))
        } else {
            None
        };

        info!(
            indexed = orchestrator.index().len(),
            poller = poller.is_some(),
            "unit host started"
        );
        Ok(Self {
            orchestrator,
            shutdown,
            poller,
        })
    }

    pub fn orchestrator(&self) -> &Arc<UnitCacheOrchestrator> {
        &self.orchestrator
    }

    /// Stop the poller and wait for its current cycle to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.poller.take() {
            handle.await?;
        }
        info!("unit host stopped");
        Ok(())
    }
}

/// Orchestrator wired from config: the configured source store and blob
/// store, a filesystem resolver over `units.dir`, and the Lua compiler.
pub async fn build_orchestrator(config: &Config) -> Result<UnitCacheOrchestrator> {
    let source_store: Arc<dyn SourceStore> = match config.store.kind {
        StoreKind::Memory => Arc::new(InMemorySourceStore::new()),
        StoreKind::Sqlite => {
            let pool = crate::db::connect(config).await?;
            crate::migrate::create_schema(&pool).await?;
            Arc::new(SqliteSourceStore::new(pool))
        }
    };

    let blobs: Arc<dyn BlobStore> = match &config.blob.root {
        Some(root) => Arc::new(FsBlobStore::new(root)),
        None => Arc::new(InMemoryBlobStore::new()),
    };

    let resolver: Arc<dyn UnitSourceResolver> = Arc::new(FsSourceResolver::from_config(config)?);

    Ok(UnitCacheOrchestrator::builder()
        .compiler(Arc::new(compiler_from_config(config)))
        .source_store(source_store)
        .blob_store(blobs)
        .resolver(resolver)
        .settings(EntityCacheSettings::from_config(config))
        .artifact_capacity(config.cache.artifact_capacity)
        .invoke_timeout(config.units.invoke_timeout_secs.map(Duration::from_secs))
        .build())
}

/// Lua compiler with the host API and timeouts taken from `config`.
pub fn compiler_from_config(config: &Config) -> LuaUnitCompiler {
    let host = HostOptions {
        retry: RetryPolicy::from_config(&config.retry),
        http_timeout: Duration::from_secs(config.http.timeout_secs),
    };
    LuaUnitCompiler::new(host, Duration::from_secs(config.units.compile_timeout_secs))
}

async fn poll_loop(
    orchestrator: Arc<UnitCacheOrchestrator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately and start() has just loaded.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let failures = orchestrator.entities().poll_once().await;
                orchestrator.warm_all().await;
                debug!(failures, "poll cycle complete");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
