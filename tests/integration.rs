use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

use unit_harness::entity_cache::{EntityCacheSettings, MetadataEntityCache};
use unit_harness::error::{CompileErrorKind, UnitError};
use unit_harness::orchestrator::UnitCacheOrchestrator;
use unit_harness::retry::RetryPolicy;
use unit_harness_core::cache::{BoundedCache, Cache};
use unit_harness_core::filter::{AppType, PlatformType, StackType, StampType};
use unit_harness_core::models::{
    AppResource, MetadataEntity, ResourceContext, ResourceInstance, UnitSource,
};
use unit_harness_core::store::memory::InMemorySourceStore;
use unit_harness_core::store::SourceStore;

fn units_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("units");
    path
}

fn app(platform: PlatformType, internal: bool) -> ResourceContext {
    ResourceContext::new(
        ResourceInstance::App(AppResource {
            name: "contoso".into(),
            app_type: AppType::WEB_APP,
            platform,
            stack: StackType::NONE,
            stamp: StampType::PUBLIC,
        }),
        internal,
    )
}

fn unit_source(id: &str, filter: &str, body: &str) -> UnitSource {
    UnitSource::unit(
        id,
        format!(
            r#"
unit = {{
  definition = {{ id = "{id}", name = "{id}", author = "ops" }},
  {filter}
}}
{body}
"#
        ),
    )
}

fn fast_settings() -> EntityCacheSettings {
    EntityCacheSettings {
        retry: RetryPolicy::new(3, Duration::from_millis(1)),
        ..EntityCacheSettings::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Compilation outcomes
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_unit_with_empty_id_is_excluded() {
    let orchestrator = UnitCacheOrchestrator::builder().build();
    let source = UnitSource::unit(
        "U1",
        r#"
unit = {
  definition = { id = "", name = "Nameless", author = "ops" },
  resource_filter = { kind = "app", internal_only = false },
}
function unit.run() return 1 end
"#,
    );

    let unit = orchestrator.publish(source).await.unwrap();
    assert!(!unit.is_compilation_successful());
    assert!(!unit.diagnostics.is_empty());

    for platform in [PlatformType::WINDOWS, PlatformType::LINUX] {
        for internal in [false, true] {
            assert!(orchestrator
                .list_applicable_units(&app(platform, internal))
                .is_empty());
        }
    }

    // Still queryable by id, with its diagnostics.
    let found = orchestrator
        .get_unit("u1", &app(PlatformType::WINDOWS, false))
        .await
        .unwrap();
    assert!(!found.error_messages().is_empty());
    let err = orchestrator
        .invoke_unit("U1", &app(PlatformType::WINDOWS, true), vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, UnitError::InvalidOperation { .. }));
}

#[tokio::test]
async fn test_entry_point_count_is_enforced() {
    let orchestrator = UnitCacheOrchestrator::builder().build();

    let missing = orchestrator
        .publish(unit_source("none", "system_filter = {},", "local x = 1"))
        .await
        .unwrap();
    assert_eq!(missing.failure, Some(CompileErrorKind::MissingEntryPoint));

    let duplicate = orchestrator
        .publish(unit_source(
            "twice",
            "system_filter = {},",
            "function unit.run() return 1 end\nfunction unit.run() return 2 end",
        ))
        .await
        .unwrap();
    assert_eq!(duplicate.failure, Some(CompileErrorKind::DuplicateEntryPoint));
}

// ═══════════════════════════════════════════════════════════════════════
// Routing and invocation
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_system_and_resource_units_never_overlap() {
    let orchestrator = UnitCacheOrchestrator::builder().build();
    orchestrator
        .publish(unit_source(
            "web",
            r#"resource_filter = { kind = "app", internal_only = false },"#,
            "function unit.run() return 'web' end",
        ))
        .await
        .unwrap();
    orchestrator
        .publish(unit_source(
            "sys",
            "system_filter = {},",
            "function unit.run() return 'sys' end",
        ))
        .await
        .unwrap();

    let ctx = app(PlatformType::WINDOWS, true);
    let resource: Vec<String> = orchestrator
        .list_applicable_units(&ctx)
        .iter()
        .map(|m| m.id().to_string())
        .collect();
    let system: Vec<String> = orchestrator
        .list_system_units(&ctx)
        .iter()
        .map(|m| m.id().to_string())
        .collect();
    assert_eq!(resource, vec!["web"]);
    assert_eq!(system, vec!["sys"]);
    assert!(orchestrator.get_system_unit("SYS", &ctx).is_some());
    assert!(orchestrator.get_system_unit("web", &ctx).is_none());
    assert!(orchestrator
        .list_system_units(&app(PlatformType::WINDOWS, false))
        .is_empty());
}

#[tokio::test]
async fn test_invoke_binds_arguments_by_position() {
    let orchestrator = UnitCacheOrchestrator::builder().build();
    orchestrator
        .publish(unit_source(
            "threshold",
            r#"resource_filter = { kind = "app", platform = "linux", internal_only = false },
  parameters = { { name = "limit", type = "integer" }, { name = "label", type = "string", required = false } },"#,
            r#"
function unit.run(limit, label)
  return { over = limit > 80, label = label or "none", resource = context.resource.name }
end"#,
        ))
        .await
        .unwrap();

    let ctx = app(PlatformType::LINUX, false);
    let result = orchestrator
        .invoke_unit("threshold", &ctx, vec![json!(90), json!("cpu"), json!("dropped")])
        .await
        .unwrap();
    assert_eq!(result, json!({ "over": true, "label": "cpu", "resource": "contoso" }));

    let err = orchestrator
        .invoke_unit("threshold", &ctx, vec![json!("ninety")])
        .await
        .unwrap_err();
    assert!(matches!(err, UnitError::ArgumentBinding { position: 0, .. }));

    // Not applicable to a Windows app.
    let err = orchestrator
        .invoke_unit("threshold", &app(PlatformType::WINDOWS, false), vec![json!(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, UnitError::NotFound { .. }));
}

// ═══════════════════════════════════════════════════════════════════════
// Metadata cache
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_poll_merges_incremental_rows() {
    let store = Arc::new(InMemorySourceStore::new());
    let old = Utc.timestamp_opt(1_000, 0).unwrap();
    store
        .upsert_batch(&[
            MetadataEntity::new("unit", "A", "A", old),
            MetadataEntity::new("unit", "B", "B", old),
        ])
        .await
        .unwrap();

    let cache = Arc::new(MetadataEntityCache::new(
        store.clone(),
        EntityCacheSettings {
            categories: vec!["unit".into()],
            ..fast_settings()
        },
    ));
    cache.start().await;

    let now = Utc::now();
    store
        .upsert_batch(&[
            MetadataEntity::new("unit", "a", "A updated", now),
            MetadataEntity::new("unit", "C", "C", now).with_disabled(true),
        ])
        .await
        .unwrap();
    assert_eq!(cache.poll_once().await, 0);

    let rows = cache.snapshot("unit").unwrap();
    let view: Vec<(String, i64)> = rows
        .iter()
        .map(|r| (r.row_key.to_uppercase(), r.last_modified.timestamp()))
        .collect();
    assert_eq!(
        view,
        vec![("A".to_string(), now.timestamp()), ("B".to_string(), 1_000)]
    );
}

#[tokio::test]
async fn test_fetch_retries_then_reports_every_attempt() {
    let store = Arc::new(InMemorySourceStore::new());
    store
        .upsert(&MetadataEntity::new("unit", "x", "x", Utc::now()))
        .await
        .unwrap();
    let orchestrator = UnitCacheOrchestrator::builder()
        .source_store(store.clone())
        .settings(fast_settings())
        .build();

    store.fail_next_fetches(2);
    let outcome = orchestrator.refresh_now("unit").await.unwrap();
    assert_eq!(outcome.cached, 1);

    store.fail_next_fetches(3);
    match orchestrator.refresh_now("unit").await {
        Err(UnitError::DependencyFailure(err)) => assert_eq!(err.attempt_count(), 3),
        other => panic!("expected dependency failure, got {:?}", other.map(|o| o.cached)),
    }
}

#[test]
fn test_bounded_cache_evicts_oldest() {
    let cache: BoundedCache<String, u32> = BoundedCache::new(2);
    cache.add_or_update("a".into(), 1);
    cache.add_or_update("b".into(), 2);
    cache.add_or_update("c".into(), 3);
    assert_eq!(cache.len(), 2);
    assert!(cache.try_get(&"a".to_string()).is_none());
    assert_eq!(cache.keys(), vec!["b".to_string(), "c".to_string()]);
}

// ═══════════════════════════════════════════════════════════════════════
// CLI
// ═══════════════════════════════════════════════════════════════════════

fn write_project(root: &Path) {
    fs::create_dir_all(root.join("units")).unwrap();
    fs::create_dir_all(root.join("fragments")).unwrap();
    fs::write(
        root.join("fragments/fmt.lua"),
        "return { pct = function(x) return tostring(x) .. '%' end }",
    )
    .unwrap();
    fs::write(
        root.join("units/cpu.lua"),
        r#"-- @reference fmt
local fmt = require("fmt")
unit = {
  definition = { id = "cpu", name = "High CPU", author = "ops" },
  resource_filter = { kind = "app", internal_only = false },
  parameters = { { name = "value", type = "integer" } },
}
function unit.run(value) return fmt.pct(value) end
"#,
    )
    .unwrap();
}

#[test]
fn test_cli_compile_and_test() {
    let tmp = TempDir::new().unwrap();
    write_project(tmp.path());
    let config = tmp.path().join("units.toml");
    fs::write(&config, format!("[units]\ndir = \"{}\"\n", tmp.path().display())).unwrap();

    let output = Command::new(units_binary())
        .args(["--config", config.to_str().unwrap(), "compile"])
        .arg(tmp.path().join("units/cpu.lua"))
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("High CPU"));

    let output = Command::new(units_binary())
        .args(["--config", config.to_str().unwrap(), "test"])
        .arg(tmp.path().join("units/cpu.lua"))
        .args(["--arg", "value=42"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("42%"));
}

#[test]
fn test_cli_scaffold_refuses_existing() {
    let tmp = TempDir::new().unwrap();
    let run = || {
        Command::new(units_binary())
            .current_dir(tmp.path())
            .args(["scaffold", "slow-start"])
            .output()
            .unwrap()
    };

    assert!(run().status.success());
    assert!(tmp.path().join("units/slow-start.lua").exists());
    assert!(!run().status.success());
}
