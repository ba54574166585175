//! `units` subcommands for authoring and publishing units.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `units scaffold <name>` | Write a commented template to `units/<name>.lua` |
//! | `units compile <path>` | Compile one file and print diagnostics and metadata |
//! | `units test <path> --arg k=v` | Compile, then invoke against a sample resource |
//! | `units list --resource <kind>` | Units under `units.dir` applicable to a resource |
//! | `units publish <path>` | Compile, store the artifact, upsert the metadata row |
//!
//! Fragments a unit references are resolved from `units.dir`.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use unit_harness_core::filter::{parse_flags, AppType, HostingEnvironmentType, PlatformType, StackType, StampType};
use unit_harness_core::models::{
    AppResource, ArmResource, HostingEnvironmentResource, ResourceContext, ResourceInstance, UnitKind,
    UnitMetadata,
};

use crate::compiler::UnitCompiler;
use crate::config::Config;
use crate::host::{build_orchestrator, compiler_from_config};
use crate::source_fs::{load_source_file, FsSourceResolver};
use crate::unit::CompiledUnit;

/// The sample resource commands evaluate units against.
#[derive(Debug, Clone, clap::Args)]
pub struct ResourceArgs {
    /// Resource kind: `app`, `hosting-environment` or `arm`.
    #[arg(long = "resource", default_value = "app")]
    pub kind: String,
    /// Resource name.
    #[arg(long, default_value = "sample")]
    pub name: String,
    /// App type flag (`web_app`, `function_app`, `api_app`).
    #[arg(long, default_value = "web_app")]
    pub app_type: String,
    /// Platform flag (`windows`, `linux`).
    #[arg(long, default_value = "windows")]
    pub platform: String,
    /// Stack flag (`asp_net`, `net_core`, `php`, `node`, `java`, `none`).
    #[arg(long, default_value = "none")]
    pub stack: String,
    /// Stamp flag (`public`, `ase_v1`, `ase_v2`).
    #[arg(long, default_value = "public")]
    pub stamp: String,
    /// Hosting environment version (`v1`, `v2`).
    #[arg(long, default_value = "v2")]
    pub hosting_environment_type: String,
    /// ARM resource provider, e.g. `Microsoft.KeyVault`.
    #[arg(long, default_value = "")]
    pub provider: String,
    /// ARM resource type, e.g. `vaults`.
    #[arg(long, default_value = "")]
    pub resource_type: String,
    /// Evaluate as an internal client (sees internal-only and system units).
    #[arg(long)]
    pub internal: bool,
}

impl Default for ResourceArgs {
    fn default() -> Self {
        Self {
            kind: "app".into(),
            name: "sample".into(),
            app_type: "web_app".into(),
            platform: "windows".into(),
            stack: "none".into(),
            stamp: "public".into(),
            hosting_environment_type: "v2".into(),
            provider: String::new(),
            resource_type: String::new(),
            internal: false,
        }
    }
}

impl ResourceArgs {
    pub fn to_context(&self) -> Result<ResourceContext> {
        let resource = match self.kind.replace('_', "-").to_lowercase().as_str() {
            "app" => ResourceInstance::App(AppResource {
                name: self.name.clone(),
                app_type: flag::<AppType>("app type", &self.app_type)?,
                platform: flag::<PlatformType>("platform", &self.platform)?,
                stack: flag::<StackType>("stack", &self.stack)?,
                stamp: flag::<StampType>("stamp", &self.stamp)?,
            }),
            "hosting-environment" => ResourceInstance::HostingEnvironment(HostingEnvironmentResource {
                name: self.name.clone(),
                platform: flag::<PlatformType>("platform", &self.platform)?,
                hosting_environment_type: flag::<HostingEnvironmentType>(
                    "hosting environment type",
                    &self.hosting_environment_type,
                )?,
            }),
            "arm" => {
                if self.provider.is_empty() || self.resource_type.is_empty() {
                    bail!("--provider and --resource-type are required for arm resources");
                }
                ResourceInstance::Arm(ArmResource {
                    name: self.name.clone(),
                    provider: self.provider.clone(),
                    resource_type: self.resource_type.clone(),
                })
            }
            other => bail!("Unknown resource kind '{}': expected app, hosting-environment or arm", other),
        };
        Ok(ResourceContext::new(resource, self.internal))
    }
}

fn flag<F: bitflags::Flags>(label: &str, expr: &str) -> Result<F> {
    parse_flags::<F>(expr).with_context(|| format!("Unknown {} '{}'", label, expr))
}

// ═══════════════════════════════════════════════════════════════════════
// Scaffold
// ═══════════════════════════════════════════════════════════════════════

/// Write a commented unit template to `units/<name>.lua`.
pub fn scaffold_unit(name: &str) -> Result<()> {
    let dir = Path::new("units");
    std::fs::create_dir_all(dir)?;

    let id = name.replace('_', "-");
    let path = dir.join(format!("{}.lua", id));
    if path.exists() {
        bail!("Unit already exists: {}", path.display());
    }

    let template = format!(
        r#"--[[
  Unit: {id}

  Shared fragments go in fragments/<name>.lua and are loaded with
  require("<name>"), or declared in a header line:
  -- @reference <name>

  Test:
    units test units/{id}.lua --arg threshold=90
]]

unit = {{
    definition = {{
        id = "{id}",
        name = "{id}",
        author = "TODO",
        category = "Availability",
        description = "TODO: describe what this unit detects",
    }},
    resource_filter = {{
        kind = "app",
        app_type = "all",
        platform = {{ "windows", "linux" }},
        internal_only = true,
    }},
    support_topics = {{}},
    parameters = {{
        {{ name = "threshold", type = "number", required = false }},
    }},
}}

--- Evaluate the unit against the current resource.
--- `context.resource` describes the resource being diagnosed.
function unit.run(threshold)
    log.info("checking " .. context.resource.name)
    return {{
        status = "healthy",
        threshold = threshold or 80,
    }}
end
"#,
        id = id,
    );

    std::fs::write(&path, template)?;
    println!("Created unit: {}", path.display());
    println!();
    println!("Then test:");
    println!();
    println!("  units test {} --arg threshold=90", path.display());
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Compile / test
// ═══════════════════════════════════════════════════════════════════════

/// Compile one file against the fragments under `units.dir`.
pub async fn compile_file(path: &Path, config: &Config) -> Result<Arc<CompiledUnit>> {
    let source = load_source_file(path)?;
    let orchestrator = build_orchestrator(config).await?;
    Ok(orchestrator.compile_and_index(&source).await?)
}

pub async fn run_compile(path: &Path, config: &Config) -> Result<()> {
    let unit = compile_file(path, config).await?;
    print_unit(&unit)?;
    if let Some(err) = unit.compile_error() {
        return Err(err.into());
    }
    Ok(())
}

/// Compile `path`, then invoke it with `--arg` values bound to its
/// declared parameters by name.
pub async fn run_test(
    path: &Path,
    args: Vec<(String, String)>,
    resource: &ResourceArgs,
    config: &Config,
) -> Result<()> {
    let ctx = resource.to_context()?;
    let unit = compile_file(path, config).await?;
    println!("Testing unit: {} ({})", unit.id, path.display());
    if let Some(err) = unit.compile_error() {
        print_unit(&unit)?;
        return Err(err.into());
    }
    println!("  ✓ Compiled");

    let values = positional_args(unit.metadata.as_ref(), &args)?;
    let compiler = compiler_from_config(config);
    let deadline = config
        .units
        .invoke_timeout_secs
        .map(|s| Instant::now() + Duration::from_secs(s));
    let invoked = Arc::clone(&unit);
    let result =
        tokio::task::spawn_blocking(move || compiler.invoke(&invoked, values, Some(&ctx), deadline))
            .await??;

    println!("  ✓ Invoked");
    println!();
    println!("Result:");
    let pretty = serde_json::to_string_pretty(&result)?;
    for line in pretty.lines() {
        println!("  {}", line);
    }
    Ok(())
}

/// Order `key=value` pairs by the unit's declared parameters. Values
/// parse as JSON, falling back to a string; absent parameters are null.
/// Without declared parameters the pairs are passed in the given order.
pub fn positional_args(
    metadata: Option<&UnitMetadata>,
    args: &[(String, String)],
) -> Result<Vec<Value>> {
    let parse = |v: &str| serde_json::from_str::<Value>(v).unwrap_or_else(|_| Value::String(v.to_string()));

    let params = metadata.map(|m| m.parameters.as_slice()).unwrap_or(&[]);
    if params.is_empty() {
        return Ok(args.iter().map(|(_, v)| parse(v)).collect());
    }

    for (key, _) in args {
        if !params.iter().any(|p| p.name.eq_ignore_ascii_case(key)) {
            let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
            bail!("Unknown argument '{}': declared parameters are {}", key, names.join(", "));
        }
    }

    Ok(params
        .iter()
        .map(|p| {
            args.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(&p.name))
                .map(|(_, v)| parse(v))
                .unwrap_or(Value::Null)
        })
        .collect())
}

fn print_unit(unit: &CompiledUnit) -> Result<()> {
    println!("{} {:?} {:?}", unit.id, unit.kind, unit.state());
    for diagnostic in &unit.diagnostics {
        println!("  {}", diagnostic);
    }
    if let Some(metadata) = &unit.metadata {
        let pretty = serde_json::to_string_pretty(metadata)?;
        for line in pretty.lines() {
            println!("  {}", line);
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// List / publish
// ═══════════════════════════════════════════════════════════════════════

/// Compile every source under `units.dir` and return the units
/// applicable to `resource`, resource units first, then system units.
pub async fn applicable_units(config: &Config, resource: &ResourceArgs) -> Result<Vec<UnitMetadata>> {
    let ctx = resource.to_context()?;
    let orchestrator = build_orchestrator(config).await?;
    let sources = FsSourceResolver::from_config(config)?.scan()?;

    for source in &sources {
        let unit = orchestrator.compile_and_index(source).await?;
        if unit.kind == UnitKind::Unit && !unit.is_compilation_successful() {
            eprintln!("{}: {}", unit.id, unit.error_messages().join("; "));
        }
    }

    let mut units = orchestrator.list_applicable_units(&ctx);
    units.extend(orchestrator.list_system_units(&ctx));
    Ok(units)
}

pub async fn run_list(config: &Config, resource: &ResourceArgs) -> Result<()> {
    let units = applicable_units(config, resource).await?;
    if units.is_empty() {
        println!("No applicable units.");
        return Ok(());
    }

    println!("{:<24} {:<8} {:<28} AUTHOR", "UNIT", "TYPE", "NAME");
    for m in &units {
        let type_str = if m.is_system() { "system" } else { "resource" };
        println!(
            "{:<24} {:<8} {:<28} {}",
            m.id(),
            type_str,
            m.display_name(),
            m.definition.author
        );
    }
    Ok(())
}

/// Compile `path`, upload its artifact and upsert its metadata row into
/// the configured stores.
pub async fn run_publish(path: &Path, config: &Config) -> Result<()> {
    let source = load_source_file(path)?;
    let orchestrator = build_orchestrator(config).await?;
    let unit = orchestrator.publish(source).await?;
    if let Some(err) = unit.compile_error() {
        print_unit(&unit)?;
        return Err(err.into());
    }
    println!("Published {} ({:?})", unit.id, unit.kind);
    Ok(())
}
