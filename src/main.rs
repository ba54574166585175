//! # Unit Harness CLI (`units`)
//!
//! Author, check and publish Lua diagnostic units, or run the host that
//! keeps them compiled and cached.
//!
//! ## Usage
//!
//! ```bash
//! units --config ./config/units.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `units init` | Create the SQLite database and its schema |
//! | `units scaffold <name>` | Write a template unit to `units/<name>.lua` |
//! | `units compile <path>` | Compile a unit and print diagnostics and metadata |
//! | `units test <path> --arg k=v` | Compile and invoke a unit against a sample resource |
//! | `units list --resource app --platform linux` | Units applicable to a resource |
//! | `units publish <path>` | Compile, upload the artifact, upsert the metadata row |
//! | `units serve` | Run the host: load metadata, warm units, poll until Ctrl-C |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use unit_harness::config;
use unit_harness::host::UnitHost;
use unit_harness::migrate;
use unit_harness::unit_cmd::{self, ResourceArgs};

/// Unit Harness: host, cache and invoke Lua diagnostic units.
#[derive(Parser)]
#[command(name = "units", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Commands other than `init`, `publish` and `serve` fall back to
    /// defaults when the file is missing.
    #[arg(long, global = true, default_value = "./config/units.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the SQLite metadata store.
    ///
    /// Idempotent; safe to run more than once.
    Init,

    /// Scaffold a new unit from a template.
    Scaffold {
        /// Unit identifier (e.g., `high-cpu`).
        name: String,
    },

    /// Compile a unit or fragment and print its diagnostics.
    Compile {
        /// Path to the `.lua` source.
        path: PathBuf,
    },

    /// Compile a unit and invoke it.
    Test {
        /// Path to the `.lua` unit.
        path: PathBuf,
        /// Unit arguments as `key=value` pairs, bound to declared parameters.
        #[arg(long = "arg", value_parser = parse_key_val)]
        args: Vec<(String, String)>,
        #[command(flatten)]
        resource: ResourceArgs,
    },

    /// List units under `units.dir` applicable to a resource.
    List {
        #[command(flatten)]
        resource: ResourceArgs,
    },

    /// Publish a unit to the configured stores.
    Publish {
        /// Path to the `.lua` source.
        path: PathBuf,
    },

    /// Run the host until interrupted.
    Serve,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that can run without a config file
    let cfg = match &cli.command {
        Commands::Init | Commands::Publish { .. } | Commands::Serve => config::load_config(&cli.config)?,
        _ => config::load_config(&cli.config).unwrap_or_else(|_| config::Config::minimal()),
    };

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Scaffold { name } => {
            unit_cmd::scaffold_unit(&name)?;
        }
        Commands::Compile { path } => {
            unit_cmd::run_compile(&path, &cfg).await?;
        }
        Commands::Test {
            path,
            args,
            resource,
        } => {
            unit_cmd::run_test(&path, args, &resource, &cfg).await?;
        }
        Commands::List { resource } => {
            unit_cmd::run_list(&cfg, &resource).await?;
        }
        Commands::Publish { path } => {
            unit_cmd::run_publish(&path, &cfg).await?;
        }
        Commands::Serve => {
            let host = UnitHost::start(&cfg).await?;
            tokio::signal::ctrl_c().await?;
            host.shutdown().await?;
        }
    }

    Ok(())
}
