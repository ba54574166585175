use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub units: UnitsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub blob: BlobConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UnitsConfig {
    /// Root holding `units/` and `fragments/` subdirectories.
    #[serde(default = "default_units_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    /// Host-imposed deadline for a single invocation. Unset means none.
    #[serde(default)]
    pub invoke_timeout_secs: Option<u64>,
    /// Upper bound on evaluating a unit's top level during compilation.
    #[serde(default = "default_compile_timeout_secs")]
    pub compile_timeout_secs: u64,
}

impl Default for UnitsConfig {
    fn default() -> Self {
        Self {
            dir: default_units_dir(),
            include_globs: default_include_globs(),
            invoke_timeout_secs: None,
            compile_timeout_secs: default_compile_timeout_secs(),
        }
    }
}

fn default_units_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.lua".to_string()]
}
fn default_compile_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_artifact_capacity")]
    pub artifact_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            artifact_capacity: default_artifact_capacity(),
        }
    }
}

fn default_artifact_capacity() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// How far back each incremental poll looks.
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            lookback_secs: default_lookback_secs(),
            categories: default_categories(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_interval_secs() -> u64 {
    60
}
fn default_lookback_secs() -> u64 {
    300
}
fn default_categories() -> Vec<String> {
    vec!["unit".to_string(), "fragment".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_delay_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/units.sqlite")
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BlobConfig {
    /// Directory artifacts are written under. Unset keeps them in memory.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Client timeout for the `http` host API; also bounds its retries.
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_http_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Defaults for commands that run without a config file.
    pub fn minimal() -> Self {
        Self::default()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.cache.artifact_capacity == 0 {
        anyhow::bail!("cache.artifact_capacity must be > 0");
    }

    if config.poller.interval_secs == 0 {
        anyhow::bail!("poller.interval_secs must be > 0");
    }

    if config.poller.enabled && config.poller.categories.is_empty() {
        anyhow::bail!("poller.categories must not be empty when the poller is enabled");
    }

    if config.retry.max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be >= 1");
    }

    if config.units.invoke_timeout_secs == Some(0) {
        anyhow::bail!("units.invoke_timeout_secs must be > 0 when set");
    }

    Ok(config)
}
