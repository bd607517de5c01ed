//! Application configuration for Stitchwork.
//!
//! User config lives at `~/.stitchwork/stitchwork.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StitchworkError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "stitchwork.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".stitchwork";

/// Upper bound for scheduler durations (one year).
const MAX_SCHEDULER_MS: u64 = 365 * 24 * 60 * 60 * 1000;

// ---------------------------------------------------------------------------
// Config structs (matching stitchwork.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Entity store location.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Queue, retry and lease policy.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Worker loop tuning.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Provider registry and payload limits.
    #[serde(default)]
    pub intake: IntakeSection,

    /// Stage order and built-in processors.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// `[database]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the libSQL database file. A leading `~/` expands to the home directory.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.stitchwork/stitchwork.db".into()
}

impl DatabaseConfig {
    /// Resolve the configured path, expanding `~/`.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        match self.path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir().ok_or_else(|| {
                    StitchworkError::config("could not determine home directory")
                })?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.path)),
        }
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Claims allowed before a transiently failing entity is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay; doubled per attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on the retry delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// How long a claim stays exclusive before another worker may take over.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            lease_ms: default_lease_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    300_000
}
fn default_lease_ms() -> u64 {
    60_000
}

/// `[worker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent worker coordinators.
    #[serde(default = "default_worker_count")]
    pub count: u32,

    /// Initial sleep when the queue has nothing due.
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,

    /// Cap for the doubling idle sleep.
    #[serde(default = "default_idle_backoff_max_ms")]
    pub idle_backoff_max_ms: u64,

    /// Sleep after a store error before the next cycle.
    #[serde(default = "default_store_retry_ms")]
    pub store_retry_ms: u64,

    /// Per-processor invocation timeout.
    #[serde(default = "default_processor_timeout_ms")]
    pub processor_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            idle_backoff_ms: default_idle_backoff_ms(),
            idle_backoff_max_ms: default_idle_backoff_max_ms(),
            store_retry_ms: default_store_retry_ms(),
            processor_timeout_ms: default_processor_timeout_ms(),
        }
    }
}

fn default_worker_count() -> u32 {
    4
}
fn default_idle_backoff_ms() -> u64 {
    250
}
fn default_idle_backoff_max_ms() -> u64 {
    5_000
}
fn default_store_retry_ms() -> u64 {
    1_000
}
fn default_processor_timeout_ms() -> u64 {
    30_000
}

/// `[intake]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeSection {
    /// Registered provider ids. Empty means any well-formed provider id is accepted.
    #[serde(default)]
    pub providers: Vec<String>,

    /// Largest accepted serialized payload.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for IntakeSection {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stage names in execution order.
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,

    /// Built-in processors, in registration order.
    #[serde(default)]
    pub processors: Vec<BuiltinProcessorConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            processors: Vec::new(),
        }
    }
}

fn default_stages() -> Vec<String> {
    ["extract", "derive", "identify", "finalize"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// `[[pipeline.processors]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuiltinProcessorConfig {
    /// Copy top-level payload fields into metadata.
    CopyFields {
        id: String,
        stage: String,
        fields: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Runtime configs (derived from AppConfig)
// ---------------------------------------------------------------------------

/// Runtime scheduler policy.
#[derive(Debug, Clone)]
pub struct SchedulerPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub lease: Duration,
}

impl From<&AppConfig> for SchedulerPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.scheduler.max_attempts,
            backoff_base: Duration::from_millis(config.scheduler.backoff_base_ms),
            backoff_max: Duration::from_millis(config.scheduler.backoff_max_ms),
            lease: Duration::from_millis(config.scheduler.lease_ms),
        }
    }
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Runtime worker settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub count: usize,
    pub idle_backoff: Duration,
    pub idle_backoff_max: Duration,
    pub store_retry: Duration,
    pub processor_timeout: Duration,
}

impl From<&AppConfig> for WorkerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            count: config.worker.count as usize,
            idle_backoff: Duration::from_millis(config.worker.idle_backoff_ms),
            idle_backoff_max: Duration::from_millis(config.worker.idle_backoff_max_ms),
            store_retry: Duration::from_millis(config.worker.store_retry_ms),
            processor_timeout: Duration::from_millis(config.worker.processor_timeout_ms),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Runtime intake configuration: the explicit provider registry.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub providers: BTreeSet<String>,
    pub max_payload_bytes: usize,
}

impl From<&AppConfig> for IntakeConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            providers: config.intake.providers.iter().cloned().collect(),
            max_payload_bytes: config.intake.max_payload_bytes,
        }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.stitchwork/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| StitchworkError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.stitchwork/stitchwork.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| StitchworkError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        StitchworkError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let path = config_dir()?.join(CONFIG_FILE_NAME);
    init_config_at(&path)?;
    Ok(path)
}

/// Write a default config file at `path`, creating parent directories.
pub fn init_config_at(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| StitchworkError::io(dir, e))?;
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| StitchworkError::config(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| StitchworkError::io(path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(())
}

/// Reject configurations the orchestrator cannot run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.scheduler.max_attempts == 0 {
        return Err(StitchworkError::config(
            "scheduler.max_attempts must be at least 1",
        ));
    }
    if config.scheduler.backoff_max_ms < config.scheduler.backoff_base_ms {
        return Err(StitchworkError::config(
            "scheduler.backoff_max_ms must not be smaller than backoff_base_ms",
        ));
    }
    for (name, value) in [
        ("backoff_max_ms", config.scheduler.backoff_max_ms),
        ("lease_ms", config.scheduler.lease_ms),
    ] {
        if value > MAX_SCHEDULER_MS {
            return Err(StitchworkError::config(format!(
                "scheduler.{name} must not exceed {MAX_SCHEDULER_MS}"
            )));
        }
    }
    if config.scheduler.lease_ms == 0 {
        return Err(StitchworkError::config("scheduler.lease_ms must be positive"));
    }
    if config.worker.count == 0 {
        return Err(StitchworkError::config("worker.count must be at least 1"));
    }
    if config.pipeline.stages.is_empty() {
        return Err(StitchworkError::config(
            "pipeline.stages must name at least one stage",
        ));
    }

    let mut seen = HashSet::new();
    for stage in &config.pipeline.stages {
        if !seen.insert(stage.as_str()) {
            return Err(StitchworkError::config(format!(
                "pipeline stage '{stage}' is listed twice"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("max_attempts"));
        assert!(toml_str.contains("extract"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.scheduler.max_attempts, 5);
        assert_eq!(
            parsed.pipeline.stages,
            vec!["extract", "derive", "identify", "finalize"]
        );
    }

    #[test]
    fn config_with_processors() {
        let toml_str = r#"
[scheduler]
max_attempts = 3

[intake]
providers = ["fs-scanner"]

[pipeline]
stages = ["extract", "derive"]

[[pipeline.processors]]
kind = "copy_fields"
id = "header"
stage = "extract"
fields = ["EXPTIME", "OBJECT"]
prefix = "fits."
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.scheduler.lease_ms, 60_000);
        assert_eq!(config.intake.providers, vec!["fs-scanner"]);
        assert_eq!(config.pipeline.processors.len(), 1);
        match &config.pipeline.processors[0] {
            BuiltinProcessorConfig::CopyFields {
                id, fields, prefix, ..
            } => {
                assert_eq!(id, "header");
                assert_eq!(fields.len(), 2);
                assert_eq!(prefix.as_deref(), Some("fits."));
            }
        }
        validate_config(&config).expect("valid");
    }

    #[test]
    fn runtime_configs_from_app_config() {
        let app = AppConfig::default();
        let policy = SchedulerPolicy::from(&app);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_base, Duration::from_secs(1));
        assert_eq!(policy.lease, Duration::from_secs(60));

        let worker = WorkerSettings::from(&app);
        assert_eq!(worker.count, 4);
        assert_eq!(worker.processor_timeout, Duration::from_secs(30));

        let intake = IntakeConfig::from(&app);
        assert!(intake.providers.is_empty());
        assert_eq!(intake.max_payload_bytes, 1024 * 1024);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.scheduler.max_attempts = 0;
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.pipeline.stages = vec!["extract".into(), "extract".into()];
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("listed twice"));

        let mut config = AppConfig::default();
        config.scheduler.backoff_max_ms = 10;
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.scheduler.backoff_max_ms = 10_000_000_000_000_000;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("backoff_max_ms must not exceed"));

        let mut config = AppConfig::default();
        config.scheduler.lease_ms = u64::MAX;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("lease_ms must not exceed"));
    }

    #[test]
    fn init_config_at_writes_loadable_defaults() {
        let path = std::env::temp_dir()
            .join(format!("sw_cfg_{}", uuid::Uuid::now_v7()))
            .join("stitchwork.toml");
        init_config_at(&path).expect("write config");
        let loaded = load_config_from(&path).expect("load config");
        assert_eq!(loaded.scheduler.max_attempts, 5);
        assert_eq!(loaded.worker.count, 4);
        assert_eq!(loaded.pipeline.stages.len(), 4);
    }

    #[test]
    fn db_path_expands_home() {
        let config = DatabaseConfig::default();
        let resolved = config.resolve_path().expect("resolve");
        assert!(resolved.ends_with(".stitchwork/stitchwork.db"));

        let config = DatabaseConfig {
            path: "/var/lib/stitchwork.db".into(),
        };
        assert_eq!(
            config.resolve_path().unwrap(),
            PathBuf::from("/var/lib/stitchwork.db")
        );
    }
}
