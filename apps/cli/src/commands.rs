//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tracing::info;

use stitchwork_core::{CycleObserver, CycleReport, Orchestrator, ReleaseDecision};
use stitchwork_shared::{
    AppConfig, EntityId, ProcessingState, ProcessingStatus, config_file_path, init_config_at,
    load_config, load_config_from,
};
use stitchwork_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Stitchwork: ingest, enrich and stitch entities from pluggable sources.
#[derive(Parser)]
#[command(
    name = "stitchwork",
    version,
    about = "Ingest raw entities, run staged enrichment workers, and stitch canonical records.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.stitchwork/stitchwork.toml).
    #[arg(long, global = true, env = "STITCHWORK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database file, overriding `[database].path`.
    #[arg(long, global = true, env = "STITCHWORK_DB")]
    pub db: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Register or update a raw entity and schedule it.
    Emit {
        /// Provider id owning the entity.
        provider: String,

        /// Provider-scoped external id.
        external_id: String,

        /// JSON payload, or `@path` to read it from a file.
        payload: String,
    },

    /// Delete an entity and everything derived from it.
    Retract {
        provider: String,
        external_id: String,
    },

    /// Run enrichment workers.
    Work {
        /// Number of concurrent workers (defaults to `[worker].count`).
        #[arg(short, long)]
        workers: Option<usize>,

        /// Process everything currently due, then exit.
        #[arg(long)]
        drain: bool,
    },

    /// Show the processing state of an entity.
    Status { entity_id: EntityId },

    /// Show the committed canonical entity as JSON.
    Show { entity_id: EntityId },

    /// Show queue counts and list entries.
    Queue {
        /// Only list entries with this status.
        #[arg(long)]
        status: Option<ProcessingStatus>,

        /// Maximum entries to list.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Move a dead-lettered entity back to the queue.
    Requeue { entity_id: EntityId },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "stitchwork=info",
        1 => "stitchwork=debug",
        _ => "stitchwork=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config {
        action: ConfigAction::Init,
    } = &cli.command
    {
        return cmd_config_init(cli.config.as_deref());
    }
    let env = Env::resolve(&cli)?;

    match cli.command {
        Command::Emit {
            provider,
            external_id,
            payload,
        } => cmd_emit(&env, &provider, &external_id, &payload).await,
        Command::Retract {
            provider,
            external_id,
        } => cmd_retract(&env, &provider, &external_id).await,
        Command::Work { workers, drain } => cmd_work(&env, workers, drain).await,
        Command::Status { entity_id } => cmd_status(&env, entity_id).await,
        Command::Show { entity_id } => cmd_show(&env, entity_id).await,
        Command::Queue { status, limit } => cmd_queue(&env, status, limit).await,
        Command::Requeue { entity_id } => cmd_requeue(&env, entity_id).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(cli.config.as_deref()),
            ConfigAction::Show => cmd_config_show(&env),
        },
    }
}

/// Resolved config and database location.
struct Env {
    config: AppConfig,
    db_path: PathBuf,
}

impl Env {
    fn resolve(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        };
        let db_path = match &cli.db {
            Some(path) => path.clone(),
            None => config.database.resolve_path()?,
        };
        Ok(Self { config, db_path })
    }

    async fn orchestrator(&self) -> Result<Orchestrator> {
        Ok(Orchestrator::open(&self.config, &self.db_path, Vec::new()).await?)
    }

    async fn readonly_storage(&self) -> Result<Storage> {
        if !self.db_path.exists() {
            return Err(eyre!(
                "no database at '{}'; emit an entity or run a worker first",
                self.db_path.display()
            ));
        }
        Ok(Storage::open_readonly(&self.db_path).await?)
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_emit(env: &Env, provider: &str, external_id: &str, payload: &str) -> Result<()> {
    let payload = parse_payload(payload)?;
    let orch = env.orchestrator().await?;
    let receipt = orch.emit(provider, external_id, &payload).await?;

    let action = if receipt.created { "created" } else { "updated" };
    println!("{} {action}", receipt.entity_id);
    Ok(())
}

fn parse_payload(arg: &str) -> Result<Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .wrap_err_with(|| format!("cannot read payload file '{path}'"))?,
        None => arg.to_string(),
    };
    serde_json::from_str(&text).wrap_err("payload is not valid JSON")
}

async fn cmd_retract(env: &Env, provider: &str, external_id: &str) -> Result<()> {
    let orch = env.orchestrator().await?;
    let entity_id = orch.retract(provider, external_id).await?;
    println!("{entity_id} retracted");
    Ok(())
}

async fn cmd_work(env: &Env, workers: Option<usize>, drain: bool) -> Result<()> {
    let orch = env.orchestrator().await?;
    let count = workers.unwrap_or(orch.settings().count).max(1);
    let observer = Arc::new(CliObserver::new());
    let prefix = worker_prefix();

    if drain {
        info!(db = %env.db_path.display(), "draining queue");
        let summary = orch
            .run_until_idle(&format!("{prefix}-drain"), observer.clone())
            .await?;
        observer.finish();

        println!();
        println!("  Processed:     {}", summary.processed);
        println!("  Retrying:      {}", summary.retried);
        println!("  Dead-lettered: {}", summary.dead_lettered);
        println!("  Discarded:     {}", summary.discarded);
        println!();
        return Ok(());
    }

    info!(count, db = %env.db_path.display(), "starting workers; ctrl-c to stop");
    let pool = orch.spawn_workers(count, &prefix, observer.clone());
    tokio::signal::ctrl_c()
        .await
        .wrap_err("failed to listen for ctrl-c")?;

    observer.spinner.set_message("Stopping workers...");
    pool.shutdown().await?;
    observer.finish();
    Ok(())
}

fn worker_prefix() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "worker".to_string())
}

async fn cmd_status(env: &Env, entity_id: EntityId) -> Result<()> {
    let storage = env.readonly_storage().await?;
    let state = storage
        .get_processing_state(entity_id)
        .await?
        .ok_or_else(|| eyre!("entity {entity_id} not found"))?;
    print_state(&state);
    Ok(())
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into())
}

fn print_state(state: &ProcessingState) {
    println!("  Entity:   {}", state.entity_id);
    println!("  Status:   {}", state.status);
    println!("  Attempts: {}", state.attempt_count);
    println!("  Due:      {}", fmt_time(state.due_at));
    println!(
        "  Lease:    {} until {}",
        state.lease_owner.as_deref().unwrap_or("-"),
        fmt_time(state.lease_expires_at)
    );
    println!("  Error:    {}", state.last_error.as_deref().unwrap_or("-"));
}

async fn cmd_show(env: &Env, entity_id: EntityId) -> Result<()> {
    let storage = env.readonly_storage().await?;
    let canonical = storage
        .get_canonical(entity_id)
        .await?
        .ok_or_else(|| eyre!("entity {entity_id} has no canonical version"))?;
    println!("{}", serde_json::to_string_pretty(&canonical)?);
    Ok(())
}

async fn cmd_queue(env: &Env, status: Option<ProcessingStatus>, limit: u32) -> Result<()> {
    let storage = env.readonly_storage().await?;
    let stats = storage.queue_stats().await?;
    println!(
        "  unprocessed: {}  claimed: {}  processed: {}  failed: {}",
        stats.unprocessed, stats.claimed, stats.processed, stats.failed
    );
    println!();

    for state in storage.list_processing(status, limit).await? {
        let due = fmt_time(state.due_at);
        println!(
            "  {}  {:<11}  attempts={}  due={}  {}",
            state.entity_id,
            state.status.as_str(),
            state.attempt_count,
            due,
            state.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_requeue(env: &Env, entity_id: EntityId) -> Result<()> {
    let orch = env.orchestrator().await?;
    orch.scheduler().requeue(entity_id).await?;
    println!("{entity_id} requeued");
    Ok(())
}

fn cmd_config_init(path: Option<&std::path::Path>) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config_file_path()?,
    };
    init_config_at(&path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(env: &Env) -> Result<()> {
    let toml_str = toml::to_string_pretty(&env.config)?;
    println!("{toml_str}");
    println!("# database: {}", env.db_path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI cycle observer
// ---------------------------------------------------------------------------

/// Worker progress rendered as an indicatif spinner.
struct CliObserver {
    spinner: ProgressBar,
    processed: AtomicUsize,
    retried: AtomicUsize,
    failed: AtomicUsize,
    discarded: AtomicUsize,
}

impl CliObserver {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        spinner.set_message("Waiting for work...");
        Self {
            spinner,
            processed: AtomicUsize::new(0),
            retried: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
        }
    }

    fn counts(&self) -> String {
        format!(
            "processed {} · retrying {} · failed {} · discarded {}",
            self.processed.load(Ordering::Relaxed),
            self.retried.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.discarded.load(Ordering::Relaxed),
        )
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl CycleObserver for CliObserver {
    fn claimed(&self, worker_id: &str, entity_id: EntityId, attempt: u32) {
        self.spinner.set_message(format!(
            "[{worker_id}] {entity_id} attempt {attempt} | {}",
            self.counts()
        ));
    }

    fn finished(&self, _worker_id: &str, report: &CycleReport) {
        let counter = match report {
            CycleReport::Idle => return,
            CycleReport::Discarded { .. } => &self.discarded,
            CycleReport::Processed { decision, .. } => match decision {
                ReleaseDecision::Processed => &self.processed,
                ReleaseDecision::Retry { .. } => &self.retried,
                ReleaseDecision::DeadLettered => &self.failed,
                ReleaseDecision::LeaseLost => &self.discarded,
            },
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.spinner.set_message(self.counts());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn cli_parses_work_flags() {
        let cli = Cli::parse_from(["stitchwork", "--db", "/tmp/x.db", "work", "-w", "3", "--drain"]);
        assert_eq!(cli.db.as_deref(), Some(Path::new("/tmp/x.db")));
        match cli.command {
            Command::Work { workers, drain } => {
                assert_eq!(workers, Some(3));
                assert!(drain);
            }
            _ => panic!("expected work command"),
        }
    }

    #[test]
    fn cli_parses_queue_status_filter() {
        let cli = Cli::parse_from(["stitchwork", "queue", "--status", "failed"]);
        match cli.command {
            Command::Queue { status, limit } => {
                assert_eq!(status, Some(ProcessingStatus::Failed));
                assert_eq!(limit, 20);
            }
            _ => panic!("expected queue command"),
        }
    }

    #[test]
    fn payload_inline_and_invalid() {
        assert_eq!(parse_payload(r#"{"a":1}"#).unwrap()["a"], 1);
        assert!(parse_payload("{not json").is_err());
    }
}
