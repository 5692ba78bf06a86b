pub mod config;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::info;

use crate::storage::connection::{
    DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_DATABASE_URL, DEFAULT_MAX_CONNECTIONS,
};
use crate::storage::hierarchy::Lineage;
use crate::storage::types::{
    ArtifactRecord, FlowKey, MetadataRecord, RunKey, RunRecord, StepRecord, TaskRecord,
};
use crate::storage::{DatabaseConfig, MetadataStore};

pub use config::FlowMetaConfig;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_BODY: usize = 1_048_576;

#[derive(Parser)]
#[command(
    name = "flowmeta",
    version,
    about = "Execution-tracking store for flows, runs, steps and tasks"
)]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a YAML config file (default: auto-detect flowmeta.yaml in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Database connection flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct DatabaseArgs {
    /// Database URL (sqlite://... or postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Maximum pooled connections
    #[arg(long, env = "MF_METADATA_MAX_CONNECTIONS")]
    max_connections: Option<u32>,

    /// Seconds to wait for a free connection
    #[arg(long, env = "MF_METADATA_ACQUIRE_TIMEOUT")]
    acquire_timeout: Option<u64>,
}

impl DatabaseArgs {
    /// Flag/env values win over the config file, which wins over defaults.
    fn resolve(&self, cfg: &FlowMetaConfig) -> DatabaseConfig {
        DatabaseConfig {
            url: self
                .database_url
                .clone()
                .or_else(|| cfg.database_url.clone())
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            max_connections: self
                .max_connections
                .or(cfg.max_connections)
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: self
                .acquire_timeout
                .or(cfg.acquire_timeout_s)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server
    Serve {
        /// Host to bind to
        #[arg(long, env = "MF_METADATA_HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "MF_METADATA_PORT")]
        port: Option<u16>,

        /// Maximum request body size in bytes (default: 1048576 = 1 MB)
        #[arg(long, env = "MF_METADATA_MAX_BODY")]
        max_body: Option<usize>,

        #[command(flatten)]
        db: DatabaseArgs,
    },

    /// Create the schema and exit
    Migrate {
        #[command(flatten)]
        db: DatabaseArgs,
    },

    /// List registered flows
    Flows {
        /// Only flows registered after this epoch-millisecond timestamp
        #[arg(long)]
        since: Option<i64>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,

        #[command(flatten)]
        db: DatabaseArgs,
    },

    /// List the runs of a flow
    Runs {
        /// Flow ID
        flow_id: String,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,

        #[command(flatten)]
        db: DatabaseArgs,
    },

    /// Print a run with its steps, tasks, metadata and artifacts
    Inspect {
        /// Flow ID
        flow_id: String,

        /// Run number
        run_number: i64,

        #[command(flatten)]
        db: DatabaseArgs,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let cfg = FlowMetaConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            max_body,
            db,
        } => {
            let host = host
                .or_else(|| cfg.host.clone())
                .unwrap_or_else(|| DEFAULT_HOST.to_string());
            let port = port.or(cfg.port).unwrap_or(DEFAULT_PORT);
            let max_body = max_body.or(cfg.max_body).unwrap_or(DEFAULT_MAX_BODY);
            let store = open_store(db.resolve(&cfg)).await?;
            crate::api::serve(&host, port, store, max_body).await
        }
        Commands::Migrate { db } => cmd_migrate(db.resolve(&cfg)).await,
        Commands::Flows { since, format, db } => cmd_flows(db.resolve(&cfg), since, format).await,
        Commands::Runs {
            flow_id,
            format,
            db,
        } => cmd_runs(db.resolve(&cfg), flow_id, format).await,
        Commands::Inspect {
            flow_id,
            run_number,
            db,
        } => cmd_inspect(db.resolve(&cfg), flow_id, run_number).await,
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (warn if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

/// Create the directory holding a SQLite database file, if any.
fn ensure_sqlite_dir(url: &str) -> Result<()> {
    let Some(rest) = url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let file = rest.split('?').next().unwrap_or_default();
    if file.is_empty() || file == ":memory:" {
        return Ok(());
    }
    if let Some(parent) = Path::new(file).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
    }
    Ok(())
}

async fn open_store(config: DatabaseConfig) -> Result<std::sync::Arc<MetadataStore>> {
    ensure_sqlite_dir(&config.url)?;
    MetadataStore::get_instance(&config)
        .await
        .with_context(|| "Failed to open metadata store")
}

fn format_ts(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

async fn cmd_migrate(config: DatabaseConfig) -> Result<()> {
    let store = open_store(config).await?;
    println!("Schema ready ({})", store.connection().backend());
    store.shutdown().await;
    Ok(())
}

async fn cmd_flows(config: DatabaseConfig, since: Option<i64>, format: String) -> Result<()> {
    let store = open_store(config).await?;
    let result = print_flows(&store, since, &format).await;
    store.shutdown().await;
    result
}

async fn print_flows(store: &MetadataStore, since: Option<i64>, format: &str) -> Result<()> {
    let flows = store.flows().list(since).await?;

    if flows.is_empty() {
        println!("No flows found.");
        return Ok(());
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&flows)?);
        return Ok(());
    }

    println!("{:<32} {:<24} {:<16} {:<20}", "FLOW ID", "NAME", "USER", "REGISTERED");
    println!("{}", "-".repeat(92));
    for flow in &flows {
        println!(
            "{:<32} {:<24} {:<16} {:<20}",
            flow.flow_id,
            flow.name,
            flow.user_name.as_deref().unwrap_or("-"),
            format_ts(flow.ts_epoch)
        );
    }

    println!("\nTotal: {} flow(s)", flows.len());
    Ok(())
}

async fn cmd_runs(config: DatabaseConfig, flow_id: String, format: String) -> Result<()> {
    let store = open_store(config).await?;
    let result = print_runs(&store, FlowKey::new(flow_id), &format).await;
    store.shutdown().await;
    result
}

async fn print_runs(store: &MetadataStore, flow: FlowKey, format: &str) -> Result<()> {
    if store.flows().find(&flow).await?.is_none() {
        anyhow::bail!("Flow '{}' not found", flow);
    }
    let runs = store.runs().list(&flow, None).await?;

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    println!("{:<8} {:<10} {:<16} {:<20} {:<20}", "RUN", "STATUS", "USER", "STARTED", "FINISHED");
    println!("{}", "-".repeat(78));
    for run in &runs {
        println!(
            "{:<8} {:<10} {:<16} {:<20} {:<20}",
            run.run_number,
            run.status,
            run.user_name.as_deref().unwrap_or("-"),
            format_ts(run.ts_epoch),
            run.finished_at.map(format_ts).unwrap_or_else(|| "-".to_string())
        );
    }

    println!("\nTotal: {} run(s)", runs.len());
    Ok(())
}

#[derive(Serialize)]
struct TaskView {
    #[serde(flatten)]
    task: TaskRecord,
    artifacts: Vec<ArtifactRecord>,
}

#[derive(Serialize)]
struct StepView {
    #[serde(flatten)]
    step: StepRecord,
    tasks: Vec<TaskView>,
}

#[derive(Serialize)]
struct RunView {
    #[serde(flatten)]
    run: RunRecord,
    steps: Vec<StepView>,
    metadata: Vec<MetadataRecord>,
}

async fn cmd_inspect(config: DatabaseConfig, flow_id: String, run_number: i64) -> Result<()> {
    let store = open_store(config).await?;
    let result = print_run(&store, RunKey::new(flow_id, run_number)).await;
    store.shutdown().await;
    result
}

async fn print_run(store: &MetadataStore, key: RunKey) -> Result<()> {

    let run = store
        .runs()
        .find(&key)
        .await?
        .with_context(|| format!("Run '{}' not found", key))?;

    let steps = store.steps().list(&key, None).await?;
    let key_ref = &key;
    let step_views = join_all(steps.into_iter().map(|step| {
        let key = key_ref;
        async move {
            let step_key = key.step(step.step_name.clone());
            let tasks = store.tasks().list(&step_key, None).await?;
            let mut task_views = Vec::with_capacity(tasks.len());
            for task in tasks {
                let artifacts = store.artifacts().list(&task.key(), None).await?;
                task_views.push(TaskView { task, artifacts });
            }
            anyhow::Ok(StepView {
                step,
                tasks: task_views,
            })
        }
    }))
    .await
    .into_iter()
    .collect::<Result<Vec<_>>>()?;

    let metadata = store.metadata().list(&Lineage::from(&key), None).await?;

    let view = RunView {
        run,
        steps: step_views,
        metadata,
    };
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let cfg = FlowMetaConfig {
            database_url: Some("sqlite://from-file.db".into()),
            max_connections: Some(3),
            acquire_timeout_s: Some(9),
            ..Default::default()
        };
        let args = DatabaseArgs {
            database_url: Some("sqlite://from-flag.db".into()),
            max_connections: None,
            acquire_timeout: None,
        };
        let resolved = args.resolve(&cfg);
        assert_eq!(resolved.url, "sqlite://from-flag.db");
        assert_eq!(resolved.max_connections, 3);
        assert_eq!(resolved.acquire_timeout, Duration::from_secs(9));
    }

    #[test]
    fn defaults_fill_gaps() {
        let args = DatabaseArgs {
            database_url: None,
            max_connections: None,
            acquire_timeout: None,
        };
        let resolved = args.resolve(&FlowMetaConfig::default());
        assert_eq!(resolved.url, DEFAULT_DATABASE_URL);
        assert_eq!(resolved.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn sqlite_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested/deeper/meta.db");
        ensure_sqlite_dir(&format!("sqlite://{}?mode=rwc", db.display())).unwrap();
        assert!(db.parent().unwrap().is_dir());
        ensure_sqlite_dir("postgres://localhost/meta").unwrap();
    }

    #[tokio::test]
    async fn listing_command_releases_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig::sqlite_file(&dir.path().join("meta.db"));
        cmd_flows(config.clone(), None, "json".into()).await.unwrap();

        // The command opened the process-wide store; it must leave it closed.
        let store = MetadataStore::get_instance(&config).await.unwrap();
        assert!(store.connection().pool().unwrap().is_closed());
    }
}
