use crate::automation::commands::{self, ScheduleAllRequest, ScheduleSessionRequest};
use crate::automation::manager::TaskManager;
use crate::automation::models::{JsonMap, TaskStatus};
use crate::automation::storage::{NullSessionStore, SessionStore, SqliteSessionStore};
use crate::config::SchedulerConfig;
use crate::scheduler::{Scheduler, SchedulerOptions};
use crate::scrapers::registry_from_sources;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const SHUTDOWN_GRACE_SECS: u64 = 10;

#[derive(Debug, Parser)]
#[command(name = "scrapeflow", about = "Priority scheduler for scraping sessions")]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, env = "SCRAPEFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Schedule sessions and run the worker pool until they finish
    Run(RunArgs),
    /// List configured sources
    Sources,
    /// Show persisted sessions
    Sessions(SessionsArgs),
    /// Delete persisted sessions older than a threshold
    Purge(PurgeArgs),
}

#[derive(Debug, Args, Clone)]
struct RunArgs {
    /// Source to scrape; repeatable
    #[arg(long = "source", value_name = "SOURCE")]
    sources: Vec<String>,
    /// Scrape every configured source at high priority
    #[arg(long, conflicts_with = "sources")]
    all: bool,
    /// Session config entry as key=value; values are parsed as JSON when possible
    #[arg(long = "set", value_name = "KEY=VALUE")]
    settings: Vec<String>,
    #[arg(long, default_value = "medium")]
    priority: String,
    /// Give up waiting after this many seconds
    #[arg(long, default_value_t = 3600)]
    wait_secs: u64,
    /// Do not write sessions to the database
    #[arg(long)]
    no_persist: bool,
}

#[derive(Debug, Args, Clone)]
struct SessionsArgs {
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: i64,
}

#[derive(Debug, Args, Clone)]
struct PurgeArgs {
    #[arg(long, default_value_t = commands::DEFAULT_CLEANUP_HOURS)]
    older_than_hours: u64,
}

/// Installs the fmt subscriber. `SCRAPEFLOW_LOG` takes an `EnvFilter` directive.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("SCRAPEFLOW_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

impl Cli {
    pub async fn run(self) -> Result<(), String> {
        let config =
            SchedulerConfig::load(self.config.as_deref()).map_err(|e| e.to_string())?;

        match self.command {
            Command::Run(args) => run_sessions(config, args).await,
            Command::Sources => {
                let sources: Vec<Value> = config
                    .sources
                    .iter()
                    .map(|(name, command)| {
                        json!({
                            "source": name,
                            "program": command.program,
                            "args": command.args,
                        })
                    })
                    .collect();
                print_json(&sources)
            }
            Command::Sessions(args) => {
                let store = SqliteSessionStore::open(&config.resolved_database_path()).await?;
                let status = args
                    .status
                    .as_deref()
                    .map(TaskStatus::from_str)
                    .transpose()?;
                let sessions = store
                    .list_sessions(args.source.as_deref(), status, Some(args.limit))
                    .await?;
                print_json(&sessions)
            }
            Command::Purge(args) => {
                let store = SqliteSessionStore::open(&config.resolved_database_path()).await?;
                let cutoff = i64::try_from(args.older_than_hours)
                    .ok()
                    .and_then(chrono::Duration::try_hours)
                    .and_then(|age| Utc::now().checked_sub_signed(age))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                let deleted = store.purge_sessions_before(cutoff).await?;
                print_json(&json!({
                    "deleted": deleted,
                    "older_than_hours": args.older_than_hours,
                }))
            }
        }
    }
}

async fn run_sessions(config: SchedulerConfig, args: RunArgs) -> Result<(), String> {
    if !args.all && args.sources.is_empty() {
        return Err("Pass --source <name> or --all".to_string());
    }

    let registry = registry_from_sources(&config.sources)?;
    let session_config = parse_settings(&args.settings)?;

    let sqlite_store = if config.persist_sessions && !args.no_persist {
        Some(SqliteSessionStore::open(&config.resolved_database_path()).await?)
    } else {
        None
    };
    let store: Arc<dyn SessionStore> = match &sqlite_store {
        Some(store) => Arc::new(store.clone()),
        None => Arc::new(NullSessionStore),
    };

    let manager = Arc::new(TaskManager::new(
        Arc::new(registry),
        config.retry.clone(),
        config.task_timeout(),
        store,
    ));

    let mut scheduler = Scheduler::new(Arc::clone(&manager), SchedulerOptions::from(&config));
    if let Some(store) = sqlite_store {
        scheduler = scheduler.with_session_store(store);
    }
    let handle = scheduler.start();

    let task_ids = if args.all {
        commands::schedule_all_sessions(
            &manager,
            Some(ScheduleAllRequest {
                config: session_config,
            }),
        )
        .await?
        .task_ids
    } else {
        let mut ids = Vec::with_capacity(args.sources.len());
        for source in &args.sources {
            let scheduled = commands::schedule_session(
                &manager,
                ScheduleSessionRequest {
                    source: source.clone(),
                    config: session_config.clone(),
                    priority: Some(args.priority.clone()),
                    metadata: JsonMap::new(),
                    max_retries: None,
                },
            )
            .await?;
            ids.push(scheduled.task_id);
        }
        ids
    };

    let finished = tokio::select! {
        idle = manager.wait_until_idle(Duration::from_secs(args.wait_secs)) => idle,
        _ = tokio::signal::ctrl_c() => {
            log::warn!("Interrupted; cancelling outstanding sessions");
            false
        }
    };
    if !finished {
        log::warn!("Sessions still running; cancelling them");
    }
    handle
        .shutdown(Duration::from_secs(SHUTDOWN_GRACE_SECS), !finished)
        .await;

    let mut statuses = Vec::with_capacity(task_ids.len());
    for task_id in task_ids {
        statuses.push(commands::get_session_status(&manager, task_id).await?);
    }
    let metrics = commands::get_metrics(&manager).await?;

    print_json(&json!({
        "sessions": statuses,
        "metrics": metrics,
    }))
}

/// Builds a session config object from `key=value` pairs.
fn parse_settings(settings: &[String]) -> Result<Value, String> {
    let mut config = JsonMap::new();
    for setting in settings {
        let (key, raw) = setting
            .split_once('=')
            .ok_or_else(|| format!("Invalid --set '{}': expected key=value", setting))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Invalid --set '{}': key is empty", setting));
        }
        let value = serde_json::from_str::<Value>(raw.trim())
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        config.insert(key.to_string(), value);
    }
    Ok(Value::Object(config))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Failed to render output: {}", e))?;
    println!("{}", rendered);
    Ok(())
}
