use crate::automation::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const APP_DIR: &str = "scrapeflow";
const CONFIG_FILE: &str = "config.toml";
const DATABASE_FILE: &str = "sessions.db";

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 8;
const MAX_TASK_TIMEOUT_SECS: u64 = 24 * 3600;
const MAX_RETRIES_CAP: u32 = 20;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value '{value}' for {name}")]
    InvalidEnv { name: &'static str, value: String },
}

/// External command that implements one scraping source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Number of concurrent worker loops.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Wall-clock limit per attempt.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Finished tasks older than this are purged from memory and the store.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Upper bound on how long an idle worker sleeps between queue checks.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// SQLite file for session rows. Defaults to the platform data directory.
    pub database_path: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub persist_sessions: bool,

    #[serde(default)]
    pub sources: BTreeMap<String, SourceCommand>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            task_timeout_secs: default_task_timeout_secs(),
            retry: RetryPolicy::default(),
            retention_hours: default_retention_hours(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            idle_poll_ms: default_idle_poll_ms(),
            database_path: None,
            persist_sessions: true,
            sources: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Loads configuration from `explicit`, else the default config file if it
    /// exists, else defaults. Environment overrides are applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|path| path.is_file()),
        };

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config.clamped())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Applies `SCRAPEFLOW_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("SCRAPEFLOW_WORKERS") {
            self.workers = parse_env("SCRAPEFLOW_WORKERS", &value)?;
        }
        if let Some(value) = lookup("SCRAPEFLOW_TASK_TIMEOUT_SECS") {
            self.task_timeout_secs = parse_env("SCRAPEFLOW_TASK_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("SCRAPEFLOW_MAX_RETRIES") {
            self.retry.max_retries = parse_env("SCRAPEFLOW_MAX_RETRIES", &value)?;
        }
        if let Some(value) = lookup("SCRAPEFLOW_DATABASE") {
            let value = value.trim();
            if !value.is_empty() {
                self.database_path = Some(PathBuf::from(value));
            }
        }
        Ok(())
    }

    pub fn clamped(mut self) -> Self {
        self.workers = self.workers.clamp(MIN_WORKERS, MAX_WORKERS);
        self.task_timeout_secs = self.task_timeout_secs.clamp(1, MAX_TASK_TIMEOUT_SECS);
        self.retry.max_retries = self.retry.max_retries.clamp(1, MAX_RETRIES_CAP);
        self.retry.max_delay_ms = self.retry.max_delay_ms.max(self.retry.base_delay_ms);
        self.cleanup_interval_secs = self.cleanup_interval_secs.max(1);
        self.idle_poll_ms = self.idle_poll_ms.max(10);
        self
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|dir| dir.join(APP_DIR).join(DATABASE_FILE))
                .unwrap_or_else(|| PathBuf::from(DATABASE_FILE))
        })
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnv {
        name,
        value: value.to_string(),
    })
}

fn default_workers() -> usize {
    2
}

fn default_task_timeout_secs() -> u64 {
    crate::automation::executor::DEFAULT_TASK_TIMEOUT_SECS
}

fn default_retention_hours() -> u64 {
    24
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_idle_poll_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}
