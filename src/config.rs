//! Configuration for scanrun, read from `scanrun.toml`.
//!
//! Layered as: defaults → file → environment → CLI flags. A `.env` file in
//! the working directory is loaded before the environment is read.
//!
//! ```toml
//! [execution]
//! async = true
//! task_timeout_secs = 86400
//! poll_interval_ms = 500
//!
//! [database]
//! path = "scanrun.db"
//! queue_path = "scanrun-queue.db"
//!
//! [logging]
//! level = "info"
//! json = false
//!
//! [webhooks]
//! timeout_secs = 10
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "scanrun.toml";

/// How runs are executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Hand runs to the job queue and a worker instead of executing inline
    #[serde(rename = "async", default)]
    pub async_mode: bool,
    /// Maximum wall time of one pipeline task, in seconds
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// How often an idle worker polls the queue
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            async_mode: false,
            task_timeout_secs: default_task_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_task_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_poll_interval_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Run database; relative paths are resolved against the project dir
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Job queue database
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            queue_path: default_queue_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("scanrun.db")
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("scanrun-queue.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhooksConfig {
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanrunConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
}

impl ScanrunConfig {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse scanrun.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Load `scanrun.toml` from `dir`, or the defaults when there is none.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// File, then `.env`, then process environment.
    pub fn resolve(dir: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(dir)?;
        // A missing .env is not an error.
        let _ = dotenvy::from_path(dir.join(".env"));
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `SCANRUN_*` overrides read through `get`.
    pub fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = get("SCANRUN_ASYNC") {
            self.execution.async_mode = parse_bool(&value)
                .with_context(|| format!("Invalid SCANRUN_ASYNC value '{}'", value))?;
        }
        if let Some(value) = get("SCANRUN_TASK_TIMEOUT") {
            self.execution.task_timeout_secs = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid SCANRUN_TASK_TIMEOUT value '{}'", value))?;
        }
        if let Some(value) = get("SCANRUN_DB_PATH") {
            self.database.path = PathBuf::from(value);
        }
        if let Some(value) = get("SCANRUN_QUEUE_PATH") {
            self.database.queue_path = PathBuf::from(value);
        }
        if let Some(value) = get("SCANRUN_LOG_LEVEL") {
            self.logging.level = value;
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.task_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.execution.poll_interval_ms)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhooks.timeout_secs)
    }

    pub fn db_path(&self, base: &Path) -> PathBuf {
        base.join(&self.database.path)
    }

    pub fn queue_path(&self, base: &Path) -> PathBuf {
        base.join(&self.database.queue_path)
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("expected a boolean, got '{}'", other),
    }
}
