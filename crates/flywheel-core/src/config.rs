use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Scheduler tunables — read once at engine construction.
pub const DEFAULT_MAX_WORKERS: usize = 4;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TASK_TIMEOUT_SECS: u32 = 300;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;

/// Top-level config (flywheel.toml + FLYWHEEL_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlywheelConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for FlywheelConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
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

/// Polling scheduler tunables.
///
/// All values are read once when the engine is built; changing them requires
/// a scheduler restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrent execution slots in the worker pool.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Seconds between due-task polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Maximum tasks fetched per poll cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Default retry budget for newly enqueued tasks (overridable per task).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Default advisory timeout in seconds for newly enqueued tasks.
    /// Nothing interrupts an overrunning task; the engine only logs.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u32,
    /// Fixed backoff in seconds applied to a failed task before its next
    /// attempt becomes eligible.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

impl FlywheelConfig {
    /// Load config from a TOML file with FLYWHEEL_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.flywheel/flywheel.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: FlywheelConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("FLYWHEEL_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.flywheel/flywheel.toml", home)
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.flywheel/flywheel.db", home)
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_task_timeout() -> u32 {
    DEFAULT_TASK_TIMEOUT_SECS
}

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}
