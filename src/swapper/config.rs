//! Swapper configuration.
//!
//! Loaded from an optional JSON file, then overridden from `MODEL_SWAPPER_*`
//! environment variables. Every component takes its own section by value so
//! tests can point storage at temporary locations without touching globals.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Result, SwapperError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapperConfig {
    pub queue: QueueConfig,
    pub checkpoint: CheckpointConfig,
    pub scheduler: SchedulerConfig,
    pub runner: RunnerSpawnConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

/// Queue fabric storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub db_path: PathBuf,
    /// How often an idle consumer re-checks its queue.
    pub poll_interval_ms: u64,
    /// SQLite busy timeout for cross-process access.
    pub busy_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/model_swapper_queues.db"),
            poll_interval_ms: 10,
            busy_timeout_ms: 5_000,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub root: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/checkpoints"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Size of the slot pool.
    pub slot_count: usize,
    pub start_timeout_ms: u64,
    pub graceful_stop_timeout_ms: u64,
    /// Upper bound on one batch round trip through the runner.
    pub batch_timeout_ms: u64,
    /// Minimum time a model keeps its slot before it may be preempted while
    /// it still has pending input.
    pub min_active_time_ms: u64,
    /// Drained models are swapped out after this long even if nobody waits.
    pub idle_unload_after_ms: u64,
    /// Runner crashes tolerated per model before it enters the error state.
    pub max_crash_retries: u32,
    /// Base delay before reloading a model whose runner crashed.
    pub crash_backoff_ms: u64,
    /// Interval between full rescans of the model input queues.
    pub rescan_interval_ms: u64,
    /// Control loop wake-up interval when nothing happens.
    pub tick_ms: u64,
    /// Attempts for checkpoint and fabric operations before giving up.
    pub io_retry_attempts: u32,
    pub io_retry_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            slot_count: 4,
            start_timeout_ms: 30_000,
            graceful_stop_timeout_ms: 30_000,
            batch_timeout_ms: 60_000,
            min_active_time_ms: 5_000,
            idle_unload_after_ms: 60_000,
            max_crash_retries: 5,
            crash_backoff_ms: 1_000,
            rescan_interval_ms: 5_000,
            tick_ms: 20,
            io_retry_attempts: 5,
            io_retry_backoff_ms: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn graceful_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_stop_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn min_active_time(&self) -> Duration {
        Duration::from_millis(self.min_active_time_ms)
    }

    pub fn idle_unload_after(&self) -> Duration {
        Duration::from_millis(self.idle_unload_after_ms)
    }

    pub fn crash_backoff(&self) -> Duration {
        Duration::from_millis(self.crash_backoff_ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn io_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.io_retry_backoff_ms)
    }
}

/// How to launch a model runner subprocess.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSpawnConfig {
    /// Runner executable. `None` runs this binary's built-in echo runner.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

impl RunnerSpawnConfig {
    /// Spawn config for an explicit program.
    pub fn program(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: Some(program.into()),
            args,
        }
    }

    /// Resolve the executable and arguments to spawn.
    pub fn command_line(&self) -> Result<(PathBuf, Vec<String>)> {
        match &self.program {
            Some(program) => Ok((program.clone(), self.args.clone())),
            None => {
                let exe = std::env::current_exe()?;
                let mut args = vec!["runner".to_string()];
                args.extend(self.args.iter().cloned());
                Ok((exe, args))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Maximum number of rows in one `DataBatch`.
    pub batch_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { batch_size: 200 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            level: "info".to_string(),
        }
    }
}

impl SwapperConfig {
    /// Load defaults, then `path` (if given), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    SwapperError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                serde_json::from_str(&text).map_err(|e| {
                    SwapperError::Config(format!("cannot parse {}: {e}", path.display()))
                })?
            }
            None => SwapperConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MODEL_SWAPPER_*` overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("MODEL_SWAPPER_QUEUE_DB") {
            self.queue.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MODEL_SWAPPER_CHECKPOINT_ROOT") {
            self.checkpoint.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("MODEL_SWAPPER_LOG_DIR") {
            self.logging.log_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MODEL_SWAPPER_SLOTS") {
            self.scheduler.slot_count = parse_env("MODEL_SWAPPER_SLOTS", &v)?;
        }
        if let Some(v) = lookup("MODEL_SWAPPER_STOP_TIMEOUT_MS") {
            self.scheduler.graceful_stop_timeout_ms =
                parse_env("MODEL_SWAPPER_STOP_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("MODEL_SWAPPER_BATCH_SIZE") {
            self.client.batch_size = parse_env("MODEL_SWAPPER_BATCH_SIZE", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.slot_count == 0 {
            return Err(SwapperError::Config("slot_count must be at least 1".into()));
        }
        if self.client.batch_size == 0 {
            return Err(SwapperError::Config("batch_size must be at least 1".into()));
        }
        if s.start_timeout_ms == 0 || s.graceful_stop_timeout_ms == 0 || s.batch_timeout_ms == 0 {
            return Err(SwapperError::Config("timeouts must be positive".into()));
        }
        if s.tick_ms == 0 || self.queue.poll_interval_ms == 0 {
            return Err(SwapperError::Config("poll intervals must be positive".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SwapperError::Config(format!("{key}={value:?} is not a valid number")))
}
