//! Shared fixtures for the integration tests.
//!
//! Every test binary is its own process and may install the reaper once, so
//! it lives in a lazy static that all tests of a binary share.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use lazy_static::lazy_static;
use tempfile::TempDir;

use model_swapper::{
    CheckpointConfig, ModelId, ModelInputRow, ProcessReaper, QueueConfig, RunnerSpawnConfig,
    SchedulerConfig,
};

lazy_static! {
    pub static ref REAPER: Arc<ProcessReaper> =
        ProcessReaper::install().expect("reaper installs once per test binary");
}

/// The crate's own binary running the built-in echo runner.
pub fn echo_runner(extra_args: &[&str]) -> RunnerSpawnConfig {
    let mut args = vec!["runner".to_string()];
    args.extend(extra_args.iter().map(|a| a.to_string()));
    RunnerSpawnConfig::program(env!("CARGO_BIN_EXE_model_swapper"), args)
}

/// Temporary queue database and checkpoint root.
pub struct TestDirs {
    pub dir: TempDir,
}

impl TestDirs {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            db_path: self.dir.path().join("queues.db"),
            poll_interval_ms: 5,
            ..QueueConfig::default()
        }
    }

    pub fn checkpoint_config(&self) -> CheckpointConfig {
        CheckpointConfig {
            root: self.dir.path().join("checkpoints"),
        }
    }
}

/// Scheduler timings scaled down for tests.
pub fn fast_scheduler_config(slot_count: usize) -> SchedulerConfig {
    SchedulerConfig {
        slot_count,
        start_timeout_ms: 10_000,
        graceful_stop_timeout_ms: 10_000,
        batch_timeout_ms: 10_000,
        min_active_time_ms: 50,
        idle_unload_after_ms: 60_000,
        max_crash_retries: 2,
        crash_backoff_ms: 20,
        rescan_interval_ms: 200,
        tick_ms: 5,
        io_retry_attempts: 3,
        io_retry_backoff_ms: 10,
    }
}

pub fn model(id: &str) -> ModelId {
    ModelId::new(id).unwrap()
}

pub fn rows(ids: std::ops::RangeInclusive<i64>) -> Vec<ModelInputRow> {
    ids.map(|id| ModelInputRow::new(id, Utc::now(), id as f64)).collect()
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
