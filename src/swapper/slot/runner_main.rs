//! Built-in echo runner entry point.
//!
//! Runs as a child process spawned by a slot agent (same binary, `runner`
//! subcommand). Reads JSON commands from stdin and writes JSON responses to
//! stdout. All log output goes to stderr (inherited by the parent).
//!
//! The "model" echoes every row back with the distance from the running mean
//! as its anomaly score. Its state is small enough to checkpoint as JSON.
//!
//! Thread design:
//! - Thread 0 (stdin reader): reads lines → channel
//! - Thread 1 (main loop): handles one command at a time, writes to stdout

use std::io::{self, BufRead, Write};
use std::thread;

use crossbeam_channel::{self, Receiver, Sender};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use super::ipc_types::*;
use crate::swapper::types::{check_row_order, InferenceResult, ModelInputRow};

/// Exit code used by `--fail-on-row-id`.
pub const INJECTED_FAILURE_EXIT_CODE: i32 = 3;

#[derive(Debug, Clone, Default)]
pub struct EchoRunnerOptions {
    /// Exit abruptly when a row with this rowID arrives.
    pub fail_on_row_id: Option<i64>,
}

/// Checkpointed state of the echo model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EchoModelState {
    pub model_id: String,
    #[serde(default)]
    pub args: serde_json::Value,
    pub rows_seen: u64,
    pub last_row_id: Option<i64>,
    pub mean: f64,
}

impl EchoModelState {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            args: serde_json::Value::Null,
            rows_seen: 0,
            last_row_id: None,
            mean: 0.0,
        }
    }

    /// Score `rows` in order.
    ///
    /// Rows at or below the last processed rowID are redeliveries and are
    /// skipped. A decreasing rowID inside the batch is an error and leaves the
    /// state untouched.
    pub fn process(&mut self, rows: &[ModelInputRow]) -> Result<Vec<InferenceResult>, String> {
        check_row_order(None, rows).map_err(|e| e.to_string())?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            if self.last_row_id.is_some_and(|last| row.row_id <= last) {
                continue;
            }
            let score = if self.rows_seen == 0 {
                0.0
            } else {
                (row.value - self.mean).abs()
            };
            self.rows_seen += 1;
            self.mean += (row.value - self.mean) / self.rows_seen as f64;
            self.last_row_id = Some(row.row_id);
            results.push(InferenceResult {
                row_id: row.row_id,
                timestamp: row.timestamp,
                value: row.value,
                anomaly_score: score,
            });
        }
        Ok(results)
    }

    fn restore(model_id: &str, checkpoint: &str) -> Result<Self, String> {
        let blob = decode_checkpoint(checkpoint).map_err(|e| e.to_string())?;
        let state: Self =
            serde_json::from_slice(&blob).map_err(|e| format!("corrupt checkpoint: {e}"))?;
        if state.model_id != model_id {
            return Err(format!(
                "checkpoint belongs to model {}, not {model_id}",
                state.model_id
            ));
        }
        Ok(state)
    }

    fn checkpoint(&self) -> Result<String, String> {
        serde_json::to_vec(self)
            .map(|blob| encode_checkpoint(&blob))
            .map_err(|e| format!("checkpoint serialization failed: {e}"))
    }
}

/// Run the echo runner until shutdown. Returns the process exit code.
pub fn run_runner(options: EchoRunnerOptions) -> i32 {
    info!("[RUNNER] Starting echo runner (pid={})", std::process::id());

    let (stdin_tx, stdin_rx): (Sender<String>, Receiver<String>) = crossbeam_channel::unbounded();

    // Thread 0: stdin reader
    let spawned = thread::Builder::new()
        .name("runner-stdin".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(l) if !l.trim().is_empty() => {
                        if stdin_tx.send(l).is_err() {
                            break; // Main loop exited
                        }
                    }
                    Ok(_) => {}      // Empty line, skip
                    Err(_) => break, // stdin closed (parent gone)
                }
            }
        });
    if let Err(e) = spawned {
        error!("[RUNNER] Cannot start stdin reader: {e}");
        return 1;
    }

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    let mut state: Option<EchoModelState> = None;

    loop {
        let Ok(line) = stdin_rx.recv() else {
            // EOF without an explicit Shutdown: save what we have and leave.
            info!("[RUNNER] Stdin closed, shutting down");
            if let Some(state) = &state {
                if let Ok(data) = state.checkpoint() {
                    write_response(&mut stdout, &RunnerResponse::ok(0, RunnerPayload::Checkpoint { data }));
                }
            }
            return 0;
        };

        let request: RunnerRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!("[RUNNER] Failed to parse command: {e}");
                write_response(&mut stdout, &RunnerResponse::error(0, format!("Parse error: {e}")));
                continue;
            }
        };
        let req_id = request.id;

        match request.command {
            RunnerCommand::Init {
                model_id,
                checkpoint,
            } => {
                let restored = checkpoint.is_some();
                let loaded = match checkpoint {
                    Some(data) => EchoModelState::restore(&model_id, &data),
                    None => Ok(EchoModelState::new(model_id.clone())),
                };
                match loaded {
                    Ok(loaded) => {
                        info!(
                            "[RUNNER] Model {model_id} ready (restored={restored}, rows_seen={})",
                            loaded.rows_seen
                        );
                        state = Some(loaded);
                        write_response(
                            &mut stdout,
                            &RunnerResponse::ok(req_id, RunnerPayload::Ready { model_id, restored }),
                        );
                    }
                    Err(e) => {
                        error!("[RUNNER] Cannot initialize model {model_id}: {e}");
                        write_response(&mut stdout, &RunnerResponse::error(req_id, e));
                    }
                }
            }

            RunnerCommand::DefineModel { args } => match state.as_mut() {
                Some(state) => {
                    state.args = args;
                    write_response(&mut stdout, &RunnerResponse::ok(req_id, RunnerPayload::ModelDefined));
                }
                None => write_response(&mut stdout, &RunnerResponse::error(req_id, "Not initialized")),
            },

            RunnerCommand::ProcessBatch { batch_id, rows } => {
                let Some(state) = state.as_mut() else {
                    write_response(&mut stdout, &RunnerResponse::error(req_id, "Not initialized"));
                    continue;
                };
                if let Some(fail_on) = options.fail_on_row_id {
                    if rows.iter().any(|r| r.row_id == fail_on) {
                        error!("[RUNNER] Injected failure on rowID {fail_on}");
                        return INJECTED_FAILURE_EXIT_CODE;
                    }
                }
                match state.process(&rows) {
                    Ok(results) => write_response(
                        &mut stdout,
                        &RunnerResponse::ok(req_id, RunnerPayload::BatchProcessed { batch_id, results }),
                    ),
                    Err(e) => {
                        warn!("[RUNNER] Rejected batch {batch_id}: {e}");
                        write_response(&mut stdout, &RunnerResponse::error(req_id, e));
                    }
                }
            }

            RunnerCommand::Shutdown { save_checkpoint } => {
                info!("[RUNNER] Shutdown requested (save_checkpoint={save_checkpoint})");
                if save_checkpoint {
                    match state.as_ref().map(EchoModelState::checkpoint) {
                        Some(Ok(data)) => write_response(
                            &mut stdout,
                            &RunnerResponse::ok(req_id, RunnerPayload::Checkpoint { data }),
                        ),
                        Some(Err(e)) => write_response(&mut stdout, &RunnerResponse::error(req_id, e)),
                        None => write_response(&mut stdout, &RunnerResponse::error(req_id, "Not initialized")),
                    }
                }
                return 0;
            }
        }
    }
}

/// Write a JSON response line to stdout, flushing immediately.
fn write_response(stdout: &mut io::StdoutLock, response: &RunnerResponse) {
    if let Ok(json) = serde_json::to_string(response) {
        let _ = writeln!(stdout, "{json}");
        let _ = stdout.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rows(ids: &[i64]) -> Vec<ModelInputRow> {
        ids.iter()
            .map(|&id| ModelInputRow::new(id, Utc::now(), id as f64))
            .collect()
    }

    #[test]
    fn test_scores_against_running_mean() {
        let mut state = EchoModelState::new("m");
        let results = state.process(&rows(&[1, 2, 3])).unwrap();
        let scores: Vec<f64> = results.iter().map(|r| r.anomaly_score).collect();
        // means before each row: -, 1.0, 1.5
        assert_eq!(scores, vec![0.0, 1.0, 1.5]);
        assert_eq!(state.rows_seen, 3);
        assert_eq!(state.last_row_id, Some(3));
        assert!((state.mean - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_redelivered_rows_are_skipped() {
        let mut state = EchoModelState::new("m");
        state.process(&rows(&[1, 2, 3])).unwrap();
        let results = state.process(&rows(&[2, 3, 4])).unwrap();
        let ids: Vec<i64> = results.iter().map(|r| r.row_id).collect();
        assert_eq!(ids, vec![4]);
        assert_eq!(state.rows_seen, 4);
    }

    #[test]
    fn test_out_of_order_batch_is_rejected_untouched() {
        let mut state = EchoModelState::new("m");
        assert!(state.process(&rows(&[5, 4])).is_err());
        assert_eq!(state, EchoModelState::new("m"));
    }

    #[test]
    fn test_checkpoint_restore() {
        let mut state = EchoModelState::new("m");
        state.args = serde_json::json!({"window": 3});
        state.process(&rows(&[1, 2])).unwrap();

        let data = state.checkpoint().unwrap();
        assert_eq!(EchoModelState::restore("m", &data).unwrap(), state);
        assert!(EchoModelState::restore("other", &data).is_err());
    }
}
