//! Model runner lifecycle for one slot.
//!
//! Spawns the runner as a child process, talks JSON Lines to it over
//! stdin/stdout, and learns about its exit exclusively through the
//! [`ProcessReaper`]. Nothing here ever calls `wait` on the child.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use log::{debug, info, warn};

use super::ipc_types::*;
use crate::swapper::config::RunnerSpawnConfig;
use crate::swapper::error::{Result, SwapperError};
use crate::swapper::reaper::{ListenerId, ProcessReaper};
use crate::swapper::signals::{cloexec_inherited_fds, max_fd};
use crate::swapper::types::{InferenceResult, ModelId, ModelInputRow};

/// Invoked once, from the reaper thread, when the runner exits.
pub type TerminationCallback = Box<dyn FnOnce(u32, i32) + Send>;

/// How long to keep reading the runner's stdout after it exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// How long to wait for the reaper after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartInfo {
    pub pid: u32,
    /// Whether the runner restored state from the checkpoint it was given.
    pub restored: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub return_code: i32,
    /// Final model state, present when requested and the runner sent one.
    pub checkpoint: Option<Vec<u8>>,
    /// The runner had to be killed after the graceful timeout.
    pub forced: bool,
}

/// Pid filter between the reaper and one runner.
///
/// Registered before the spawn so an exit that happens before the pid is
/// known is buffered instead of lost.
struct ExitWatch {
    state: Mutex<WatchState>,
}

struct WatchState {
    pid: Option<u32>,
    early: Vec<(u32, i32)>,
    exit_tx: Option<Sender<i32>>,
    on_termination: Option<TerminationCallback>,
}

impl ExitWatch {
    fn new(exit_tx: Sender<i32>, on_termination: TerminationCallback) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WatchState {
                pid: None,
                early: Vec::new(),
                exit_tx: Some(exit_tx),
                on_termination: Some(on_termination),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WatchState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_exit(&self, pid: u32, return_code: i32) {
        let fired = {
            let mut state = self.lock();
            match state.pid {
                None => {
                    state.early.push((pid, return_code));
                    None
                }
                Some(watched) if watched == pid => state.take_fire(),
                Some(_) => None,
            }
        };
        fire(fired, pid, return_code);
    }

    fn arm(&self, pid: u32) {
        let fired = {
            let mut state = self.lock();
            state.pid = Some(pid);
            let early = std::mem::take(&mut state.early);
            match early.into_iter().find(|(p, _)| *p == pid) {
                Some((_, code)) => state.take_fire().map(|f| (f, code)),
                None => None,
            }
        };
        if let Some((fired, code)) = fired {
            fire(Some(fired), pid, code);
        }
    }
}

type Fired = (Option<Sender<i32>>, Option<TerminationCallback>);

impl WatchState {
    fn take_fire(&mut self) -> Option<Fired> {
        if self.exit_tx.is_none() && self.on_termination.is_none() {
            return None;
        }
        Some((self.exit_tx.take(), self.on_termination.take()))
    }
}

fn fire(fired: Option<Fired>, pid: u32, return_code: i32) {
    let Some((exit_tx, on_termination)) = fired else {
        return;
    };
    if let Some(tx) = exit_tx {
        let _ = tx.send(return_code);
    }
    if let Some(callback) = on_termination {
        callback(pid, return_code);
    }
}

enum Waited {
    Reply(RunnerResponse),
    StdoutClosed,
    Exited(i32),
    TimedOut,
}

struct RunningRunner {
    model_id: ModelId,
    pid: u32,
    stdin: Option<ChildStdin>,
    replies: Receiver<RunnerResponse>,
    exit_rx: Receiver<i32>,
    exit_code: Option<i32>,
    listener: ListenerId,
}

impl RunningRunner {
    /// Exit code, waiting up to `timeout` for the reaper's report.
    fn wait_exit(&mut self, timeout: Duration) -> Option<i32> {
        if self.exit_code.is_none() {
            if let Ok(code) = self.exit_rx.recv_timeout(timeout) {
                self.exit_code = Some(code);
            }
        }
        self.exit_code
    }

    fn kill(&mut self) {
        if let Ok(code) = self.exit_rx.try_recv() {
            self.exit_code = Some(code);
        }
        if self.exit_code.is_some() {
            return;
        }
        // Not yet reported by the reaper, so the pid cannot have been reused.
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGKILL);
        }
    }

    /// Read replies until stdout closes, looking for `id`.
    fn drain_for(&self, id: u64, timeout: Duration) -> Option<RunnerPayload> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(reply) if reply.id == id => return Some(reply.payload),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Owns one execution slot and the runner currently hosted in it.
pub struct SlotAgent {
    slot_id: usize,
    spawn: RunnerSpawnConfig,
    reaper: Arc<ProcessReaper>,
    start_timeout: Duration,
    running: Option<RunningRunner>,
    next_request_id: u64,
    pending_batch: Option<(String, u64)>,
}

impl std::fmt::Debug for SlotAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotAgent")
            .field("slot_id", &self.slot_id)
            .field("model", &self.model_id())
            .field("pid", &self.pid())
            .finish()
    }
}

impl SlotAgent {
    pub fn new(
        slot_id: usize,
        spawn: RunnerSpawnConfig,
        reaper: Arc<ProcessReaper>,
        start_timeout: Duration,
    ) -> Self {
        Self {
            slot_id,
            spawn,
            reaper,
            start_timeout,
            running: None,
            next_request_id: 1,
            pending_batch: None,
        }
    }

    pub fn slot_id(&self) -> usize {
        self.slot_id
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().map(|r| r.pid)
    }

    pub fn model_id(&self) -> Option<&ModelId> {
        self.running.as_ref().map(|r| &r.model_id)
    }

    /// Spawn a runner for `model_id` and wait until it reports ready.
    pub fn start(
        &mut self,
        model_id: &ModelId,
        checkpoint: Option<&[u8]>,
        on_termination: TerminationCallback,
    ) -> Result<StartInfo> {
        if let Some(running) = &self.running {
            return Err(SwapperError::RunnerProtocol(format!(
                "slot {} already hosts model {}",
                self.slot_id, running.model_id
            )));
        }

        let start_failed = |reason: String| SwapperError::RunnerStartFailed {
            model: model_id.clone(),
            reason,
        };

        let (program, args) = self.spawn.command_line()?;
        // A failed exec makes std wait on the child itself, racing the reaper.
        validate_program(&program).map_err(start_failed)?;

        let (exit_tx, exit_rx) = bounded(1);
        let watch = ExitWatch::new(exit_tx, on_termination);
        let listener = {
            let watch = watch.clone();
            self.reaper
                .register(move |pid, code| watch.on_exit(pid, code))
        };

        info!(
            "[SLOT {}] Spawning runner for model {model_id}: {} {}",
            self.slot_id,
            program.display(),
            args.join(" ")
        );

        let fd_limit = max_fd();
        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Runner logs go to our stderr
            // Own process group: a terminal Ctrl-C must reach the scheduler
            // only, which then stops runners through the protocol.
            .process_group(0);
        unsafe {
            command.pre_exec(move || cloexec_inherited_fds(fd_limit));
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.reaper.unregister(listener);
                return Err(start_failed(format!("spawn failed: {e}")));
            }
        };
        let pid = child.id();
        watch.arm(pid);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        // Dropping `Child` neither kills nor waits; the reaper collects it.
        drop(child);

        let (reply_tx, replies) = unbounded();
        if let Some(stdout) = stdout {
            let slot_id = self.slot_id;
            let spawned = thread::Builder::new()
                .name(format!("runner-stdout-{slot_id}"))
                .spawn(move || stdout_reader(slot_id, stdout, reply_tx));
            if let Err(e) = spawned {
                warn!("[SLOT {slot_id}] Failed to start stdout reader: {e}");
            }
        }

        self.running = Some(RunningRunner {
            model_id: model_id.clone(),
            pid,
            stdin,
            replies,
            exit_rx,
            exit_code: None,
            listener,
        });

        let init = RunnerCommand::Init {
            model_id: model_id.to_string(),
            checkpoint: checkpoint.map(encode_checkpoint),
        };
        let outcome = self
            .request(init, self.start_timeout)
            .and_then(|payload| match payload {
                RunnerPayload::Ready { restored, .. } => Ok(restored),
                RunnerPayload::Error { message } => Err(SwapperError::RunnerProtocol(message)),
                other => Err(SwapperError::RunnerProtocol(format!(
                    "unexpected reply to Init: {other:?}"
                ))),
            });

        match outcome {
            Ok(restored) => {
                info!(
                    "[SLOT {}] Runner pid={pid} ready for model {model_id} (restored={restored})",
                    self.slot_id
                );
                Ok(StartInfo { pid, restored })
            }
            Err(e) => {
                warn!("[SLOT {}] Runner pid={pid} failed to start: {e}", self.slot_id);
                self.abort();
                Err(start_failed(e.to_string()))
            }
        }
    }

    /// Forward model parameters and wait for the runner to accept them.
    pub fn define(&mut self, args: serde_json::Value, timeout: Duration) -> Result<()> {
        match self.request(RunnerCommand::DefineModel { args }, timeout)? {
            RunnerPayload::ModelDefined => Ok(()),
            RunnerPayload::Error { message } => Err(SwapperError::RunnerProtocol(message)),
            other => Err(SwapperError::RunnerProtocol(format!(
                "unexpected reply to DefineModel: {other:?}"
            ))),
        }
    }

    /// Send one ordered batch. Pair with [`SlotAgent::await_batch`].
    pub fn feed(&mut self, batch_id: &str, rows: Vec<ModelInputRow>) -> Result<()> {
        let id = self.send(RunnerCommand::ProcessBatch {
            batch_id: batch_id.to_string(),
            rows,
        })?;
        self.pending_batch = Some((batch_id.to_string(), id));
        Ok(())
    }

    /// Wait for the results of the batch last passed to [`SlotAgent::feed`].
    pub fn await_batch(&mut self, batch_id: &str, timeout: Duration) -> Result<Vec<InferenceResult>> {
        let id = match self.pending_batch.take() {
            Some((pending, id)) if pending == batch_id => id,
            _ => {
                return Err(SwapperError::RunnerProtocol(format!(
                    "batch {batch_id} was not fed"
                )))
            }
        };
        match self.await_reply(id, timeout)? {
            RunnerPayload::BatchProcessed { results, .. } => Ok(results),
            RunnerPayload::Error { message } => Err(SwapperError::RunnerProtocol(message)),
            other => Err(SwapperError::RunnerProtocol(format!(
                "unexpected reply to ProcessBatch: {other:?}"
            ))),
        }
    }

    /// Close the runner's stdin without a `Shutdown` request. The runner
    /// exits on EOF; collect it with [`SlotAgent::stop_gracefully`].
    pub fn close_input(&mut self) {
        if let Some(runner) = self.running.as_mut() {
            drop(runner.stdin.take());
        }
    }

    /// Ask the runner to shut down, wait up to `timeout`, then force it.
    ///
    /// Also used to collect a runner that already exited on its own.
    pub fn stop_gracefully(&mut self, timeout: Duration, save_checkpoint: bool) -> Result<StopReport> {
        let request_id = if self.running.as_ref().is_some_and(|r| r.exit_code.is_none()) {
            match self.send(RunnerCommand::Shutdown { save_checkpoint }) {
                Ok(id) => Some(id),
                Err(e) => {
                    debug!("[SLOT {}] Shutdown request not delivered: {e}", self.slot_id);
                    None
                }
            }
        } else {
            None
        };

        let slot_id = self.slot_id;
        let mut runner = self.running.take().ok_or_else(|| not_running(slot_id))?;
        self.pending_batch = None;

        // EOF on stdin is the runner's cue even if the request was lost.
        drop(runner.stdin.take());

        let mut forced = false;
        let return_code = match runner.wait_exit(timeout) {
            Some(code) => code,
            None => {
                warn!(
                    "[SLOT {slot_id}] Runner pid={} for model {} ignored shutdown for {timeout:?}, killing",
                    runner.pid, runner.model_id
                );
                forced = true;
                runner.kill();
                match runner.wait_exit(KILL_WAIT) {
                    Some(code) => code,
                    None => {
                        self.reaper.unregister(runner.listener);
                        return Err(SwapperError::Timeout(timeout + KILL_WAIT));
                    }
                }
            }
        };
        self.reaper.unregister(runner.listener);

        let checkpoint = match request_id {
            Some(id) if save_checkpoint => match runner.drain_for(id, DRAIN_TIMEOUT) {
                Some(RunnerPayload::Checkpoint { data }) => Some(decode_checkpoint(&data)?),
                Some(RunnerPayload::Error { message }) => {
                    warn!("[SLOT {slot_id}] Runner failed to checkpoint: {message}");
                    None
                }
                _ => None,
            },
            _ => None,
        };

        info!(
            "[SLOT {slot_id}] Runner pid={} for model {} stopped with return code {return_code}",
            runner.pid, runner.model_id
        );
        Ok(StopReport {
            return_code,
            checkpoint,
            forced,
        })
    }

    /// Kill the runner without asking and wait for the reaper.
    fn abort(&mut self) {
        if let Some(mut runner) = self.running.take() {
            drop(runner.stdin.take());
            runner.kill();
            if runner.wait_exit(KILL_WAIT).is_none() {
                warn!(
                    "[SLOT {}] Runner pid={} not reported by the reaper after kill",
                    self.slot_id, runner.pid
                );
            }
            self.reaper.unregister(runner.listener);
        }
        self.pending_batch = None;
    }

    fn send(&mut self, command: RunnerCommand) -> Result<u64> {
        let slot_id = self.slot_id;
        let runner = self.running.as_mut().ok_or_else(|| not_running(slot_id))?;
        let id = self.next_request_id;
        self.next_request_id += 1;

        let mut line = serde_json::to_string(&RunnerRequest { id, command })?;
        line.push('\n');
        let stdin = runner
            .stdin
            .as_mut()
            .ok_or_else(|| SwapperError::RunnerProtocol("runner stdin closed".to_string()))?;
        stdin.write_all(line.as_bytes())?;
        stdin.flush()?;
        Ok(id)
    }

    fn request(&mut self, command: RunnerCommand, timeout: Duration) -> Result<RunnerPayload> {
        let id = self.send(command)?;
        self.await_reply(id, timeout)
    }

    fn await_reply(&mut self, id: u64, timeout: Duration) -> Result<RunnerPayload> {
        let slot_id = self.slot_id;
        let runner = self.running.as_mut().ok_or_else(|| not_running(slot_id))?;
        let deadline = Instant::now() + timeout;

        loop {
            if runner.exit_code.is_some() {
                return runner
                    .drain_for(id, DRAIN_TIMEOUT)
                    .ok_or_else(|| crashed(runner));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SwapperError::Timeout(timeout));
            }
            let waited = select! {
                recv(runner.replies) -> reply => match reply {
                    Ok(reply) => Waited::Reply(reply),
                    Err(_) => Waited::StdoutClosed,
                },
                recv(runner.exit_rx) -> code => Waited::Exited(code.unwrap_or(-1)),
                default(remaining) => Waited::TimedOut,
            };
            match waited {
                Waited::Reply(reply) if reply.id == id => return Ok(reply.payload),
                Waited::Reply(reply) => {
                    debug!("[SLOT {slot_id}] Ignoring stray reply id={}", reply.id);
                }
                // stdout closed: the runner is on its way out
                Waited::StdoutClosed => {
                    if runner.wait_exit(remaining).is_none() {
                        return Err(SwapperError::RunnerProtocol(
                            "runner closed stdout".to_string(),
                        ));
                    }
                }
                Waited::Exited(code) => runner.exit_code = Some(code),
                Waited::TimedOut => return Err(SwapperError::Timeout(timeout)),
            }
        }
    }
}

impl Drop for SlotAgent {
    fn drop(&mut self) {
        self.abort();
    }
}

fn not_running(slot_id: usize) -> SwapperError {
    SwapperError::RunnerProtocol(format!("slot {slot_id} has no runner"))
}

fn crashed(runner: &RunningRunner) -> SwapperError {
    SwapperError::RunnerCrashed {
        model: runner.model_id.clone(),
        return_code: runner.exit_code.unwrap_or(-1),
    }
}

fn validate_program(program: &Path) -> std::result::Result<(), String> {
    let metadata =
        fs::metadata(program).map_err(|e| format!("runner {}: {e}", program.display()))?;
    if !metadata.is_file() {
        return Err(format!("runner {} is not a file", program.display()));
    }
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(format!("runner {} is not executable", program.display()));
    }
    Ok(())
}

fn stdout_reader(slot_id: usize, stdout: std::process::ChildStdout, replies: Sender<RunnerResponse>) {
    let reader = BufReader::new(stdout);
    for line in reader.lines() {
        let line = match line {
            Ok(l) if l.trim().is_empty() => continue,
            Ok(l) => l,
            Err(_) => break,
        };
        match serde_json::from_str::<RunnerResponse>(&line) {
            Ok(response) => {
                if replies.send(response).is_err() {
                    break;
                }
            }
            Err(e) => warn!("[SLOT {slot_id}] Unparseable runner output ({e}): {line}"),
        }
    }
    debug!("[SLOT {slot_id}] Runner stdout closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_watch() -> (Arc<ExitWatch>, Receiver<i32>, Arc<AtomicUsize>) {
        let (tx, rx) = bounded(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let watch = ExitWatch::new(
            tx,
            Box::new(move |_: u32, _: i32| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (watch, rx, calls)
    }

    #[test]
    fn test_exit_watch_filters_by_pid() {
        let (watch, rx, calls) = counting_watch();
        watch.arm(42);
        watch.on_exit(7, 1);
        assert!(rx.try_recv().is_err());
        watch.on_exit(42, 0);
        watch.on_exit(42, 0);
        assert_eq!(rx.try_recv().unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exit_watch_buffers_exit_before_arm() {
        let (watch, rx, calls) = counting_watch();
        watch.on_exit(99, -9);
        watch.on_exit(5, 0);
        watch.arm(99);
        assert_eq!(rx.try_recv().unwrap(), -9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_validate_program() {
        assert!(validate_program(Path::new("/definitely/not/here")).is_err());
        let dir = tempfile::TempDir::new().unwrap();
        assert!(validate_program(dir.path()).is_err());

        let script = dir.path().join("runner.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        assert!(validate_program(&script).is_err());
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(validate_program(&script).is_ok());
    }
}
