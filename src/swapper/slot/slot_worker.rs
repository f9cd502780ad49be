//! Management thread for one slot.
//!
//! The scheduler assigns a model; the worker loads its checkpoint, starts the
//! runner through its [`SlotAgent`], drains the model's input queue into it
//! one message at a time and publishes results. It reports every state edge
//! back as a [`SlotEvent`] and never touches scheduler state.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};

use super::slot_agent::SlotAgent;
use crate::swapper::backoff::{backoff_delay, retry_transient};
use crate::swapper::checkpoint::CheckpointStore;
use crate::swapper::config::{RunnerSpawnConfig, SchedulerConfig};
use crate::swapper::error::{Result, SwapperError};
use crate::swapper::fabric::{Consumer, Delivery, Persistence, QueueFabric};
use crate::swapper::messages::{input_queue_name, Command, CommandStatus, ModelResult, RESULTS_QUEUE};
use crate::swapper::reaper::ProcessReaper;
use crate::swapper::types::ModelId;

/// Collecting an already-dead runner needs no grace period.
const CRASH_COLLECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Instructions from the scheduler (and the reaper) to a slot worker.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotCommand {
    /// Host `model_id`. `defined` tells whether its `DefineModel` already
    /// reached a runner in an earlier incarnation.
    Assign { model_id: ModelId, defined: bool },
    /// Stop the hosted model with a checkpoint.
    SwapOut,
    /// Swap out (if hosting) and end the thread.
    Shutdown,
    RunnerExited { pid: u32, return_code: i32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    SwappedOut { checkpoint_saved: bool },
    Crashed { return_code: i32 },
    Deleted,
}

/// State edges reported by slot workers to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotEvent {
    Started { slot: usize, model_id: ModelId, restored: bool },
    StartFailed { slot: usize, model_id: ModelId, error: String },
    Defined { slot: usize, model_id: ModelId },
    /// The input queue ran empty.
    Drained { slot: usize, model_id: ModelId },
    /// Work arrived again after `Drained`.
    Resumed { slot: usize, model_id: ModelId },
    BatchProcessed { slot: usize, model_id: ModelId, rows: usize },
    /// The runner is gone and the slot is free again.
    Stopped { slot: usize, model_id: ModelId, outcome: StopOutcome },
}

impl SlotEvent {
    pub fn slot(&self) -> usize {
        match self {
            SlotEvent::Started { slot, .. }
            | SlotEvent::StartFailed { slot, .. }
            | SlotEvent::Defined { slot, .. }
            | SlotEvent::Drained { slot, .. }
            | SlotEvent::Resumed { slot, .. }
            | SlotEvent::BatchProcessed { slot, .. }
            | SlotEvent::Stopped { slot, .. } => *slot,
        }
    }
}

/// Everything a slot worker needs, passed in by the scheduler.
#[derive(Clone)]
pub struct SlotWorkerContext {
    pub slot_id: usize,
    pub fabric: QueueFabric,
    pub checkpoints: Arc<CheckpointStore>,
    pub reaper: Arc<ProcessReaper>,
    pub spawn: RunnerSpawnConfig,
    pub config: SchedulerConfig,
    pub events: Sender<SlotEvent>,
}

pub struct SlotWorkerHandle {
    pub slot_id: usize,
    inbox: Sender<SlotCommand>,
    thread: Option<JoinHandle<()>>,
}

impl SlotWorkerHandle {
    pub fn send(&self, command: SlotCommand) {
        if self.inbox.send(command).is_err() {
            warn!("[SLOT {}] Worker thread is gone", self.slot_id);
        }
    }

    /// Wait for the worker thread to end. Send [`SlotCommand::Shutdown`] first.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("[SLOT {}] Worker thread panicked", self.slot_id);
            }
        }
    }
}

pub fn spawn_slot_worker(context: SlotWorkerContext) -> Result<SlotWorkerHandle> {
    let (inbox, rx) = unbounded();
    let slot_id = context.slot_id;
    let self_tx = inbox.clone();
    let thread = thread::Builder::new()
        .name(format!("slot-{slot_id}"))
        .spawn(move || SlotWorker::new(context, rx, self_tx).run())?;
    Ok(SlotWorkerHandle {
        slot_id,
        inbox,
        thread: Some(thread),
    })
}

/// Why [`SlotWorker::host`] returned.
enum Hosted {
    Done,
    ShutdownRequested,
}

struct SlotWorker {
    ctx: SlotWorkerContext,
    agent: SlotAgent,
    inbox: Receiver<SlotCommand>,
    self_tx: Sender<SlotCommand>,
}

impl SlotWorker {
    fn new(ctx: SlotWorkerContext, inbox: Receiver<SlotCommand>, self_tx: Sender<SlotCommand>) -> Self {
        let agent = SlotAgent::new(
            ctx.slot_id,
            ctx.spawn.clone(),
            ctx.reaper.clone(),
            ctx.config.start_timeout(),
        );
        Self {
            ctx,
            agent,
            inbox,
            self_tx,
        }
    }

    fn run(mut self) {
        debug!("[SLOT {}] Worker started", self.ctx.slot_id);
        while let Ok(command) = self.inbox.recv() {
            match command {
                SlotCommand::Assign { model_id, defined } => {
                    if let Hosted::ShutdownRequested = self.host(&model_id, defined) {
                        break;
                    }
                }
                SlotCommand::Shutdown => break,
                SlotCommand::SwapOut | SlotCommand::RunnerExited { .. } => {}
            }
        }
        debug!("[SLOT {}] Worker exiting", self.ctx.slot_id);
    }

    fn emit(&self, event: SlotEvent) {
        let _ = self.ctx.events.send(event);
    }

    /// Host one model until it is swapped out, deleted or crashes.
    fn host(&mut self, model_id: &ModelId, mut defined: bool) -> Hosted {
        let slot = self.ctx.slot_id;
        let config = &self.ctx.config;

        let checkpoint = match retry_transient(
            "load checkpoint",
            config.io_retry_attempts,
            config.io_retry_backoff(),
            || self.ctx.checkpoints.load_optional(model_id),
        ) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                self.emit(SlotEvent::StartFailed {
                    slot,
                    model_id: model_id.clone(),
                    error: e.to_string(),
                });
                return Hosted::Done;
            }
        };

        let exits = self.self_tx.clone();
        let on_termination = Box::new(move |pid: u32, return_code: i32| {
            let _ = exits.send(SlotCommand::RunnerExited { pid, return_code });
        });
        let started = match self.agent.start(model_id, checkpoint.as_deref(), on_termination) {
            Ok(started) => started,
            Err(e) => {
                warn!("[SLOT {slot}] Model {model_id} failed to start: {e}");
                self.emit(SlotEvent::StartFailed {
                    slot,
                    model_id: model_id.clone(),
                    error: e.to_string(),
                });
                return Hosted::Done;
            }
        };
        // A checkpoint only exists once the model has been defined.
        defined |= started.restored;
        self.emit(SlotEvent::Started {
            slot,
            model_id: model_id.clone(),
            restored: started.restored,
        });

        let consumer = match self.ctx.fabric.consume(&input_queue_name(model_id)) {
            Ok(consumer) => consumer,
            Err(SwapperError::QueueNotFound(_)) => {
                info!("[SLOT {slot}] Input queue of {model_id} vanished, treating as deleted");
                self.stop_quietly(false);
                let _ = self.ctx.checkpoints.delete(model_id);
                self.emit(SlotEvent::Stopped {
                    slot,
                    model_id: model_id.clone(),
                    outcome: StopOutcome::Deleted,
                });
                return Hosted::Done;
            }
            Err(e) => {
                error!("[SLOT {slot}] Cannot consume input of {model_id}: {e}");
                return self.swap_out(model_id, None, Hosted::Done);
            }
        };

        let mut drained = false;
        let mut fabric_failures = 0u32;
        loop {
            match self.inbox.try_recv() {
                Ok(SlotCommand::SwapOut) => return self.swap_out(model_id, Some(consumer), Hosted::Done),
                Ok(SlotCommand::Shutdown) => {
                    return self.swap_out(model_id, Some(consumer), Hosted::ShutdownRequested)
                }
                Ok(SlotCommand::RunnerExited { pid, return_code }) => {
                    if Some(pid) == self.agent.pid() {
                        warn!("[SLOT {slot}] Runner for {model_id} exited unexpectedly ({return_code})");
                        return self.crashed(model_id, consumer);
                    }
                }
                Ok(SlotCommand::Assign { model_id: other, .. }) => {
                    error!("[SLOT {slot}] BUG: assigned {other} while hosting {model_id}");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }

            let delivery = match consumer.next(self.ctx.config.tick()) {
                Ok(delivery) => {
                    fabric_failures = 0;
                    delivery
                }
                Err(e) => {
                    let delay = backoff_delay(self.ctx.config.io_retry_backoff(), fabric_failures);
                    warn!("[SLOT {slot}] Fabric error on {model_id} input, retrying in {delay:?}: {e}");
                    fabric_failures = fabric_failures.saturating_add(1);
                    thread::sleep(delay);
                    continue;
                }
            };

            let Some(delivery) = delivery else {
                if !drained {
                    drained = true;
                    self.emit(SlotEvent::Drained {
                        slot,
                        model_id: model_id.clone(),
                    });
                }
                continue;
            };
            if drained {
                drained = false;
                self.emit(SlotEvent::Resumed {
                    slot,
                    model_id: model_id.clone(),
                });
            }

            let command = match Command::decode(&delivery.body) {
                Ok(command) if command.model_id() == model_id => command,
                Ok(command) => {
                    warn!(
                        "[SLOT {slot}] Dropping {} for {} found on the queue of {model_id}",
                        command.method(),
                        command.model_id()
                    );
                    self.ack(&consumer, delivery);
                    continue;
                }
                Err(e) => {
                    warn!("[SLOT {slot}] Dropping undecodable message on {model_id}: {e}");
                    self.ack(&consumer, delivery);
                    continue;
                }
            };

            match command {
                Command::DefineModel { command_id, args, .. } => {
                    if defined {
                        debug!("[SLOT {slot}] Duplicate DefineModel for {model_id}, acknowledging");
                        self.publish_command_result(model_id, &command_id, "defineModel", Ok(()));
                        self.ack(&consumer, delivery);
                        continue;
                    }
                    match self.agent.define(args, self.ctx.config.batch_timeout()) {
                        Ok(()) => {
                            defined = true;
                            self.emit(SlotEvent::Defined {
                                slot,
                                model_id: model_id.clone(),
                            });
                            self.publish_command_result(model_id, &command_id, "defineModel", Ok(()));
                            self.ack(&consumer, delivery);
                        }
                        Err(e @ SwapperError::RunnerProtocol(_)) => {
                            self.publish_command_result(model_id, &command_id, "defineModel", Err(&e));
                            self.ack(&consumer, delivery);
                        }
                        Err(e) => {
                            warn!("[SLOT {slot}] Runner for {model_id} failed during define: {e}");
                            return self.crashed(model_id, consumer);
                        }
                    }
                }

                Command::DataBatch {
                    command_id, rows, ..
                } => {
                    let row_count = rows.len();
                    let outcome = self
                        .agent
                        .feed(&command_id, rows)
                        .and_then(|()| self.agent.await_batch(&command_id, self.ctx.config.batch_timeout()));
                    match outcome {
                        Ok(results) => {
                            let result = ModelResult::Inference {
                                model_id: model_id.clone(),
                                command_id,
                                results,
                            };
                            if let Err(e) = self.publish_result(&result) {
                                error!("[SLOT {slot}] Cannot publish results for {model_id}: {e}");
                                let _ = consumer.reject(delivery, true);
                                return self.swap_out(model_id, Some(consumer), Hosted::Done);
                            }
                            self.ack(&consumer, delivery);
                            self.emit(SlotEvent::BatchProcessed {
                                slot,
                                model_id: model_id.clone(),
                                rows: row_count,
                            });
                        }
                        Err(e @ SwapperError::RunnerProtocol(_)) => {
                            warn!("[SLOT {slot}] Runner rejected batch {command_id} for {model_id}: {e}");
                            self.publish_command_result(model_id, &command_id, "dataBatch", Err(&e));
                            self.ack(&consumer, delivery);
                        }
                        Err(e) => {
                            warn!("[SLOT {slot}] Runner for {model_id} failed on batch {command_id}: {e}");
                            return self.crashed(model_id, consumer);
                        }
                    }
                }

                Command::DeleteModel { command_id, .. } => {
                    info!("[SLOT {slot}] Deleting model {model_id}");
                    self.stop_quietly(false);
                    self.delete_model_data(model_id);
                    drop(consumer);
                    self.publish_command_result(model_id, &command_id, "deleteModel", Ok(()));
                    self.emit(SlotEvent::Stopped {
                        slot,
                        model_id: model_id.clone(),
                        outcome: StopOutcome::Deleted,
                    });
                    return Hosted::Done;
                }
            }
        }
    }

    /// Stop with a checkpoint and save it.
    fn swap_out(&mut self, model_id: &ModelId, consumer: Option<Consumer>, then: Hosted) -> Hosted {
        let slot = self.ctx.slot_id;
        // Disconnect first so anything unacknowledged is redeliverable at once.
        drop(consumer);

        let outcome = match self
            .agent
            .stop_gracefully(self.ctx.config.graceful_stop_timeout(), true)
        {
            Ok(report) if report.return_code == 0 => {
                let checkpoint_saved = match report.checkpoint {
                    Some(blob) => self.save_checkpoint(model_id, &blob),
                    None => {
                        warn!("[SLOT {slot}] Runner for {model_id} exited without a checkpoint");
                        false
                    }
                };
                StopOutcome::SwappedOut { checkpoint_saved }
            }
            Ok(report) => {
                warn!(
                    "[SLOT {slot}] Runner for {model_id} exited with {} during swap-out",
                    report.return_code
                );
                StopOutcome::Crashed {
                    return_code: report.return_code,
                }
            }
            Err(e) => {
                error!("[SLOT {slot}] Stopping runner for {model_id} failed: {e}");
                StopOutcome::Crashed { return_code: -1 }
            }
        };

        self.emit(SlotEvent::Stopped {
            slot,
            model_id: model_id.clone(),
            outcome,
        });
        then
    }

    /// Collect a runner that died on its own. Unacknowledged input stays queued.
    fn crashed(&mut self, model_id: &ModelId, consumer: Consumer) -> Hosted {
        drop(consumer);
        let return_code = match self.agent.stop_gracefully(CRASH_COLLECT_TIMEOUT, false) {
            Ok(report) => report.return_code,
            Err(e) => {
                error!("[SLOT {}] Collecting crashed runner failed: {e}", self.ctx.slot_id);
                -1
            }
        };
        self.emit(SlotEvent::Stopped {
            slot: self.ctx.slot_id,
            model_id: model_id.clone(),
            outcome: StopOutcome::Crashed { return_code },
        });
        Hosted::Done
    }

    fn stop_quietly(&mut self, save_checkpoint: bool) {
        if !self.agent.is_running() {
            return;
        }
        if let Err(e) = self
            .agent
            .stop_gracefully(self.ctx.config.graceful_stop_timeout(), save_checkpoint)
        {
            warn!("[SLOT {}] Stopping runner failed: {e}", self.ctx.slot_id);
        }
    }

    fn save_checkpoint(&self, model_id: &ModelId, blob: &[u8]) -> bool {
        let config = &self.ctx.config;
        match retry_transient(
            "save checkpoint",
            config.io_retry_attempts,
            config.io_retry_backoff(),
            || self.ctx.checkpoints.save(model_id, blob),
        ) {
            Ok(()) => true,
            Err(e) => {
                // The previous checkpoint stays usable; the model can still be reloaded.
                error!("[SLOT {}] Saving checkpoint of {model_id} failed: {e}", self.ctx.slot_id);
                false
            }
        }
    }

    fn delete_model_data(&self, model_id: &ModelId) {
        let config = &self.ctx.config;
        let slot = self.ctx.slot_id;
        if let Err(e) = retry_transient(
            "delete checkpoint",
            config.io_retry_attempts,
            config.io_retry_backoff(),
            || self.ctx.checkpoints.delete(model_id),
        ) {
            error!("[SLOT {slot}] Deleting checkpoint of {model_id} failed: {e}");
        }
        if let Err(e) = retry_transient(
            "delete input queue",
            config.io_retry_attempts,
            config.io_retry_backoff(),
            || self.ctx.fabric.delete_model_input_queue(model_id),
        ) {
            error!("[SLOT {slot}] Deleting input queue of {model_id} failed: {e}");
        }
    }

    fn ack(&self, consumer: &Consumer, delivery: Delivery) {
        if let Err(e) = consumer.ack(delivery) {
            // Redelivered later; the runner skips rows it has already seen.
            warn!("[SLOT {}] Ack failed on {}: {e}", self.ctx.slot_id, consumer.queue());
        }
    }

    fn publish_result(&self, result: &ModelResult) -> Result<()> {
        let body = result.encode()?;
        let config = &self.ctx.config;
        retry_transient(
            "publish result",
            config.io_retry_attempts,
            config.io_retry_backoff(),
            || {
                self.ctx
                    .fabric
                    .publish(RESULTS_QUEUE, &body, Persistence::Persistent)
                    .map(|_| ())
            },
        )
    }

    fn publish_command_result(
        &self,
        model_id: &ModelId,
        command_id: &str,
        method: &str,
        outcome: std::result::Result<(), &SwapperError>,
    ) {
        let (status, message) = match outcome {
            Ok(()) => (CommandStatus::Ok, None),
            Err(e) => (CommandStatus::Error, Some(e.to_string())),
        };
        let result = ModelResult::Command {
            model_id: model_id.clone(),
            command_id: command_id.to_string(),
            method: method.to_string(),
            status,
            message,
        };
        if let Err(e) = self.publish_result(&result) {
            warn!(
                "[SLOT {}] Cannot publish {method} result for {model_id}: {e}",
                self.ctx.slot_id
            );
        }
    }
}
