//! Model scheduler: the control loop multiplexing models onto the slot pool.
//!
//! Only the scheduler thread mutates slot and model state. It learns about
//! pending work from notifications and a periodic queue rescan, and about
//! runners from the [`SlotEvent`]s its slot workers report.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};

use crate::swapper::backoff::backoff_delay;
use crate::swapper::checkpoint::CheckpointStore;
use crate::swapper::config::{RunnerSpawnConfig, SchedulerConfig};
use crate::swapper::error::Result;
use crate::swapper::fabric::{Consumer, Persistence, QueueFabric};
use crate::swapper::messages::{
    input_queue_name, model_id_from_queue, Command, CommandStatus, ModelResult, Notification,
    INPUT_QUEUE_PREFIX, NOTIFICATION_QUEUE, RESULTS_QUEUE,
};
use crate::swapper::policy::{ActiveModel, SwapPolicy, WaitingModel};
use crate::swapper::reaper::ProcessReaper;
use crate::swapper::slot::slot_worker::{
    spawn_slot_worker, SlotCommand, SlotEvent, SlotWorkerContext, SlotWorkerHandle, StopOutcome,
};
use crate::swapper::types::ModelId;

/// Notifications handled per loop iteration.
const NOTIFICATION_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Unloaded,
    Loading,
    Active,
    Unloading,
    Deleted,
    /// Crash budget exhausted; excluded from scheduling until cleared.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Starting(ModelId),
    Busy(ModelId),
    Stopping(ModelId),
}

impl SlotState {
    pub fn model_id(&self) -> Option<&ModelId> {
        match self {
            SlotState::Free => None,
            SlotState::Starting(m) | SlotState::Busy(m) | SlotState::Stopping(m) => Some(m),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotSnapshot {
    pub slot: usize,
    pub state: SlotState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSnapshot {
    pub state: ModelState,
    pub slot: Option<usize>,
    pub defined: bool,
    pub crash_count: u32,
    pub last_error: Option<String>,
}

/// Point-in-time view of the scheduler, refreshed every loop iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerSnapshot {
    pub slots: Vec<SlotSnapshot>,
    pub models: BTreeMap<ModelId, ModelSnapshot>,
    pub running: bool,
}

impl SchedulerSnapshot {
    pub fn model_state(&self, model_id: &ModelId) -> Option<ModelState> {
        self.models.get(model_id).map(|m| m.state)
    }

    /// Number of slots currently holding `model_id` in any non-free state.
    pub fn slots_holding(&self, model_id: &ModelId) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state.model_id() == Some(model_id))
            .count()
    }
}

enum Control {
    ClearError(ModelId),
    Stop,
}

/// Handle to a running scheduler thread.
pub struct SchedulerHandle {
    control: Sender<Control>,
    snapshot: Arc<Mutex<SchedulerSnapshot>>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.snapshot
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Put a model in `Error` back into scheduling with a fresh crash budget.
    pub fn clear_error(&self, model_id: &ModelId) {
        let _ = self.control.send(Control::ClearError(model_id.clone()));
    }

    /// Swap out every active model, stop the slot workers and wait.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.control.send(Control::Stop);
            if thread.join().is_err() {
                error!("[SCHEDULER] Scheduler thread panicked");
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

struct ModelEntry {
    state: ModelState,
    slot: Option<usize>,
    defined: bool,
    pending_since: Option<Instant>,
    active_since: Option<Instant>,
    drained_since: Option<Instant>,
    crash_count: u32,
    retry_after: Option<Instant>,
    last_error: Option<String>,
}

impl ModelEntry {
    fn new() -> Self {
        Self {
            state: ModelState::Unloaded,
            slot: None,
            defined: false,
            pending_since: None,
            active_since: None,
            drained_since: None,
            crash_count: 0,
            retry_after: None,
            last_error: None,
        }
    }
}

struct SlotEntry {
    state: SlotState,
    worker: Option<SlotWorkerHandle>,
}

pub struct ModelScheduler {
    config: SchedulerConfig,
    fabric: QueueFabric,
    checkpoints: Arc<CheckpointStore>,
    policy: Box<dyn SwapPolicy>,
    slots: Vec<SlotEntry>,
    models: BTreeMap<ModelId, ModelEntry>,
    events: Receiver<SlotEvent>,
    control: Receiver<Control>,
    notifications: Consumer,
    snapshot: Arc<Mutex<SchedulerSnapshot>>,
    last_rescan: Instant,
}

impl ModelScheduler {
    /// Recover the fabric, start one worker per slot and run the control loop
    /// on its own thread.
    pub fn spawn(
        config: SchedulerConfig,
        spawn: RunnerSpawnConfig,
        fabric: QueueFabric,
        checkpoints: Arc<CheckpointStore>,
        reaper: Arc<ProcessReaper>,
        policy: Box<dyn SwapPolicy>,
    ) -> Result<SchedulerHandle> {
        fabric.declare_queue(NOTIFICATION_QUEUE)?;
        fabric.declare_queue(RESULTS_QUEUE)?;
        fabric.recover()?;
        let notifications = fabric.consume(NOTIFICATION_QUEUE)?;

        let (event_tx, events) = unbounded();
        let mut slots = Vec::with_capacity(config.slot_count);
        for slot_id in 0..config.slot_count {
            let worker = spawn_slot_worker(SlotWorkerContext {
                slot_id,
                fabric: fabric.clone(),
                checkpoints: checkpoints.clone(),
                reaper: reaper.clone(),
                spawn: spawn.clone(),
                config: config.clone(),
                events: event_tx.clone(),
            })?;
            slots.push(SlotEntry {
                state: SlotState::Free,
                worker: Some(worker),
            });
        }

        let (control_tx, control) = unbounded();
        let snapshot = Arc::new(Mutex::new(SchedulerSnapshot::default()));

        let scheduler = ModelScheduler {
            config,
            fabric,
            checkpoints,
            policy,
            slots,
            models: BTreeMap::new(),
            events,
            control,
            notifications,
            snapshot: snapshot.clone(),
            last_rescan: Instant::now(),
        };
        scheduler.publish_snapshot(true);

        let thread = thread::Builder::new()
            .name("model-scheduler".to_string())
            .spawn(move || scheduler.run())?;

        Ok(SchedulerHandle {
            control: control_tx,
            snapshot,
            thread: Some(thread),
        })
    }

    fn run(mut self) {
        info!("[SCHEDULER] Running with {} slot(s)", self.slots.len());
        // Restart recovery: pick up whatever the queues still hold.
        self.rescan();

        loop {
            loop {
                match self.control.try_recv() {
                    Ok(Control::ClearError(model_id)) => self.clear_error(&model_id),
                    Ok(Control::Stop) | Err(TryRecvError::Disconnected) => {
                        self.shutdown();
                        return;
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }

            if let Ok(event) = self.events.recv_timeout(self.config.tick()) {
                self.on_slot_event(event);
                while let Ok(event) = self.events.try_recv() {
                    self.on_slot_event(event);
                }
            }

            self.drain_notifications();
            if self.last_rescan.elapsed() >= self.config.rescan_interval() {
                self.rescan();
            }
            self.schedule(Instant::now());
            self.publish_snapshot(true);
        }
    }

    fn shutdown(&mut self) {
        info!("[SCHEDULER] Stopping, swapping out active models");
        for slot in &self.slots {
            if let Some(worker) = &slot.worker {
                worker.send(SlotCommand::Shutdown);
            }
        }
        for slot in &mut self.slots {
            if let Some(worker) = slot.worker.take() {
                worker.join();
            }
        }
        while let Ok(event) = self.events.try_recv() {
            self.on_slot_event(event);
        }
        self.publish_snapshot(false);
        info!("[SCHEDULER] Stopped");
    }

    fn clear_error(&mut self, model_id: &ModelId) {
        match self.models.get_mut(model_id) {
            Some(entry) if entry.state == ModelState::Error => {
                info!("[SCHEDULER] Clearing error state of {model_id}");
                entry.state = ModelState::Unloaded;
                entry.crash_count = 0;
                entry.retry_after = None;
                entry.last_error = None;
                entry.pending_since = Some(Instant::now());
            }
            _ => debug!("[SCHEDULER] clear_error({model_id}): model is not in error"),
        }
    }

    fn on_slot_event(&mut self, event: SlotEvent) {
        let now = Instant::now();
        let slot = event.slot();
        debug!("[SCHEDULER] {event:?}");

        match event {
            SlotEvent::Started {
                model_id, restored, ..
            } => {
                self.set_slot(slot, SlotState::Busy(model_id.clone()));
                let entry = self.models.entry(model_id).or_insert_with(ModelEntry::new);
                entry.defined |= restored;
                if entry.state == ModelState::Loading {
                    entry.state = ModelState::Active;
                }
                entry.active_since = Some(now);
                entry.drained_since = None;
            }
            SlotEvent::StartFailed { model_id, error, .. } => {
                self.set_slot(slot, SlotState::Free);
                self.record_failure(&model_id, error, now);
            }
            SlotEvent::Defined { model_id, .. } => {
                if let Some(entry) = self.models.get_mut(&model_id) {
                    entry.defined = true;
                }
            }
            SlotEvent::Drained { model_id, .. } => {
                if let Some(entry) = self.models.get_mut(&model_id) {
                    entry.drained_since = Some(now);
                }
            }
            SlotEvent::Resumed { model_id, .. } => {
                if let Some(entry) = self.models.get_mut(&model_id) {
                    entry.drained_since = None;
                }
            }
            SlotEvent::BatchProcessed { model_id, .. } => {
                if let Some(entry) = self.models.get_mut(&model_id) {
                    entry.crash_count = 0;
                    entry.last_error = None;
                }
            }
            SlotEvent::Stopped {
                model_id, outcome, ..
            } => {
                self.set_slot(slot, SlotState::Free);
                match outcome {
                    StopOutcome::SwappedOut { checkpoint_saved } => {
                        if !checkpoint_saved {
                            warn!("[SCHEDULER] {model_id} swapped out without a new checkpoint");
                        }
                        let has_work = self.has_ready_input(&model_id);
                        let entry = self.models.entry(model_id).or_insert_with(ModelEntry::new);
                        entry.state = ModelState::Unloaded;
                        entry.slot = None;
                        entry.active_since = None;
                        entry.drained_since = None;
                        entry.pending_since = has_work.then_some(now);
                    }
                    StopOutcome::Crashed { return_code } => {
                        let reason = format!("runner crashed with return code {return_code}");
                        self.record_failure(&model_id, reason, now);
                    }
                    StopOutcome::Deleted => {
                        info!("[SCHEDULER] Model {model_id} deleted");
                        let entry = self.models.entry(model_id).or_insert_with(ModelEntry::new);
                        *entry = ModelEntry::new();
                        entry.state = ModelState::Deleted;
                    }
                }
            }
        }
    }

    fn set_slot(&mut self, slot: usize, state: SlotState) {
        match self.slots.get_mut(slot) {
            Some(entry) => entry.state = state,
            None => error!("[SCHEDULER] BUG: event for unknown slot {slot}"),
        }
    }

    /// Count a failed start or crash against the model's budget.
    fn record_failure(&mut self, model_id: &ModelId, reason: String, now: Instant) {
        let max_retries = self.config.max_crash_retries;
        let base = self.config.crash_backoff();
        let entry = self
            .models
            .entry(model_id.clone())
            .or_insert_with(ModelEntry::new);
        entry.crash_count += 1;
        entry.slot = None;
        entry.active_since = None;
        entry.drained_since = None;

        if entry.crash_count > max_retries {
            error!(
                "[SCHEDULER] Model {model_id} failed {} time(s), giving up: {reason}",
                entry.crash_count
            );
            entry.state = ModelState::Error;
            entry.pending_since = None;
            entry.retry_after = None;
        } else {
            let delay = backoff_delay(base, entry.crash_count - 1);
            warn!(
                "[SCHEDULER] Model {model_id} failed ({}/{max_retries}), retrying in {delay:?}: {reason}",
                entry.crash_count
            );
            entry.state = ModelState::Unloaded;
            entry.retry_after = Some(now + delay);
            entry.pending_since.get_or_insert(now);
        }
        entry.last_error = Some(reason);
    }

    fn has_ready_input(&self, model_id: &ModelId) -> bool {
        // Assume work on errors; the head check before assignment corrects it.
        self.fabric
            .ready_count(&input_queue_name(model_id))
            .map(|n| n > 0)
            .unwrap_or(true)
    }

    fn drain_notifications(&mut self) {
        for _ in 0..NOTIFICATION_BATCH {
            let delivery = match self.notifications.try_next() {
                Ok(Some(delivery)) => delivery,
                Ok(None) => return,
                Err(e) => {
                    warn!("[SCHEDULER] Reading notifications failed: {e}");
                    return;
                }
            };
            let decoded = Notification::decode(&delivery.body);
            if let Err(e) = self.notifications.ack(delivery) {
                warn!("[SCHEDULER] Ack of notification failed: {e}");
            }
            match decoded {
                Ok(notification) => self.on_notification(&notification.model_id),
                Err(e) => warn!("[SCHEDULER] Dropping malformed notification: {e}"),
            }
        }
    }

    fn on_notification(&mut self, model_id: &ModelId) {
        let hosted = self
            .models
            .get(model_id)
            .is_some_and(|m| m.slot.is_some());
        if hosted {
            // The slot worker is already draining that queue.
            return;
        }
        match self.fabric.queue_exists(&input_queue_name(model_id)) {
            Ok(true) => self.note_pending(model_id, Instant::now()),
            Ok(false) => {
                warn!("[SCHEDULER] Dropping notification for unknown or deleted model {model_id}")
            }
            Err(e) => warn!("[SCHEDULER] Cannot check input queue of {model_id}: {e}"),
        }
    }

    /// Record that `model_id`'s existing input queue has work.
    fn note_pending(&mut self, model_id: &ModelId, now: Instant) {
        let entry = self
            .models
            .entry(model_id.clone())
            .or_insert_with(ModelEntry::new);
        match entry.state {
            ModelState::Deleted => {
                info!("[SCHEDULER] Model {model_id} was defined again");
                *entry = ModelEntry::new();
                entry.pending_since = Some(now);
            }
            ModelState::Unloaded => {
                entry.pending_since.get_or_insert(now);
            }
            ModelState::Error => {
                // Deletion is still honoured for a model in error, even
                // behind the batch that keeps crashing it.
                if let Some(command_id) = self.queued_delete(model_id) {
                    self.delete_inline(model_id, &command_id);
                }
            }
            ModelState::Loading | ModelState::Active | ModelState::Unloading => {}
        }
    }

    /// Reconcile with the fabric: every input queue with ready messages is
    /// pending work, and unloaded models whose queue is gone are deleted.
    fn rescan(&mut self) {
        let now = Instant::now();
        self.last_rescan = now;

        let queues = match self.fabric.list_queues(INPUT_QUEUE_PREFIX) {
            Ok(queues) => queues,
            Err(e) => {
                warn!("[SCHEDULER] Queue rescan failed: {e}");
                return;
            }
        };
        let live: BTreeSet<ModelId> = queues.iter().filter_map(|q| model_id_from_queue(q)).collect();

        for model_id in &live {
            if self.models.get(model_id).is_some_and(|m| m.slot.is_some()) {
                continue;
            }
            match self.fabric.ready_count(&input_queue_name(model_id)) {
                Ok(0) => {
                    let entry = self
                        .models
                        .entry(model_id.clone())
                        .or_insert_with(ModelEntry::new);
                    if entry.state == ModelState::Deleted {
                        *entry = ModelEntry::new();
                    }
                }
                Ok(_) => self.note_pending(model_id, now),
                Err(e) => warn!("[SCHEDULER] Cannot count input of {model_id}: {e}"),
            }
        }

        for (model_id, entry) in self.models.iter_mut() {
            if entry.state == ModelState::Unloaded && !live.contains(model_id) {
                info!("[SCHEDULER] Input queue of {model_id} is gone, marking deleted");
                *entry = ModelEntry::new();
                entry.state = ModelState::Deleted;
            }
        }
    }

    /// Command id of the first `DeleteModel` waiting in the model's queue.
    fn queued_delete(&self, model_id: &ModelId) -> Option<String> {
        let bodies = match self.fabric.browse(&input_queue_name(model_id)) {
            Ok(bodies) => bodies,
            Err(e) => {
                warn!("[SCHEDULER] Cannot browse input of {model_id}: {e}");
                return None;
            }
        };
        bodies.iter().find_map(|body| match Command::decode(body) {
            Ok(Command::DeleteModel { command_id, .. }) => Some(command_id),
            _ => None,
        })
    }

    /// Delete a model that no slot hosts without starting a runner for it.
    /// Anything still queued for it is dropped with the queue.
    fn delete_inline(&mut self, model_id: &ModelId, command_id: &str) {
        match self.purge_model(model_id) {
            Ok(()) => {
                info!("[SCHEDULER] Deleted unloaded model {model_id}");
                self.publish_delete_result(model_id, command_id);
                let entry = self
                    .models
                    .entry(model_id.clone())
                    .or_insert_with(ModelEntry::new);
                *entry = ModelEntry::new();
                entry.state = ModelState::Deleted;
            }
            Err(e) => warn!("[SCHEDULER] Deleting {model_id} failed, will retry: {e}"),
        }
    }

    fn purge_model(&self, model_id: &ModelId) -> Result<()> {
        self.checkpoints.delete(model_id)?;
        self.fabric.delete_model_input_queue(model_id)?;
        Ok(())
    }

    fn publish_delete_result(&self, model_id: &ModelId, command_id: &str) {
        let result = ModelResult::Command {
            model_id: model_id.clone(),
            command_id: command_id.to_string(),
            method: "deleteModel".to_string(),
            status: CommandStatus::Ok,
            message: None,
        };
        let published = result
            .encode()
            .and_then(|body| self.fabric.publish(RESULTS_QUEUE, &body, Persistence::Persistent));
        if let Err(e) = published {
            warn!("[SCHEDULER] Cannot publish deleteModel result for {model_id}: {e}");
        }
    }

    fn schedule(&mut self, now: Instant) {
        self.unload_idle(now);

        // Models examined this pass; one decision per model per pass.
        let mut examined: BTreeSet<ModelId> = BTreeSet::new();
        // Waiting models already promised a slot that is stopping.
        let mut covered = 0usize;
        loop {
            let waiting: Vec<(ModelId, Instant)> = self
                .models
                .iter()
                .filter(|(id, m)| {
                    m.state == ModelState::Unloaded
                        && m.retry_after.map_or(true, |t| t <= now)
                        && !examined.contains(*id)
                })
                .filter_map(|(id, m)| m.pending_since.map(|since| (id.clone(), since)))
                .collect();
            if waiting.is_empty() {
                return;
            }

            let next = {
                let view: Vec<WaitingModel<'_>> = waiting
                    .iter()
                    .map(|(model_id, pending_since)| WaitingModel {
                        model_id,
                        pending_since: *pending_since,
                    })
                    .collect();
                self.policy.next_model(&view).cloned()
            };
            let Some(model_id) = next else {
                return;
            };
            examined.insert(model_id.clone());

            let head = match self.fabric.peek(&input_queue_name(&model_id)) {
                Ok(head) => head,
                Err(e) => {
                    warn!("[SCHEDULER] Cannot inspect input of {model_id}: {e}");
                    return;
                }
            };
            let Some(head) = head else {
                if let Some(entry) = self.models.get_mut(&model_id) {
                    entry.pending_since = None;
                }
                continue;
            };
            if let Ok(Command::DeleteModel { command_id, .. }) = Command::decode(&head) {
                self.delete_inline(&model_id, &command_id);
                continue;
            }

            let free: Vec<usize> = self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.state == SlotState::Free)
                .map(|(i, _)| i)
                .collect();
            if let Some(slot) = self.policy.pick_free_slot(&free) {
                self.assign(slot, &model_id);
                continue;
            }

            // No free slot: a slot that is already stopping covers this
            // model, otherwise reclaim one.
            let stopping = self
                .slots
                .iter()
                .filter(|s| matches!(s.state, SlotState::Stopping(_)))
                .count();
            if stopping > covered {
                covered += 1;
                continue;
            }
            let victim = {
                let active: Vec<ActiveModel<'_>> = self
                    .slots
                    .iter()
                    .enumerate()
                    .filter_map(|(slot, s)| match &s.state {
                        SlotState::Busy(model_id) => {
                            let entry = self.models.get(model_id)?;
                            (entry.state == ModelState::Active).then_some(ActiveModel {
                                slot,
                                model_id,
                                active_since: entry.active_since.unwrap_or(now),
                                drained_since: entry.drained_since,
                            })
                        }
                        _ => None,
                    })
                    .collect();
                self.policy.pick_victim(&active, now)
            };
            match victim {
                Some(slot) => {
                    self.swap_out(slot, "slot needed by a waiting model");
                    covered += 1;
                }
                None => return,
            }
        }
    }

    fn unload_idle(&mut self, now: Instant) {
        let idle: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| match &s.state {
                SlotState::Busy(model_id) => {
                    let entry = self.models.get(model_id)?;
                    let active = ActiveModel {
                        slot,
                        model_id,
                        active_since: entry.active_since.unwrap_or(now),
                        drained_since: entry.drained_since,
                    };
                    (entry.state == ModelState::Active && self.policy.should_idle_unload(&active, now))
                        .then_some(slot)
                }
                _ => None,
            })
            .collect();
        for slot in idle {
            self.swap_out(slot, "idle");
        }
    }

    fn assign(&mut self, slot: usize, model_id: &ModelId) {
        let Some(entry) = self.models.get_mut(model_id) else {
            return;
        };
        info!("[SCHEDULER] Assigning {model_id} to slot {slot}");
        entry.state = ModelState::Loading;
        entry.slot = Some(slot);
        entry.pending_since = None;
        entry.retry_after = None;
        let defined = entry.defined;

        if let Some(slot_entry) = self.slots.get_mut(slot) {
            slot_entry.state = SlotState::Starting(model_id.clone());
            if let Some(worker) = &slot_entry.worker {
                worker.send(SlotCommand::Assign {
                    model_id: model_id.clone(),
                    defined,
                });
            }
        }
    }

    fn swap_out(&mut self, slot: usize, reason: &str) {
        let Some(slot_entry) = self.slots.get_mut(slot) else {
            return;
        };
        let SlotState::Busy(model_id) = &slot_entry.state else {
            return;
        };
        let model_id = model_id.clone();
        info!("[SCHEDULER] Swapping out {model_id} from slot {slot} ({reason})");
        slot_entry.state = SlotState::Stopping(model_id.clone());
        if let Some(worker) = &slot_entry.worker {
            worker.send(SlotCommand::SwapOut);
        }
        if let Some(entry) = self.models.get_mut(&model_id) {
            entry.state = ModelState::Unloading;
        }
    }

    fn publish_snapshot(&self, running: bool) {
        let snapshot = SchedulerSnapshot {
            slots: self
                .slots
                .iter()
                .enumerate()
                .map(|(slot, s)| SlotSnapshot {
                    slot,
                    state: s.state.clone(),
                })
                .collect(),
            models: self
                .models
                .iter()
                .map(|(id, m)| {
                    (
                        id.clone(),
                        ModelSnapshot {
                            state: m.state,
                            slot: m.slot,
                            defined: m.defined,
                            crash_count: m.crash_count,
                            last_error: m.last_error.clone(),
                        },
                    )
                })
                .collect(),
            running,
        };
        if let Ok(mut shared) = self.snapshot.lock() {
            *shared = snapshot;
        }
    }
}
