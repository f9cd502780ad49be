//! Swap policy: which waiting model gets a slot, and which active model gives
//! one up.

use std::time::{Duration, Instant};

use crate::swapper::config::SchedulerConfig;
use crate::swapper::types::ModelId;

/// A model with pending input and no slot.
#[derive(Debug, Clone)]
pub struct WaitingModel<'a> {
    pub model_id: &'a ModelId,
    pub pending_since: Instant,
}

/// A model hosted by a slot and not already stopping.
#[derive(Debug, Clone)]
pub struct ActiveModel<'a> {
    pub slot: usize,
    pub model_id: &'a ModelId,
    pub active_since: Instant,
    /// Set while the model's input queue is empty.
    pub drained_since: Option<Instant>,
}

/// Swap policy trait. Implementations must be deterministic for equal inputs.
pub trait SwapPolicy: Send + Sync {
    /// The waiting model to place next.
    fn next_model<'a>(&self, waiting: &[WaitingModel<'a>]) -> Option<&'a ModelId>;

    /// The free slot to fill next.
    fn pick_free_slot(&self, free: &[usize]) -> Option<usize> {
        free.iter().copied().min()
    }

    /// Slot to reclaim for a waiting model when none is free.
    fn pick_victim(&self, active: &[ActiveModel<'_>], now: Instant) -> Option<usize>;

    /// Whether an active model should be swapped out although nobody waits.
    fn should_idle_unload(&self, active: &ActiveModel<'_>, now: Instant) -> bool;
}

/// Longest-waiting model first.
///
/// Victims are drained models first (longest drained), then models that have
/// been active for at least `min_active_time` (longest active). Ties go to the
/// lower model id or slot index.
#[derive(Debug, Clone)]
pub struct LongestWaitingFirst {
    pub min_active_time: Duration,
    pub idle_unload_after: Duration,
}

impl LongestWaitingFirst {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            min_active_time: config.min_active_time(),
            idle_unload_after: config.idle_unload_after(),
        }
    }
}

impl SwapPolicy for LongestWaitingFirst {
    fn next_model<'a>(&self, waiting: &[WaitingModel<'a>]) -> Option<&'a ModelId> {
        waiting
            .iter()
            .min_by(|a, b| {
                a.pending_since
                    .cmp(&b.pending_since)
                    .then_with(|| a.model_id.cmp(b.model_id))
            })
            .map(|w| w.model_id)
    }

    fn pick_victim(&self, active: &[ActiveModel<'_>], now: Instant) -> Option<usize> {
        let drained = active
            .iter()
            .filter_map(|a| a.drained_since.map(|since| (since, a.slot)))
            .min();
        if let Some((_, slot)) = drained {
            return Some(slot);
        }
        active
            .iter()
            .filter(|a| now.saturating_duration_since(a.active_since) >= self.min_active_time)
            .map(|a| (a.active_since, a.slot))
            .min()
            .map(|(_, slot)| slot)
    }

    fn should_idle_unload(&self, active: &ActiveModel<'_>, now: Instant) -> bool {
        active
            .drained_since
            .is_some_and(|since| now.saturating_duration_since(since) >= self.idle_unload_after)
    }
}
