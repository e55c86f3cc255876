use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::types::{FallbackReason, Outcome, PriorityTier};

/// Per-tier request counters exposed through `stats()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierCounters {
    pub submitted: u64,
    /// Protected requests that skipped the queue.
    pub bypassed: u64,
    pub admitted: u64,
    /// Capacity deferrals (the request went back into the queue).
    pub deferred: u64,
    /// Pause deferrals answered with a fallback.
    pub denied: u64,
    pub completed: u64,
    pub cache_hits: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub fallbacks: u64,
    /// Work items that actually ran.
    pub executions: u64,
    /// Rolling mean work-item duration.
    pub avg_duration_ms: f64,
}

impl TierCounters {
    fn record_execution(&mut self, duration: Duration) {
        self.executions += 1;
        let cur = duration.as_secs_f64() * 1000.0;
        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        self.avg_duration_ms += (cur - self.avg_duration_ms) / self.executions as f64;
    }
}

/// Scheduler counters, written through explicit `record_*` calls.
#[derive(Debug, Default)]
pub struct Metrics {
    tiers: RwLock<HashMap<PriorityTier, TierCounters>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, tier: PriorityTier, f: impl FnOnce(&mut TierCounters)) {
        let mut tiers = self.tiers.write().unwrap_or_else(PoisonError::into_inner);
        f(tiers.entry(tier).or_default());
    }

    pub fn record_submitted(&self, tier: PriorityTier) {
        self.update(tier, |c| c.submitted += 1);
    }

    pub fn record_bypassed(&self, tier: PriorityTier) {
        self.update(tier, |c| c.bypassed += 1);
    }

    pub fn record_admitted(&self, tier: PriorityTier) {
        self.update(tier, |c| c.admitted += 1);
    }

    pub fn record_deferred(&self, tier: PriorityTier) {
        self.update(tier, |c| c.deferred += 1);
    }

    pub fn record_denied(&self, tier: PriorityTier) {
        self.update(tier, |c| c.denied += 1);
    }

    pub fn record_execution(&self, tier: PriorityTier, duration: Duration) {
        self.update(tier, |c| c.record_execution(duration));
    }

    /// Count the terminal outcome delivered to a caller.
    pub fn record_outcome(&self, tier: PriorityTier, outcome: &Outcome) {
        self.update(tier, |c| match outcome {
            Outcome::Completed { cached, .. } => {
                c.completed += 1;
                if *cached {
                    c.cache_hits += 1;
                }
            }
            Outcome::Fallback { reason, .. } => {
                c.fallbacks += 1;
                if *reason == FallbackReason::Timeout {
                    c.timed_out += 1;
                }
            }
            Outcome::Failed { .. } => c.failed += 1,
        });
    }

    /// Point-in-time copy covering every tier, in urgency order.
    pub fn snapshot(&self) -> BTreeMap<PriorityTier, TierCounters> {
        let tiers = self.tiers.read().unwrap_or_else(PoisonError::into_inner);
        PriorityTier::ALL
            .into_iter()
            .map(|t| (t, tiers.get(&t).cloned().unwrap_or_default()))
            .collect()
    }

    pub fn tier(&self, tier: PriorityTier) -> TierCounters {
        self.tiers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tier)
            .cloned()
            .unwrap_or_default()
    }
}
