//! Admission Gate: decides whether a request may start now.
//!
//! Protected tiers always bypass. Throttleable tiers are deferred while a
//! user is active, while an operator pause is in force, or while the
//! executing count sits at the concurrency cap. Decisions only read shared
//! state; nothing here blocks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::activity::ActivityTracker;
use crate::request::deadline_after;
use crate::types::{Admission, DeferReason, PriorityTier};

pub struct AdmissionGate {
    activity: Arc<ActivityTracker>,
    /// Requests currently executing, all tiers.
    executing: Arc<AtomicUsize>,
    max_concurrent: usize,
    /// Deadline of an operator-requested pause.
    manual_pause: Mutex<Option<Instant>>,
}

impl AdmissionGate {
    pub fn new(
        activity: Arc<ActivityTracker>,
        executing: Arc<AtomicUsize>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            activity,
            executing,
            max_concurrent,
            manual_pause: Mutex::new(None),
        }
    }

    fn manual(&self) -> MutexGuard<'_, Option<Instant>> {
        self.manual_pause.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn decide(&self, tier: PriorityTier) -> Admission {
        if tier.is_protected() {
            return Admission::Bypass;
        }
        if let Some(reason) = self.pause_reason() {
            return Admission::Defer(reason);
        }
        if self.executing.load(Ordering::Acquire) >= self.max_concurrent {
            return Admission::Defer(DeferReason::AtCapacity);
        }
        Admission::Admit
    }

    /// Pause throttleable admission for `duration` (extends, never shortens).
    pub fn pause_background(&self, duration: Duration) {
        let until = deadline_after(Instant::now(), duration);
        let mut pause = self.manual();
        let until = match *pause {
            Some(existing) if existing > until => existing,
            _ => until,
        };
        *pause = Some(until);
        info!(secs = duration.as_secs_f64(), "background work paused");
    }

    pub fn resume_background(&self) {
        if self.manual().take().is_some() {
            info!("background work resumed");
        }
    }

    pub fn manual_pause_active(&self) -> bool {
        matches!(*self.manual(), Some(until) if Instant::now() < until)
    }

    /// Clear a manual pause whose deadline has passed. Returns `true` if one was cleared.
    pub fn expire_manual_pause(&self) -> bool {
        let mut pause = self.manual();
        match *pause {
            Some(until) if Instant::now() >= until => {
                *pause = None;
                info!("manual background pause expired");
                true
            }
            _ => false,
        }
    }

    /// Which pause, if any, currently holds throttleable work back.
    pub fn pause_reason(&self) -> Option<DeferReason> {
        if self.activity.is_pause_active() {
            Some(DeferReason::UserActive)
        } else if self.manual_pause_active() {
            Some(DeferReason::ManualPause)
        } else {
            None
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause_reason().is_some()
    }

    pub fn executing(&self) -> usize {
        self.executing.load(Ordering::Acquire)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
