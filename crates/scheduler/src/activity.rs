//! Protected-tier activity tracking.
//!
//! Records, per submitter, when they last sent a protected-tier request.
//! The Admission Gate asks [`ActivityTracker::is_pause_active`] on every
//! throttleable decision; the cleanup loop calls [`ActivityTracker::cleanup`]
//! to bound memory.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

pub struct ActivityTracker {
    records: RwLock<HashMap<String, Instant>>,
    pause_window: Duration,
    activity_timeout: Duration,
}

impl ActivityTracker {
    pub fn new(pause_window: Duration, activity_timeout: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            pause_window,
            activity_timeout,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Instant>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Instant>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamp `now` for a submitter. Call for protected-tier submissions only.
    pub fn record_activity(&self, submitter: &str) {
        self.write().insert(submitter.to_string(), Instant::now());
    }

    #[cfg(test)]
    fn last_activity(&self, submitter: &str) -> Option<Instant> {
        self.read().get(submitter).copied()
    }

    /// True if any submitter was active within the pause window.
    pub fn is_pause_active(&self) -> bool {
        let now = Instant::now();
        self.read()
            .values()
            .any(|t| now.saturating_duration_since(*t) < self.pause_window)
    }

    /// Time until the current pause lifts, if one is active.
    pub fn pause_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        self.read()
            .values()
            .filter_map(|t| self.pause_window.checked_sub(now.saturating_duration_since(*t)))
            .filter(|d| !d.is_zero())
            .max()
    }

    /// Drop records older than the activity timeout. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut records = self.write();
        let before = records.len();
        records.retain(|_, t| now.saturating_duration_since(*t) < self.activity_timeout);
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, remaining = records.len(), "purged stale activity records");
        }
        removed
    }

    /// Number of tracked submitters.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
