use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use throttle_core::ThrottleConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::activity::ActivityTracker;
use crate::cache::ResponseCache;
use crate::executor::Executor;
use crate::gate::AdmissionGate;
use crate::metrics::{Metrics, TierCounters};
use crate::queue::PriorityQueue;
use crate::request::RequestTicket;
use crate::types::{PriorityTier, RequestState};

/// Mediates access to the shared backend for every caller.
///
/// Construct one per process with [`Manager::new`], call
/// [`Manager::start`] during startup, and pass the `Arc` to whoever submits
/// work.
pub struct Manager {
    pub(super) config: ThrottleConfig,
    pub(super) activity: Arc<ActivityTracker>,
    pub(super) cache: Arc<ResponseCache>,
    pub(super) gate: AdmissionGate,
    pub(super) queue: PriorityQueue,
    pub(super) executor: Executor,
    pub(super) metrics: Arc<Metrics>,
    /// In-flight requests; removed once the caller has its answer.
    pub(super) active: Mutex<HashMap<Uuid, Arc<RequestTicket>>>,
    /// Arrival counter used as the final FIFO tie-break.
    pub(super) sequence: AtomicU64,
    pub(super) running: AtomicBool,
    pub(super) shutdown: watch::Sender<bool>,
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Read-only snapshot returned by [`Manager::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub queue_depth: usize,
    pub queued_by_tier: BTreeMap<PriorityTier, usize>,
    pub active_requests: usize,
    pub executing: usize,
    pub cache_size: usize,
    pub cache_hit_rate: f64,
    /// Any pause (user activity or manual) is holding background work.
    pub pause_active: bool,
    pub manual_pause_active: bool,
    /// Milliseconds until user activity stops holding background work.
    pub user_pause_remaining_ms: Option<u64>,
    pub background_permits_free: usize,
    pub tracked_users: usize,
    pub running: bool,
    pub tiers: BTreeMap<PriorityTier, TierCounters>,
}

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub activity_purged: usize,
    pub cache_purged: usize,
    pub manual_pause_expired: bool,
}

impl Manager {
    pub fn new(config: ThrottleConfig) -> Arc<Self> {
        let activity = Arc::new(ActivityTracker::new(
            config.pause_window(),
            config.activity_timeout(),
        ));
        let cache = Arc::new(ResponseCache::from_config(&config));
        let metrics = Arc::new(Metrics::new());
        let executing = Arc::new(AtomicUsize::new(0));
        let gate = AdmissionGate::new(
            Arc::clone(&activity),
            Arc::clone(&executing),
            config.max_concurrent,
        );
        let executor = Executor::new(
            config.background_permits,
            Arc::clone(&cache),
            Arc::clone(&metrics),
            executing,
        );
        let (shutdown, _) = watch::channel(false);

        info!(
            max_concurrent = config.max_concurrent,
            background_permits = config.background_permits,
            "manager created"
        );

        Arc::new(Self {
            config,
            activity,
            cache,
            gate,
            queue: PriorityQueue::new(),
            executor,
            metrics,
            active: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub(super) fn active(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<RequestTicket>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Note that a user is present without submitting work on their behalf.
    pub fn record_activity(&self, submitter: &str) {
        self.activity.record_activity(submitter);
    }

    /// Hold back all throttleable work for `duration`. Protected tiers are unaffected.
    pub fn pause_background(&self, duration: Duration) {
        self.gate.pause_background(duration);
    }

    pub fn resume_background(&self) {
        self.gate.resume_background();
    }

    /// Current state of an in-flight request, if it is still tracked.
    pub fn request_state(&self, id: Uuid) -> Option<RequestState> {
        self.active().get(&id).map(|t| t.state())
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            queue_depth: self.queue.len(),
            queued_by_tier: self.queue.pending_by_tier(),
            active_requests: self.active().len(),
            executing: self.executor.executing(),
            cache_size: self.cache.len(),
            cache_hit_rate: self.cache.hit_rate(),
            pause_active: self.gate.is_paused(),
            manual_pause_active: self.gate.manual_pause_active(),
            user_pause_remaining_ms: self
                .activity
                .pause_remaining()
                .map(|d| d.as_millis() as u64),
            background_permits_free: self.executor.background_available(),
            tracked_users: self.activity.len(),
            running: self.is_running(),
            tiers: self.metrics.snapshot(),
        }
    }

    /// One pass of housekeeping. The cleanup loop calls this on a timer.
    pub fn run_cleanup(&self) -> CleanupReport {
        let report = CleanupReport {
            activity_purged: self.activity.cleanup(),
            cache_purged: self.cache.purge_expired(),
            manual_pause_expired: self.gate.expire_manual_pause(),
        };
        debug!(
            activity_purged = report.activity_purged,
            cache_purged = report.cache_purged,
            manual_pause_expired = report.manual_pause_expired,
            tracked_users = self.activity.len(),
            cache_size = self.cache.len(),
            "cleanup pass"
        );
        report
    }
}
