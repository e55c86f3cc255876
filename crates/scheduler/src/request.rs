//! Requests, their builder, and the shared per-request ticket.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ThrottleError;
use crate::fallback;
use crate::types::{Outcome, PriorityTier, RequestState};

/// Future produced by a work item.
pub type WorkFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Zero-argument deferred computation against the shared backend.
pub type WorkItem = Box<dyn FnOnce() -> WorkFuture + Send + 'static>;

/// Roughly 30 years; stands in for "no deadline" when a duration overflows.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + budget`, clamped to a far-future instant instead of overflowing.
pub(crate) fn deadline_after(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

// ── Submission ──────────────────────────────────────────────────────

/// Caller-side description of a unit of work.
///
/// # Example
/// ```ignore
/// let resp = manager
///     .submit(
///         Submission::new(PriorityTier::UserConversation, || async {
///             Ok(serde_json::json!({"text": "hello"}))
///         })
///         .submitter("user-42")
///         .cache_key("greeting")
///         .timeout(Duration::from_secs(5)),
///     )
///     .await;
/// ```
pub struct Submission {
    pub(crate) tier: PriorityTier,
    pub(crate) work: WorkItem,
    pub(crate) submitter: Option<String>,
    pub(crate) cache_key: Option<String>,
    pub(crate) timeout: Option<Duration>,
}

impl Submission {
    pub fn new<F, Fut>(tier: PriorityTier, work: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            tier,
            work: Box::new(move || work().boxed()),
            submitter: None,
            cache_key: None,
            timeout: None,
        }
    }

    /// Identity of the end user (protected tiers) or job runner.
    pub fn submitter(mut self, id: impl Into<String>) -> Self {
        self.submitter = Some(id.into());
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Timeout budget for this request (default comes from config).
    pub fn timeout(mut self, budget: Duration) -> Self {
        self.timeout = Some(budget);
        self
    }

    pub fn tier(&self) -> PriorityTier {
        self.tier
    }
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("tier", &self.tier)
            .field("submitter", &self.submitter)
            .field("cache_key", &self.cache_key)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

// ── RequestTicket ───────────────────────────────────────────────────

/// Shared view of an in-flight request.
///
/// Owned by the manager's active set; the queue and executor hold clones
/// while the request moves through them.
#[derive(Debug)]
pub struct RequestTicket {
    pub id: Uuid,
    pub tier: PriorityTier,
    pub submitter: Option<String>,
    pub cache_key: Option<String>,
    /// Wall-clock creation time, for reporting.
    pub created_at: DateTime<Utc>,
    /// Monotonic submission time; first FIFO tie-break inside a tier.
    pub submitted: Instant,
    /// Arrival order; second FIFO tie-break.
    pub seq: u64,
    pub deadline: Instant,
    state: Mutex<RequestState>,
    abandoned: AtomicBool,
    defer_count: AtomicU32,
}

impl RequestTicket {
    pub fn new(
        tier: PriorityTier,
        submitter: Option<String>,
        cache_key: Option<String>,
        budget: Duration,
        seq: u64,
    ) -> Self {
        let submitted = Instant::now();
        Self {
            id: Uuid::new_v4(),
            tier,
            submitter,
            cache_key,
            created_at: Utc::now(),
            submitted,
            seq,
            deadline: deadline_after(submitted, budget),
            state: Mutex::new(RequestState::Created),
            abandoned: AtomicBool::new(false),
            defer_count: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> RequestState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if legal. Returns `false` (and leaves state alone) otherwise.
    pub fn transition(&self, next: RequestState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.can_transition_to(next) {
            debug!(
                request_id = %self.id,
                from = ?*state,
                to = ?next,
                "ignoring state transition"
            );
            return false;
        }
        *state = next;
        true
    }

    /// Mark that the caller stopped waiting; any later result is discarded.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Bump the retry counter; returns the new count.
    pub fn record_deferral(&self) -> u32 {
        self.defer_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn defer_count(&self) -> u32 {
        self.defer_count.load(Ordering::Relaxed)
    }

    /// Ordering key: tier, then submission time, then arrival order.
    pub(crate) fn order_key(&self) -> (PriorityTier, Instant, u64) {
        (self.tier, self.submitted, self.seq)
    }
}

// ── Request ─────────────────────────────────────────────────────────

/// A queued request: ticket plus the work item and its result channel.
pub struct Request {
    pub ticket: std::sync::Arc<RequestTicket>,
    pub(crate) work: WorkItem,
    pub(crate) reply: oneshot::Sender<Outcome>,
}

impl Request {
    pub(crate) fn new(
        ticket: std::sync::Arc<RequestTicket>,
        work: WorkItem,
        reply: oneshot::Sender<Outcome>,
    ) -> Self {
        Self { ticket, work, reply }
    }

    pub fn id(&self) -> Uuid {
        self.ticket.id
    }

    pub fn tier(&self) -> PriorityTier {
        self.ticket.tier
    }

    /// Resolve without running the work item.
    ///
    /// Throttleable tiers receive the deferred placeholder. Protected tiers
    /// never take this path in normal operation; if they do, the fallback
    /// generator logs it as critical and answers with a neutral stand-in.
    pub(crate) fn reject(self, err: ThrottleError) {
        let reason = err.fallback_reason();
        let terminal = match err {
            ThrottleError::Timeout(_) => RequestState::TimedOut,
            _ => RequestState::Failed,
        };
        if !self.ticket.transition(terminal) {
            return;
        }
        debug!(
            request_id = %self.ticket.id,
            tier = %self.ticket.tier,
            error = %err,
            "request resolved with fallback"
        );
        let outcome = Outcome::Fallback {
            value: fallback::generate(self.ticket.tier, reason),
            reason,
        };
        if self.reply.send(outcome).is_err() {
            warn!(request_id = %self.ticket.id, "caller gone before fallback delivery");
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}
