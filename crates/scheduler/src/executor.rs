//! Runs admitted work items.
//!
//! Protected requests run straight away on their own task. Throttleable
//! requests must hold a permit of the shared background semaphore, which
//! bounds how much background work touches the backend at once.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde_json::json;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::error::ThrottleError;
use crate::fallback;
use crate::metrics::Metrics;
use crate::request::Request;
use crate::types::{FallbackReason, Outcome, RequestState};

/// RAII guard for one unit of the executing count.
///
/// Dropping it decrements the count and wakes the dispatch loop if it is
/// waiting for capacity.
pub struct ExecutionSlot {
    executing: Arc<AtomicUsize>,
    released: Arc<Notify>,
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        self.executing.fetch_sub(1, Ordering::AcqRel);
        self.released.notify_one();
    }
}

pub struct Executor {
    background_lock: Arc<Semaphore>,
    cache: Arc<ResponseCache>,
    metrics: Arc<Metrics>,
    executing: Arc<AtomicUsize>,
    released: Arc<Notify>,
}

impl Executor {
    pub fn new(
        background_permits: usize,
        cache: Arc<ResponseCache>,
        metrics: Arc<Metrics>,
        executing: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            background_lock: Arc::new(Semaphore::new(background_permits)),
            cache,
            metrics,
            executing,
            released: Arc::new(Notify::new()),
        }
    }

    /// Claim an executing slot. Counted until the guard drops.
    pub fn slot(&self) -> ExecutionSlot {
        self.executing.fetch_add(1, Ordering::AcqRel);
        ExecutionSlot {
            executing: Arc::clone(&self.executing),
            released: Arc::clone(&self.released),
        }
    }

    /// Wait for the shared critical section used by throttleable work.
    pub async fn acquire_background(&self) -> Result<OwnedSemaphorePermit, ThrottleError> {
        Arc::clone(&self.background_lock)
            .acquire_owned()
            .await
            .map_err(|_| ThrottleError::NotRunning)
    }

    /// Resolves when an executing slot is released.
    pub async fn capacity_released(&self) {
        self.released.notified().await
    }

    pub fn executing(&self) -> usize {
        self.executing.load(Ordering::Acquire)
    }

    /// Free background permits right now.
    pub fn background_available(&self) -> usize {
        self.background_lock.available_permits()
    }

    /// Run `request` on its own task. `permit` is `None` for protected tiers.
    pub fn spawn(
        &self,
        request: Request,
        slot: ExecutionSlot,
        permit: Option<OwnedSemaphorePermit>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(run(request, slot, permit, cache, metrics))
    }
}

async fn run(
    request: Request,
    slot: ExecutionSlot,
    permit: Option<OwnedSemaphorePermit>,
    cache: Arc<ResponseCache>,
    metrics: Arc<Metrics>,
) {
    let Request {
        ticket,
        work,
        reply,
    } = request;
    let tier = ticket.tier;

    if ticket.is_abandoned() {
        debug!(request_id = %ticket.id, "caller gone before execution; skipping work");
        return;
    }
    if !ticket.transition(RequestState::Executing) {
        return;
    }

    let started = Instant::now();
    let result = AssertUnwindSafe(async move { work().await })
        .catch_unwind()
        .await;
    let elapsed = started.elapsed();
    metrics.record_execution(tier, elapsed);
    drop(permit);

    let result = match result {
        Ok(inner) => inner.map_err(|e| format!("{e:#}")),
        Err(payload) => Err(panic_message(payload)),
    };

    let outcome = match result {
        Ok(value) => {
            if !ticket.transition(RequestState::Completed) {
                debug!(
                    request_id = %ticket.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "discarding late result"
                );
                return;
            }
            if let Some(key) = &ticket.cache_key {
                cache.set(key.as_str(), value.clone());
            }
            Outcome::Completed {
                value,
                cached: false,
            }
        }
        Err(error) => {
            warn!(request_id = %ticket.id, tier = %tier, error = %error, "work item failed");
            if !ticket.transition(RequestState::Failed) {
                return;
            }
            if tier.is_protected() {
                Outcome::Failed {
                    value: json!({ "status": "error", "message": error }),
                    error,
                }
            } else {
                Outcome::Fallback {
                    value: fallback::generate(tier, FallbackReason::ExecutionError),
                    reason: FallbackReason::ExecutionError,
                }
            }
        }
    };

    drop(slot);
    if reply.send(outcome).is_err() {
        debug!(request_id = %ticket.id, "caller dropped before result delivery");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("work item panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("work item panicked: {s}")
    } else {
        "work item panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;
    use tokio::sync::oneshot;

    use super::*;
    use crate::request::{RequestTicket, WorkItem};
    use crate::types::PriorityTier;

    struct Harness {
        executor: Executor,
        cache: Arc<ResponseCache>,
        metrics: Arc<Metrics>,
    }

    fn harness() -> Harness {
        let cache = Arc::new(ResponseCache::new(
            16,
            Duration::from_secs(30),
            Duration::from_secs(300),
        ));
        let metrics = Arc::new(Metrics::new());
        let executor = Executor::new(
            1,
            cache.clone(),
            metrics.clone(),
            Arc::new(AtomicUsize::new(0)),
        );
        Harness {
            executor,
            cache,
            metrics,
        }
    }

    fn work(value: Value) -> WorkItem {
        Box::new(move || async move { Ok::<_, anyhow::Error>(value) }.boxed())
    }

    fn request(
        tier: PriorityTier,
        cache_key: Option<&str>,
        work: WorkItem,
    ) -> (Request, Arc<RequestTicket>, oneshot::Receiver<Outcome>) {
        let ticket = Arc::new(RequestTicket::new(
            tier,
            None,
            cache_key.map(str::to_string),
            Duration::from_secs(5),
            0,
        ));
        let initial = if tier.is_protected() {
            RequestState::Bypassed
        } else {
            RequestState::Admitted
        };
        if tier.is_throttleable() {
            assert!(ticket.transition(RequestState::Queued));
        }
        assert!(ticket.transition(initial));
        let (tx, rx) = oneshot::channel();
        (Request::new(ticket.clone(), work, tx), ticket, rx)
    }

    #[tokio::test]
    async fn protected_runs_without_permit() {
        let h = harness();
        let _held = h.executor.acquire_background().await.unwrap();

        let (req, ticket, rx) = request(PriorityTier::UserConversation, None, work(json!("hi")));
        let slot = h.executor.slot();
        h.executor.spawn(req, slot, None).await.unwrap();

        let outcome = rx.await.unwrap();
        assert_eq!(outcome, Outcome::Completed { value: json!("hi"), cached: false });
        assert_eq!(ticket.state(), RequestState::Completed);
        assert_eq!(h.executor.executing(), 0);
    }

    #[tokio::test]
    async fn success_with_key_is_cached() {
        let h = harness();
        let (req, _, rx) = request(PriorityTier::SystemMaintenance, Some("k"), work(json!(7)));
        let permit = h.executor.acquire_background().await.unwrap();
        let slot = h.executor.slot();
        h.executor.spawn(req, slot, Some(permit)).await.unwrap();

        assert_eq!(rx.await.unwrap().value(), &json!(7));
        assert_eq!(h.cache.get("k", PriorityTier::UserConversation), Some(json!(7)));
        assert_eq!(h.executor.background_available(), 1);
        assert_eq!(h.metrics.tier(PriorityTier::SystemMaintenance).executions, 1);
    }

    #[tokio::test]
    async fn throttleable_error_becomes_fallback() {
        let h = harness();
        let failing: WorkItem =
            Box::new(|| async { Err::<Value, _>(anyhow::anyhow!("backend down")) }.boxed());
        let (req, ticket, rx) = request(PriorityTier::BackgroundProcessing, Some("k"), failing);
        let slot = h.executor.slot();
        h.executor.spawn(req, slot, None).await.unwrap();

        let outcome = rx.await.unwrap();
        assert!(fallback::is_deferred(outcome.value()));
        assert_eq!(ticket.state(), RequestState::Failed);
        assert!(h.cache.is_empty(), "errors are never cached");
    }

    #[tokio::test]
    async fn protected_error_is_surfaced() {
        let h = harness();
        let failing: WorkItem =
            Box::new(|| async { Err::<Value, _>(anyhow::anyhow!("model crashed")) }.boxed());
        let (req, _, rx) = request(PriorityTier::UserInteraction, None, failing);
        let slot = h.executor.slot();
        h.executor.spawn(req, slot, None).await.unwrap();

        match rx.await.unwrap() {
            Outcome::Failed { value, error } => {
                assert!(error.contains("model crashed"));
                assert_eq!(value["status"], "error");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let h = harness();
        fn explode() -> anyhow::Result<Value> {
            panic!("kaboom")
        }
        let exploding: WorkItem = Box::new(|| async { explode() }.boxed());
        let (req, _, rx) = request(PriorityTier::UserConversation, None, exploding);
        let slot = h.executor.slot();
        h.executor.spawn(req, slot, None).await.unwrap();

        match rx.await.unwrap() {
            Outcome::Failed { error, .. } => assert!(error.contains("kaboom")),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(h.executor.executing(), 0);
    }

    #[tokio::test]
    async fn late_result_is_discarded() {
        let h = harness();
        let (req, ticket, rx) = request(PriorityTier::SystemMaintenance, Some("late"), work(json!(1)));
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let req = Request::new(
            req.ticket.clone(),
            Box::new(move || {
                async move {
                    let _ = gate_rx.await;
                    Ok::<_, anyhow::Error>(json!(1))
                }
                .boxed()
            }),
            req.reply,
        );
        let slot = h.executor.slot();
        let handle = h.executor.spawn(req, slot, None);
        tokio::task::yield_now().await;

        // caller gives up while the work is running
        ticket.abandon();
        assert!(ticket.transition(RequestState::TimedOut));
        let _ = gate_tx.send(());
        handle.await.unwrap();

        assert!(rx.await.is_err(), "nothing delivered after timeout");
        assert_eq!(ticket.state(), RequestState::TimedOut);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn abandoned_before_start_skips_work() {
        let h = harness();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let item: WorkItem = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(Value::Null) }.boxed()
        });
        let (req, ticket, _rx) = request(PriorityTier::ConsciousnessCycle, None, item);
        ticket.abandon();
        let slot = h.executor.slot();
        h.executor.spawn(req, slot, None).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
