use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::fallback;
use crate::request::{Request, RequestTicket, Submission};
use crate::types::{Admission, FallbackReason, Outcome, PriorityTier, RequestState, Response};

use super::Manager;

impl Manager {
    /// Run `submission` against the shared backend, or explain why not.
    ///
    /// Always returns a usable value. Protected tiers start immediately;
    /// throttleable tiers wait in the priority queue and may come back as
    /// a deferred placeholder. When the timeout budget runs out the caller
    /// gets the timeout fallback and any later result is thrown away.
    pub async fn submit(&self, submission: Submission) -> Response {
        let Submission {
            tier,
            work,
            submitter,
            cache_key,
            timeout,
        } = submission;
        let budget = timeout.unwrap_or_else(|| self.config.default_timeout());
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let ticket = Arc::new(RequestTicket::new(tier, submitter, cache_key, budget, seq));
        self.metrics.record_submitted(tier);

        if tier.is_protected() {
            if let Some(user) = &ticket.submitter {
                self.activity.record_activity(user);
            }
        }

        if let Some(key) = &ticket.cache_key {
            if let Some(value) = self.cache.get(key, tier) {
                ticket.transition(RequestState::Completed);
                debug!(request_id = %ticket.id, tier = %tier, key = %key, "served from cache");
                return self.finish(&ticket, Outcome::Completed { value, cached: true });
            }
        }

        let (tx, rx) = oneshot::channel();
        let request = Request::new(Arc::clone(&ticket), work, tx);
        let _tracked = ActiveEntry::track(self, &ticket);

        match self.gate.decide(tier) {
            Admission::Bypass => {
                ticket.transition(RequestState::Bypassed);
                self.metrics.record_bypassed(tier);
                let slot = self.executor.slot();
                self.executor.spawn(request, slot, None);
            }
            _ => {
                ticket.transition(RequestState::Queued);
                self.queue.push(request);
                // Checked after the push so a concurrent `stop` cannot strand it.
                if !self.is_running() {
                    warn!(request_id = %ticket.id, tier = %tier, "submit while manager stopped");
                    self.reject_queued();
                }
            }
        }

        let outcome = self.await_outcome(&ticket, rx).await;
        self.finish(&ticket, outcome)
    }

    async fn await_outcome(
        &self,
        ticket: &RequestTicket,
        mut rx: oneshot::Receiver<Outcome>,
    ) -> Outcome {
        match tokio::time::timeout_at(ticket.deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => dropped_outcome(ticket.tier),
            Err(_) => {
                ticket.abandon();
                if ticket.transition(RequestState::TimedOut) {
                    let budget = ticket.deadline.saturating_duration_since(ticket.submitted);
                    info!(
                        request_id = %ticket.id,
                        tier = %ticket.tier,
                        budget_ms = budget.as_millis() as u64,
                        "request timed out"
                    );
                    return Outcome::Fallback {
                        value: fallback::generate(ticket.tier, FallbackReason::Timeout),
                        reason: FallbackReason::Timeout,
                    };
                }
                // Lost the race to a terminal transition; its sender is about
                // to deliver (or drop).
                rx.await.unwrap_or_else(|_| dropped_outcome(ticket.tier))
            }
        }
    }

    fn finish(&self, ticket: &RequestTicket, outcome: Outcome) -> Response {
        self.metrics.record_outcome(ticket.tier, &outcome);
        Response {
            request_id: ticket.id,
            tier: ticket.tier,
            outcome,
        }
    }
}

/// Keeps a ticket in the active set for as long as its caller is waiting.
/// Also covers a caller that drops the `submit` future early.
struct ActiveEntry<'a> {
    manager: &'a Manager,
    ticket: Arc<RequestTicket>,
}

impl<'a> ActiveEntry<'a> {
    fn track(manager: &'a Manager, ticket: &Arc<RequestTicket>) -> Self {
        manager.active().insert(ticket.id, Arc::clone(ticket));
        Self {
            manager,
            ticket: Arc::clone(ticket),
        }
    }
}

impl Drop for ActiveEntry<'_> {
    fn drop(&mut self) {
        if !self.ticket.state().is_terminal() {
            self.ticket.abandon();
        }
        self.manager.active().remove(&self.ticket.id);
    }
}

/// The request ended without anyone delivering a result.
fn dropped_outcome(tier: PriorityTier) -> Outcome {
    if tier.is_protected() {
        let error = "request dropped before completion".to_string();
        warn!(tier = %tier, "{error}");
        Outcome::Failed {
            value: json!({ "status": "error", "message": error }),
            error,
        }
    } else {
        Outcome::Fallback {
            value: fallback::generate(tier, FallbackReason::Denied),
            reason: FallbackReason::Denied,
        }
    }
}
