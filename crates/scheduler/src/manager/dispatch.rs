use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::ThrottleError;
use crate::request::Request;
use crate::types::{Admission, DeferReason, RequestState};

use super::Manager;

impl Manager {
    /// Drain the priority queue until shutdown.
    ///
    /// Acts as a supervisor: an error or panic while handling one request
    /// is logged and the loop carries on after a short pause.
    pub(super) async fn dispatch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("dispatch loop started");
        while !*shutdown.borrow() {
            let step = AssertUnwindSafe(self.dispatch_one(&mut shutdown))
                .catch_unwind()
                .await;
            let failure = match step {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "dispatch step panicked".to_string(),
            };
            error!(error = %failure, "dispatch error; pausing before next request");
            tokio::select! {
                _ = tokio::time::sleep(self.config.dispatch_error_pause()) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("dispatch loop stopped");
    }

    /// Handle the head of the queue, or wait for work if it is empty.
    async fn dispatch_one(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), ThrottleError> {
        let Some(request) = self.queue.pop() else {
            tokio::select! {
                _ = self.queue.notified() => {}
                _ = shutdown.changed() => {}
            }
            return Ok(());
        };
        let ticket = Arc::clone(&request.ticket);
        let tier = ticket.tier;

        if ticket.is_abandoned() || ticket.state().is_terminal() {
            debug!(request_id = %ticket.id, "dropping abandoned request");
            return Ok(());
        }
        let now = Instant::now();
        if ticket.is_expired(now) {
            let waited = now.saturating_duration_since(ticket.submitted);
            request.reject(ThrottleError::Timeout(waited));
            return Ok(());
        }

        match self.gate.decide(tier) {
            Admission::Bypass => {
                ticket.transition(RequestState::Bypassed);
                self.metrics.record_bypassed(tier);
                let slot = self.executor.slot();
                self.executor.spawn(request, slot, None);
                Ok(())
            }
            Admission::Admit => self.admit(request, shutdown).await,
            Admission::Defer(reason) if reason.is_pause() => {
                self.deny(request, reason);
                Ok(())
            }
            Admission::Defer(reason) => {
                ticket.transition(RequestState::Deferred);
                let attempts = ticket.record_deferral();
                self.metrics.record_deferred(tier);
                debug!(
                    request_id = %ticket.id,
                    tier = %tier,
                    attempts,
                    reason = %reason,
                    "deferred; waiting for capacity"
                );
                ticket.transition(RequestState::Queued);
                self.queue.push(request);
                tokio::select! {
                    _ = self.executor.capacity_released() => {}
                    _ = tokio::time::sleep(self.config.defer_backoff()) => {}
                    _ = shutdown.changed() => {}
                }
                Ok(())
            }
        }
    }

    /// Take an executing slot and the background permit, then hand off.
    async fn admit(
        &self,
        request: Request,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ThrottleError> {
        let ticket = Arc::clone(&request.ticket);
        let slot = self.executor.slot();
        ticket.transition(RequestState::Admitted);
        self.metrics.record_admitted(ticket.tier);

        let permit = tokio::select! {
            permit = self.executor.acquire_background() => permit,
            _ = tokio::time::sleep_until(ticket.deadline) => {
                let waited = ticket.deadline.saturating_duration_since(ticket.submitted);
                request.reject(ThrottleError::Timeout(waited));
                return Ok(());
            }
            _ = shutdown.changed() => {
                request.reject(ThrottleError::NotRunning);
                return Ok(());
            }
        };
        let permit = match permit {
            Ok(permit) => permit,
            Err(e) => {
                request.reject(e.clone());
                return Err(e);
            }
        };

        // A user may have shown up while we waited for the permit.
        if let Some(reason) = self.gate.pause_reason() {
            drop(permit);
            self.deny(request, reason);
            return Ok(());
        }

        self.executor.spawn(request, slot, Some(permit));
        Ok(())
    }

    /// Resolve a paused request with the deferred placeholder.
    fn deny(&self, request: Request, reason: DeferReason) {
        let ticket = &request.ticket;
        if ticket.state() == RequestState::Queued {
            ticket.transition(RequestState::Deferred);
        }
        self.metrics.record_denied(ticket.tier);
        debug!(request_id = %ticket.id, tier = %ticket.tier, reason = %reason, "denied during pause");
        request.reject(ThrottleError::AdmissionDenied(reason));
    }
}
