use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::error::ThrottleError;

use super::Manager;

impl Manager {
    /// Spawn the dispatch and cleanup loops. Call once during startup.
    pub fn start(self: &Arc<Self>) -> Result<(), ThrottleError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ThrottleError::AlreadyRunning);
        }
        self.shutdown.send_replace(false);

        let dispatch = tokio::spawn(Arc::clone(self).dispatch_loop(self.shutdown.subscribe()));
        let cleanup = tokio::spawn(Arc::clone(self).cleanup_loop(self.shutdown.subscribe()));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([dispatch, cleanup]);

        info!("manager started");
        Ok(())
    }

    /// Stop both loops and answer everything still queued with a fallback.
    ///
    /// Work already executing is left to finish and deliver normally.
    pub async fn stop(&self) -> Result<(), ThrottleError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(ThrottleError::NotRunning);
        }
        info!("manager stopping");
        self.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }

        self.reject_queued();

        info!("manager stopped");
        Ok(())
    }

    /// Answer everything still queued with a fallback.
    pub(super) fn reject_queued(&self) {
        let drained = self.queue.drain();
        if !drained.is_empty() {
            info!(count = drained.len(), "resolving queued requests while stopped");
        }
        for request in drained {
            request.reject(ThrottleError::NotRunning);
        }
    }

    pub(super) async fn cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cleanup();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
