//! Synthetic mixed workload for the simulator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use throttle_scheduler::{FallbackReason, Manager, Outcome, PriorityTier, Response, Submission};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cli::SimArgs;

const BACKGROUND_TIERS: [PriorityTier; 3] = [
    PriorityTier::SystemMaintenance,
    PriorityTier::BackgroundProcessing,
    PriorityTier::ConsciousnessCycle,
];

#[derive(Debug, Clone)]
pub struct Workload {
    pub users: usize,
    pub background: usize,
    pub latency: Duration,
    pub timeout: Duration,
    pub cache_keys: usize,
}

impl Workload {
    pub fn from_args(args: &SimArgs) -> Self {
        Self {
            users: args.users,
            background: args.background,
            latency: Duration::from_millis(args.work_ms),
            timeout: Duration::from_millis(args.timeout_ms),
            cache_keys: args.cache_keys,
        }
    }

    fn background_job(&self, i: usize) -> Submission {
        let tier = BACKGROUND_TIERS[i % BACKGROUND_TIERS.len()];
        let submission = simulated(tier, i, self.latency).timeout(self.timeout);
        if self.cache_keys == 0 {
            submission
        } else {
            submission.cache_key(format!("job-{}", i % self.cache_keys))
        }
    }

    fn user_request(&self, i: usize) -> Submission {
        let tier = if i % 2 == 0 {
            PriorityTier::UserConversation
        } else {
            PriorityTier::UserInteraction
        };
        simulated(tier, i, self.latency)
            .submitter(format!("user-{i}"))
            .timeout(self.timeout)
    }
}

/// Stand-in for an inference call: sleeps, then echoes its identity.
fn simulated(tier: PriorityTier, i: usize, latency: Duration) -> Submission {
    Submission::new(tier, move || async move {
        tokio::time::sleep(latency).await;
        Ok(json!({ "tier": tier.as_str(), "job": i }))
    })
}

/// What callers of one tier got back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierSummary {
    pub completed: usize,
    pub cached: usize,
    pub deferred: usize,
    pub timed_out: usize,
    pub failed: usize,
}

pub type Summary = BTreeMap<PriorityTier, TierSummary>;

fn tally(summary: &mut Summary, resp: &Response) {
    let entry = summary.entry(resp.tier).or_default();
    match &resp.outcome {
        Outcome::Completed { cached: true, .. } => entry.cached += 1,
        Outcome::Completed { .. } => entry.completed += 1,
        Outcome::Fallback { reason: FallbackReason::Timeout, .. } => entry.timed_out += 1,
        Outcome::Fallback { .. } => entry.deferred += 1,
        Outcome::Failed { .. } => entry.failed += 1,
    }
}

/// Submit background jobs, let them get going, then send user traffic.
pub async fn run(manager: &Arc<Manager>, workload: &Workload) -> Summary {
    let mut set = JoinSet::new();

    for i in 0..workload.background {
        let m = Arc::clone(manager);
        let submission = workload.background_job(i);
        set.spawn(async move { m.submit(submission).await });
    }
    info!(count = workload.background, "background jobs submitted");

    tokio::time::sleep(workload.latency).await;

    for i in 0..workload.users {
        let m = Arc::clone(manager);
        let submission = workload.user_request(i);
        set.spawn(async move { m.submit(submission).await });
    }
    info!(count = workload.users, "user requests submitted");

    let mut summary = Summary::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(resp) => {
                debug!(request_id = %resp.request_id, tier = %resp.tier, "response received");
                tally(&mut summary, &resp);
            }
            Err(e) => warn!(error = %e, "submit task failed"),
        }
    }
    summary
}
