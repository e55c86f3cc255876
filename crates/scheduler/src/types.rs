use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ThrottleError;

/// Request urgency. Lower numeric value = higher urgency.
///
/// The first two tiers are *protected*: they are never denied, deferred,
/// paused, or answered with a "could not run" placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PriorityTier {
    /// A live user waiting on a conversational reply.
    UserConversation = 1,
    /// Any other user-initiated interaction.
    UserInteraction = 2,
    /// Housekeeping: summarisation, index repair, etc.
    SystemMaintenance = 3,
    /// Bulk background jobs.
    BackgroundProcessing = 4,
    /// Periodic self-reflection cycles; lowest urgency.
    ConsciousnessCycle = 5,
}

impl PriorityTier {
    pub const ALL: [PriorityTier; 5] = [
        PriorityTier::UserConversation,
        PriorityTier::UserInteraction,
        PriorityTier::SystemMaintenance,
        PriorityTier::BackgroundProcessing,
        PriorityTier::ConsciousnessCycle,
    ];

    pub fn is_protected(self) -> bool {
        matches!(self, PriorityTier::UserConversation | PriorityTier::UserInteraction)
    }

    pub fn is_throttleable(self) -> bool {
        !self.is_protected()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PriorityTier::UserConversation => "user_conversation",
            PriorityTier::UserInteraction => "user_interaction",
            PriorityTier::SystemMaintenance => "system_maintenance",
            PriorityTier::BackgroundProcessing => "background_processing",
            PriorityTier::ConsciousnessCycle => "consciousness_cycle",
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single request.
///
/// ```text
/// Created ─┬─> Queued ─┬─> Admitted ──> Executing ─┬─> Completed
///          │           ├─> Deferred ─> Queued      └─> Failed
///          └─> Bypassed ───────────> Executing
/// any non-terminal ──> TimedOut
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Created,
    Queued,
    Bypassed,
    Admitted,
    Deferred,
    Executing,
    Completed,
    Failed,
    TimedOut,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::TimedOut
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        if self.is_terminal() {
            return false;
        }
        if next == TimedOut {
            return true;
        }
        matches!(
            (self, next),
            // cache hit answers before the request is ever queued
            (Created, Completed)
                | (Created, Queued)
                | (Created, Bypassed)
                | (Queued, Bypassed)
                | (Queued, Admitted)
                | (Queued, Deferred)
                | (Queued, Failed)
                | (Deferred, Queued)
                | (Deferred, Failed)
                | (Bypassed, Executing)
                | (Admitted, Executing)
                | (Admitted, Failed)
                | (Executing, Completed)
                | (Executing, Failed)
        )
    }
}

/// Why a throttleable request was not admitted on this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    /// A protected-tier request was seen within the pause window.
    UserActive,
    /// Operators paused background work by hand.
    ManualPause,
    /// The executing count reached the concurrency cap.
    AtCapacity,
}

impl DeferReason {
    /// Pause-type deferrals resolve to a fallback; capacity deferrals retry.
    pub fn is_pause(self) -> bool {
        matches!(self, DeferReason::UserActive | DeferReason::ManualPause)
    }
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeferReason::UserActive => "user activity within pause window",
            DeferReason::ManualPause => "background work paused",
            DeferReason::AtCapacity => "concurrency cap reached",
        };
        f.write_str(s)
    }
}

/// Admission Gate verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Protected tier: run now, skip queue and shared lock.
    Bypass,
    /// Throttleable tier with capacity and no pause.
    Admit,
    /// Throttleable tier that must wait or fall back.
    Defer(DeferReason),
}

/// Why a placeholder was produced instead of a real result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    Denied,
    Timeout,
    ExecutionError,
}

impl FallbackReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FallbackReason::Denied => "denied",
            FallbackReason::Timeout => "timeout",
            FallbackReason::ExecutionError => "execution_error",
        }
    }
}

/// Terminal result delivered to a `submit` caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The work item ran (or a fresh cache entry answered for it).
    Completed { value: Value, cached: bool },
    /// Degraded service: a placeholder stands in for the result.
    Fallback { value: Value, reason: FallbackReason },
    /// Protected-tier work item failed; the error is surfaced, not disguised.
    Failed { value: Value, error: String },
}

impl Outcome {
    pub fn value(&self) -> &Value {
        match self {
            Outcome::Completed { value, .. }
            | Outcome::Fallback { value, .. }
            | Outcome::Failed { value, .. } => value,
        }
    }
}

/// What `Manager::submit` returns. Always carries a usable value.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub request_id: uuid::Uuid,
    pub tier: PriorityTier,
    pub outcome: Outcome,
}

impl Response {
    pub fn value(&self) -> &Value {
        self.outcome.value()
    }

    pub fn into_value(self) -> Value {
        match self.outcome {
            Outcome::Completed { value, .. }
            | Outcome::Fallback { value, .. }
            | Outcome::Failed { value, .. } => value,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, Outcome::Completed { .. })
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.outcome, Outcome::Completed { cached: true, .. })
    }

    pub fn fallback_reason(&self) -> Option<FallbackReason> {
        match self.outcome {
            Outcome::Fallback { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// The real result, or why there is none. For callers that must tell
    /// degraded service apart from a genuine value.
    pub fn into_result(self) -> Result<Value, ThrottleError> {
        match self.outcome {
            Outcome::Completed { value, .. } => Ok(value),
            Outcome::Fallback { .. } => Err(ThrottleError::FallbackServed),
            Outcome::Failed { error, .. } => Err(ThrottleError::Execution(error)),
        }
    }
}
