//! Deterministic placeholders for requests that cannot be serviced.

use serde_json::{json, Value};
use tracing::error;

use crate::types::{FallbackReason, PriorityTier};

/// Status marker carried by every throttleable placeholder.
pub const DEFERRED_STATUS: &str = "deferred";

/// Neutral stand-in for a protected caller. Must never read as throttling.
const PROTECTED_STAND_IN: &str =
    "Your request has been received and is still being worked on. Check back in a moment.";

fn note_for(reason: FallbackReason) -> &'static str {
    match reason {
        FallbackReason::Denied => {
            "Background work is paused while users are active; this task was deferred."
        }
        FallbackReason::Timeout => {
            "The shared backend did not finish this task within its time budget."
        }
        FallbackReason::ExecutionError => "The task failed and will be retried by its owner.",
    }
}

/// Produce the placeholder for `tier` failing with `reason`.
///
/// Throttleable tiers get a structured `"deferred"` marker that callers can
/// tell apart from a real result. Protected tiers should never land here;
/// when they do it is logged as critical and a neutral answer is returned.
pub fn generate(tier: PriorityTier, reason: FallbackReason) -> Value {
    if tier.is_protected() {
        error!(
            critical = true,
            tier = %tier,
            reason = reason.as_str(),
            "fallback requested for protected tier"
        );
        return json!({
            "status": "ok",
            "message": PROTECTED_STAND_IN,
        });
    }

    json!({
        "status": DEFERRED_STATUS,
        "tier": tier.as_str(),
        "reason": reason.as_str(),
        "note": note_for(reason),
    })
}

/// Whether `value` is a throttleable placeholder rather than a real result.
pub fn is_deferred(value: &Value) -> bool {
    value.get("status").and_then(Value::as_str) == Some(DEFERRED_STATUS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttleable_placeholder_is_marked() {
        let v = generate(PriorityTier::BackgroundProcessing, FallbackReason::Denied);
        assert!(is_deferred(&v));
        assert_eq!(v["tier"], "background_processing");
        assert_eq!(v["reason"], "denied");
        assert!(v["note"].as_str().unwrap().contains("deferred"));
    }

    #[test]
    fn placeholder_is_deterministic() {
        let a = generate(PriorityTier::ConsciousnessCycle, FallbackReason::Timeout);
        let b = generate(PriorityTier::ConsciousnessCycle, FallbackReason::Timeout);
        assert_eq!(a, b);
    }

    #[test]
    fn protected_stand_in_has_no_throttle_language() {
        for tier in [PriorityTier::UserConversation, PriorityTier::UserInteraction] {
            for reason in [
                FallbackReason::Denied,
                FallbackReason::Timeout,
                FallbackReason::ExecutionError,
            ] {
                let v = generate(tier, reason);
                assert!(!is_deferred(&v));
                let text = v.to_string().to_lowercase();
                for word in ["throttl", "defer", "paused", "sorry", "busy"] {
                    assert!(!text.contains(word), "{word} leaked into {text}");
                }
            }
        }
    }

    #[test]
    fn real_results_are_not_deferred() {
        assert!(!is_deferred(&json!({"text": "hello"})));
        assert!(!is_deferred(&json!("deferred")));
        assert!(!is_deferred(&Value::Null));
    }
}
