//! Admission control and priority scheduling for a shared inference backend.
//!
//! User-facing (protected) requests always run immediately. Background
//! (throttleable) requests wait in a priority queue and are deferred,
//! paused, or answered with a placeholder while users are active or the
//! backend is saturated. [`Manager`] is the entry point.

pub mod activity;
pub mod cache;
pub mod error;
pub mod executor;
pub mod fallback;
pub mod gate;
pub mod manager;
pub mod metrics;
pub mod queue;
pub mod request;
pub mod types;

pub use error::ThrottleError;
pub use manager::{CleanupReport, Manager, ManagerStats};
pub use metrics::TierCounters;
pub use request::{Submission, WorkFuture, WorkItem};
pub use types::{FallbackReason, Outcome, PriorityTier, RequestState, Response};
