//! Scheduler error taxonomy.

use std::time::Duration;

use thiserror::Error;

use crate::types::{DeferReason, FallbackReason};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThrottleError {
    #[error("admission denied: {0}")]
    AdmissionDenied(DeferReason),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("work item failed: {0}")]
    Execution(String),

    #[error("fallback served")]
    FallbackServed,

    #[error("manager is not running")]
    NotRunning,

    #[error("manager is already running")]
    AlreadyRunning,
}

impl ThrottleError {
    /// Placeholder category for errors that end a request.
    pub fn fallback_reason(&self) -> FallbackReason {
        match self {
            ThrottleError::Timeout(_) => FallbackReason::Timeout,
            ThrottleError::Execution(_) => FallbackReason::ExecutionError,
            _ => FallbackReason::Denied,
        }
    }
}
