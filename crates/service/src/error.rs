use std::time::Duration;

use thiserror::Error;

/// Outcomes of the service's background work that callers act on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("task is already running")]
    AlreadyRunning,

    #[error("task was never started")]
    NotStarted,

    #[error("task was cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("probe failed: {0}")]
    ProbeFailed(String),

    #[error("change {id} failed: {message}")]
    ChangeFailed { id: String, message: String },

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}
