//! Executor error taxonomy and classification
//!
//! The executor catches every error at the stage boundary and classifies it
//! into one of three dispositions: fail (terminal), pause (checkpoint and
//! wait for capacity), or retry (transient). Structured variants classify
//! directly; free-text errors from the transport classify by substring.

use thiserror::Error;

use apexstore::{PauseReason, StoreError};

use crate::capacity::SessionLimitStatus;
use crate::transport::TransportError;

/// Errors surfaced by workflow execution
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Task {task_id} exceeded budget: {detail}")]
    BudgetExceeded { task_id: String, detail: String },

    #[error("Task {0} was cancelled")]
    Cancelled(String),

    #[error("Session limit reached: {}", status.message)]
    SessionLimitReached { status: SessionLimitStatus },

    #[error("Usage limit reached")]
    UsageLimit { resume_after: Option<i64> },

    #[error("Rate limited")]
    RateLimit { resume_after: Option<i64> },

    #[error("Capacity exhausted")]
    Capacity,

    #[error("{0}")]
    Transient(String),

    #[error(transparent)]
    Store(StoreError),
}

/// What the executor does with a classified error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Terminal: task -> failed, never retried
    Fail,
    /// Checkpoint and pause with this reason
    Pause(PauseReason),
    /// Transient: retry with backoff while attempts remain
    Retry,
}

/// Substrings that mark an error as never retryable, matched
/// case-insensitively against the error message.
const NON_RETRYABLE: [&str; 5] = [
    "not found",
    "exceeded budget",
    "was cancelled",
    "invalid input",
    "workflow not found",
];

/// Classify a free-text error message
pub fn classify_error_message(message: &str) -> ErrorDisposition {
    let m = message.to_lowercase();

    if NON_RETRYABLE.iter().any(|s| m.contains(s)) {
        return ErrorDisposition::Fail;
    }
    if m.contains("usage limit") || m.contains("exhausted your monthly") {
        return ErrorDisposition::Pause(PauseReason::UsageLimit);
    }
    if m.contains("rate limit") || m.contains("rate limited") {
        return ErrorDisposition::Pause(PauseReason::RateLimit);
    }
    ErrorDisposition::Retry
}

impl ExecError {
    /// Classify this error for the retry/pause/fail decision
    pub fn disposition(&self) -> ErrorDisposition {
        match self {
            ExecError::TaskNotFound(_)
            | ExecError::WorkflowNotFound(_)
            | ExecError::AgentNotFound(_)
            | ExecError::CheckpointNotFound(_)
            | ExecError::InvalidInput(_)
            | ExecError::BudgetExceeded { .. }
            | ExecError::Cancelled(_)
            | ExecError::Store(_) => ErrorDisposition::Fail,
            ExecError::SessionLimitReached { .. } => ErrorDisposition::Pause(PauseReason::SessionLimit),
            ExecError::UsageLimit { .. } => ErrorDisposition::Pause(PauseReason::UsageLimit),
            ExecError::RateLimit { .. } => ErrorDisposition::Pause(PauseReason::RateLimit),
            ExecError::Capacity => ErrorDisposition::Pause(PauseReason::Capacity),
            ExecError::Transient(message) => classify_error_message(message),
        }
    }

    /// Earliest wall time a paused task may be re-admitted, when known
    pub fn resume_after_hint(&self) -> Option<i64> {
        match self {
            ExecError::UsageLimit { resume_after } | ExecError::RateLimit { resume_after } => *resume_after,
            _ => None,
        }
    }
}

impl From<TransportError> for ExecError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::RateLimited { retry_after } => ExecError::RateLimit {
                resume_after: Some(apexstore::now_ms() + retry_after.as_millis() as i64),
            },
            TransportError::UsageLimit { resume_after } => ExecError::UsageLimit { resume_after },
            other => ExecError::Transient(other.to_string()),
        }
    }
}

impl From<StoreError> for ExecError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TaskNotFound(id) => ExecError::TaskNotFound(id),
            StoreError::CheckpointNotFound(id) => ExecError::CheckpointNotFound(id),
            other => ExecError::Store(other),
        }
    }
}
