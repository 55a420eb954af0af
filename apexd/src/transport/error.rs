//! Agent transport error types

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the agent transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Usage limit reached{}", format_resume(.resume_after))]
    UsageLimit { resume_after: Option<i64> },

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

fn format_resume(resume_after: &Option<i64>) -> String {
    match resume_after {
        Some(at) => format!(", resume after {}", at),
        None => String::new(),
    }
}

impl TransportError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, TransportError::RateLimited { .. })
    }

    /// Whether a fresh attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::RateLimited { .. } => true,
            TransportError::UsageLimit { .. } => false,
            TransportError::ApiError { status, .. } => *status >= 500,
            TransportError::Network(_) => true,
            TransportError::Timeout(_) => true,
            TransportError::InvalidResponse(_) => false,
            TransportError::Json(_) => false,
            TransportError::Failed(_) => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
