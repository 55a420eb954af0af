//! Session-pressure estimation
//!
//! Estimates how much of the agent's context window a task's stored
//! conversation consumes and recommends what to do about it. Shared by the
//! workflow executor (pre-stage gate) and the orchestrator
//! (`detect_session_limit`).

use serde::{Deserialize, Serialize};

use apexstore::ConversationMessage;

/// What to do about the current session pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRecommendation {
    Continue,
    Summarize,
    Checkpoint,
    Handoff,
}

impl SessionRecommendation {
    /// Checkpoint and handoff both force a pause before the next stage
    pub fn requires_pause(&self) -> bool {
        matches!(self, Self::Checkpoint | Self::Handoff)
    }
}

/// Result of a session-pressure check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLimitStatus {
    pub current_tokens: u64,
    pub utilization: f64,
    pub near_limit: bool,
    pub recommendation: SessionRecommendation,
    pub message: String,
}

/// Estimate conversation size in tokens (~4 characters per token)
///
/// Structured tool results are JSON-serialised before counting; null
/// content contributes nothing.
pub fn estimate_conversation_tokens(conversation: &[ConversationMessage]) -> u64 {
    let chars: usize = conversation
        .iter()
        .map(|m| match &m.content {
            serde_json::Value::Null => 0,
            serde_json::Value::String(s) => s.chars().count(),
            other => serde_json::to_string(other).map(|s| s.len()).unwrap_or(0),
        })
        .sum();
    (chars / 4) as u64
}

/// Check session pressure for a conversation against a context window
pub fn check_session_limit(
    conversation: &[ConversationMessage],
    context_window: u64,
    threshold: f64,
) -> SessionLimitStatus {
    let current_tokens = estimate_conversation_tokens(conversation);
    status_for(current_tokens, context_window, threshold)
}

/// Classify an absolute token count against a window
pub fn status_for(current_tokens: u64, context_window: u64, threshold: f64) -> SessionLimitStatus {
    let utilization = if context_window == 0 {
        f64::INFINITY
    } else {
        current_tokens as f64 / context_window as f64
    };

    let percent = if utilization.is_finite() {
        format!("{:.0}%", utilization * 100.0)
    } else {
        "100%+".to_string()
    };

    let (recommendation, message) = if utilization < 0.6 {
        (
            SessionRecommendation::Continue,
            format!("Session healthy ({percent} of context window used)"),
        )
    } else if utilization < threshold {
        (
            SessionRecommendation::Summarize,
            format!("Consider summarization: {percent} of context window used"),
        )
    } else if utilization < 0.95 {
        (
            SessionRecommendation::Checkpoint,
            format!("Context window pressure at {percent}, checkpoint recommended"),
        )
    } else {
        (
            SessionRecommendation::Handoff,
            format!("Context window nearly exhausted at {percent}, handoff required"),
        )
    };

    SessionLimitStatus {
        current_tokens,
        utilization,
        near_limit: utilization >= threshold,
        recommendation,
        message,
    }
}
