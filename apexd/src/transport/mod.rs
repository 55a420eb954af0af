//! Agent invocation transport
//!
//! The executor hands a prompt plus session environment to an
//! `AgentTransport` and consumes a stream of typed messages in return. The
//! core never interprets tool calls; it only accounts for them and relays
//! them as events.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod anthropic;
pub mod error;
pub mod mock;

pub use anthropic::AnthropicTransport;
pub use error::TransportError;
pub use mock::{ScriptStep, ScriptedTransport};

/// One message from the agent stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Text {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        content: serde_json::Value,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Everything needed for one stage invocation
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    /// The agent's system prompt (markdown body of its definition)
    pub system_prompt: String,

    /// Rendered stage prompt
    pub prompt: String,

    /// Model routing for this agent
    pub model: String,

    /// Session environment exported to the agent (APEX_TASK_ID etc.)
    pub env: HashMap<String, String>,

    /// Working directory: workspace path when present, else project path
    pub cwd: PathBuf,

    /// Turn cap for the invocation
    pub max_turns: u32,
}

/// Opaque asynchronous message source backing stage execution
///
/// Implementations stream messages into the provided channel and return
/// once the invocation finishes. The receiver side may be dropped early
/// (cancellation); senders must tolerate that.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn invoke(
        &self,
        invocation: AgentInvocation,
        messages: mpsc::Sender<AgentMessage>,
    ) -> Result<(), TransportError>;
}

/// Estimate cost in USD for a usage delta on the given model
pub fn cost_usd(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let (input_price, output_price) = match model {
        m if m.contains("opus") => (15.0, 75.0),
        m if m.contains("sonnet") => (3.0, 15.0),
        m if m.contains("haiku") => (0.25, 1.25),
        _ => (3.0, 15.0),
    };

    (input_tokens as f64 / 1_000_000.0) * input_price + (output_tokens as f64 / 1_000_000.0) * output_price
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_message_serde_tagged() {
        let msg = AgentMessage::ToolUse {
            name: "read_file".to_string(),
            input: serde_json::json!({"path": "src/lib.rs"}),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["name"], "read_file");

        let back: AgentMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_cost_per_model_family() {
        // Sonnet: $3/M input, $15/M output
        let cost = cost_usd("claude-sonnet-4-20250514", 1_000_000, 100_000);
        assert!((cost - 4.5).abs() < 1e-9);

        // Opus: $15/M input, $75/M output
        let cost = cost_usd("claude-opus-4", 1_000_000, 100_000);
        assert!((cost - 22.5).abs() < 1e-9);

        // Unknown models fall back to sonnet pricing
        let cost = cost_usd("mystery-model", 1_000_000, 0);
        assert!((cost - 3.0).abs() < 1e-9);
    }
}
