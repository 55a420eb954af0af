//! Anthropic Messages API transport
//!
//! Streams one agent invocation over SSE, mapping content-block and usage
//! events onto the `AgentMessage` union the executor consumes.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::mpsc;
use tracing::debug;

use super::{AgentInvocation, AgentMessage, AgentTransport, TransportError};
use crate::config::LlmConfig;

/// Agent transport backed by the Anthropic Messages API
#[derive(Debug)]
pub struct AnthropicTransport {
    api_key: String,
    base_url: String,
    http: Client,
    max_tokens: u32,
    default_model: String,
}

impl AnthropicTransport {
    /// Create a transport from configuration
    ///
    /// Reads the API key from the environment variable named in config.
    pub fn from_config(config: &LlmConfig) -> Result<Self, TransportError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            TransportError::InvalidResponse(format!("Environment variable {} not set", config.api_key_env))
        })?;

        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(TransportError::Network)?;

        Ok(Self {
            api_key,
            base_url: config.base_url.clone(),
            http,
            max_tokens: config.max_tokens,
            default_model: config.model.clone(),
        })
    }

    fn build_request_body(&self, invocation: &AgentInvocation) -> serde_json::Value {
        let model = if invocation.model.is_empty() {
            &self.default_model
        } else {
            &invocation.model
        };

        serde_json::json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "system": invocation.system_prompt,
            "messages": [{ "role": "user", "content": invocation.prompt }],
            "stream": true,
        })
    }
}

#[async_trait]
impl AgentTransport for AnthropicTransport {
    async fn invoke(
        &self,
        invocation: AgentInvocation,
        messages: mpsc::Sender<AgentMessage>,
    ) -> Result<(), TransportError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(&invocation);
        debug!(cwd = %invocation.cwd.display(), "AnthropicTransport::invoke");

        let request = self
            .http
            .post(url)
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body);

        let mut es = EventSource::new(request).map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        // Per-block accumulators: (kind, text) for text/thinking,
        // (name, partial json) for tool_use
        let mut text_acc: Option<(BlockKind, String)> = None;
        let mut tool_acc: Option<(String, String)> = None;

        while let Some(event) = es.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    let data: serde_json::Value = serde_json::from_str(&msg.data).map_err(TransportError::Json)?;

                    match data["type"].as_str() {
                        Some("message_start") => {
                            if let Some(u) = data["message"].get("usage") {
                                let input_tokens = u["input_tokens"].as_u64().unwrap_or(0);
                                if input_tokens > 0 {
                                    let _ = messages
                                        .send(AgentMessage::Usage {
                                            input_tokens,
                                            output_tokens: 0,
                                        })
                                        .await;
                                }
                            }
                        }
                        Some("content_block_start") => {
                            if let Some(block) = data.get("content_block") {
                                match block["type"].as_str() {
                                    Some("tool_use") => {
                                        let name = block["name"].as_str().unwrap_or("").to_string();
                                        tool_acc = Some((name, String::new()));
                                    }
                                    Some("thinking") => {
                                        text_acc = Some((BlockKind::Thinking, String::new()));
                                    }
                                    _ => {
                                        text_acc = Some((BlockKind::Text, String::new()));
                                    }
                                }
                            }
                        }
                        Some("content_block_delta") => {
                            if let Some(delta) = data.get("delta") {
                                if let Some(text) = delta["text"].as_str()
                                    && let Some((_, acc)) = &mut text_acc
                                {
                                    acc.push_str(text);
                                }
                                if let Some(text) = delta["thinking"].as_str()
                                    && let Some((_, acc)) = &mut text_acc
                                {
                                    acc.push_str(text);
                                }
                                if let Some(json) = delta["partial_json"].as_str()
                                    && let Some((_, acc)) = &mut tool_acc
                                {
                                    acc.push_str(json);
                                }
                            }
                        }
                        Some("content_block_stop") => {
                            if let Some((name, json)) = tool_acc.take() {
                                let input: serde_json::Value =
                                    serde_json::from_str(&json).unwrap_or(serde_json::json!({}));
                                let _ = messages.send(AgentMessage::ToolUse { name, input }).await;
                            }
                            if let Some((kind, content)) = text_acc.take() {
                                let msg = match kind {
                                    BlockKind::Text => AgentMessage::Text { content },
                                    BlockKind::Thinking => AgentMessage::Thinking { content },
                                };
                                let _ = messages.send(msg).await;
                            }
                        }
                        Some("message_delta") => {
                            if let Some(u) = data.get("usage") {
                                let output_tokens = u["output_tokens"].as_u64().unwrap_or(0);
                                if output_tokens > 0 {
                                    let _ = messages
                                        .send(AgentMessage::Usage {
                                            input_tokens: 0,
                                            output_tokens,
                                        })
                                        .await;
                                }
                            }
                        }
                        Some("message_stop") => break,
                        Some("error") => {
                            let message = data["error"]["message"].as_str().unwrap_or("unknown").to_string();
                            let err_type = data["error"]["type"].as_str().unwrap_or("");
                            es.close();
                            return Err(match err_type {
                                "rate_limit_error" => TransportError::RateLimited {
                                    retry_after: Duration::from_secs(60),
                                },
                                "overloaded_error" => TransportError::ApiError { status: 529, message },
                                _ => TransportError::InvalidResponse(message),
                            });
                        }
                        _ => {}
                    }
                }
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    es.close();
                    if status.as_u16() == 429 {
                        let retry_after = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .unwrap_or(60);
                        return Err(TransportError::RateLimited {
                            retry_after: Duration::from_secs(retry_after),
                        });
                    }
                    let message = response.text().await.unwrap_or_default();
                    return Err(TransportError::ApiError {
                        status: status.as_u16(),
                        message,
                    });
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    es.close();
                    return Err(TransportError::InvalidResponse(e.to_string()));
                }
            }
        }

        Ok(())
    }
}

enum BlockKind {
    Text,
    Thinking,
}
