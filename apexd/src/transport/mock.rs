//! Scripted agent transport for tests and dry runs
//!
//! Each invocation consumes the next script step: either a list of messages
//! streamed in order, or a failure with a given error message. Invocations
//! are recorded so tests can assert on the environment and working
//! directory handed to the agent.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{AgentInvocation, AgentMessage, AgentTransport, TransportError};

/// What one invocation of the scripted transport does
pub enum ScriptStep {
    /// Stream these messages, then finish cleanly
    Messages(Vec<AgentMessage>),
    /// Fail with this error message
    Fail(String),
}

impl ScriptStep {
    /// A clean stage: some text plus a usage report
    pub fn text_and_usage(content: &str, input_tokens: u64, output_tokens: u64) -> Self {
        ScriptStep::Messages(vec![
            AgentMessage::Text {
                content: content.to_string(),
            },
            AgentMessage::Usage {
                input_tokens,
                output_tokens,
            },
        ])
    }
}

/// Deterministic transport driven by a pre-loaded script
pub struct ScriptedTransport {
    script: Mutex<VecDeque<ScriptStep>>,
    calls: AtomicUsize,
    invocations: Mutex<Vec<AgentInvocation>>,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Number of invocations made so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Append another step to the script
    pub fn push_step(&self, step: ScriptStep) {
        self.script.lock().unwrap().push_back(step);
    }

    /// Invocations recorded in call order
    pub fn recorded_invocations(&self) -> Vec<AgentInvocation> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    async fn invoke(
        &self,
        invocation: AgentInvocation,
        messages: mpsc::Sender<AgentMessage>,
    ) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.invocations.lock().unwrap().push(invocation);

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(ScriptStep::Messages(msgs)) => {
                for msg in msgs {
                    // The receiver may drop mid-stream on cancellation
                    if messages.send(msg).await.is_err() {
                        break;
                    }
                }
                Ok(())
            }
            Some(ScriptStep::Fail(message)) => Err(TransportError::Failed(message)),
            None => Err(TransportError::InvalidResponse("No more scripted responses".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn invocation() -> AgentInvocation {
        AgentInvocation {
            system_prompt: "sys".to_string(),
            prompt: "go".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            env: HashMap::new(),
            cwd: PathBuf::from("/repo"),
            max_turns: 10,
        }
    }

    #[tokio::test]
    async fn test_streams_scripted_messages_in_order() {
        let transport = ScriptedTransport::new(vec![ScriptStep::text_and_usage("hello", 100, 50)]);
        let (tx, mut rx) = mpsc::channel(16);

        transport.invoke(invocation(), tx).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(AgentMessage::Text {
                content: "hello".to_string()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(AgentMessage::Usage {
                input_tokens: 100,
                output_tokens: 50
            })
        );
        assert_eq!(rx.recv().await, None);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_step_surfaces_message() {
        let transport = ScriptedTransport::new(vec![ScriptStep::Fail("Network timeout".to_string())]);
        let (tx, _rx) = mpsc::channel(16);

        let err = transport.invoke(invocation(), tx).await.unwrap_err();
        assert_eq!(err.to_string(), "Network timeout");
    }

    #[tokio::test]
    async fn test_exhausted_script_errors() {
        let transport = ScriptedTransport::new(vec![]);
        let (tx, _rx) = mpsc::channel(16);
        let err = transport.invoke(invocation(), tx).await.unwrap_err();
        assert!(err.to_string().contains("No more scripted responses"));
    }

    #[tokio::test]
    async fn test_records_invocations() {
        let transport = ScriptedTransport::new(vec![ScriptStep::Messages(vec![])]);
        let (tx, _rx) = mpsc::channel(16);
        transport.invoke(invocation(), tx).await.unwrap();

        let recorded = transport.recorded_invocations();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].prompt, "go");
        assert_eq!(recorded[0].cwd, PathBuf::from("/repo"));
    }
}
