//! Event bus - central pub/sub for daemon events
//!
//! Built on a tokio broadcast channel: emits are synchronous relative to the
//! emitting call, delivery is fan-out to every subscriber, and a slow or
//! panicking consumer can never abort the emitter. Components that need a
//! pre-bound task id emit through an `EventEmitter` handle.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::types::Event;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Central event bus for daemon activity
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers
    ///
    /// Fire-and-forget: with no subscribers the event is dropped; when the
    /// channel is full the oldest events are dropped.
    pub fn emit(&self, event: Event) {
        debug!(channel = event.channel(), task_id = ?event.task_id(), "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Create an emitter handle bound to one task id
    pub fn emitter_for(&self, task_id: impl Into<String>) -> EventEmitter {
        EventEmitter {
            tx: self.tx.clone(),
            task_id: task_id.into(),
        }
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}

/// Handle for components to emit task events without owning the bus
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<Event>,
    task_id: String,
}

impl EventEmitter {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn emit(&self, event: Event) {
        debug!(channel = event.channel(), "EventEmitter::emit");
        let _ = self.tx.send(event);
    }

    // === Convenience methods ===

    pub fn task_started(&self, workflow: &str) {
        self.emit(Event::TaskStarted {
            task_id: self.task_id.clone(),
            workflow: workflow.to_string(),
        });
    }

    pub fn stage_changed(&self, stage: &str, stage_index: usize, total_stages: usize) {
        self.emit(Event::TaskStageChanged {
            task_id: self.task_id.clone(),
            stage: stage.to_string(),
            stage_index,
            total_stages,
        });
    }

    pub fn task_completed(&self) {
        self.emit(Event::TaskCompleted {
            task_id: self.task_id.clone(),
        });
    }

    pub fn task_failed(&self, error: &str) {
        self.emit(Event::TaskFailed {
            task_id: self.task_id.clone(),
            error: error.to_string(),
        });
    }

    pub fn task_paused(&self, reason: apexstore::PauseReason) {
        self.emit(Event::TaskPaused {
            task_id: self.task_id.clone(),
            reason,
        });
    }

    pub fn session_resumed(&self, checkpoint_id: &str, stage_index: usize) {
        self.emit(Event::TaskSessionResumed {
            task_id: self.task_id.clone(),
            checkpoint_id: checkpoint_id.to_string(),
            stage_index,
        });
    }

    pub fn agent_message(&self, stage: &str, agent: &str, content: &str) {
        self.emit(Event::AgentMessage {
            task_id: self.task_id.clone(),
            stage: stage.to_string(),
            agent: agent.to_string(),
            content: content.to_string(),
        });
    }

    pub fn agent_thinking(&self, stage: &str, agent: &str, content: &str) {
        self.emit(Event::AgentThinking {
            task_id: self.task_id.clone(),
            stage: stage.to_string(),
            agent: agent.to_string(),
            content: content.to_string(),
        });
    }

    pub fn agent_tool_use(&self, stage: &str, agent: &str, tool: &str, input: serde_json::Value) {
        self.emit(Event::AgentToolUse {
            task_id: self.task_id.clone(),
            stage: stage.to_string(),
            agent: agent.to_string(),
            tool: tool.to_string(),
            input,
        });
    }

    pub fn agent_tool_result(&self, stage: &str, agent: &str, content: serde_json::Value) {
        self.emit(Event::AgentToolResult {
            task_id: self.task_id.clone(),
            stage: stage.to_string(),
            agent: agent.to_string(),
            content,
        });
    }

    pub fn usage_updated(&self, usage: apexstore::TaskUsage) {
        self.emit(Event::UsageUpdated {
            task_id: self.task_id.clone(),
            usage,
        });
    }

    pub fn log_entry(&self, level: apexstore::LogLevel, message: &str) {
        self.emit(Event::LogEntry {
            task_id: self.task_id.clone(),
            level,
            message: message.to_string(),
        });
    }
}
