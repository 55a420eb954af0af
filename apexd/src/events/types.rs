//! Event types for daemon activity streaming
//!
//! Every observable action emits one of these: task lifecycle, agent
//! streaming, gates, usage accounting, PR operations, capacity changes.
//! Channel names are stable strings consumers can filter on.

use serde::{Deserialize, Serialize};

use apexstore::{LogLevel, PauseReason, Priority, SubtaskStrategy, TaskUsage};

use crate::capacity::CapacityRestoredEvent;

/// The vocabulary of daemon activity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    // === Task lifecycle ===
    TaskCreated {
        task_id: String,
        description: String,
        workflow: String,
        priority: Priority,
    },
    TaskStarted {
        task_id: String,
        workflow: String,
    },
    TaskStageChanged {
        task_id: String,
        stage: String,
        stage_index: usize,
        total_stages: usize,
    },
    TaskCompleted {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    TaskPaused {
        task_id: String,
        reason: PauseReason,
    },
    TaskSessionResumed {
        task_id: String,
        checkpoint_id: String,
        stage_index: usize,
    },
    TaskDecomposed {
        task_id: String,
        subtask_ids: Vec<String>,
        strategy: SubtaskStrategy,
    },

    // === Subtasks ===
    SubtaskCreated {
        task_id: String,
        subtask_id: String,
        description: String,
    },
    SubtaskCompleted {
        task_id: String,
        subtask_id: String,
    },
    SubtaskFailed {
        task_id: String,
        subtask_id: String,
        error: String,
    },

    // === Agent streaming ===
    AgentMessage {
        task_id: String,
        stage: String,
        agent: String,
        content: String,
    },
    AgentThinking {
        task_id: String,
        stage: String,
        agent: String,
        content: String,
    },
    AgentToolUse {
        task_id: String,
        stage: String,
        agent: String,
        tool: String,
        input: serde_json::Value,
    },
    AgentToolResult {
        task_id: String,
        stage: String,
        agent: String,
        content: serde_json::Value,
    },

    // === Gates ===
    GateRequired {
        task_id: String,
        gate: String,
    },
    GateApproved {
        task_id: String,
        gate: String,
        approver: String,
    },
    GateRejected {
        task_id: String,
        gate: String,
        approver: String,
    },

    // === Accounting and operations ===
    UsageUpdated {
        task_id: String,
        usage: TaskUsage,
    },
    LogEntry {
        task_id: String,
        level: LogLevel,
        message: String,
    },
    PrCreated {
        task_id: String,
        url: String,
    },
    PrFailed {
        task_id: String,
        error: String,
    },
    TemplateCreated {
        template_id: String,
        name: String,
    },
    TemplateUpdated {
        template_id: String,
        name: String,
    },
    CapacityRestored {
        event: CapacityRestoredEvent,
    },
}

impl Event {
    /// Stable channel name for filtering
    pub fn channel(&self) -> &'static str {
        match self {
            Event::TaskCreated { .. } => "task:created",
            Event::TaskStarted { .. } => "task:started",
            Event::TaskStageChanged { .. } => "task:stage-changed",
            Event::TaskCompleted { .. } => "task:completed",
            Event::TaskFailed { .. } => "task:failed",
            Event::TaskPaused { .. } => "task:paused",
            Event::TaskSessionResumed { .. } => "task:session-resumed",
            Event::TaskDecomposed { .. } => "task:decomposed",
            Event::SubtaskCreated { .. } => "subtask:created",
            Event::SubtaskCompleted { .. } => "subtask:completed",
            Event::SubtaskFailed { .. } => "subtask:failed",
            Event::AgentMessage { .. } => "agent:message",
            Event::AgentThinking { .. } => "agent:thinking",
            Event::AgentToolUse { .. } => "agent:tool-use",
            Event::AgentToolResult { .. } => "agent:tool-result",
            Event::GateRequired { .. } => "gate:required",
            Event::GateApproved { .. } => "gate:approved",
            Event::GateRejected { .. } => "gate:rejected",
            Event::UsageUpdated { .. } => "usage:updated",
            Event::LogEntry { .. } => "log:entry",
            Event::PrCreated { .. } => "pr:created",
            Event::PrFailed { .. } => "pr:failed",
            Event::TemplateCreated { .. } => "template:created",
            Event::TemplateUpdated { .. } => "template:updated",
            Event::CapacityRestored { .. } => "capacity:restored",
        }
    }

    /// The task this event belongs to, when it has one
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Event::TaskCreated { task_id, .. }
            | Event::TaskStarted { task_id, .. }
            | Event::TaskStageChanged { task_id, .. }
            | Event::TaskCompleted { task_id }
            | Event::TaskFailed { task_id, .. }
            | Event::TaskPaused { task_id, .. }
            | Event::TaskSessionResumed { task_id, .. }
            | Event::TaskDecomposed { task_id, .. }
            | Event::SubtaskCreated { task_id, .. }
            | Event::SubtaskCompleted { task_id, .. }
            | Event::SubtaskFailed { task_id, .. }
            | Event::AgentMessage { task_id, .. }
            | Event::AgentThinking { task_id, .. }
            | Event::AgentToolUse { task_id, .. }
            | Event::AgentToolResult { task_id, .. }
            | Event::GateRequired { task_id, .. }
            | Event::GateApproved { task_id, .. }
            | Event::GateRejected { task_id, .. }
            | Event::UsageUpdated { task_id, .. }
            | Event::LogEntry { task_id, .. }
            | Event::PrCreated { task_id, .. }
            | Event::PrFailed { task_id, .. } => Some(task_id),
            Event::TemplateCreated { .. } | Event::TemplateUpdated { .. } | Event::CapacityRestored { .. } => None,
        }
    }
}
