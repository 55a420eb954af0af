//! APEX daemon - autonomous development orchestration
//!
//! The daemon accepts task requests, runs each task as an ordered sequence
//! of workflow stages delegated to an external agent transport, enforces
//! per-task and per-day budgets, persists durable checkpoints, coordinates
//! dependent tasks, pauses and resumes work with time-of-day capacity
//! windows, and supervises its own process health.
//!
//! # Modules
//!
//! - [`orchestrator`] - public API surface: task CRUD, templates, gates,
//!   checkpoints, PR operations, event bus
//! - [`executor`] - per-task workflow state machine
//! - [`scheduler`] - admission loop over the store's queue
//! - [`capacity`] - time windows, budgets, session pressure
//! - [`transport`] - agent invocation interface and implementations
//! - [`defs`] - on-disk workflow and agent definitions
//! - [`events`] - typed event bus
//! - [`config`] - configuration types and loading

pub mod capacity;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod defs;
pub mod events;
pub mod executor;
pub mod health;
pub mod ids;
pub mod orchestrator;
pub mod scheduler;
pub mod transport;
pub mod workspace;

// Re-export commonly used types
pub use capacity::{
    CapacityMode, CapacityMonitor, CapacityRestoredEvent, DailyUsage, RestorationReason, SessionLimitStatus,
    SessionRecommendation, TimeWindow, UsageStatsProvider,
};
pub use config::Config;
pub use daemon::{DaemonManager, DaemonStatus};
pub use defs::{AgentDef, AgentLoader, StageDef, WorkflowDef, WorkflowLoader};
pub use events::{Event, EventBus, EventEmitter, create_event_bus};
pub use executor::{
    ExecError, ExecuteOptions, SubtaskSpec, TaskExecResult, TaskOutcome, WorkflowExecutor, classify_error_message,
};
pub use health::{HealthMonitor, HealthReport};
pub use orchestrator::{
    CreateTaskRequest, CreateTemplateRequest, Orchestrator, OrchestratorOptions, PrOutcome, PrRequest, PushOutcome,
    PushValidator,
};
pub use scheduler::TaskRunner;
pub use transport::{
    AgentInvocation, AgentMessage, AgentTransport, AnthropicTransport, ScriptStep, ScriptedTransport, TransportError,
};
pub use workspace::{DirWorkspaceManager, NoWorkspaceManager, WorkspaceManager};
