//! Workflow execution: state machine, error taxonomy, subtasks

pub mod engine;
pub mod error;
pub mod subtasks;

pub use engine::{ExecuteOptions, TaskExecResult, TaskOutcome, WorkflowExecutor};
pub use error::{ErrorDisposition, ExecError, classify_error_message};
pub use subtasks::SubtaskSpec;
