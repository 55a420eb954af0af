//! On-disk workflow and agent definitions

pub mod agent;
pub mod workflow;

pub use agent::{AgentDef, AgentLoader};
pub use workflow::{StageDef, WorkflowDef, WorkflowLoader};
