//! Orchestrator façade and PR operations

pub mod core;
pub mod pr;

pub use core::{CreateTaskRequest, CreateTemplateRequest, Orchestrator, OrchestratorOptions};
pub use pr::{
    CommandValidator, NoopValidator, PrOutcome, PrRequest, PushOutcome, PushValidator, format_thousands,
    generate_pr_body, generate_pr_title,
};
