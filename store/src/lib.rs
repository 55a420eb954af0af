//! apexstore - durable task store for the APEX daemon
//!
//! A single-writer SQLite store holding tasks, logs, artifacts, gates,
//! checkpoints, templates and idle-task suggestions, with the queue and
//! dependency queries the scheduler relies on. The store is the only
//! component that mutates persistent state; everything else reads through
//! its query API and submits changes as patches.

pub mod error;
pub mod models;
pub mod store;

pub use error::{Result, StoreError};
pub use models::{
    ArtifactKind, Autonomy, Checkpoint, CheckpointMetadata, ConversationMessage, Gate, GateStatus, IdleTask, LogLevel,
    PauseReason, Priority, ResumePoint, SubtaskStrategy, Task, TaskArtifact, TaskFilter, TaskLogEntry, TaskPatch,
    TaskStatus, TaskUsage, Template, TemplatePatch, now_ms,
};
pub use store::{Store, UsageTotals};
