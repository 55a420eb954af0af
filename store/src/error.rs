//! Store error types

use thiserror::Error;

/// Errors surfaced by store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Idle task not found: {0}")]
    IdleTaskNotFound(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Gate not found: {task_id}/{name}")]
    GateNotFound { task_id: String, name: String },

    #[error("Store is locked by another daemon: {0}")]
    Locked(String),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the store crate
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Check whether this error identifies a missing entity
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::TaskNotFound(_)
                | StoreError::TemplateNotFound(_)
                | StoreError::IdleTaskNotFound(_)
                | StoreError::CheckpointNotFound(_)
                | StoreError::GateNotFound { .. }
        )
    }
}
