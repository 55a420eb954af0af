//! Workspace manager interface
//!
//! The core consumes two read-only queries (workspace path and container id)
//! plus cleanup/release, all defensively: errors, `None`, and empty strings
//! all mean "no workspace" and execution falls back to the task's project
//! path.

use std::path::PathBuf;

use async_trait::async_trait;
use eyre::Result;
use tracing::{debug, info};

/// Provides per-task working directories and optional container ids
#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    /// Workspace directory for a task, if one was provisioned
    async fn workspace_path(&self, task_id: &str) -> Result<Option<String>>;

    /// Container the task runs in, if any
    async fn container_id(&self, task_id: &str) -> Result<Option<String>>;

    /// Remove a completed task's workspace from disk
    async fn cleanup_workspace(&self, task_id: &str) -> Result<()>;

    /// Release the workspace without necessarily deleting it
    async fn release_workspace(&self, task_id: &str) -> Result<()>;
}

/// Directory-per-task workspace manager under `<root>/.apex/workspaces`
pub struct DirWorkspaceManager {
    root: PathBuf,
}

impl DirWorkspaceManager {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        let root = project_path.into().join(".apex").join("workspaces");
        Self { root }
    }

    fn dir_for(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    /// Create the workspace directory for a task
    pub async fn provision(&self, task_id: &str) -> Result<PathBuf> {
        let dir = self.dir_for(task_id);
        tokio::fs::create_dir_all(&dir).await?;
        info!(task_id, path = %dir.display(), "Provisioned workspace");
        Ok(dir)
    }
}

#[async_trait]
impl WorkspaceManager for DirWorkspaceManager {
    async fn workspace_path(&self, task_id: &str) -> Result<Option<String>> {
        let dir = self.dir_for(task_id);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            Ok(Some(dir.to_string_lossy().to_string()))
        } else {
            Ok(None)
        }
    }

    async fn container_id(&self, _task_id: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn cleanup_workspace(&self, task_id: &str) -> Result<()> {
        let dir = self.dir_for(task_id);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir).await?;
            debug!(task_id, "Removed workspace");
        }
        Ok(())
    }

    async fn release_workspace(&self, task_id: &str) -> Result<()> {
        debug!(task_id, "Released workspace");
        Ok(())
    }
}

/// Workspace manager that never provisions anything; tasks run in their
/// project path.
pub struct NoWorkspaceManager;

#[async_trait]
impl WorkspaceManager for NoWorkspaceManager {
    async fn workspace_path(&self, _task_id: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn container_id(&self, _task_id: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn cleanup_workspace(&self, _task_id: &str) -> Result<()> {
        Ok(())
    }

    async fn release_workspace(&self, _task_id: &str) -> Result<()> {
        Ok(())
    }
}
