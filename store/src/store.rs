//! SQLite-backed task store
//!
//! One logical database owned by the daemon process. Entities are stored as
//! JSON documents beside indexed columns used by the queue and dependency
//! queries; the store is the only component that mutates rows, and every
//! mutating operation is linearised through a single connection.
//!
//! Opening a store on disk takes an exclusive advisory lock next to the
//! database so a second daemon cannot share it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs2::FileExt;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::models::{
    ArtifactKind, Checkpoint, CheckpointMetadata, Gate, GateStatus, IdleTask, LogLevel, Priority, Task, TaskArtifact,
    TaskFilter, TaskLogEntry, TaskPatch, TaskStatus, Template, TemplatePatch, now_ms,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id            TEXT PRIMARY KEY,
    status        TEXT NOT NULL,
    priority      TEXT NOT NULL,
    parent_task_id TEXT,
    pause_reason  TEXT,
    resume_after  INTEGER,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    data          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_task_id);

CREATE TABLE IF NOT EXISTS task_deps (
    task_id    TEXT NOT NULL,
    depends_on TEXT NOT NULL,
    PRIMARY KEY (task_id, depends_on)
);
CREATE INDEX IF NOT EXISTS idx_deps_target ON task_deps(depends_on);

CREATE TABLE IF NOT EXISTS task_logs (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id   TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    level     TEXT NOT NULL,
    message   TEXT NOT NULL,
    stage     TEXT,
    agent     TEXT,
    component TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_task ON task_logs(task_id);

CREATE TABLE IF NOT EXISTS task_artifacts (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id    TEXT NOT NULL,
    name       TEXT NOT NULL,
    kind       TEXT NOT NULL,
    path       TEXT,
    content    TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_artifacts_task ON task_artifacts(task_id);

CREATE TABLE IF NOT EXISTS task_commands (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id    TEXT NOT NULL,
    command    TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS gates (
    task_id      TEXT NOT NULL,
    name         TEXT NOT NULL,
    status       TEXT NOT NULL,
    required_at  INTEGER NOT NULL,
    responded_at INTEGER,
    approver     TEXT,
    comment      TEXT,
    PRIMARY KEY (task_id, name)
);

CREATE TABLE IF NOT EXISTS checkpoints (
    task_id            TEXT NOT NULL,
    checkpoint_id      TEXT NOT NULL,
    stage              TEXT,
    stage_index        INTEGER NOT NULL,
    conversation_state TEXT,
    metadata           TEXT NOT NULL,
    created_at         INTEGER NOT NULL,
    PRIMARY KEY (task_id, checkpoint_id)
);

CREATE TABLE IF NOT EXISTS templates (
    id         TEXT PRIMARY KEY,
    data       TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS idle_tasks (
    id          TEXT PRIMARY KEY,
    implemented INTEGER NOT NULL DEFAULT 0,
    data        TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);
"#;

// Queue rank in SQL must agree with Priority::queue_rank.
const PRIORITY_RANK: &str =
    "CASE priority WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 WHEN 'normal' THEN 2 WHEN 'low' THEN 3 ELSE 2 END";

/// A task is ready when it is pending and no dependency is outstanding.
/// The LEFT JOIN makes a dependency on a missing task block forever.
const READY_PREDICATE: &str = "t.status = 'pending' AND NOT EXISTS (
    SELECT 1 FROM task_deps d
    LEFT JOIN tasks dep ON dep.id = d.depends_on
    WHERE d.task_id = t.id AND (dep.id IS NULL OR dep.status != 'completed')
)";

/// Aggregated usage across tasks touched since a cutoff
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageTotals {
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// The durable task store
pub struct Store {
    conn: Mutex<Connection>,
    /// Held for the lifetime of the store; dropping releases the lock
    _lock: Option<fs::File>,
}

impl Store {
    /// Open or create a store at the given database path
    ///
    /// Creates parent directories, applies the schema, and acquires an
    /// exclusive lock file beside the database. Fails with
    /// `StoreError::Locked` when another daemon already owns the store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_path = lock_path_for(path);
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(path.display().to_string()));
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "Opened task store");
        Ok(Self {
            conn: Mutex::new(conn),
            _lock: Some(lock_file),
        })
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            _lock: None,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock means a writer panicked mid-operation; the
        // database state can no longer be trusted in this process.
        self.conn.lock().expect("store connection lock poisoned")
    }

    // === Tasks ===

    /// Insert a new task along with its dependency rows
    pub fn create_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        insert_task(&tx, task)?;
        tx.commit()?;
        debug!(task_id = %task.id, workflow = %task.workflow, "Created task");
        Ok(())
    }

    /// Fetch a task by id; `None` when missing
    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn();
        read_task(&conn, id)
    }

    /// Fetch a task by id, failing with `TaskNotFound` when missing
    pub fn require_task(&self, id: &str) -> Result<Task> {
        self.get_task(id)?.ok_or_else(|| StoreError::TaskNotFound(id.to_string()))
    }

    /// Apply a partial update; an empty patch is a no-op, not an error
    pub fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<Task> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut task = read_task(&tx, id)?.ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;

        if patch.is_empty() {
            tx.commit()?;
            return Ok(task);
        }

        patch.apply(&mut task);
        // Guarantee updated_at advances even within one millisecond
        task.updated_at = now_ms().max(task.updated_at + 1);
        write_task(&tx, &task)?;
        tx.commit()?;
        Ok(task)
    }

    /// List tasks matching the filter
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let conn = self.conn();
        let order = if filter.order_by_priority {
            format!("{PRIORITY_RANK}, created_at ASC")
        } else {
            "created_at ASC".to_string()
        };
        let limit = filter.limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default();

        let tasks = match filter.status {
            Some(status) => {
                let sql = format!("SELECT id FROM tasks WHERE status = ?1 ORDER BY {order}{limit}");
                let mut stmt = conn.prepare(&sql)?;
                let ids: Vec<String> = stmt
                    .query_map(params![status.to_string()], |row| row.get(0))?
                    .collect::<rusqlite::Result<_>>()?;
                read_tasks(&conn, &ids)?
            }
            None => {
                let sql = format!("SELECT id FROM tasks ORDER BY {order}{limit}");
                let mut stmt = conn.prepare(&sql)?;
                let ids: Vec<String> = stmt.query_map([], |row| row.get(0))?.collect::<rusqlite::Result<_>>()?;
                read_tasks(&conn, &ids)?
            }
        };
        Ok(tasks)
    }

    // === Queue ===

    /// Highest-priority ready task, ties broken by age
    ///
    /// A blocked task is never returned even when its priority dominates.
    pub fn get_next_queued_task(&self) -> Result<Option<Task>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT t.id FROM tasks t WHERE {READY_PREDICATE} ORDER BY {PRIORITY_RANK}, t.created_at ASC LIMIT 1"
        );
        let id: Option<String> = conn.query_row(&sql, [], |row| row.get(0)).optional()?;
        match id {
            Some(id) => read_task(&conn, &id),
            None => Ok(None),
        }
    }

    /// All ready tasks in queue order
    pub fn get_ready_tasks(&self, order_by_priority: bool, limit: Option<usize>) -> Result<Vec<Task>> {
        let conn = self.conn();
        let order = if order_by_priority {
            format!("{PRIORITY_RANK}, t.created_at ASC")
        } else {
            "t.created_at ASC".to_string()
        };
        let limit = limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default();
        let sql = format!("SELECT t.id FROM tasks t WHERE {READY_PREDICATE} ORDER BY {order}{limit}");
        let mut stmt = conn.prepare(&sql)?;
        let ids: Vec<String> = stmt.query_map([], |row| row.get(0))?.collect::<rusqlite::Result<_>>()?;
        read_tasks(&conn, &ids)
    }

    /// Reset a task to pending with the given priority
    pub fn queue_task(&self, id: &str, priority: Priority) -> Result<Task> {
        self.update_task(
            id,
            &TaskPatch::new().status(TaskStatus::Pending).priority(priority).unpaused(),
        )
    }

    /// Paused tasks eligible for automatic resumption
    ///
    /// Only the exact lowercase reasons usage_limit, budget and capacity
    /// qualify; session_limit and manual pauses need an explicit resume.
    /// Tasks whose resume_after lies in the future are excluded.
    pub fn get_paused_tasks_for_resume(&self) -> Result<Vec<Task>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT id FROM tasks WHERE status = 'paused' \
             AND pause_reason IN ('usage_limit', 'budget', 'capacity') \
             AND (resume_after IS NULL OR resume_after <= ?1) \
             ORDER BY {PRIORITY_RANK}, created_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let ids: Vec<String> = stmt
            .query_map(params![now_ms()], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        read_tasks(&conn, &ids)
    }

    // === Dependencies ===

    /// The tasks this task depends on (existing rows only)
    pub fn get_task_dependencies(&self, id: &str) -> Result<Vec<Task>> {
        let conn = self.conn();
        require_task_row(&conn, id)?;
        let mut stmt = conn.prepare("SELECT depends_on FROM task_deps WHERE task_id = ?1 ORDER BY depends_on")?;
        let dep_ids: Vec<String> = stmt.query_map(params![id], |row| row.get(0))?.collect::<rusqlite::Result<_>>()?;
        let mut deps = Vec::new();
        for dep_id in dep_ids {
            if let Some(task) = read_task(&conn, &dep_id)? {
                deps.push(task);
            }
        }
        Ok(deps)
    }

    /// Tasks that depend on this task
    pub fn get_dependent_tasks(&self, id: &str) -> Result<Vec<Task>> {
        let conn = self.conn();
        require_task_row(&conn, id)?;
        let mut stmt = conn.prepare("SELECT task_id FROM task_deps WHERE depends_on = ?1 ORDER BY task_id")?;
        let ids: Vec<String> = stmt.query_map(params![id], |row| row.get(0))?.collect::<rusqlite::Result<_>>()?;
        read_tasks(&conn, &ids)
    }

    /// Dependencies of this task that are not yet completed
    pub fn get_blocking_tasks(&self, id: &str) -> Result<Vec<Task>> {
        Ok(self
            .get_task_dependencies(id)?
            .into_iter()
            .filter(|t| t.status != TaskStatus::Completed)
            .collect())
    }

    /// Whether the task is pending with no outstanding dependency
    pub fn is_task_ready(&self, id: &str) -> Result<bool> {
        let conn = self.conn();
        require_task_row(&conn, id)?;
        let sql = format!("SELECT COUNT(*) FROM tasks t WHERE t.id = ?1 AND {READY_PREDICATE}");
        let count: i64 = conn.query_row(&sql, params![id], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Add a dependency edge; inserting an existing edge is silently ignored
    pub fn add_dependency(&self, task_id: &str, depends_on: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut task = read_task(&tx, task_id)?.ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        if !task.depends_on.iter().any(|d| d == depends_on) {
            task.depends_on.push(depends_on.to_string());
            task.updated_at = now_ms().max(task.updated_at + 1);
            write_task(&tx, &task)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove a dependency edge if present
    pub fn remove_dependency(&self, task_id: &str, depends_on: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut task = read_task(&tx, task_id)?.ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        let before = task.depends_on.len();
        task.depends_on.retain(|d| d != depends_on);
        if task.depends_on.len() != before {
            task.updated_at = now_ms().max(task.updated_at + 1);
            write_task(&tx, &task)?;
        }
        tx.commit()?;
        Ok(())
    }

    // === Logs, artifacts, commands ===

    /// Append a log row
    pub fn add_log(&self, entry: &TaskLogEntry) -> Result<()> {
        let conn = self.conn();
        require_task_row(&conn, &entry.task_id)?;
        conn.execute(
            "INSERT INTO task_logs (task_id, timestamp, level, message, stage, agent, component)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.task_id,
                entry.timestamp,
                entry.level.to_string(),
                entry.message,
                entry.stage,
                entry.agent,
                entry.component
            ],
        )?;
        Ok(())
    }

    /// Logs for a task in insertion order
    pub fn get_logs(&self, task_id: &str) -> Result<Vec<TaskLogEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, timestamp, level, message, stage, agent, component
             FROM task_logs WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (task_id, timestamp, level, message, stage, agent, component) = row?;
            let level: LogLevel = level.parse().unwrap_or(LogLevel::Info);
            entries.push(TaskLogEntry {
                task_id,
                timestamp,
                level,
                message,
                stage,
                agent,
                component,
            });
        }
        Ok(entries)
    }

    /// Append an artifact row
    pub fn add_artifact(&self, artifact: &TaskArtifact) -> Result<()> {
        let conn = self.conn();
        require_task_row(&conn, &artifact.task_id)?;
        conn.execute(
            "INSERT INTO task_artifacts (task_id, name, kind, path, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                artifact.task_id,
                artifact.name,
                artifact.kind.to_string(),
                artifact.path,
                artifact.content,
                now_ms()
            ],
        )?;
        Ok(())
    }

    /// Artifacts for a task in insertion order
    pub fn get_artifacts(&self, task_id: &str) -> Result<Vec<TaskArtifact>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, name, kind, path, content FROM task_artifacts WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut artifacts = Vec::new();
        for row in rows {
            let (task_id, name, kind, path, content) = row?;
            let kind: ArtifactKind = kind.parse().unwrap_or(ArtifactKind::Data);
            artifacts.push(TaskArtifact {
                task_id,
                name,
                kind,
                path,
                content,
            });
        }
        Ok(artifacts)
    }

    /// Record an external command run on behalf of a task
    pub fn log_command(&self, task_id: &str, command: &str) -> Result<()> {
        let conn = self.conn();
        require_task_row(&conn, task_id)?;
        conn.execute(
            "INSERT INTO task_commands (task_id, command, created_at) VALUES (?1, ?2, ?3)",
            params![task_id, command, now_ms()],
        )?;
        Ok(())
    }

    /// Commands logged for a task in insertion order
    pub fn get_commands(&self, task_id: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT command FROM task_commands WHERE task_id = ?1 ORDER BY id ASC")?;
        let commands = stmt.query_map(params![task_id], |row| row.get(0))?.collect::<rusqlite::Result<_>>()?;
        Ok(commands)
    }

    // === Gates ===

    /// Upsert a gate row keyed by (task_id, name)
    pub fn set_gate(&self, gate: &Gate) -> Result<()> {
        let conn = self.conn();
        require_task_row(&conn, &gate.task_id)?;
        conn.execute(
            "INSERT INTO gates (task_id, name, status, required_at, responded_at, approver, comment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(task_id, name) DO UPDATE SET
                 status = excluded.status,
                 required_at = excluded.required_at,
                 responded_at = excluded.responded_at,
                 approver = excluded.approver,
                 comment = excluded.comment",
            params![
                gate.task_id,
                gate.name,
                gate.status.to_string(),
                gate.required_at,
                gate.responded_at,
                gate.approver,
                gate.comment
            ],
        )?;
        Ok(())
    }

    /// Fetch a gate; `None` when missing
    pub fn get_gate(&self, task_id: &str, name: &str) -> Result<Option<Gate>> {
        let conn = self.conn();
        read_gate(&conn, task_id, name)
    }

    /// Approve a pending gate, recording the approver and response time
    pub fn approve_gate(&self, task_id: &str, name: &str, approver: &str, comment: Option<&str>) -> Result<Gate> {
        self.respond_gate(task_id, name, GateStatus::Approved, approver, comment)
    }

    /// Reject a pending gate
    pub fn reject_gate(&self, task_id: &str, name: &str, approver: &str, comment: Option<&str>) -> Result<Gate> {
        self.respond_gate(task_id, name, GateStatus::Rejected, approver, comment)
    }

    fn respond_gate(
        &self,
        task_id: &str,
        name: &str,
        status: GateStatus,
        approver: &str,
        comment: Option<&str>,
    ) -> Result<Gate> {
        let conn = self.conn();
        let mut gate = read_gate(&conn, task_id, name)?.ok_or_else(|| StoreError::GateNotFound {
            task_id: task_id.to_string(),
            name: name.to_string(),
        })?;
        gate.status = status;
        gate.responded_at = Some(now_ms());
        gate.approver = Some(approver.to_string());
        gate.comment = comment.map(|c| c.to_string());
        conn.execute(
            "UPDATE gates SET status = ?3, responded_at = ?4, approver = ?5, comment = ?6
             WHERE task_id = ?1 AND name = ?2",
            params![task_id, name, gate.status.to_string(), gate.responded_at, gate.approver, gate.comment],
        )?;
        Ok(gate)
    }

    // === Checkpoints ===

    /// Upsert a checkpoint by (task_id, checkpoint_id)
    pub fn save_checkpoint(&self, cp: &Checkpoint) -> Result<()> {
        let conn = self.conn();
        require_task_row(&conn, &cp.task_id)?;
        let metadata = serde_json::to_string(&cp.metadata)?;
        let conversation_state = cp.conversation_state.as_ref().map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO checkpoints (task_id, checkpoint_id, stage, stage_index, conversation_state, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(task_id, checkpoint_id) DO UPDATE SET
                 stage = excluded.stage,
                 stage_index = excluded.stage_index,
                 conversation_state = excluded.conversation_state,
                 metadata = excluded.metadata,
                 created_at = excluded.created_at",
            params![
                cp.task_id,
                cp.checkpoint_id,
                cp.stage,
                cp.stage_index as i64,
                conversation_state,
                metadata,
                cp.created_at
            ],
        )?;
        debug!(task_id = %cp.task_id, checkpoint_id = %cp.checkpoint_id, "Saved checkpoint");
        Ok(())
    }

    /// Fetch a specific checkpoint
    pub fn get_checkpoint(&self, task_id: &str, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, checkpoint_id, stage, stage_index, conversation_state, metadata, created_at
             FROM checkpoints WHERE task_id = ?1 AND checkpoint_id = ?2",
        )?;
        let cp = stmt.query_row(params![task_id, checkpoint_id], row_to_checkpoint).optional()?;
        Ok(cp.transpose()?)
    }

    /// The checkpoint with the greatest created_at
    pub fn get_latest_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, checkpoint_id, stage, stage_index, conversation_state, metadata, created_at
             FROM checkpoints WHERE task_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )?;
        let cp = stmt.query_row(params![task_id], row_to_checkpoint).optional()?;
        Ok(cp.transpose()?)
    }

    /// All checkpoints for a task, newest first
    pub fn list_checkpoints(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, checkpoint_id, stage, stage_index, conversation_state, metadata, created_at
             FROM checkpoints WHERE task_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![task_id], row_to_checkpoint)?;
        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(row??);
        }
        Ok(checkpoints)
    }

    /// Delete one checkpoint; missing rows are an error
    pub fn delete_checkpoint(&self, task_id: &str, checkpoint_id: &str) -> Result<()> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM checkpoints WHERE task_id = ?1 AND checkpoint_id = ?2",
            params![task_id, checkpoint_id],
        )?;
        if deleted == 0 {
            return Err(StoreError::CheckpointNotFound(checkpoint_id.to_string()));
        }
        Ok(())
    }

    /// Delete all checkpoints for a task; returns the number removed
    pub fn delete_all_checkpoints(&self, task_id: &str) -> Result<usize> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM checkpoints WHERE task_id = ?1", params![task_id])?;
        Ok(deleted)
    }

    // === Templates ===

    pub fn create_template(&self, template: &Template) -> Result<()> {
        let conn = self.conn();
        let data = serde_json::to_string(template)?;
        conn.execute(
            "INSERT INTO templates (id, data, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![template.id, data, template.created_at, template.updated_at],
        )?;
        Ok(())
    }

    pub fn get_template(&self, id: &str) -> Result<Option<Template>> {
        let conn = self.conn();
        let data: Option<String> = conn
            .query_row("SELECT data FROM templates WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        data.map(|d| serde_json::from_str(&d)).transpose().map_err(StoreError::from)
    }

    pub fn list_templates(&self) -> Result<Vec<Template>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT data FROM templates ORDER BY created_at ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut templates = Vec::new();
        for row in rows {
            templates.push(serde_json::from_str(&row?)?);
        }
        Ok(templates)
    }

    pub fn update_template(&self, id: &str, patch: &TemplatePatch) -> Result<Template> {
        let conn = self.conn();
        let data: Option<String> = conn
            .query_row("SELECT data FROM templates WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        let mut template: Template =
            serde_json::from_str(&data.ok_or_else(|| StoreError::TemplateNotFound(id.to_string()))?)?;

        if patch.is_empty() {
            return Ok(template);
        }

        patch.apply(&mut template);
        template.updated_at = now_ms().max(template.updated_at + 1);
        conn.execute(
            "UPDATE templates SET data = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, serde_json::to_string(&template)?, template.updated_at],
        )?;
        Ok(template)
    }

    pub fn delete_template(&self, id: &str) -> Result<()> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM templates WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(StoreError::TemplateNotFound(id.to_string()));
        }
        Ok(())
    }

    // === Idle tasks ===

    pub fn add_idle_task(&self, idle: &IdleTask) -> Result<()> {
        let conn = self.conn();
        let data = serde_json::to_string(idle)?;
        conn.execute(
            "INSERT OR REPLACE INTO idle_tasks (id, implemented, data, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![idle.id, idle.implemented as i64, data, idle.created_at],
        )?;
        Ok(())
    }

    pub fn get_idle_task(&self, id: &str) -> Result<Option<IdleTask>> {
        let conn = self.conn();
        let data: Option<String> = conn
            .query_row("SELECT data FROM idle_tasks WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        data.map(|d| serde_json::from_str(&d)).transpose().map_err(StoreError::from)
    }

    /// Idle tasks, optionally only those not yet implemented
    pub fn list_idle_tasks(&self, unimplemented_only: bool) -> Result<Vec<IdleTask>> {
        let conn = self.conn();
        let sql = if unimplemented_only {
            "SELECT data FROM idle_tasks WHERE implemented = 0 ORDER BY created_at ASC"
        } else {
            "SELECT data FROM idle_tasks ORDER BY created_at ASC"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut idles = Vec::new();
        for row in rows {
            idles.push(serde_json::from_str(&row?)?);
        }
        Ok(idles)
    }

    /// Atomically create a task from an idle suggestion and mark it implemented
    ///
    /// The new task's acceptance criteria embeds the idle task's title and
    /// rationale when the caller did not set any; the idle task back-links
    /// the created task id.
    pub fn promote_idle_task(&self, idle_id: &str, mut task: Task) -> Result<Task> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let data: Option<String> = tx
            .query_row("SELECT data FROM idle_tasks WHERE id = ?1", params![idle_id], |row| row.get(0))
            .optional()?;
        let mut idle: IdleTask =
            serde_json::from_str(&data.ok_or_else(|| StoreError::IdleTaskNotFound(idle_id.to_string()))?)?;

        if task.acceptance_criteria.is_none() {
            task.acceptance_criteria = Some(format!("{}\n\nRationale: {}", idle.title, idle.rationale));
        }
        insert_task(&tx, &task)?;

        idle.implemented = true;
        idle.implemented_task_id = Some(task.id.clone());
        tx.execute(
            "UPDATE idle_tasks SET implemented = 1, data = ?2 WHERE id = ?1",
            params![idle_id, serde_json::to_string(&idle)?],
        )?;

        tx.commit()?;
        info!(idle_id, task_id = %task.id, "Promoted idle task");
        Ok(task)
    }

    // === Usage ===

    /// Sum token/cost usage over tasks updated at or after the cutoff
    pub fn usage_since(&self, since_ms: i64) -> Result<UsageTotals> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT data FROM tasks WHERE updated_at >= ?1")?;
        let rows = stmt.query_map(params![since_ms], |row| row.get::<_, String>(0))?;

        let mut totals = UsageTotals::default();
        for row in rows {
            let task: Task = match serde_json::from_str(&row?) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable task row in usage scan");
                    continue;
                }
            };
            totals.total_tokens += task.usage.total_tokens;
            totals.total_cost += task.usage.estimated_cost;
        }
        Ok(totals)
    }
}

fn lock_path_for(db_path: &Path) -> PathBuf {
    let mut path = db_path.to_path_buf();
    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    path.set_file_name(format!("{name}.lock"));
    path
}

fn require_task_row(conn: &Connection, id: &str) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM tasks WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(StoreError::TaskNotFound(id.to_string()));
    }
    Ok(())
}

fn insert_task(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        "INSERT INTO tasks (id, status, priority, parent_task_id, pause_reason, resume_after, created_at, updated_at, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            task.id,
            task.status.to_string(),
            task.priority.to_string(),
            task.parent_task_id,
            task.pause_reason.map(|r| r.to_string()),
            task.resume_after,
            task.created_at,
            task.updated_at,
            serde_json::to_string(task)?
        ],
    )?;
    sync_deps(conn, task)?;
    Ok(())
}

fn write_task(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET status = ?2, priority = ?3, parent_task_id = ?4, pause_reason = ?5,
                          resume_after = ?6, updated_at = ?7, data = ?8
         WHERE id = ?1",
        params![
            task.id,
            task.status.to_string(),
            task.priority.to_string(),
            task.parent_task_id,
            task.pause_reason.map(|r| r.to_string()),
            task.resume_after,
            task.updated_at,
            serde_json::to_string(task)?
        ],
    )?;
    sync_deps(conn, task)?;
    Ok(())
}

fn sync_deps(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute("DELETE FROM task_deps WHERE task_id = ?1", params![task.id])?;
    for dep in &task.depends_on {
        conn.execute(
            "INSERT OR IGNORE INTO task_deps (task_id, depends_on) VALUES (?1, ?2)",
            params![task.id, dep],
        )?;
    }
    Ok(())
}

fn read_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    let data: Option<String> = conn
        .query_row("SELECT data FROM tasks WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    data.map(|d| serde_json::from_str(&d)).transpose().map_err(StoreError::from)
}

fn read_tasks(conn: &Connection, ids: &[String]) -> Result<Vec<Task>> {
    let mut tasks = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(task) = read_task(conn, id)? {
            tasks.push(task);
        }
    }
    Ok(tasks)
}

type CheckpointRow = std::result::Result<Checkpoint, serde_json::Error>;

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRow> {
    let task_id: String = row.get(0)?;
    let checkpoint_id: String = row.get(1)?;
    let stage: Option<String> = row.get(2)?;
    let stage_index: i64 = row.get(3)?;
    let conversation_state: Option<String> = row.get(4)?;
    let metadata: String = row.get(5)?;
    let created_at: i64 = row.get(6)?;

    Ok((|| {
        let metadata: CheckpointMetadata = serde_json::from_str(&metadata)?;
        let conversation_state = conversation_state.as_deref().map(serde_json::from_str).transpose()?;
        Ok(Checkpoint {
            task_id,
            checkpoint_id,
            stage,
            stage_index: stage_index as usize,
            conversation_state,
            metadata,
            created_at,
        })
    })())
}

fn read_gate(conn: &Connection, task_id: &str, name: &str) -> Result<Option<Gate>> {
    let mut stmt = conn.prepare(
        "SELECT task_id, name, status, required_at, responded_at, approver, comment
         FROM gates WHERE task_id = ?1 AND name = ?2",
    )?;
    let gate = stmt
        .query_row(params![task_id, name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })
        .optional()?;

    Ok(gate.map(|(task_id, name, status, required_at, responded_at, approver, comment)| Gate {
        task_id,
        name,
        status: status.parse().unwrap_or(GateStatus::Pending),
        required_at,
        responded_at,
        approver,
        comment,
    }))
}
