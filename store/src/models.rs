//! Persistent entities for the APEX task store
//!
//! Task is the unit of work; everything else (logs, artifacts, gates,
//! checkpoints, templates, idle tasks) hangs off a task id or stands alone.
//! Enum wire formats match the daemon's external representation:
//! kebab-case statuses, snake_case pause reasons, lowercase priorities.

use serde::{Deserialize, Serialize};

/// Current unix time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Priority for queue ordering: urgent > high > normal > low
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// SQL rank used in ORDER BY clauses (0 = most urgent)
    pub fn queue_rank(&self) -> i64 {
        match self {
            Self::Urgent => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Queued,
    Planning,
    InProgress,
    WaitingApproval,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are never re-executed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::Planning => write!(f, "planning"),
            Self::InProgress => write!(f, "in-progress"),
            Self::WaitingApproval => write!(f, "waiting-approval"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "planning" => Ok(Self::Planning),
            "in-progress" => Ok(Self::InProgress),
            "waiting-approval" => Ok(Self::WaitingApproval),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// Why a task was paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    UsageLimit,
    Budget,
    Capacity,
    SessionLimit,
    RateLimit,
    Manual,
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UsageLimit => write!(f, "usage_limit"),
            Self::Budget => write!(f, "budget"),
            Self::Capacity => write!(f, "capacity"),
            Self::SessionLimit => write!(f, "session_limit"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for PauseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "usage_limit" => Ok(Self::UsageLimit),
            "budget" => Ok(Self::Budget),
            "capacity" => Ok(Self::Capacity),
            "session_limit" => Ok(Self::SessionLimit),
            "rate_limit" => Ok(Self::RateLimit),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Unknown pause reason: {}", s)),
        }
    }
}

/// How subtasks of a decomposed task are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SubtaskStrategy {
    #[default]
    Sequential,
    Parallel,
    DependencyBased,
}

/// Autonomy level for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Autonomy {
    #[default]
    Full,
    ReviewBeforeMerge,
    Manual,
}

/// Accumulated token/cost usage for a task
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
}

impl TaskUsage {
    /// Accumulate a usage delta, keeping total_tokens consistent
    pub fn add(&mut self, input_tokens: u64, output_tokens: u64, cost: f64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.total_tokens = self.input_tokens + self.output_tokens;
        self.estimated_cost += cost;
    }

    /// Merge another task's usage into this one (parent <- subtask)
    pub fn merge(&mut self, other: &TaskUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens = self.input_tokens + self.output_tokens;
        self.estimated_cost += other.estimated_cost;
    }
}

/// One stored message of a task's conversation history
///
/// Content is kept as raw JSON: plain strings for text turns, structured
/// values for tool results, null for empty turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: serde_json::Value,
}

impl ConversationMessage {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: serde_json::Value::String(content.into()),
        }
    }
}

/// The unit of work driven through a workflow by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier (`task_<millis>_<rand>`)
    pub id: String,

    /// Free-text description of the work
    pub description: String,

    #[serde(default)]
    pub acceptance_criteria: Option<String>,

    #[serde(default)]
    pub parent_task_id: Option<String>,

    #[serde(default)]
    pub subtask_strategy: Option<SubtaskStrategy>,

    /// Ordered child task ids when decomposed
    #[serde(default)]
    pub subtask_ids: Vec<String>,

    /// Workflow name resolved against the definition directory
    pub workflow: String,

    #[serde(default)]
    pub autonomy: Autonomy,

    pub project_path: String,

    /// Stable branch assigned at creation (`apex/<slug>`), never rewritten
    pub branch_name: String,

    #[serde(default)]
    pub priority: Priority,

    pub created_at: i64,
    pub updated_at: i64,

    /// Task ids that must complete before this task is ready
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub status: TaskStatus,

    #[serde(default)]
    pub current_stage: Option<String>,

    /// Set iff status is completed
    #[serde(default)]
    pub completed_at: Option<i64>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub paused_at: Option<i64>,

    #[serde(default)]
    pub pause_reason: Option<PauseReason>,

    /// Earliest wall time (unix ms) the task may be re-admitted
    #[serde(default)]
    pub resume_after: Option<i64>,

    /// Counted separately from retry_count
    #[serde(default)]
    pub resume_attempts: u32,

    #[serde(default)]
    pub usage: TaskUsage,

    /// Stored message history for session-pressure estimation and resumption
    #[serde(default)]
    pub conversation: Vec<ConversationMessage>,

    #[serde(default)]
    pub pr_url: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

impl Task {
    /// Create a pending task with the given identity and routing
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        workflow: impl Into<String>,
        project_path: impl Into<String>,
        branch_name: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            description: description.into(),
            acceptance_criteria: None,
            parent_task_id: None,
            subtask_strategy: None,
            subtask_ids: Vec::new(),
            workflow: workflow.into(),
            autonomy: Autonomy::default(),
            project_path: project_path.into(),
            branch_name: branch_name.into(),
            priority: Priority::default(),
            created_at: now,
            updated_at: now,
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            current_stage: None,
            completed_at: None,
            error: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            paused_at: None,
            pause_reason: None,
            resume_after: None,
            resume_attempts: 0,
            usage: TaskUsage::default(),
            conversation: Vec::new(),
            pr_url: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_acceptance_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.acceptance_criteria = Some(criteria.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_id.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Partial update applied through `Store::update_task`
///
/// Outer `None` leaves a field untouched; for nullable task fields the inner
/// option distinguishes "set to value" from "clear".
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub description: Option<String>,
    pub acceptance_criteria: Option<Option<String>>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub current_stage: Option<Option<String>>,
    pub completed_at: Option<Option<i64>>,
    pub error: Option<Option<String>>,
    pub retry_count: Option<u32>,
    pub resume_attempts: Option<u32>,
    pub paused_at: Option<Option<i64>>,
    pub pause_reason: Option<Option<PauseReason>>,
    pub resume_after: Option<Option<i64>>,
    pub usage: Option<TaskUsage>,
    pub conversation: Option<Vec<ConversationMessage>>,
    pub subtask_ids: Option<Vec<String>>,
    pub subtask_strategy: Option<SubtaskStrategy>,
    pub pr_url: Option<String>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no field is set; `update_task` treats this as a no-op
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.acceptance_criteria.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.current_stage.is_none()
            && self.completed_at.is_none()
            && self.error.is_none()
            && self.retry_count.is_none()
            && self.resume_attempts.is_none()
            && self.paused_at.is_none()
            && self.pause_reason.is_none()
            && self.resume_after.is_none()
            && self.usage.is_none()
            && self.conversation.is_none()
            && self.subtask_ids.is_none()
            && self.subtask_strategy.is_none()
            && self.pr_url.is_none()
    }

    /// Apply this patch onto a task in place
    pub fn apply(&self, task: &mut Task) {
        if let Some(v) = &self.description {
            task.description = v.clone();
        }
        if let Some(v) = &self.acceptance_criteria {
            task.acceptance_criteria = v.clone();
        }
        if let Some(v) = self.status {
            task.status = v;
        }
        if let Some(v) = self.priority {
            task.priority = v;
        }
        if let Some(v) = &self.current_stage {
            task.current_stage = v.clone();
        }
        if let Some(v) = self.completed_at {
            task.completed_at = v;
        }
        if let Some(v) = &self.error {
            task.error = v.clone();
        }
        if let Some(v) = self.retry_count {
            task.retry_count = v;
        }
        if let Some(v) = self.resume_attempts {
            task.resume_attempts = v;
        }
        if let Some(v) = self.paused_at {
            task.paused_at = v;
        }
        if let Some(v) = self.pause_reason {
            task.pause_reason = v;
        }
        if let Some(v) = self.resume_after {
            task.resume_after = v;
        }
        if let Some(v) = self.usage {
            task.usage = v;
        }
        if let Some(v) = &self.conversation {
            task.conversation = v.clone();
        }
        if let Some(v) = &self.subtask_ids {
            task.subtask_ids = v.clone();
        }
        if let Some(v) = self.subtask_strategy {
            task.subtask_strategy = Some(v);
        }
        if let Some(v) = &self.pr_url {
            task.pr_url = Some(v.clone());
        }
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn current_stage(mut self, stage: Option<String>) -> Self {
        self.current_stage = Some(stage);
        self
    }

    pub fn completed_at(mut self, at: Option<i64>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn resume_attempts(mut self, count: u32) -> Self {
        self.resume_attempts = Some(count);
        self
    }

    pub fn paused(mut self, reason: PauseReason, resume_after: Option<i64>) -> Self {
        self.status = Some(TaskStatus::Paused);
        self.paused_at = Some(Some(now_ms()));
        self.pause_reason = Some(Some(reason));
        self.resume_after = Some(resume_after);
        self
    }

    /// Clear pause bookkeeping when a task goes back to work
    pub fn unpaused(mut self) -> Self {
        self.paused_at = Some(None);
        self.pause_reason = Some(None);
        self.resume_after = Some(None);
        self
    }

    pub fn usage(mut self, usage: TaskUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn conversation(mut self, conversation: Vec<ConversationMessage>) -> Self {
        self.conversation = Some(conversation);
        self
    }

    pub fn subtasks(mut self, ids: Vec<String>, strategy: SubtaskStrategy) -> Self {
        self.subtask_ids = Some(ids);
        self.subtask_strategy = Some(strategy);
        self
    }

    pub fn pr_url(mut self, url: impl Into<String>) -> Self {
        self.pr_url = Some(url.into());
        self
    }
}

/// Log severity for task log rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
            Self::Debug => write!(f, "debug"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "debug" => Ok(Self::Debug),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// Append-only task log row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub task_id: String,
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub component: Option<String>,
}

impl TaskLogEntry {
    pub fn new(task_id: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            timestamp: now_ms(),
            level,
            message: message.into(),
            stage: None,
            agent: None,
            component: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }
}

/// Kind of stored artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    File,
    Data,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Data => write!(f, "data"),
        }
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "data" => Ok(Self::Data),
            _ => Err(format!("Unknown artifact kind: {}", s)),
        }
    }
}

/// Append-only artifact row produced by a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskArtifact {
    pub task_id: String,
    pub name: String,
    pub kind: ArtifactKind,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Human-approval gate status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for GateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Unknown gate status: {}", s)),
        }
    }
}

/// Human-approval gate keyed by (task_id, name)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    pub task_id: String,
    pub name: String,
    pub status: GateStatus,
    pub required_at: i64,
    #[serde(default)]
    pub responded_at: Option<i64>,
    #[serde(default)]
    pub approver: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl Gate {
    pub fn new(task_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            name: name.into(),
            status: GateStatus::Pending,
            required_at: now_ms(),
            responded_at: None,
            approver: None,
            comment: None,
        }
    }
}

/// Where execution resumes from a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePoint {
    StageStart,
    WorkflowContinue,
}

/// Resumption metadata attached to a checkpoint
///
/// Stored as opaque JSON in the database; unknown keys written by newer
/// daemons survive a round trip through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<PauseReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_point: Option<ResumePoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_limit_status: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_stages: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub in_progress_stages: Vec<String>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub stage_results: serde_json::Map<String, serde_json::Value>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Durable snapshot of task progress, keyed by (task_id, checkpoint_id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,
    /// `cp_<...>`
    pub checkpoint_id: String,
    #[serde(default)]
    pub stage: Option<String>,
    pub stage_index: usize,
    #[serde(default)]
    pub conversation_state: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: CheckpointMetadata,
    pub created_at: i64,
}

/// Reusable task template, independent of any single task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// `template_<...>`
    pub id: String,
    pub name: String,
    pub description: String,
    pub workflow: String,
    #[serde(default)]
    pub priority: Priority,
    pub effort: String,
    #[serde(default)]
    pub acceptance_criteria: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Partial update applied through `Store::update_template`
#[derive(Debug, Clone, Default)]
pub struct TemplatePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub workflow: Option<String>,
    pub priority: Option<Priority>,
    pub effort: Option<String>,
    pub acceptance_criteria: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
}

impl TemplatePatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.workflow.is_none()
            && self.priority.is_none()
            && self.effort.is_none()
            && self.acceptance_criteria.is_none()
            && self.tags.is_none()
    }

    pub fn apply(&self, template: &mut Template) {
        if let Some(v) = &self.name {
            template.name = v.clone();
        }
        if let Some(v) = &self.description {
            template.description = v.clone();
        }
        if let Some(v) = &self.workflow {
            template.workflow = v.clone();
        }
        if let Some(v) = self.priority {
            template.priority = v;
        }
        if let Some(v) = &self.effort {
            template.effort = v.clone();
        }
        if let Some(v) = &self.acceptance_criteria {
            template.acceptance_criteria = v.clone();
        }
        if let Some(v) = &self.tags {
            template.tags = v.clone();
        }
    }
}

/// Low-priority candidate produced by project analyzers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleTask {
    /// `idle-<kebab>`
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub description: String,
    #[serde(default = "idle_default_priority")]
    pub priority: Priority,
    pub estimated_effort: String,
    pub suggested_workflow: String,
    pub rationale: String,
    pub created_at: i64,
    #[serde(default)]
    pub implemented: bool,
    #[serde(default)]
    pub implemented_task_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn idle_default_priority() -> Priority {
    Priority::Low
}

/// Filter for task listing queries
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub order_by_priority: bool,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Urgent);
    }

    #[test]
    fn test_priority_queue_rank_inverts_ord() {
        assert!(Priority::Urgent.queue_rank() < Priority::High.queue_rank());
        assert!(Priority::High.queue_rank() < Priority::Normal.queue_rank());
        assert!(Priority::Normal.queue_rank() < Priority::Low.queue_rank());
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(TaskStatus::InProgress.to_string(), "in-progress");
        assert_eq!(TaskStatus::WaitingApproval.to_string(), "waiting-approval");
        assert_eq!("in-progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);

        let json = serde_json::to_string(&TaskStatus::WaitingApproval).unwrap();
        assert_eq!(json, "\"waiting-approval\"");
    }

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn test_pause_reason_wire_format() {
        assert_eq!(PauseReason::UsageLimit.to_string(), "usage_limit");
        assert_eq!(PauseReason::SessionLimit.to_string(), "session_limit");
        assert_eq!("rate_limit".parse::<PauseReason>().unwrap(), PauseReason::RateLimit);
        // Case variants are not valid wire values
        assert!("USAGE_LIMIT".parse::<PauseReason>().is_err());
    }

    #[test]
    fn test_usage_add_keeps_total_consistent() {
        let mut usage = TaskUsage::default();
        usage.add(100, 50, 0.01);
        usage.add(100, 50, 0.01);
        assert_eq!(usage.input_tokens, 200);
        assert_eq!(usage.output_tokens, 100);
        assert_eq!(usage.total_tokens, 300);
        assert!((usage.estimated_cost - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_usage_merge() {
        let mut parent = TaskUsage::default();
        parent.add(10, 5, 0.5);
        let mut child = TaskUsage::default();
        child.add(20, 10, 1.0);
        parent.merge(&child);
        assert_eq!(parent.total_tokens, 45);
        assert!((parent.estimated_cost - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_task_new_defaults() {
        let task = Task::new("task_1_abc", "Add OAuth", "feature", "/repo", "apex/add-oauth");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::Normal);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.retry_count, 0);
        assert!(task.completed_at.is_none());
        assert!(task.depends_on.is_empty());
        assert_eq!(task.created_at, task.updated_at);
    }

    #[test]
    fn test_task_serde_round_trip() {
        let task = Task::new("task_1_abc", "Add OAuth", "feature", "/repo", "apex/add-oauth")
            .with_priority(Priority::High)
            .with_dependencies(vec!["task_0_xyz".to_string()])
            .with_acceptance_criteria("OAuth flow passes");

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, task.id);
        assert_eq!(back.priority, Priority::High);
        assert_eq!(back.depends_on, vec!["task_0_xyz"]);
        assert_eq!(back.acceptance_criteria.as_deref(), Some("OAuth flow passes"));
    }

    #[test]
    fn test_patch_empty_detection() {
        assert!(TaskPatch::new().is_empty());
        assert!(!TaskPatch::new().status(TaskStatus::Queued).is_empty());
    }

    #[test]
    fn test_patch_apply_only_touches_set_fields() {
        let mut task = Task::new("task_1_a", "Desc", "feature", "/repo", "apex/desc");
        task.error = Some("old error".to_string());

        TaskPatch::new().status(TaskStatus::InProgress).apply(&mut task);

        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.error.as_deref(), Some("old error"));

        TaskPatch::new().error(None).apply(&mut task);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_patch_paused_sets_bookkeeping() {
        let mut task = Task::new("task_1_a", "Desc", "feature", "/repo", "apex/desc");
        TaskPatch::new()
            .paused(PauseReason::UsageLimit, Some(12345))
            .apply(&mut task);

        assert_eq!(task.status, TaskStatus::Paused);
        assert_eq!(task.pause_reason, Some(PauseReason::UsageLimit));
        assert_eq!(task.resume_after, Some(12345));
        assert!(task.paused_at.is_some());

        TaskPatch::new().status(TaskStatus::Pending).unpaused().apply(&mut task);
        assert!(task.pause_reason.is_none());
        assert!(task.resume_after.is_none());
        assert!(task.paused_at.is_none());
    }

    #[test]
    fn test_checkpoint_metadata_round_trip() {
        let mut meta = CheckpointMetadata {
            pause_reason: Some(PauseReason::SessionLimit),
            resume_point: Some(ResumePoint::StageStart),
            ..Default::default()
        };
        meta.completed_stages.push("planning".to_string());

        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["pause_reason"], "session_limit");
        assert_eq!(json["resume_point"], "stage_start");

        let back: CheckpointMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back.completed_stages, vec!["planning"]);
        assert_eq!(back.resume_point, Some(ResumePoint::StageStart));
    }

    #[test]
    fn test_idle_task_type_rename() {
        let idle = IdleTask {
            id: "idle-remove-dead-code".to_string(),
            kind: "cleanup".to_string(),
            title: "Remove dead code".to_string(),
            description: "Drop unused helpers".to_string(),
            priority: Priority::Low,
            estimated_effort: "small".to_string(),
            suggested_workflow: "refactor".to_string(),
            rationale: "Unreferenced since v0.2".to_string(),
            created_at: now_ms(),
            implemented: false,
            implemented_task_id: None,
            tags: vec!["cleanup".to_string()],
        };

        let json = serde_json::to_value(&idle).unwrap();
        assert_eq!(json["type"], "cleanup");
        assert!(json.get("kind").is_none());
    }

    #[test]
    fn test_subtask_strategy_wire_format() {
        let json = serde_json::to_string(&SubtaskStrategy::DependencyBased).unwrap();
        assert_eq!(json, "\"dependency-based\"");
    }
}
