//! Orchestrator façade - the public API surface of the daemon
//!
//! Bundles the store, workflow executor, scheduler, capacity monitor,
//! health monitor and event bus behind one value. Callers create and
//! manage tasks here; the scheduler drains them in the background once
//! `start()` is called.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{Local, TimeZone};
use eyre::{Result, eyre};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use apexstore::{
    Autonomy, Checkpoint, Gate, LogLevel, Priority, Store, Task, TaskFilter, TaskLogEntry, TaskPatch, TaskStatus,
    Template, TemplatePatch, now_ms,
};

use crate::capacity::{CapacityMonitor, DailyUsage, SessionLimitStatus, UsageStatsProvider, check_session_limit};
use crate::config::Config;
use crate::defs::{AgentLoader, WorkflowLoader};
use crate::events::{Event, EventBus, create_event_bus};
use crate::executor::{ExecError, ExecuteOptions, SubtaskSpec, TaskOutcome, WorkflowExecutor};
use crate::health::{HealthMonitor, HealthReport};
use crate::ids;
use crate::scheduler::TaskRunner;
use crate::transport::{AgentTransport, AnthropicTransport};
use crate::workspace::{DirWorkspaceManager, WorkspaceManager};

use super::pr::{self, NoopValidator, PrOutcome, PrRequest, PushOutcome, PushValidator};

/// Wiring options for `Orchestrator::initialize`
///
/// Every field except the project path has a production default; tests
/// inject in-memory stores and scripted transports here.
pub struct OrchestratorOptions {
    pub project_path: String,
    pub config: Option<Config>,
    pub config_path: Option<PathBuf>,
    pub store: Option<Arc<Store>>,
    pub transport: Option<Arc<dyn AgentTransport>>,
    pub workspace: Option<Arc<dyn WorkspaceManager>>,
    pub push_validator: Option<Arc<dyn PushValidator>>,
}

impl OrchestratorOptions {
    pub fn new(project_path: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            config: None,
            config_path: None,
            store: None,
            transport: None,
            workspace: None,
            push_validator: None,
        }
    }
}

/// Request to create a task
#[derive(Debug, Clone, Default)]
pub struct CreateTaskRequest {
    pub description: String,
    pub workflow: Option<String>,
    pub priority: Option<Priority>,
    pub acceptance_criteria: Option<String>,
    pub autonomy: Option<Autonomy>,
    pub depends_on: Vec<String>,
    pub max_retries: Option<u32>,
}

impl CreateTaskRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }
}

/// Request to create a template
#[derive(Debug, Clone)]
pub struct CreateTemplateRequest {
    pub name: String,
    pub description: String,
    pub workflow: String,
    pub priority: Priority,
    pub effort: String,
    pub acceptance_criteria: Option<String>,
    pub tags: Vec<String>,
}

/// Usage stats sourced from the store for the capacity monitor
struct StoreUsageStats {
    store: Arc<Store>,
    daily_budget: f64,
}

impl UsageStatsProvider for StoreUsageStats {
    fn current_daily_usage(&self) -> DailyUsage {
        let midnight = start_of_local_day_ms();
        match self.store.usage_since(midnight) {
            Ok(totals) => DailyUsage {
                total_cost: totals.total_cost,
                total_tokens: totals.total_tokens,
            },
            Err(e) => {
                warn!(error = %e, "Daily usage query failed; reporting zero");
                DailyUsage::default()
            }
        }
    }

    fn active_task_count(&self) -> usize {
        let count_of = |status| {
            self.store
                .list_tasks(&TaskFilter {
                    status: Some(status),
                    ..Default::default()
                })
                .map(|tasks| tasks.len())
                .unwrap_or(0)
        };
        count_of(TaskStatus::InProgress) + count_of(TaskStatus::Planning)
    }

    fn daily_budget(&self) -> f64 {
        self.daily_budget
    }
}

fn start_of_local_day_ms() -> i64 {
    let today = Local::now().date_naive();
    for hour in 0..3 {
        if let Some(naive) = today.and_hms_opt(hour, 0, 0)
            && let Some(dt) = Local.from_local_datetime(&naive).earliest()
        {
            return dt.timestamp_millis();
        }
    }
    now_ms()
}

/// The daemon's public API surface
pub struct Orchestrator {
    config: Config,
    project_path: String,
    store: Arc<Store>,
    events: Arc<EventBus>,
    executor: Arc<WorkflowExecutor>,
    runner: Arc<TaskRunner>,
    capacity: Arc<CapacityMonitor>,
    workspace: Arc<dyn WorkspaceManager>,
    health: Arc<HealthMonitor>,
    push_validator: Arc<dyn PushValidator>,
    started: AtomicBool,
    runner_handle: Mutex<Option<JoinHandle<()>>>,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Wire up all components; idempotent at the process level because the
    /// store takes an exclusive lock. Must run inside a tokio runtime.
    pub async fn initialize(options: OrchestratorOptions) -> Result<Arc<Self>> {
        let project_path = options.project_path;
        let config = match options.config {
            Some(config) => config,
            None => Config::load(options.config_path.as_ref())?,
        };

        let store = match options.store {
            Some(store) => store,
            None => {
                let db_path = PathBuf::from(&project_path).join(".apex").join("apex.db");
                Arc::new(Store::open(db_path)?)
            }
        };

        let workflows = Arc::new(WorkflowLoader::load(&project_path)?);
        let agents = Arc::new(AgentLoader::load(&project_path)?);
        let workspace: Arc<dyn WorkspaceManager> = options
            .workspace
            .unwrap_or_else(|| Arc::new(DirWorkspaceManager::new(&project_path)));
        let transport: Arc<dyn AgentTransport> = match options.transport {
            Some(transport) => transport,
            None => Arc::new(AnthropicTransport::from_config(&config.llm)?),
        };

        let events = create_event_bus();
        let executor = Arc::new(WorkflowExecutor::new(
            store.clone(),
            workflows,
            agents,
            transport,
            workspace.clone(),
            events.clone(),
            &config,
        ));

        let stats = Arc::new(StoreUsageStats {
            store: store.clone(),
            daily_budget: config.limits.daily_budget,
        });
        let capacity = Arc::new(CapacityMonitor::new(config.daemon.time_based_usage.clone(), stats));
        let runner = Arc::new(TaskRunner::new(store.clone(), executor.clone(), capacity.clone(), &config));
        let health = Arc::new(HealthMonitor::new(&config.daemon.health_check));
        let push_validator = options.push_validator.unwrap_or_else(|| Arc::new(NoopValidator));

        let orchestrator = Arc::new(Self {
            config,
            project_path,
            store,
            events,
            executor,
            runner,
            capacity,
            workspace,
            health,
            push_validator,
            started: AtomicBool::new(false),
            runner_handle: Mutex::new(None),
            cleanup_handle: Mutex::new(None),
        });

        orchestrator.spawn_cleanup_subscriber();
        orchestrator.health.start();
        info!(project = %orchestrator.project_path, "Orchestrator initialized");
        Ok(orchestrator)
    }

    /// Start the scheduler loop; calling it again is a no-op
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self.runner.start();
        *self.runner_handle.lock().expect("orchestrator lock poisoned") = Some(handle);
    }

    /// Stop admissions, drain running workers, stop background tasks
    pub async fn shutdown(&self) {
        self.runner.stop();
        self.runner.wait_for_all_tasks().await;
        if let Some(handle) = self.runner_handle.lock().expect("orchestrator lock poisoned").take() {
            let _ = handle.await;
        }
        self.health.stop();
        if let Some(handle) = self.cleanup_handle.lock().expect("orchestrator lock poisoned").take() {
            handle.abort();
        }
        self.started.store(false, Ordering::SeqCst);
        info!("Orchestrator shut down");
    }

    /// Cleanup completed-task workspaces unless config says otherwise.
    /// Failures are logged (tracing and the task's logs) and never re-thrown.
    fn spawn_cleanup_subscriber(self: &Arc<Self>) {
        if !self.config.cleanup_on_complete() {
            return;
        }

        let mut rx = self.events.subscribe();
        let store = self.store.clone();
        let workspace = self.workspace.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Event::TaskCompleted { task_id }) => {
                        if let Err(e) = workspace.cleanup_workspace(&task_id).await {
                            warn!(task_id, error = %e, "Workspace cleanup failed");
                            let _ = store.add_log(
                                &TaskLogEntry::new(
                                    &task_id,
                                    LogLevel::Warn,
                                    format!("Workspace cleanup failed: {e}"),
                                )
                                .with_component("workspace-cleanup"),
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.cleanup_handle.lock().expect("orchestrator lock poisoned") = Some(handle);
    }

    // === Tasks ===

    pub fn create_task(&self, request: CreateTaskRequest) -> Result<Task> {
        if request.description.trim().is_empty() {
            return Err(eyre!("Invalid input: task description is empty"));
        }

        let workflow = request.workflow.unwrap_or_else(|| "feature".to_string());
        if self.executor.workflows().get(&workflow).is_none() {
            return Err(eyre!("Workflow not found: {workflow}"));
        }

        let autonomy = request.autonomy.unwrap_or(self.config.autonomy.default);
        if !self.config.autonomy.allowed.contains(&autonomy) {
            return Err(eyre!("Invalid input: autonomy level {autonomy:?} is not allowed"));
        }

        let mut task = Task::new(
            ids::task_id(),
            &request.description,
            &workflow,
            &self.project_path,
            ids::branch_name(&request.description),
        );
        task.autonomy = autonomy;
        task.priority = request.priority.unwrap_or_default();
        task.acceptance_criteria = request.acceptance_criteria;
        task.depends_on = request.depends_on;
        if let Some(max_retries) = request.max_retries {
            task.max_retries = max_retries;
        }

        self.store.create_task(&task)?;
        self.events.emit(Event::TaskCreated {
            task_id: task.id.clone(),
            description: task.description.clone(),
            workflow: task.workflow.clone(),
            priority: task.priority,
        });
        Ok(task)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.store.get_task(task_id)?)
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks(filter)?)
    }

    pub fn queue_task(&self, task_id: &str, priority: Priority) -> Result<Task> {
        Ok(self.store.queue_task(task_id, priority)?)
    }

    pub async fn execute_task(&self, task_id: &str, options: ExecuteOptions) -> Result<TaskOutcome, ExecError> {
        self.executor.execute_task(task_id, options).await
    }

    pub async fn resume_task(&self, task_id: &str, checkpoint_id: Option<&str>) -> Result<bool, ExecError> {
        self.executor.resume_task(task_id, checkpoint_id).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<bool, ExecError> {
        self.executor.cancel_task(task_id).await
    }

    pub fn decompose_task(
        &self,
        parent_id: &str,
        specs: Vec<SubtaskSpec>,
        strategy: apexstore::SubtaskStrategy,
    ) -> Result<Vec<Task>, ExecError> {
        self.executor.decompose_task(parent_id, specs, strategy)
    }

    pub async fn execute_subtasks(&self, parent_id: &str) -> Result<bool, ExecError> {
        self.executor.execute_subtasks(parent_id).await
    }

    // === Gates ===

    /// Require a human approval gate; the task waits until it is answered
    pub fn require_gate(&self, task_id: &str, name: &str) -> Result<Gate> {
        let gate = Gate::new(task_id, name);
        self.store.set_gate(&gate)?;
        self.store
            .update_task(task_id, &TaskPatch::new().status(TaskStatus::WaitingApproval))?;
        self.events.emit(Event::GateRequired {
            task_id: task_id.to_string(),
            gate: name.to_string(),
        });
        Ok(gate)
    }

    /// Approve a gate and put the task back into the queue
    pub fn approve_gate(&self, task_id: &str, name: &str, approver: &str, comment: Option<&str>) -> Result<Gate> {
        let gate = self.store.approve_gate(task_id, name, approver, comment)?;
        let task = self.store.require_task(task_id)?;
        if task.status == TaskStatus::WaitingApproval {
            self.store.queue_task(task_id, task.priority)?;
        }
        self.events.emit(Event::GateApproved {
            task_id: task_id.to_string(),
            gate: name.to_string(),
            approver: approver.to_string(),
        });
        Ok(gate)
    }

    /// Reject a gate; the task fails with a gate-rejection error
    pub fn reject_gate(&self, task_id: &str, name: &str, approver: &str, comment: Option<&str>) -> Result<Gate> {
        let gate = self.store.reject_gate(task_id, name, approver, comment)?;
        self.store.update_task(
            task_id,
            &TaskPatch::new()
                .status(TaskStatus::Failed)
                .error(Some(format!("Gate {name} rejected by {approver}"))),
        )?;
        self.events.emit(Event::GateRejected {
            task_id: task_id.to_string(),
            gate: name.to_string(),
            approver: approver.to_string(),
        });
        Ok(gate)
    }

    pub fn get_gate(&self, task_id: &str, name: &str) -> Result<Option<Gate>> {
        Ok(self.store.get_gate(task_id, name)?)
    }

    // === Templates ===

    pub fn create_template(&self, request: CreateTemplateRequest) -> Result<Template> {
        let now = now_ms();
        let template = Template {
            id: ids::template_id(),
            name: request.name,
            description: request.description,
            workflow: request.workflow,
            priority: request.priority,
            effort: request.effort,
            acceptance_criteria: request.acceptance_criteria,
            tags: request.tags,
            created_at: now,
            updated_at: now,
        };
        self.store.create_template(&template)?;
        self.events.emit(Event::TemplateCreated {
            template_id: template.id.clone(),
            name: template.name.clone(),
        });
        Ok(template)
    }

    pub fn update_template(&self, template_id: &str, patch: &TemplatePatch) -> Result<Template> {
        let template = self.store.update_template(template_id, patch)?;
        self.events.emit(Event::TemplateUpdated {
            template_id: template.id.clone(),
            name: template.name.clone(),
        });
        Ok(template)
    }

    pub fn get_template(&self, template_id: &str) -> Result<Option<Template>> {
        Ok(self.store.get_template(template_id)?)
    }

    pub fn list_templates(&self) -> Result<Vec<Template>> {
        Ok(self.store.list_templates()?)
    }

    pub fn delete_template(&self, template_id: &str) -> Result<()> {
        Ok(self.store.delete_template(template_id)?)
    }

    /// Instantiate a task from a stored template
    pub fn create_task_from_template(&self, template_id: &str) -> Result<Task> {
        let template = self
            .store
            .get_template(template_id)?
            .ok_or_else(|| eyre!("Template not found: {template_id}"))?;

        self.create_task(CreateTaskRequest {
            description: template.description,
            workflow: Some(template.workflow),
            priority: Some(template.priority),
            acceptance_criteria: template.acceptance_criteria,
            ..Default::default()
        })
    }

    // === Idle tasks ===

    /// Promote an analyzer suggestion into a real task
    pub fn promote_idle_task(&self, idle_id: &str) -> Result<Task> {
        let idle = self
            .store
            .get_idle_task(idle_id)?
            .ok_or_else(|| eyre!("Idle task not found: {idle_id}"))?;

        if self.executor.workflows().get(&idle.suggested_workflow).is_none() {
            return Err(eyre!("Workflow not found: {}", idle.suggested_workflow));
        }

        let mut task = Task::new(
            ids::task_id(),
            &idle.description,
            &idle.suggested_workflow,
            &self.project_path,
            ids::branch_name(&idle.title),
        );
        task.priority = idle.priority;

        let task = self.store.promote_idle_task(idle_id, task)?;
        self.events.emit(Event::TaskCreated {
            task_id: task.id.clone(),
            description: task.description.clone(),
            workflow: task.workflow.clone(),
            priority: task.priority,
        });
        Ok(task)
    }

    // === Checkpoints ===

    pub fn list_checkpoints(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        Ok(self.store.list_checkpoints(task_id)?)
    }

    pub fn get_latest_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.store.get_latest_checkpoint(task_id)?)
    }

    pub fn delete_checkpoint(&self, task_id: &str, checkpoint_id: &str) -> Result<()> {
        Ok(self.store.delete_checkpoint(task_id, checkpoint_id)?)
    }

    pub fn delete_all_checkpoints(&self, task_id: &str) -> Result<usize> {
        Ok(self.store.delete_all_checkpoints(task_id)?)
    }

    // === Session pressure ===

    /// Apply the session-pressure check to a task's stored conversation
    pub fn detect_session_limit(&self, task_id: &str, context_window: Option<u64>) -> Result<SessionLimitStatus> {
        let task = self.store.require_task(task_id)?;
        let window = context_window.unwrap_or(self.config.llm.context_window);
        Ok(check_session_limit(
            &task.conversation,
            window,
            self.config.daemon.session_recovery.context_window_threshold,
        ))
    }

    // === PR operations ===

    pub async fn create_pull_request(&self, task_id: &str, request: PrRequest) -> PrOutcome {
        let task = match self.store.require_task(task_id) {
            Ok(task) => task,
            Err(e) => return self.pr_failed(task_id, e.to_string()),
        };

        if !pr::gh_available().await {
            return self.pr_failed(task_id, "GitHub CLI (gh) is not available".to_string());
        }
        if !pr::remote_is_github(&task.project_path).await {
            return self.pr_failed(task_id, "origin remote is not a GitHub repository".to_string());
        }

        let title = request
            .title
            .unwrap_or_else(|| pr::generate_pr_title(&task.workflow, &task.description));
        let body = request.body.unwrap_or_else(|| pr::generate_pr_body(&task));

        match pr::create_pr(&task.project_path, &task.branch_name, &title, &body, request.draft).await {
            Ok(url) => {
                let _ = self.store.log_command(task_id, &format!("gh pr create --head {}", task.branch_name));
                if let Err(e) = self.store.update_task(task_id, &TaskPatch::new().pr_url(&url)) {
                    warn!(task_id, error = %e, "Failed to persist PR URL");
                }
                self.events.emit(Event::PrCreated {
                    task_id: task_id.to_string(),
                    url: url.clone(),
                });
                PrOutcome {
                    success: true,
                    url: Some(url),
                    error: None,
                }
            }
            Err(e) => self.pr_failed(task_id, e.to_string()),
        }
    }

    fn pr_failed(&self, task_id: &str, error: String) -> PrOutcome {
        self.events.emit(Event::PrFailed {
            task_id: task_id.to_string(),
            error: error.clone(),
        });
        PrOutcome::failed(error)
    }

    /// Push the task branch after pre-push validation
    pub async fn push_branch(&self, task_id: &str) -> PushOutcome {
        if !self.config.git.push_after_task {
            return PushOutcome::failed("git.push-after-task is disabled");
        }

        let task = match self.store.require_task(task_id) {
            Ok(task) => task,
            Err(e) => return PushOutcome::failed(e.to_string()),
        };

        if let Err(e) = self.push_validator.validate(&task.project_path).await {
            return PushOutcome::failed(e.to_string());
        }

        match pr::push_branch(&task.project_path, &task.branch_name).await {
            Ok(()) => {
                let _ = self
                    .store
                    .log_command(task_id, &format!("git push -u origin {}", task.branch_name));
                PushOutcome {
                    success: true,
                    remote_branch: Some(format!("origin/{}", task.branch_name)),
                    error: None,
                }
            }
            Err(e) => PushOutcome::failed(e.to_string()),
        }
    }

    // === Accessors ===

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn capacity(&self) -> &Arc<CapacityMonitor> {
        &self.capacity
    }

    pub fn health_report(&self) -> HealthReport {
        self.health.check()
    }

    pub fn running_task_count(&self) -> usize {
        self.runner.running_task_count()
    }

    pub fn running_task_ids(&self) -> Vec<String> {
        self.runner.running_task_ids()
    }

    pub fn is_task_running(&self, task_id: &str) -> bool {
        self.runner.is_task_running(task_id)
    }

    pub fn is_task_runner_active(&self) -> bool {
        self.runner.is_active()
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.runner.max_concurrent_tasks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AgentMessage, ScriptStep, ScriptedTransport};
    use crate::workspace::NoWorkspaceManager;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.limits.retry_delay_ms = 1;
        config.daemon.poll_interval_ms = 10;
        // Keep capacity out of the way for wall-time-independent tests
        config.daemon.time_based_usage.enabled = false;
        config
    }

    async fn orchestrator_with(script: Vec<ScriptStep>) -> Arc<Orchestrator> {
        orchestrator_custom(test_config(), script, None).await
    }

    async fn orchestrator_custom(
        config: Config,
        script: Vec<ScriptStep>,
        workspace: Option<Arc<dyn WorkspaceManager>>,
    ) -> Arc<Orchestrator> {
        let mut options = OrchestratorOptions::new("/repo");
        options.config = Some(config);
        options.store = Some(Arc::new(Store::open_in_memory().unwrap()));
        options.transport = Some(Arc::new(ScriptedTransport::new(script)));
        options.workspace = Some(workspace.unwrap_or_else(|| Arc::new(NoWorkspaceManager)));
        Orchestrator::initialize(options).await.unwrap()
    }

    fn stage() -> ScriptStep {
        ScriptStep::Messages(vec![AgentMessage::Usage {
            input_tokens: 10,
            output_tokens: 5,
        }])
    }

    #[tokio::test]
    async fn test_create_task_assigns_identity_and_emits() {
        let orch = orchestrator_with(vec![]).await;
        let mut rx = orch.subscribe();

        let task = orch
            .create_task(CreateTaskRequest::new("Add OAuth authentication"))
            .unwrap();

        assert!(task.id.starts_with("task_"));
        assert_eq!(task.branch_name, "apex/add-oauth-authentication");
        assert_eq!(task.workflow, "feature");
        assert_eq!(task.status, TaskStatus::Pending);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.channel(), "task:created");
        assert_eq!(event.task_id(), Some(task.id.as_str()));

        let stored = orch.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.description, "Add OAuth authentication");
    }

    #[tokio::test]
    async fn test_create_task_rejects_unknown_workflow_and_empty_description() {
        let orch = orchestrator_with(vec![]).await;

        let err = orch
            .create_task(CreateTaskRequest {
                description: "Something".to_string(),
                workflow: Some("ghost".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "Workflow not found: ghost");

        let err = orch.create_task(CreateTaskRequest::new("   ")).unwrap_err();
        assert!(err.to_string().contains("Invalid input"));
    }

    #[tokio::test]
    async fn test_gate_flow() {
        let orch = orchestrator_with(vec![]).await;
        let task = orch.create_task(CreateTaskRequest::new("Needs review")).unwrap();
        let mut rx = orch.subscribe();

        orch.require_gate(&task.id, "review").unwrap();
        assert_eq!(
            orch.get_task(&task.id).unwrap().unwrap().status,
            TaskStatus::WaitingApproval
        );
        assert_eq!(rx.try_recv().unwrap().channel(), "gate:required");

        let gate = orch.approve_gate(&task.id, "review", "alex", Some("ok")).unwrap();
        assert_eq!(gate.status, apexstore::GateStatus::Approved);
        assert_eq!(orch.get_task(&task.id).unwrap().unwrap().status, TaskStatus::Pending);
        assert_eq!(rx.try_recv().unwrap().channel(), "gate:approved");
    }

    #[tokio::test]
    async fn test_gate_rejection_fails_task() {
        let orch = orchestrator_with(vec![]).await;
        let task = orch.create_task(CreateTaskRequest::new("Needs review")).unwrap();
        orch.require_gate(&task.id, "review").unwrap();

        orch.reject_gate(&task.id, "review", "sam", Some("nope")).unwrap();
        let task = orch.get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("Gate review rejected"));
    }

    #[tokio::test]
    async fn test_template_lifecycle_and_instantiation() {
        let orch = orchestrator_with(vec![]).await;
        let mut rx = orch.subscribe();

        let template = orch
            .create_template(CreateTemplateRequest {
                name: "Bugfix".to_string(),
                description: "Fix a reported bug".to_string(),
                workflow: "feature".to_string(),
                priority: Priority::High,
                effort: "small".to_string(),
                acceptance_criteria: Some("Bug no longer reproduces".to_string()),
                tags: vec!["bug".to_string()],
            })
            .unwrap();
        assert!(template.id.starts_with("template_"));
        assert_eq!(rx.try_recv().unwrap().channel(), "template:created");

        let updated = orch
            .update_template(&template.id, &TemplatePatch {
                name: Some("Bugfix v2".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(updated.name, "Bugfix v2");
        assert_eq!(rx.try_recv().unwrap().channel(), "template:updated");

        let task = orch.create_task_from_template(&template.id).unwrap();
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.acceptance_criteria.as_deref(), Some("Bug no longer reproduces"));

        orch.delete_template(&template.id).unwrap();
        assert!(orch.get_template(&template.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_promote_idle_task_links_back() {
        let orch = orchestrator_with(vec![]).await;
        let idle = apexstore::IdleTask {
            id: "idle-tighten-lints".to_string(),
            kind: "quality".to_string(),
            title: "Tighten lints".to_string(),
            description: "Enable stricter clippy lints".to_string(),
            priority: Priority::Low,
            estimated_effort: "small".to_string(),
            suggested_workflow: "feature".to_string(),
            rationale: "Lint debt keeps growing".to_string(),
            created_at: now_ms(),
            implemented: false,
            implemented_task_id: None,
            tags: vec![],
        };
        orch.store().add_idle_task(&idle).unwrap();

        let task = orch.promote_idle_task("idle-tighten-lints").unwrap();
        assert!(task.acceptance_criteria.unwrap().contains("Lint debt keeps growing"));

        let idle = orch.store().get_idle_task("idle-tighten-lints").unwrap().unwrap();
        assert!(idle.implemented);
        assert_eq!(idle.implemented_task_id.as_deref(), Some(task.id.as_str()));
    }

    #[tokio::test]
    async fn test_detect_session_limit_zero_window() {
        let orch = orchestrator_with(vec![]).await;
        let task = orch.create_task(CreateTaskRequest::new("Check limits")).unwrap();
        orch.store()
            .update_task(
                &task.id,
                &TaskPatch::new().conversation(vec![apexstore::ConversationMessage::text("assistant", "hello")]),
            )
            .unwrap();

        let status = orch.detect_session_limit(&task.id, Some(0)).unwrap();
        assert!(status.utilization.is_infinite());
        assert_eq!(status.recommendation, crate::capacity::SessionRecommendation::Handoff);
    }

    #[tokio::test]
    async fn test_auto_cleanup_on_completion() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(DirWorkspaceManager::new(dir.path()));
        let orch = orchestrator_custom(test_config(), vec![stage(), stage()], Some(manager.clone())).await;

        let task = orch.create_task(CreateTaskRequest::new("Cleanup me")).unwrap();
        let ws = manager.provision(&task.id).await.unwrap();
        assert!(ws.exists());

        orch.execute_task(&task.id, ExecuteOptions::default()).await.unwrap();

        // The cleanup subscriber runs async off the event bus
        for _ in 0..100 {
            if !ws.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!ws.exists(), "workspace removed after completion");
    }

    #[tokio::test]
    async fn test_auto_cleanup_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(DirWorkspaceManager::new(dir.path()));
        let mut config = test_config();
        config.workspace.cleanup_on_complete = Some(false);
        let orch = orchestrator_custom(config, vec![stage(), stage()], Some(manager.clone())).await;

        let task = orch.create_task(CreateTaskRequest::new("Keep my workspace")).unwrap();
        let ws = manager.provision(&task.id).await.unwrap();

        orch.execute_task(&task.id, ExecuteOptions::default()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(ws.exists(), "workspace kept when cleanup is disabled");
    }

    #[tokio::test]
    async fn test_push_branch_disabled_by_config() {
        let orch = orchestrator_with(vec![]).await;
        let task = orch.create_task(CreateTaskRequest::new("Push me")).unwrap();

        let outcome = orch.push_branch(&task.id).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("push-after-task"));
    }

    #[tokio::test]
    async fn test_create_pull_request_fails_gracefully() {
        let orch = orchestrator_with(vec![]).await;
        let task = orch.create_task(CreateTaskRequest::new("PR me")).unwrap();
        let mut rx = orch.subscribe();

        // /repo is not a GitHub checkout (and gh may be absent entirely)
        let outcome = orch.create_pull_request(&task.id, PrRequest::default()).await;
        assert!(!outcome.success);
        assert!(outcome.error.is_some());

        let channels: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.channel())
            .collect();
        assert!(channels.contains(&"pr:failed"));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_shutdown_drains() {
        let orch = orchestrator_with(vec![stage(), stage()]).await;
        orch.start();
        orch.start();
        assert!(orch.is_task_runner_active());

        let task = orch.create_task(CreateTaskRequest::new("Run me")).unwrap();
        for _ in 0..200 {
            if orch.get_task(&task.id).unwrap().unwrap().status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(orch.get_task(&task.id).unwrap().unwrap().status, TaskStatus::Completed);

        orch.shutdown().await;
        assert!(!orch.is_task_runner_active());
        assert_eq!(orch.running_task_count(), 0);
    }

    #[tokio::test]
    async fn test_health_report_available() {
        let orch = orchestrator_with(vec![]).await;
        let report = orch.health_report();
        assert!(report.checks_run >= 1);
    }
}
