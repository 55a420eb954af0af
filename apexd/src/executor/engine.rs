//! Workflow executor - the per-task state machine
//!
//! Drives a task through its workflow stages: queries the workspace, gates
//! on session pressure, streams the agent transport, accounts usage against
//! the per-task budget, classifies failures, retries transient ones from
//! the first stage, and writes resumable checkpoints at stage boundaries
//! and on every pause.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use handlebars::Handlebars;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use apexstore::{
    Checkpoint, CheckpointMetadata, ConversationMessage, LogLevel, PauseReason, ResumePoint, Store, Task, TaskLogEntry,
    TaskPatch, TaskStatus, TaskUsage, now_ms,
};

use crate::capacity::{SessionLimitStatus, check_session_limit};
use crate::config::{Config, LimitsConfig, SessionRecoveryConfig};
use crate::defs::{AgentDef, AgentLoader, StageDef, WorkflowDef, WorkflowLoader};
use crate::events::{EventBus, EventEmitter};
use crate::ids;
use crate::transport::{AgentInvocation, AgentMessage, AgentTransport, cost_usd};
use crate::workspace::WorkspaceManager;

use super::error::{ErrorDisposition, ExecError};

/// Caller-controlled execution options
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Retry transient failures automatically
    pub auto_retry: bool,
    /// Start from this stage instead of the first (resume path)
    pub resume_from_stage: Option<usize>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            auto_retry: true,
            resume_from_stage: None,
        }
    }
}

/// How a task run ended without an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Paused(PauseReason),
    Cancelled,
}

/// Per-task result of a concurrent execution batch
#[derive(Debug, Clone)]
pub struct TaskExecResult {
    pub success: bool,
    pub error: Option<String>,
}

const STAGE_PROMPT: &str = "\
# Task\n\
{{description}}\n\
{{#if acceptance_criteria}}\n## Acceptance criteria\n{{acceptance_criteria}}\n{{/if}}\
\n## Stage: {{stage}}\n\
{{#if stage_description}}{{stage_description}}\n{{/if}}\
\nYou are working on branch {{branch}} as part of the {{workflow}} workflow. \
Complete only this stage and report what you did.\n";

#[derive(Serialize)]
struct PromptContext<'a> {
    description: &'a str,
    acceptance_criteria: Option<&'a str>,
    stage: &'a str,
    stage_description: Option<&'a str>,
    workflow: &'a str,
    branch: &'a str,
}

/// Executes tasks through their workflow definitions
pub struct WorkflowExecutor {
    store: Arc<Store>,
    workflows: Arc<WorkflowLoader>,
    agents: Arc<AgentLoader>,
    transport: Arc<dyn AgentTransport>,
    workspace: Arc<dyn WorkspaceManager>,
    events: Arc<EventBus>,
    limits: LimitsConfig,
    recovery: SessionRecoveryConfig,
    context_window: u64,
    default_model: String,
    handlebars: Handlebars<'static>,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<Store>,
        workflows: Arc<WorkflowLoader>,
        agents: Arc<AgentLoader>,
        transport: Arc<dyn AgentTransport>,
        workspace: Arc<dyn WorkspaceManager>,
        events: Arc<EventBus>,
        config: &Config,
    ) -> Self {
        let mut handlebars = Handlebars::new();
        handlebars
            .register_template_string("stage-prompt", STAGE_PROMPT)
            .expect("builtin stage prompt template is valid");

        Self {
            store,
            workflows,
            agents,
            transport,
            workspace,
            events,
            limits: config.limits.clone(),
            recovery: config.daemon.session_recovery.clone(),
            context_window: config.llm.context_window,
            default_model: config.llm.model.clone(),
            handlebars,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn workflows(&self) -> &Arc<WorkflowLoader> {
        &self.workflows
    }

    pub fn max_resume_attempts(&self) -> u32 {
        self.recovery.max_resume_attempts
    }

    pub(crate) fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Run a task to a terminal or pause state
    ///
    /// Success means status=completed with `completed_at` set and
    /// `resume_attempts` zeroed. A pause writes a checkpoint and returns
    /// without error. Terminal failures set status=failed, emit
    /// `task:failed` once, and return the error to the caller.
    pub async fn execute_task(&self, task_id: &str, options: ExecuteOptions) -> Result<TaskOutcome, ExecError> {
        let task = self.store.require_task(task_id)?;
        if task.status == TaskStatus::Cancelled {
            return Err(ExecError::Cancelled(task_id.to_string()));
        }

        let workflow = self
            .workflows
            .get(&task.workflow)
            .ok_or_else(|| ExecError::WorkflowNotFound(task.workflow.clone()))?
            .clone();

        let emitter = self.events.emitter_for(task_id);
        self.store.update_task(
            task_id,
            &TaskPatch::new().status(TaskStatus::Planning).error(None).unpaused(),
        )?;
        emitter.task_started(&workflow.name);
        info!(task_id, workflow = %workflow.name, "Executing task");

        let mut start_stage = options.resume_from_stage.unwrap_or(0);
        loop {
            match self.run_workflow(task_id, &workflow, start_stage, &emitter).await {
                Ok(()) => {
                    self.complete_task(task_id, &emitter)?;
                    return Ok(TaskOutcome::Completed);
                }
                Err(err) => match err.disposition() {
                    ErrorDisposition::Pause(reason) => {
                        // run_workflow already checkpointed and paused
                        return Ok(TaskOutcome::Paused(reason));
                    }
                    ErrorDisposition::Fail => {
                        if matches!(err, ExecError::Cancelled(_)) {
                            return Ok(TaskOutcome::Cancelled);
                        }
                        self.fail_task(task_id, &err.to_string(), &emitter)?;
                        return Err(err);
                    }
                    ErrorDisposition::Retry => {
                        let current = self.store.require_task(task_id)?;
                        if !options.auto_retry || current.retry_count >= current.max_retries {
                            self.fail_task(task_id, &err.to_string(), &emitter)?;
                            return Err(err);
                        }

                        let attempt = current.retry_count;
                        self.store
                            .update_task(task_id, &TaskPatch::new().retry_count(attempt + 1))?;
                        self.store.add_log(&TaskLogEntry::new(
                            task_id,
                            LogLevel::Warn,
                            format!(
                                "Retrying after transient error (attempt {}/{}): {}",
                                attempt + 1,
                                current.max_retries,
                                err
                            ),
                        ))?;
                        tokio::time::sleep(self.limits.retry_backoff(attempt)).await;

                        // Stage side effects are not idempotent at the agent
                        // boundary; retries restart from the first stage.
                        start_stage = 0;
                    }
                },
            }
        }
    }

    /// Run stages from `from_index` in topological order
    async fn run_workflow(
        &self,
        task_id: &str,
        workflow: &WorkflowDef,
        from_index: usize,
        emitter: &EventEmitter,
    ) -> Result<(), ExecError> {
        let order = workflow
            .stage_order()
            .map_err(|e| ExecError::InvalidInput(e.to_string()))?;
        let total = order.len();
        let mut completed: Vec<String> = order
            .iter()
            .take(from_index.min(total))
            .map(|&i| workflow.stages[i].name.clone())
            .collect();

        for pos in from_index..total {
            let stage = &workflow.stages[order[pos]];

            let task = self.store.require_task(task_id)?;
            if task.status == TaskStatus::Cancelled {
                return Err(ExecError::Cancelled(task_id.to_string()));
            }

            emitter.stage_changed(&stage.name, pos, total);
            self.store.update_task(
                task_id,
                &TaskPatch::new()
                    .status(TaskStatus::InProgress)
                    .current_stage(Some(stage.name.clone())),
            )?;

            let (ws_path, container) = self.query_workspace(task_id).await;

            // Session-pressure gate before any transport call in the stage
            if self.recovery.enabled {
                let status = check_session_limit(
                    &task.conversation,
                    self.context_window,
                    self.recovery.context_window_threshold,
                );
                if status.recommendation.requires_pause() {
                    self.pause_task(
                        task_id,
                        Some(stage.name.as_str()),
                        pos,
                        PauseReason::SessionLimit,
                        Some(&status),
                        None,
                        &completed,
                        emitter,
                    )?;
                    return Err(ExecError::SessionLimitReached { status });
                }
            }

            match self
                .run_stage(task_id, &task, workflow, stage, ws_path, container, emitter)
                .await
            {
                Ok(()) => {}
                Err(err) => {
                    if let ErrorDisposition::Pause(reason) = err.disposition()
                        && reason != PauseReason::SessionLimit
                    {
                        self.pause_task(
                            task_id,
                            Some(stage.name.as_str()),
                            pos,
                            reason,
                            None,
                            err.resume_after_hint(),
                            &completed,
                            emitter,
                        )?;
                    }
                    return Err(err);
                }
            }

            completed.push(stage.name.clone());
            self.write_checkpoint(
                task_id,
                Some(stage.name.as_str()),
                pos + 1,
                ResumePoint::WorkflowContinue,
                None,
                None,
                &completed,
            )?;
        }

        Ok(())
    }

    /// Stream one agent invocation, accounting usage and relaying events
    async fn run_stage(
        &self,
        task_id: &str,
        task: &Task,
        workflow: &WorkflowDef,
        stage: &StageDef,
        ws_path: Option<String>,
        container: Option<String>,
        emitter: &EventEmitter,
    ) -> Result<(), ExecError> {
        let agent = self
            .agents
            .get(&stage.agent)
            .ok_or_else(|| ExecError::AgentNotFound(stage.agent.clone()))?;

        let invocation = self.build_invocation(task, workflow, stage, agent, ws_path, container)?;
        let model = invocation.model.clone();

        self.store.add_log(
            &TaskLogEntry::new(
                task_id,
                LogLevel::Info,
                format!("Running stage {} with agent {}", stage.name, agent.name),
            )
            .with_stage(&stage.name)
            .with_agent(&agent.name),
        )?;

        let (tx, mut rx) = mpsc::channel(64);
        let transport = self.transport.clone();
        let call_invocation = invocation.clone();
        let call = tokio::spawn(async move { transport.invoke(call_invocation, tx).await });

        let mut conversation = task.conversation.clone();
        let mut usage = task.usage;

        let stream_result: Result<(), ExecError> = loop {
            let Some(msg) = rx.recv().await else {
                break Ok(());
            };

            match msg {
                AgentMessage::Text { content } => {
                    emitter.agent_message(&stage.name, &agent.name, &content);
                    conversation.push(ConversationMessage::text("assistant", content));
                }
                AgentMessage::Thinking { content } => {
                    emitter.agent_thinking(&stage.name, &agent.name, &content);
                }
                AgentMessage::ToolUse { name, input } => {
                    emitter.agent_tool_use(&stage.name, &agent.name, &name, input.clone());
                    conversation.push(ConversationMessage {
                        role: "assistant".to_string(),
                        content: serde_json::json!({ "tool_use": { "name": name, "input": input } }),
                    });
                }
                AgentMessage::ToolResult { content } => {
                    emitter.agent_tool_result(&stage.name, &agent.name, content.clone());
                    conversation.push(ConversationMessage {
                        role: "user".to_string(),
                        content,
                    });
                }
                AgentMessage::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    let cost = cost_usd(&model, input_tokens, output_tokens);
                    usage.add(input_tokens, output_tokens, cost);
                    self.store.update_task(task_id, &TaskPatch::new().usage(usage))?;
                    emitter.usage_updated(usage);

                    // Budget is re-checked after every usage update, before
                    // any further agent message is relayed
                    if let Some(detail) = self.budget_violation(&usage) {
                        break Err(ExecError::BudgetExceeded {
                            task_id: task_id.to_string(),
                            detail,
                        });
                    }
                }
            }

            // Cooperative cancellation between messages
            if let Some(current) = self.store.get_task(task_id)?
                && current.status == TaskStatus::Cancelled
            {
                break Err(ExecError::Cancelled(task_id.to_string()));
            }
        };

        // Keep whatever the agent streamed, on every exit path
        self.store
            .update_task(task_id, &TaskPatch::new().conversation(conversation))?;

        match stream_result {
            Ok(()) => match call.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(transport_err)) => Err(ExecError::from(transport_err)),
                Err(join_err) => Err(ExecError::Transient(format!("Agent invocation aborted: {join_err}"))),
            },
            Err(err) => {
                call.abort();
                Err(err)
            }
        }
    }

    fn build_invocation(
        &self,
        task: &Task,
        workflow: &WorkflowDef,
        stage: &StageDef,
        agent: &AgentDef,
        ws_path: Option<String>,
        container: Option<String>,
    ) -> Result<AgentInvocation, ExecError> {
        let context = PromptContext {
            description: &task.description,
            acceptance_criteria: task.acceptance_criteria.as_deref(),
            stage: &stage.name,
            stage_description: stage.description.as_deref(),
            workflow: &workflow.name,
            branch: &task.branch_name,
        };
        let prompt = self
            .handlebars
            .render("stage-prompt", &context)
            .map_err(|e| ExecError::InvalidInput(format!("Failed to render stage prompt: {e}")))?;

        let mut env = HashMap::new();
        env.insert("APEX_TASK_ID".to_string(), task.id.clone());
        env.insert("APEX_PROJECT".to_string(), task.project_path.clone());
        if let Some(container) = container.filter(|c| !c.is_empty()) {
            env.insert("APEX_CONTAINER_ID".to_string(), container);
        }
        if let Some(path) = ws_path.as_ref().filter(|p| !p.is_empty()) {
            env.insert("APEX_WORKSPACE_PATH".to_string(), path.clone());
        }

        let cwd = ws_path
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&task.project_path));

        let model = if agent.model.is_empty() {
            self.default_model.clone()
        } else {
            agent.model.clone()
        };

        Ok(AgentInvocation {
            system_prompt: agent.system_prompt.clone(),
            prompt,
            model,
            env,
            cwd,
            max_turns: self.limits.max_turns,
        })
    }

    /// Workspace queries are defensive: errors, None, and empty strings all
    /// mean "no workspace"
    async fn query_workspace(&self, task_id: &str) -> (Option<String>, Option<String>) {
        let path = match self.workspace.workspace_path(task_id).await {
            Ok(Some(p)) if !p.is_empty() => Some(p),
            Ok(_) => None,
            Err(e) => {
                warn!(task_id, error = %e, "Workspace path query failed; using project path");
                None
            }
        };
        let container = match self.workspace.container_id(task_id).await {
            Ok(Some(c)) if !c.is_empty() => Some(c),
            Ok(_) => None,
            Err(e) => {
                warn!(task_id, error = %e, "Container query failed");
                None
            }
        };
        (path, container)
    }

    fn budget_violation(&self, usage: &TaskUsage) -> Option<String> {
        if let Some(max_tokens) = self.limits.max_tokens_per_task
            && usage.total_tokens > max_tokens
        {
            return Some(format!("total tokens {} over cap {}", usage.total_tokens, max_tokens));
        }
        if let Some(max_cost) = self.limits.max_cost_per_task
            && usage.estimated_cost > max_cost
        {
            return Some(format!(
                "estimated cost ${:.2} over cap ${:.2}",
                usage.estimated_cost, max_cost
            ));
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn pause_task(
        &self,
        task_id: &str,
        stage: Option<&str>,
        stage_index: usize,
        reason: PauseReason,
        session_status: Option<&SessionLimitStatus>,
        resume_after: Option<i64>,
        completed: &[String],
        emitter: &EventEmitter,
    ) -> Result<(), ExecError> {
        self.write_checkpoint(
            task_id,
            stage,
            stage_index,
            ResumePoint::StageStart,
            Some(reason),
            session_status,
            completed,
        )?;
        self.store
            .update_task(task_id, &TaskPatch::new().paused(reason, resume_after))?;
        self.store.add_log(&TaskLogEntry::new(
            task_id,
            LogLevel::Warn,
            format!("Task paused ({reason})"),
        ))?;
        emitter.task_paused(reason);
        info!(task_id, %reason, "Task paused");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_checkpoint(
        &self,
        task_id: &str,
        stage: Option<&str>,
        stage_index: usize,
        resume_point: ResumePoint,
        pause_reason: Option<PauseReason>,
        session_status: Option<&SessionLimitStatus>,
        completed: &[String],
    ) -> Result<Checkpoint, ExecError> {
        let task = self.store.require_task(task_id)?;

        let mut metadata = CheckpointMetadata {
            pause_reason,
            resume_point: Some(resume_point),
            ..Default::default()
        };
        metadata.completed_stages = completed.to_vec();
        if resume_point == ResumePoint::StageStart
            && let Some(stage) = stage
        {
            metadata.in_progress_stages = vec![stage.to_string()];
        }
        if let Some(status) = session_status {
            metadata.session_limit_status =
                Some(serde_json::to_value(status).map_err(|e| ExecError::Store(e.into()))?);
        }

        let cp = Checkpoint {
            task_id: task_id.to_string(),
            checkpoint_id: ids::checkpoint_id(),
            stage: stage.map(|s| s.to_string()),
            stage_index,
            conversation_state: Some(
                serde_json::to_value(&task.conversation).map_err(|e| ExecError::Store(e.into()))?,
            ),
            metadata,
            created_at: now_ms(),
        };
        self.store.save_checkpoint(&cp)?;
        debug!(task_id, checkpoint_id = %cp.checkpoint_id, stage_index, "Wrote checkpoint");
        Ok(cp)
    }

    fn complete_task(&self, task_id: &str, emitter: &EventEmitter) -> Result<(), ExecError> {
        self.store.update_task(
            task_id,
            &TaskPatch::new()
                .status(TaskStatus::Completed)
                .completed_at(Some(now_ms()))
                .resume_attempts(0)
                .current_stage(None)
                .unpaused(),
        )?;
        emitter.task_completed();
        info!(task_id, "Task completed");
        Ok(())
    }

    fn fail_task(&self, task_id: &str, error: &str, emitter: &EventEmitter) -> Result<(), ExecError> {
        self.store.update_task(
            task_id,
            &TaskPatch::new()
                .status(TaskStatus::Failed)
                .error(Some(error.to_string())),
        )?;
        self.store
            .add_log(&TaskLogEntry::new(task_id, LogLevel::Error, error))?;
        emitter.task_failed(error);
        warn!(task_id, error, "Task failed");
        Ok(())
    }

    /// Run up to `max_concurrent` tasks in parallel
    ///
    /// Failures are captured per task and never cancel siblings.
    pub async fn execute_tasks_concurrently(
        self: &Arc<Self>,
        task_ids: &[String],
        max_concurrent: usize,
    ) -> HashMap<String, TaskExecResult> {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut join_set = JoinSet::new();

        for task_id in task_ids {
            let executor = self.clone();
            let semaphore = semaphore.clone();
            let task_id = task_id.clone();
            join_set.spawn(async move {
                // The semaphore is never closed, so acquisition cannot fail
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let result = executor.execute_task(&task_id, ExecuteOptions::default()).await;
                (task_id, result)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((task_id, Ok(TaskOutcome::Completed))) => {
                    results.insert(task_id, TaskExecResult {
                        success: true,
                        error: None,
                    });
                }
                Ok((task_id, Ok(_))) => {
                    results.insert(task_id, TaskExecResult {
                        success: false,
                        error: None,
                    });
                }
                Ok((task_id, Err(err))) => {
                    results.insert(task_id, TaskExecResult {
                        success: false,
                        error: Some(err.to_string()),
                    });
                }
                Err(join_err) => {
                    warn!(error = %join_err, "Concurrent task worker aborted");
                }
            }
        }
        results
    }

    /// Resume a paused task from its latest (or a named) checkpoint
    ///
    /// Counts the attempt first: once `resume_attempts` passes the cap the
    /// task is failed with a decomposition suggestion and `false` returned.
    /// A failure during the resumed run re-pauses under the prior reason so
    /// the task stays resumable until the cap trips.
    pub async fn resume_task(&self, task_id: &str, checkpoint_id: Option<&str>) -> Result<bool, ExecError> {
        let task = self.store.require_task(task_id)?;
        if task.status == TaskStatus::Cancelled {
            return Err(ExecError::Cancelled(task_id.to_string()));
        }

        let cp = match checkpoint_id {
            Some(cid) => self
                .store
                .get_checkpoint(task_id, cid)?
                .ok_or_else(|| ExecError::CheckpointNotFound(cid.to_string()))?,
            None => self
                .store
                .get_latest_checkpoint(task_id)?
                .ok_or_else(|| ExecError::CheckpointNotFound(format!("no checkpoints for {task_id}")))?,
        };

        let attempts = task.resume_attempts + 1;
        self.store
            .update_task(task_id, &TaskPatch::new().resume_attempts(attempts))?;

        let emitter = self.events.emitter_for(task_id);
        let max = self.recovery.max_resume_attempts;
        if attempts > max {
            let msg = format!(
                "Maximum resume attempts exceeded ({attempts}/{max}). \
                 Consider breaking the task into smaller subtasks."
            );
            self.fail_task(task_id, &msg, &emitter)?;
            return Ok(false);
        }

        let workflow = self
            .workflows
            .get(&task.workflow)
            .ok_or_else(|| ExecError::WorkflowNotFound(task.workflow.clone()))?
            .clone();
        let prior_reason = task.pause_reason;

        emitter.session_resumed(&cp.checkpoint_id, cp.stage_index);
        info!(task_id, checkpoint_id = %cp.checkpoint_id, stage_index = cp.stage_index, attempts, "Resuming task");
        self.store.update_task(
            task_id,
            &TaskPatch::new().status(TaskStatus::Planning).unpaused(),
        )?;

        if cp.stage_index >= workflow.stages.len() {
            // Everything already ran; only the terminal transition was lost
            self.complete_task(task_id, &emitter)?;
            return Ok(true);
        }

        match self.run_workflow(task_id, &workflow, cp.stage_index, &emitter).await {
            Ok(()) => {
                self.complete_task(task_id, &emitter)?;
                Ok(true)
            }
            Err(err) => match err.disposition() {
                ErrorDisposition::Pause(_) => Ok(false),
                _ if matches!(err, ExecError::Cancelled(_)) => Ok(false),
                _ => {
                    let reason = cp.metadata.pause_reason.or(prior_reason).unwrap_or(PauseReason::Manual);
                    self.store.add_log(&TaskLogEntry::new(
                        task_id,
                        LogLevel::Warn,
                        format!("Resume attempt {attempts} failed: {err}"),
                    ))?;
                    self.store
                        .update_task(task_id, &TaskPatch::new().paused(reason, None))?;
                    emitter.task_paused(reason);
                    Ok(false)
                }
            },
        }
    }

    /// Cancel a task; terminal tasks are refused
    ///
    /// The workspace is asked to release the task's resources; a cleanup
    /// failure is logged but does not change the return value.
    pub async fn cancel_task(&self, task_id: &str) -> Result<bool, ExecError> {
        let task = self.store.require_task(task_id)?;
        if task.is_terminal() {
            return Ok(false);
        }

        self.store
            .update_task(task_id, &TaskPatch::new().status(TaskStatus::Cancelled))?;
        info!(task_id, "Task cancelled");

        if let Err(e) = self.workspace.release_workspace(task_id).await {
            warn!(task_id, error = %e, "Workspace release failed after cancel");
            let _ = self.store.add_log(
                &TaskLogEntry::new(task_id, LogLevel::Warn, format!("Workspace release failed: {e}"))
                    .with_component("workspace-cleanup"),
            );
        }
        Ok(true)
    }
}
