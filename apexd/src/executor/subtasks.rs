//! Task decomposition and subtask execution
//!
//! Children inherit the parent's workflow, priority and branch. Dependency
//! references in a decomposition spec are resolved by description against
//! the siblings created in the same call. Child usage aggregates onto the
//! parent as children reach a terminal state.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use apexstore::{Priority, SubtaskStrategy, Task, TaskPatch, TaskStatus};

use crate::events::Event;
use crate::ids;

use super::engine::{ExecuteOptions, TaskOutcome, WorkflowExecutor};
use super::error::ExecError;

/// One child task in a decomposition request
#[derive(Debug, Clone, Default)]
pub struct SubtaskSpec {
    pub description: String,
    pub acceptance_criteria: Option<String>,
    /// Descriptions of siblings (from this call) this child depends on
    pub depends_on: Vec<String>,
    /// Override the inherited workflow
    pub workflow: Option<String>,
    /// Override the inherited priority
    pub priority: Option<Priority>,
}

impl SubtaskSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn depends_on(mut self, description: impl Into<String>) -> Self {
        self.depends_on.push(description.into());
        self
    }
}

impl WorkflowExecutor {
    /// Split a task into child tasks under the given strategy
    pub fn decompose_task(
        &self,
        parent_id: &str,
        specs: Vec<SubtaskSpec>,
        strategy: SubtaskStrategy,
    ) -> Result<Vec<Task>, ExecError> {
        let parent = self.store().require_task(parent_id)?;
        if specs.is_empty() {
            return Err(ExecError::InvalidInput("decomposition needs at least one subtask".to_string()));
        }

        let mut created: Vec<Task> = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut child = Task::new(
                ids::task_id(),
                &spec.description,
                spec.workflow.as_deref().unwrap_or(&parent.workflow),
                &parent.project_path,
                // Subtasks share the parent's stable branch
                &parent.branch_name,
            )
            .with_parent(parent_id)
            .with_priority(spec.priority.unwrap_or(parent.priority));
            child.acceptance_criteria = spec.acceptance_criteria;

            for dep_description in &spec.depends_on {
                match created.iter().find(|sibling| &sibling.description == dep_description) {
                    Some(sibling) => child.depends_on.push(sibling.id.clone()),
                    None => {
                        warn!(parent_id, dependency = %dep_description, "Unresolved subtask dependency reference");
                    }
                }
            }

            self.store().create_task(&child)?;
            self.events().emit(Event::SubtaskCreated {
                task_id: parent_id.to_string(),
                subtask_id: child.id.clone(),
                description: child.description.clone(),
            });
            created.push(child);
        }

        let child_ids: Vec<String> = created.iter().map(|t| t.id.clone()).collect();
        self.store()
            .update_task(parent_id, &TaskPatch::new().subtasks(child_ids.clone(), strategy))?;
        self.events().emit(Event::TaskDecomposed {
            task_id: parent_id.to_string(),
            subtask_ids: child_ids,
            strategy,
        });

        info!(parent_id, count = created.len(), ?strategy, "Decomposed task");
        Ok(created)
    }

    /// Run a parent's subtasks per the stored strategy
    ///
    /// Returns true iff every subtask completed; a paused or failed child
    /// leaves the parent unfinished. Child usage merges onto the parent as
    /// children reach a terminal state.
    pub async fn execute_subtasks(self: &Arc<Self>, parent_id: &str) -> Result<bool, ExecError> {
        let parent = self.store().require_task(parent_id)?;
        let strategy = parent.subtask_strategy.unwrap_or_default();
        let child_ids = parent.subtask_ids.clone();
        if child_ids.is_empty() {
            return Err(ExecError::InvalidInput(format!("task {parent_id} has no subtasks")));
        }

        let completed_before: HashSet<String> = self.completed_children(&child_ids)?;

        match strategy {
            SubtaskStrategy::Sequential => {
                for child_id in &child_ids {
                    let child = self.store().require_task(child_id)?;
                    if child.status == TaskStatus::Completed {
                        continue;
                    }
                    match self.execute_task(child_id, ExecuteOptions::default()).await {
                        Ok(TaskOutcome::Completed) => {}
                        // Order matters: a non-complete child stops the run
                        Ok(_) => break,
                        Err(_) => break,
                    }
                }
            }
            SubtaskStrategy::Parallel => {
                let pending: Vec<String> = child_ids
                    .iter()
                    .filter(|id| !completed_before.contains(*id))
                    .cloned()
                    .collect();
                self.execute_tasks_concurrently(&pending, self.limits().max_concurrent_tasks)
                    .await;
            }
            SubtaskStrategy::DependencyBased => loop {
                let mut ready = Vec::new();
                for child_id in &child_ids {
                    let child = self.store().require_task(child_id)?;
                    if child.status == TaskStatus::Pending && self.store().is_task_ready(child_id)? {
                        ready.push(child_id.clone());
                    }
                }
                if ready.is_empty() {
                    break;
                }
                self.execute_tasks_concurrently(&ready, self.limits().max_concurrent_tasks)
                    .await;
            },
        }

        // Settle events and aggregate usage for children that just finished
        let mut parent_usage = self.store().require_task(parent_id)?.usage;
        let mut all_completed = true;
        for child_id in &child_ids {
            let child = self.store().require_task(child_id)?;
            match child.status {
                TaskStatus::Completed => {
                    if !completed_before.contains(child_id) {
                        parent_usage.merge(&child.usage);
                        self.events().emit(Event::SubtaskCompleted {
                            task_id: parent_id.to_string(),
                            subtask_id: child_id.clone(),
                        });
                    }
                }
                TaskStatus::Failed => {
                    all_completed = false;
                    self.events().emit(Event::SubtaskFailed {
                        task_id: parent_id.to_string(),
                        subtask_id: child_id.clone(),
                        error: child.error.unwrap_or_else(|| "subtask failed".to_string()),
                    });
                }
                _ => {
                    all_completed = false;
                }
            }
        }
        self.store()
            .update_task(parent_id, &TaskPatch::new().usage(parent_usage))?;

        Ok(all_completed)
    }

    fn completed_children(&self, child_ids: &[String]) -> Result<HashSet<String>, ExecError> {
        let mut completed = HashSet::new();
        for id in child_ids {
            if let Some(task) = self.store().get_task(id)?
                && task.status == TaskStatus::Completed
            {
                completed.insert(id.clone());
            }
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::defs::{AgentLoader, WorkflowLoader};
    use crate::events::{EventBus, create_event_bus};
    use crate::transport::{AgentMessage, ScriptStep, ScriptedTransport};
    use crate::workspace::NoWorkspaceManager;
    use apexstore::Store;

    fn harness(script: Vec<ScriptStep>) -> (Arc<Store>, Arc<WorkflowExecutor>, Arc<EventBus>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let events = create_event_bus();
        let mut config = Config::default();
        config.limits.retry_delay_ms = 1;
        let executor = Arc::new(WorkflowExecutor::new(
            store.clone(),
            Arc::new(WorkflowLoader::builtin_only().unwrap()),
            Arc::new(AgentLoader::builtin_only().unwrap()),
            Arc::new(ScriptedTransport::new(script)),
            Arc::new(NoWorkspaceManager),
            events.clone(),
            &config,
        ));
        (store, executor, events)
    }

    fn seed_parent(store: &Store) -> Task {
        let task = Task::new(
            "task_0_parent",
            "Build the auth feature",
            "feature",
            "/repo",
            "apex/build-the-auth-feature",
        )
        .with_priority(Priority::High);
        store.create_task(&task).unwrap();
        task
    }

    fn stage() -> ScriptStep {
        ScriptStep::Messages(vec![
            AgentMessage::Text {
                content: "ok".to_string(),
            },
            AgentMessage::Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
        ])
    }

    #[tokio::test]
    async fn test_decompose_inherits_and_links() {
        let (store, executor, events) = harness(vec![]);
        seed_parent(&store);
        let mut rx = events.subscribe();

        let children = executor
            .decompose_task(
                "task_0_parent",
                vec![
                    SubtaskSpec::new("Add login endpoint"),
                    SubtaskSpec::new("Add logout endpoint").depends_on("Add login endpoint"),
                ],
                SubtaskStrategy::DependencyBased,
            )
            .unwrap();

        assert_eq!(children.len(), 2);
        for child in &children {
            assert_eq!(child.workflow, "feature");
            assert_eq!(child.priority, Priority::High);
            assert_eq!(child.branch_name, "apex/build-the-auth-feature");
            assert_eq!(child.parent_task_id.as_deref(), Some("task_0_parent"));
        }
        assert_eq!(children[1].depends_on, vec![children[0].id.clone()]);

        let parent = store.get_task("task_0_parent").unwrap().unwrap();
        assert_eq!(parent.subtask_ids.len(), 2);
        assert_eq!(parent.subtask_strategy, Some(SubtaskStrategy::DependencyBased));

        let mut channels = Vec::new();
        while let Ok(event) = rx.try_recv() {
            channels.push(event.channel());
        }
        assert_eq!(channels.iter().filter(|c| **c == "subtask:created").count(), 2);
        assert_eq!(channels.iter().filter(|c| **c == "task:decomposed").count(), 1);
    }

    #[tokio::test]
    async fn test_decompose_empty_specs_rejected() {
        let (store, executor, _) = harness(vec![]);
        seed_parent(&store);
        let err = executor
            .decompose_task("task_0_parent", vec![], SubtaskStrategy::Sequential)
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_execute_subtasks_sequential_all_complete() {
        // Two children, two stages each
        let (store, executor, events) = harness(vec![stage(), stage(), stage(), stage()]);
        seed_parent(&store);
        executor
            .decompose_task(
                "task_0_parent",
                vec![SubtaskSpec::new("First part"), SubtaskSpec::new("Second part")],
                SubtaskStrategy::Sequential,
            )
            .unwrap();
        let mut rx = events.subscribe();

        let all = executor.execute_subtasks("task_0_parent").await.unwrap();
        assert!(all);

        let parent = store.get_task("task_0_parent").unwrap().unwrap();
        // 2 children x 2 stages x (10 in + 5 out)
        assert_eq!(parent.usage.input_tokens, 40);
        assert_eq!(parent.usage.output_tokens, 20);

        let mut completions = 0;
        while let Ok(event) = rx.try_recv() {
            if event.channel() == "subtask:completed" {
                completions += 1;
            }
        }
        assert_eq!(completions, 2);
    }

    #[tokio::test]
    async fn test_execute_subtasks_paused_child_returns_false() {
        // First child's single call pauses on a rate limit
        let (store, executor, _) = harness(vec![ScriptStep::Fail("Rate limited".to_string())]);
        seed_parent(&store);
        let children = executor
            .decompose_task(
                "task_0_parent",
                vec![SubtaskSpec::new("First part"), SubtaskSpec::new("Second part")],
                SubtaskStrategy::Sequential,
            )
            .unwrap();

        let all = executor.execute_subtasks("task_0_parent").await.unwrap();
        assert!(!all);

        let first = store.get_task(&children[0].id).unwrap().unwrap();
        assert_eq!(first.status, TaskStatus::Paused);
        let second = store.get_task(&children[1].id).unwrap().unwrap();
        assert_eq!(second.status, TaskStatus::Pending, "sequential run stops at the pause");

        let parent = store.get_task("task_0_parent").unwrap().unwrap();
        assert_ne!(parent.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_execute_subtasks_dependency_based_order() {
        let (store, executor, _) = harness(vec![stage(), stage(), stage(), stage()]);
        seed_parent(&store);
        let children = executor
            .decompose_task(
                "task_0_parent",
                vec![
                    SubtaskSpec::new("Foundation"),
                    SubtaskSpec::new("Roof").depends_on("Foundation"),
                ],
                SubtaskStrategy::DependencyBased,
            )
            .unwrap();

        let all = executor.execute_subtasks("task_0_parent").await.unwrap();
        assert!(all);

        let foundation = store.get_task(&children[0].id).unwrap().unwrap();
        let roof = store.get_task(&children[1].id).unwrap().unwrap();
        assert_eq!(foundation.status, TaskStatus::Completed);
        assert_eq!(roof.status, TaskStatus::Completed);
        assert!(foundation.completed_at.unwrap() <= roof.completed_at.unwrap());
    }

    #[tokio::test]
    async fn test_execute_subtasks_without_decomposition_rejected() {
        let (store, executor, _) = harness(vec![]);
        seed_parent(&store);
        let err = executor.execute_subtasks("task_0_parent").await.unwrap_err();
        assert!(matches!(err, ExecError::InvalidInput(_)));
    }
}
