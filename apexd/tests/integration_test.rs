//! Integration tests for the APEX daemon
//!
//! End-to-end scenarios over the orchestrator with an in-memory store and
//! a scripted agent transport.

use std::sync::Arc;
use std::time::Duration;

use apexd::config::Config;
use apexd::events::Event;
use apexd::executor::ExecuteOptions;
use apexd::orchestrator::{CreateTaskRequest, Orchestrator, OrchestratorOptions, PrRequest};
use apexd::transport::{AgentMessage, ScriptStep, ScriptedTransport};
use apexd::workspace::NoWorkspaceManager;
use apexstore::{
    Checkpoint, CheckpointMetadata, ConversationMessage, PauseReason, Priority, ResumePoint, Store, TaskPatch,
    TaskStatus, now_ms,
};

fn test_config() -> Config {
    let mut config = Config::default();
    config.limits.retry_delay_ms = 1;
    config.limits.retry_backoff_factor = 1.0;
    config.daemon.poll_interval_ms = 10;
    // Wall-time independence: capacity gating is exercised in unit tests
    config.daemon.time_based_usage.enabled = false;
    config
}

async fn orchestrator(config: Config, script: Vec<ScriptStep>) -> (Arc<Orchestrator>, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::new(script));
    let mut options = OrchestratorOptions::new("/repo");
    options.config = Some(config);
    options.store = Some(Arc::new(Store::open_in_memory().unwrap()));
    options.transport = Some(transport.clone());
    options.workspace = Some(Arc::new(NoWorkspaceManager));
    let orch = Orchestrator::initialize(options).await.unwrap();
    (orch, transport)
}

/// A stage that yields two text messages and two usage reports
fn stage_messages() -> ScriptStep {
    ScriptStep::Messages(vec![
        AgentMessage::Text {
            content: "analyzing the task".to_string(),
        },
        AgentMessage::Usage {
            input_tokens: 50,
            output_tokens: 25,
        },
        AgentMessage::Text {
            content: "finished this stage".to_string(),
        },
        AgentMessage::Usage {
            input_tokens: 50,
            output_tokens: 25,
        },
    ])
}

async fn wait_for<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// =============================================================================
// E1: Linear workflow completes
// =============================================================================

#[tokio::test]
async fn test_linear_workflow_completes_through_runner() {
    let (orch, transport) = orchestrator(test_config(), vec![stage_messages(), stage_messages()]).await;
    let mut rx = orch.subscribe();

    let task = orch
        .create_task(CreateTaskRequest::new("Implement the login feature"))
        .unwrap();
    orch.start();

    let orch2 = orch.clone();
    let id = task.id.clone();
    wait_for(
        || orch2.get_task(&id).unwrap().unwrap().status == TaskStatus::Completed,
        "task to complete",
    )
    .await;
    orch.shutdown().await;

    let task = orch.get_task(&task.id).unwrap().unwrap();
    assert_eq!(task.usage.input_tokens, 200);
    assert_eq!(task.usage.output_tokens, 100);
    assert!(task.completed_at.is_some());
    assert_eq!(transport.call_count(), 2);

    let mut started = 0;
    let mut completed = 0;
    let mut messages = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            Event::TaskStarted { .. } => started += 1,
            Event::TaskCompleted { .. } => completed += 1,
            Event::AgentMessage { .. } => messages += 1,
            _ => {}
        }
    }
    assert_eq!(started, 1, "exactly one task:started");
    assert_eq!(completed, 1, "exactly one task:completed");
    assert!(messages >= 4, "at least four agent:message events");
}

// =============================================================================
// E2: Retry on transient then succeed
// =============================================================================

#[tokio::test]
async fn test_transient_failure_retried_then_succeeds() {
    let (orch, transport) = orchestrator(test_config(), vec![
        ScriptStep::Fail("Network timeout".to_string()),
        stage_messages(),
        stage_messages(),
    ])
    .await;
    let task = orch.create_task(CreateTaskRequest::new("Flaky network task")).unwrap();

    orch.execute_task(&task.id, ExecuteOptions::default()).await.unwrap();

    let task = orch.get_task(&task.id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(transport.call_count(), 3, "both attempts observed");
}

// =============================================================================
// E3: Non-retryable error
// =============================================================================

#[tokio::test]
async fn test_non_retryable_error_fails_without_retry() {
    let (orch, transport) = orchestrator(test_config(), vec![ScriptStep::Fail(
        "Task exceeded budget limit".to_string(),
    )])
    .await;
    let task = orch.create_task(CreateTaskRequest::new("Doomed task")).unwrap();
    let mut rx = orch.subscribe();

    let err = orch
        .execute_task(&task.id, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exceeded budget"));

    let task = orch.get_task(&task.id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("exceeded budget"));
    assert_eq!(transport.call_count(), 1, "no retry");

    let mut failed = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, Event::TaskFailed { .. }) {
            failed += 1;
        }
    }
    assert_eq!(failed, 1, "task:failed emitted exactly once");
}

// =============================================================================
// E4: Pause on session limit
// =============================================================================

#[tokio::test]
async fn test_session_limit_pauses_with_checkpoint() {
    let mut config = test_config();
    config.llm.context_window = 75_000;
    let (orch, transport) = orchestrator(config, vec![stage_messages(), stage_messages()]).await;

    let task = orch.create_task(CreateTaskRequest::new("Long-running task")).unwrap();
    // ~60k estimated tokens against a 75k window crosses the 0.8 threshold
    orch.store()
        .update_task(
            &task.id,
            &TaskPatch::new().conversation(vec![ConversationMessage::text("assistant", "x".repeat(240_000))]),
        )
        .unwrap();
    let mut rx = orch.subscribe();

    orch.execute_task(&task.id, ExecuteOptions::default()).await.unwrap();

    assert_eq!(transport.call_count(), 0, "paused before any transport call");
    let task = orch.get_task(&task.id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.pause_reason, Some(PauseReason::SessionLimit));

    let cp = orch.get_latest_checkpoint(&task.id).unwrap().unwrap();
    assert_eq!(cp.metadata.pause_reason, Some(PauseReason::SessionLimit));
    assert_eq!(cp.metadata.resume_point, Some(ResumePoint::StageStart));
    let status = cp.metadata.session_limit_status.unwrap();
    let recommendation = status["recommendation"].as_str().unwrap();
    assert!(recommendation == "checkpoint" || recommendation == "handoff");

    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(event, Event::TaskCompleted { .. }),
            "no task:completed for a paused task"
        );
    }
}

// =============================================================================
// E5: Dependency unblocking
// =============================================================================

#[tokio::test]
async fn test_dependency_unblocking_order() {
    let (orch, _) = orchestrator(test_config(), vec![]).await;
    let store = orch.store();

    let a = orch
        .create_task(CreateTaskRequest {
            description: "Groundwork".to_string(),
            priority: Some(Priority::Low),
            ..Default::default()
        })
        .unwrap();
    let b = orch
        .create_task(CreateTaskRequest {
            description: "Urgent follow-up".to_string(),
            priority: Some(Priority::Urgent),
            depends_on: vec![a.id.clone()],
            ..Default::default()
        })
        .unwrap();

    // At rest the blocked urgent task is never returned
    let next = store.get_next_queued_task().unwrap().unwrap();
    assert_eq!(next.id, a.id);
    let blocking: Vec<String> = store.get_blocking_tasks(&b.id).unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(blocking, vec![a.id.clone()]);

    store
        .update_task(
            &a.id,
            &TaskPatch::new().status(TaskStatus::Completed).completed_at(Some(now_ms())),
        )
        .unwrap();

    let next = store.get_next_queued_task().unwrap().unwrap();
    assert_eq!(next.id, b.id);
    assert!(store.get_blocking_tasks(&b.id).unwrap().is_empty());
}

// =============================================================================
// E6: Resume exhaustion
// =============================================================================

#[tokio::test]
async fn test_resume_exhaustion_fails_with_diagnostic() {
    let (orch, _) = orchestrator(test_config(), vec![
        ScriptStep::Fail("Invalid input: agent session corrupt".to_string()),
        ScriptStep::Fail("Invalid input: agent session corrupt".to_string()),
        ScriptStep::Fail("Invalid input: agent session corrupt".to_string()),
    ])
    .await;

    let task = orch.create_task(CreateTaskRequest::new("Fragile task")).unwrap();
    orch.store()
        .update_task(&task.id, &TaskPatch::new().paused(PauseReason::Budget, None))
        .unwrap();
    orch.store()
        .save_checkpoint(&Checkpoint {
            task_id: task.id.clone(),
            checkpoint_id: "cp_fragile".to_string(),
            stage: Some("planning".to_string()),
            stage_index: 0,
            conversation_state: None,
            metadata: CheckpointMetadata {
                pause_reason: Some(PauseReason::Budget),
                resume_point: Some(ResumePoint::StageStart),
                ..Default::default()
            },
            created_at: now_ms(),
        })
        .unwrap();

    for expected in 1..=3u32 {
        assert!(!orch.resume_task(&task.id, None).await.unwrap());
        let current = orch.get_task(&task.id).unwrap().unwrap();
        assert_eq!(current.resume_attempts, expected);
        assert_eq!(current.status, TaskStatus::Paused);
    }

    assert!(!orch.resume_task(&task.id, None).await.unwrap());
    let current = orch.get_task(&task.id).unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::Failed);
    assert!(
        current
            .error
            .unwrap()
            .contains("Maximum resume attempts exceeded (4/3)")
    );
}

// =============================================================================
// Queue ordering through the runner
// =============================================================================

#[tokio::test]
async fn test_priority_order_respected_by_runner() {
    let mut config = test_config();
    config.limits.max_concurrent_tasks = 1;
    let (orch, _) = orchestrator(config, vec![
        stage_messages(),
        stage_messages(),
        stage_messages(),
        stage_messages(),
    ])
    .await;

    let low = orch
        .create_task(CreateTaskRequest {
            description: "Low priority chore".to_string(),
            priority: Some(Priority::Low),
            ..Default::default()
        })
        .unwrap();
    let urgent = orch
        .create_task(CreateTaskRequest {
            description: "Urgent fire".to_string(),
            priority: Some(Priority::Urgent),
            ..Default::default()
        })
        .unwrap();

    orch.start();
    let orch2 = orch.clone();
    let (low_id, urgent_id) = (low.id.clone(), urgent.id.clone());
    wait_for(
        || {
            orch2.get_task(&low_id).unwrap().unwrap().status == TaskStatus::Completed
                && orch2.get_task(&urgent_id).unwrap().unwrap().status == TaskStatus::Completed
        },
        "both tasks to complete",
    )
    .await;
    orch.shutdown().await;

    let low = orch.get_task(&low.id).unwrap().unwrap();
    let urgent = orch.get_task(&urgent.id).unwrap().unwrap();
    assert!(
        urgent.completed_at.unwrap() <= low.completed_at.unwrap(),
        "urgent ran first despite being created second"
    );
}

// =============================================================================
// Cancellation terminality
// =============================================================================

#[tokio::test]
async fn test_cancellation_is_terminal() {
    let (orch, _) = orchestrator(test_config(), vec![]).await;
    let task = orch.create_task(CreateTaskRequest::new("Cancel me")).unwrap();

    assert!(orch.cancel_task(&task.id).await.unwrap());
    assert_eq!(orch.get_task(&task.id).unwrap().unwrap().status, TaskStatus::Cancelled);
    assert!(!orch.cancel_task(&task.id).await.unwrap(), "second cancel refused");

    let err = orch.execute_task(&task.id, ExecuteOptions::default()).await.unwrap_err();
    assert!(err.to_string().contains("was cancelled"));
}

// =============================================================================
// PR operations degrade gracefully
// =============================================================================

#[tokio::test]
async fn test_pr_creation_fails_cleanly_without_github() {
    let (orch, _) = orchestrator(test_config(), vec![]).await;
    let task = orch.create_task(CreateTaskRequest::new("Ship it")).unwrap();

    let outcome = orch.create_pull_request(&task.id, PrRequest::default()).await;
    assert!(!outcome.success);
    assert!(outcome.url.is_none());
    assert!(outcome.error.is_some());

    let task = orch.get_task(&task.id).unwrap().unwrap();
    assert!(task.pr_url.is_none());
}
