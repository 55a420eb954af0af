//! Task runner - the scheduler's long-running admission loop
//!
//! Polls the store for ready work, asks the capacity monitor whether tasks
//! may run, resumes eligible paused tasks first, and launches workers up to
//! the concurrency cap. Admission order is the store's priority+age order;
//! a blocked urgent task never preempts a ready lower-priority one because
//! the queue query never returns blocked tasks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Local;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use apexstore::{Priority, Store, TaskPatch, TaskStatus};

use crate::capacity::CapacityMonitor;
use crate::config::Config;
use crate::executor::{ExecuteOptions, WorkflowExecutor};

/// Long-running scheduler over the store's queue
pub struct TaskRunner {
    store: Arc<Store>,
    executor: Arc<WorkflowExecutor>,
    capacity: Arc<CapacityMonitor>,
    max_concurrent: usize,
    poll_interval: Duration,
    max_resume_attempts: u32,
    running: Mutex<HashSet<String>>,
    active: AtomicBool,
    /// Wakes the admission loop early (capacity restored, slot freed)
    wake: Notify,
    /// Signals worker completion to `wait_for_all_tasks`
    done: Notify,
}

impl TaskRunner {
    pub fn new(
        store: Arc<Store>,
        executor: Arc<WorkflowExecutor>,
        capacity: Arc<CapacityMonitor>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            executor,
            capacity,
            max_concurrent: config.limits.max_concurrent_tasks,
            poll_interval: Duration::from_millis(config.daemon.poll_interval_ms),
            max_resume_attempts: config.daemon.session_recovery.max_resume_attempts,
            running: Mutex::new(HashSet::new()),
            active: AtomicBool::new(false),
            wake: Notify::new(),
            done: Notify::new(),
        }
    }

    /// Spawn the admission loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        // Flipped here, not inside the spawned task, so a stop() racing the
        // spawn is never overwritten
        self.active.store(true, Ordering::SeqCst);
        let runner = self.clone();
        tokio::spawn(async move { runner.run().await })
    }

    /// The admission loop; returns after `stop()`
    pub async fn run(self: Arc<Self>) {
        info!(max_concurrent = self.max_concurrent, "Task runner started");

        // A capacity restoration triggers one admission cycle immediately
        let weak: Weak<TaskRunner> = Arc::downgrade(&self);
        let subscription = self.capacity.on_capacity_restored(move |_| {
            if let Some(runner) = weak.upgrade() {
                runner.wake.notify_one();
            }
        });

        while self.active.load(Ordering::SeqCst) {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.wake.notified() => {}
            }
        }

        self.capacity.unsubscribe(subscription);
        info!("Task runner stopped");
    }

    /// One admission cycle
    async fn tick(self: &Arc<Self>) {
        if self.capacity.evaluate(Local::now()) {
            debug!("Capacity monitor says pause; skipping admission");
            return;
        }

        if self.free_slots() == 0 {
            return;
        }

        // Eligible paused tasks are re-admitted ahead of the queue
        match self.store.get_paused_tasks_for_resume() {
            Ok(paused) => {
                for task in paused {
                    if self.free_slots() == 0 {
                        break;
                    }
                    if task.resume_attempts >= self.max_resume_attempts || self.is_task_running(&task.id) {
                        continue;
                    }
                    self.launch_resume(task.id);
                }
            }
            Err(e) => warn!(error = %e, "Paused-task query failed"),
        }

        while self.free_slots() > 0 {
            let next = match self.store.get_next_queued_task() {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Queue query failed");
                    break;
                }
            };
            if self.is_task_running(&next.id) {
                break;
            }

            // Mark queued before the worker spawns so the same pending row
            // cannot be admitted twice within one tick
            if let Err(e) = self
                .store
                .update_task(&next.id, &TaskPatch::new().status(TaskStatus::Queued))
            {
                warn!(task_id = %next.id, error = %e, "Failed to mark task queued");
                break;
            }
            self.launch_execute(next.id, next.priority);
        }
    }

    fn launch_execute(self: &Arc<Self>, task_id: String, priority: Priority) {
        debug!(%task_id, %priority, "Admitting task");
        self.running.lock().expect("runner lock poisoned").insert(task_id.clone());

        let runner = self.clone();
        tokio::spawn(async move {
            match runner.executor.execute_task(&task_id, ExecuteOptions::default()).await {
                Ok(outcome) => debug!(%task_id, ?outcome, "Worker finished"),
                // The executor already persisted the failure; just log it
                Err(e) => debug!(%task_id, error = %e, "Worker finished with error"),
            }
            runner.finish(&task_id);
        });
    }

    fn launch_resume(self: &Arc<Self>, task_id: String) {
        debug!(%task_id, "Resuming paused task");
        self.running.lock().expect("runner lock poisoned").insert(task_id.clone());

        let runner = self.clone();
        tokio::spawn(async move {
            match runner.executor.resume_task(&task_id, None).await {
                Ok(resumed) => debug!(%task_id, resumed, "Resume finished"),
                Err(e) => warn!(%task_id, error = %e, "Resume failed"),
            }
            runner.finish(&task_id);
        });
    }

    fn finish(&self, task_id: &str) {
        self.running.lock().expect("runner lock poisoned").remove(task_id);
        self.done.notify_waiters();
        // A freed slot may unblock the next admission
        self.wake.notify_one();
    }

    fn free_slots(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.running.lock().expect("runner lock poisoned").len())
    }

    /// Prevent new admissions; running workers keep going
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Await every currently running task reaching a terminal or paused
    /// outcome. No timeout is enforced at this layer.
    pub async fn wait_for_all_tasks(&self) {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.running_task_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    // === Observability ===

    pub fn running_task_count(&self) -> usize {
        self.running.lock().expect("runner lock poisoned").len()
    }

    pub fn running_task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .running
            .lock()
            .expect("runner lock poisoned")
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn is_task_running(&self, task_id: &str) -> bool {
        self.running.lock().expect("runner lock poisoned").contains(task_id)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.max_concurrent
    }
}
