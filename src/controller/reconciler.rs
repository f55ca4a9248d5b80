use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::execution::ExecutionBackend;
use crate::events::{EventPublisher, FleetEvent};
use crate::shared::clock::Clock;
use crate::shared::config::ReconciliationConfig;
use crate::shared::models::constants::ERROR_CODE_RECONCILIATION_TIMEOUT;
use crate::shared::models::{ExecutionResult, Task, TaskError, TaskStatus};
use crate::shared::repository::{StuckCursor, TaskRepository};

/// Stuck tasks fetched per query. A tick walks every page.
const STUCK_PAGE_SIZE: usize = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationSummary {
    pub checked: usize,
    pub reconciled: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub errored: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Reconciled,
    TimedOut,
    Skipped,
    Errored,
}

/// Clears the in-flight flag when a tick ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Watchdog for tasks stuck in a non-terminal status.
///
/// A task older than `stuck_minutes` is re-synced against the execution
/// backend. Only past `timeout_minutes` is it force-failed, and then only
/// when it was never dispatched or the backend cannot be reached.
pub struct StaleTaskReconciler {
    config: ReconciliationConfig,
    tasks: Arc<dyn TaskRepository>,
    backend: Arc<dyn ExecutionBackend>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
}

impl StaleTaskReconciler {
    pub fn new(
        config: ReconciliationConfig,
        tasks: Arc<dyn TaskRepository>,
        backend: Arc<dyn ExecutionBackend>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            tasks,
            backend,
            publisher,
            clock,
            running: AtomicBool::new(false),
        }
    }

    /// Run one pass. Returns `None` when a previous pass is still running.
    pub async fn tick(&self) -> Option<ReconciliationSummary> {
        let Some(_guard) = InFlight::acquire(&self.running) else {
            debug!("Reconciliation already in progress; skipping this tick");
            return None;
        };

        let summary = match self.reconcile_stuck_tasks().await {
            Ok(summary) => summary,
            Err(e) => {
                error!("Error processing stale tasks: {:#}", e);
                ReconciliationSummary::default()
            }
        };

        if summary.checked > 0 {
            info!(
                "Reconciliation: checked={} reconciled={} timed_out={} skipped={} errored={}",
                summary.checked,
                summary.reconciled,
                summary.timed_out,
                summary.skipped,
                summary.errored
            );
        }
        Some(summary)
    }

    async fn reconcile_stuck_tasks(&self) -> Result<ReconciliationSummary> {
        let now = self.clock.now();
        let mut summary = ReconciliationSummary::default();
        let mut cursor: Option<StuckCursor> = None;

        loop {
            let page = self
                .tasks
                .find_stuck_jobs(self.config.stuck_minutes, cursor, STUCK_PAGE_SIZE)
                .await
                .context("Failed to find stuck tasks")?;
            let last_page = page.len() < STUCK_PAGE_SIZE;
            cursor = page.last().map(StuckCursor::after);

            for task in page {
                summary.checked += 1;
                let outcome = match self.reconcile_task(&task, now).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("Failed to reconcile task {}: {:#}", task.id, e);
                        TaskOutcome::Errored
                    }
                };
                match outcome {
                    TaskOutcome::Reconciled => summary.reconciled += 1,
                    TaskOutcome::TimedOut => summary.timed_out += 1,
                    TaskOutcome::Skipped => summary.skipped += 1,
                    TaskOutcome::Errored => summary.errored += 1,
                }
            }

            if last_page {
                break;
            }
        }
        Ok(summary)
    }

    fn past_hard_timeout(&self, task: &Task, now: DateTime<Utc>) -> bool {
        now - task.updated_at > chrono::Duration::minutes(self.config.timeout_minutes)
    }

    async fn reconcile_task(&self, task: &Task, now: DateTime<Utc>) -> Result<TaskOutcome> {
        if task.status.is_terminal() {
            return Ok(TaskOutcome::Skipped);
        }
        let timed_out = self.past_hard_timeout(task, now);

        if task.execution_ref.is_none() {
            if timed_out {
                return self.force_fail(task, now).await;
            }
            debug!(
                "Task {} has no execution reference yet; leaving it ({})",
                task.id, task.status
            );
            return Ok(TaskOutcome::Skipped);
        }

        match self.backend.sync_status(task.id).await {
            Ok(outcome) if outcome.changed() => {
                info!(
                    "Reconciled task {}: {} -> {}",
                    task.id,
                    outcome
                        .previous_status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| task.status.to_string()),
                    outcome
                        .new_status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "unchanged".to_string())
                );
                Ok(TaskOutcome::Reconciled)
            }
            Ok(_) => Ok(TaskOutcome::Skipped),
            Err(e) if timed_out => {
                warn!(
                    "Sync for task {} still failing past the hard timeout: {}",
                    task.id, e
                );
                self.force_fail(task, now).await
            }
            Err(e) => {
                warn!("Sync for task {} failed; will retry: {}", task.id, e);
                Ok(TaskOutcome::Errored)
            }
        }
    }

    /// Fail the task with a `reconciliation_timeout` error. Status and error
    /// land in one write, so a task is never left terminal without its error.
    async fn force_fail(&self, task: &Task, now: DateTime<Utc>) -> Result<TaskOutcome> {
        let error = TaskError {
            code: ERROR_CODE_RECONCILIATION_TIMEOUT.to_string(),
            message: format!(
                "Task made no progress for over {} minutes and was stopped",
                self.config.timeout_minutes
            ),
        };
        let result = ExecutionResult {
            reference: task.execution_ref.clone(),
            result: None,
            error: Some(error.clone()),
            completed_at: now,
        };

        let updated = self
            .tasks
            .update_status(task.id, TaskStatus::Failed, Some(result))
            .await
            .with_context(|| format!("Failed to mark task {} failed", task.id))?;
        if !updated {
            debug!("Task {} became terminal before it could be failed", task.id);
            return Ok(TaskOutcome::Skipped);
        }
        warn!(
            "Task {} force-failed after exceeding {} minutes",
            task.id, self.config.timeout_minutes
        );

        let event = FleetEvent::TaskUpdate {
            task_id: task.id,
            status: TaskStatus::Failed,
            error: Some(error),
            at: now,
        };
        if let Err(e) = self.publisher.publish(&task.user_id, event).await {
            warn!("Failed to notify user {} about task {}: {}", task.user_id, task.id, e);
        }
        Ok(TaskOutcome::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::execution::SyncOutcome;
    use crate::shared::clock::ManualClock;
    use crate::test_support::{task, FakeExecutionBackend, FakeTaskRepository, RecordingPublisher};
    use std::time::Duration;

    struct Harness {
        reconciler: Arc<StaleTaskReconciler>,
        tasks: Arc<FakeTaskRepository>,
        backend: Arc<FakeExecutionBackend>,
        publisher: Arc<RecordingPublisher>,
    }

    fn harness(seed: Vec<Task>, clock: Arc<ManualClock>) -> Harness {
        let tasks = Arc::new(FakeTaskRepository::new(seed, clock.clone()));
        let backend = Arc::new(FakeExecutionBackend::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let config = ReconciliationConfig {
            enabled: true,
            interval_secs: 600,
            stuck_minutes: 30,
            timeout_minutes: 120,
        };
        let reconciler = Arc::new(StaleTaskReconciler::new(
            config,
            tasks.clone(),
            backend.clone(),
            publisher.clone(),
            clock,
        ));
        Harness {
            reconciler,
            tasks,
            backend,
            publisher,
        }
    }

    fn stuck_for(minutes: i64, now: DateTime<Utc>, execution_ref: Option<&str>) -> Task {
        let mut t = task(TaskStatus::InProgress);
        t.updated_at = now - chrono::Duration::minutes(minutes);
        t.execution_ref = execution_ref.map(str::to_string);
        t
    }

    #[tokio::test]
    async fn undispatched_task_under_timeout_is_left_alone() {
        let now = Utc::now();
        let t = stuck_for(35, now, None);
        let h = harness(vec![t.clone()], Arc::new(ManualClock::new(now)));

        let summary = h.reconciler.tick().await.unwrap();

        assert_eq!(summary.checked, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.timed_out, 0);
        assert_eq!(h.tasks.get(t.id).unwrap().status, TaskStatus::InProgress);
        assert!(h.publisher.events().is_empty());
    }

    #[tokio::test]
    async fn task_exactly_at_stuck_threshold_is_checked() {
        let now = Utc::now();
        let at_threshold = stuck_for(30, now, None);
        let just_under = stuck_for(29, now, None);
        let h = harness(
            vec![at_threshold, just_under],
            Arc::new(ManualClock::new(now)),
        );

        let summary = h.reconciler.tick().await.unwrap();

        assert_eq!(summary.checked, 1);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn undispatched_task_past_timeout_is_failed() {
        let now = Utc::now();
        let t = stuck_for(125, now, None);
        let h = harness(vec![t.clone()], Arc::new(ManualClock::new(now)));

        let summary = h.reconciler.tick().await.unwrap();

        assert_eq!(summary.timed_out, 1);
        assert_eq!(h.tasks.get(t.id).unwrap().status, TaskStatus::Failed);
        let results = h.tasks.results();
        assert_eq!(results.len(), 1);
        let error = results[0].1.error.clone().unwrap();
        assert_eq!(error.code, "reconciliation_timeout");

        let events = h.publisher.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, t.user_id);
        assert!(matches!(
            events[0].1,
            FleetEvent::TaskUpdate {
                status: TaskStatus::Failed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn confirmed_task_is_skipped_on_every_pass() {
        let now = Utc::now();
        let t = stuck_for(40, now, Some("job-1"));
        let h = harness(vec![t.clone()], Arc::new(ManualClock::new(now)));
        h.backend.respond(
            t.id,
            SyncOutcome {
                task_updated: false,
                job_updated: false,
                previous_status: Some(TaskStatus::InProgress),
                new_status: Some(TaskStatus::InProgress),
            },
        );

        for _ in 0..2 {
            let summary = h.reconciler.tick().await.unwrap();
            assert_eq!(summary.skipped, 1);
            assert_eq!(summary.reconciled, 0);
        }
        assert_eq!(h.backend.calls(), vec![t.id, t.id]);
        assert_eq!(h.tasks.get(t.id).unwrap().status, TaskStatus::InProgress);
        assert!(h.tasks.results().is_empty());
    }

    #[tokio::test]
    async fn changed_sync_counts_as_reconciled() {
        let now = Utc::now();
        let t = stuck_for(40, now, Some("job-2"));
        let h = harness(vec![t.clone()], Arc::new(ManualClock::new(now)));
        h.backend.respond(
            t.id,
            SyncOutcome {
                task_updated: true,
                job_updated: true,
                previous_status: Some(TaskStatus::InProgress),
                new_status: Some(TaskStatus::Completed),
            },
        );

        let summary = h.reconciler.tick().await.unwrap();
        assert_eq!(summary.reconciled, 1);
    }

    #[tokio::test]
    async fn sync_errors_escalate_only_past_timeout() {
        let now = Utc::now();
        let recent = stuck_for(45, now, Some("job-3"));
        let ancient = stuck_for(180, now, Some("job-4"));
        let h = harness(
            vec![recent.clone(), ancient.clone()],
            Arc::new(ManualClock::new(now)),
        );

        let summary = h.reconciler.tick().await.unwrap();

        assert_eq!(summary.errored, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(h.tasks.get(recent.id).unwrap().status, TaskStatus::InProgress);
        assert_eq!(h.tasks.get(ancient.id).unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn terminal_tasks_are_never_mutated() {
        let now = Utc::now();
        let mut done = stuck_for(500, now, None);
        done.status = TaskStatus::Completed;
        let h = harness(vec![done.clone()], Arc::new(ManualClock::new(now)));

        let outcome = h.reconciler.reconcile_task(&done, now).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Skipped);

        // Even a direct force-fail is refused by the repository guard.
        let outcome = h.reconciler.force_fail(&done, now).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Skipped);
        assert_eq!(h.tasks.get(done.id).unwrap().status, TaskStatus::Completed);
        assert!(h.tasks.results().is_empty());
        assert!(h.publisher.events().is_empty());
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let now = Utc::now();
        let t = stuck_for(40, now, Some("job-5"));
        let h = harness(vec![t], Arc::new(ManualClock::new(now)));
        h.backend.set_delay(Duration::from_millis(50));

        let (first, second) = tokio::join!(h.reconciler.tick(), h.reconciler.tick());
        assert!(first.is_some());
        assert!(second.is_none());

        // The flag is released once the pass finishes.
        assert!(h.reconciler.tick().await.is_some());
    }

    #[tokio::test]
    async fn failed_write_leaves_task_for_the_next_pass() {
        let now = Utc::now();
        let t = stuck_for(150, now, None);
        let h = harness(vec![t.clone()], Arc::new(ManualClock::new(now)));
        h.tasks.set_fail_writes(true);

        let summary = h.reconciler.tick().await.unwrap();
        assert_eq!(summary.errored, 1);
        assert_eq!(h.tasks.get(t.id).unwrap().status, TaskStatus::InProgress);
        assert!(h.tasks.results().is_empty());
        assert!(h.publisher.events().is_empty());

        h.tasks.set_fail_writes(false);
        let summary = h.reconciler.tick().await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(h.tasks.get(t.id).unwrap().status, TaskStatus::Failed);
        assert_eq!(h.tasks.results().len(), 1);
        assert_eq!(h.publisher.events().len(), 1);
    }

    #[tokio::test]
    async fn long_runners_do_not_hide_newer_zombies() {
        let now = Utc::now();
        let mut seed = Vec::new();
        for i in 0..(STUCK_PAGE_SIZE + 20) {
            let t = stuck_for(300 + i as i64, now, Some("job-long"));
            seed.push(t);
        }
        let zombie = stuck_for(200, now, None);
        seed.push(zombie.clone());

        let h = harness(seed.clone(), Arc::new(ManualClock::new(now)));
        for t in &seed[..seed.len() - 1] {
            h.backend.respond(
                t.id,
                SyncOutcome {
                    task_updated: false,
                    job_updated: false,
                    previous_status: Some(TaskStatus::InProgress),
                    new_status: Some(TaskStatus::InProgress),
                },
            );
        }

        let summary = h.reconciler.tick().await.unwrap();
        assert_eq!(summary.checked, STUCK_PAGE_SIZE + 21);
        assert_eq!(summary.skipped, STUCK_PAGE_SIZE + 20);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(h.tasks.get(zombie.id).unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn publish_failure_does_not_undo_the_failure() {
        let now = Utc::now();
        let t = stuck_for(200, now, None);
        let clock = Arc::new(ManualClock::new(now));
        let tasks = Arc::new(FakeTaskRepository::new(vec![t.clone()], clock.clone()));
        let reconciler = StaleTaskReconciler::new(
            ReconciliationConfig {
                enabled: true,
                ..Default::default()
            },
            tasks.clone(),
            Arc::new(FakeExecutionBackend::default()),
            Arc::new(RecordingPublisher::failing()),
            clock,
        );

        let summary = reconciler.tick().await.unwrap();
        assert_eq!(summary.timed_out, 1);
        assert_eq!(tasks.get(t.id).unwrap().status, TaskStatus::Failed);
    }
}
