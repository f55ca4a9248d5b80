use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::phase::{ApplicationPhase, PhaseTransition};
use crate::events::{EventPublisher, FleetEvent};
use crate::shared::clock::Clock;

#[derive(Debug, Error, PartialEq)]
pub enum PhaseError {
    #[error("Invalid phase transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: ApplicationPhase,
        to: ApplicationPhase,
    },
}

/// Current phase plus the transitions that led to it.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseEntry {
    pub current: ApplicationPhase,
    pub history: Vec<PhaseTransition>,
}

impl Default for PhaseEntry {
    fn default() -> Self {
        Self {
            current: ApplicationPhase::Provisioning,
            history: Vec::new(),
        }
    }
}

/// Where phase state lives between calls. In-process for a single controller;
/// back it with a shared cache if the control plane runs more than one replica.
#[async_trait]
pub trait PhaseStore: Send + Sync {
    async fn load(&self, task_id: Uuid) -> Option<PhaseEntry>;
    async fn save(&self, task_id: Uuid, entry: PhaseEntry);
    async fn remove(&self, task_id: Uuid);
}

#[derive(Default)]
pub struct InMemoryPhaseStore {
    entries: Mutex<HashMap<Uuid, PhaseEntry>>,
}

impl InMemoryPhaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PhaseStore for InMemoryPhaseStore {
    async fn load(&self, task_id: Uuid) -> Option<PhaseEntry> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.get(&task_id).cloned()
    }

    async fn save(&self, task_id: Uuid, entry: PhaseEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(task_id, entry);
    }

    async fn remove(&self, task_id: Uuid) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.remove(&task_id);
    }
}

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub task_id: Uuid,
    pub user_id: String,
    pub percent: u8,
    pub step: String,
}

/// Drives the per-task phase machine and publishes what happens to the UI.
///
/// Transitions for one task must be serialized by the caller; different
/// tasks are independent.
pub struct PhaseTracker {
    store: Arc<dyn PhaseStore>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl PhaseTracker {
    pub fn new(
        store: Arc<dyn PhaseStore>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
        }
    }

    pub async fn current_phase(&self, task_id: Uuid) -> ApplicationPhase {
        self.store
            .load(task_id)
            .await
            .map(|e| e.current)
            .unwrap_or(ApplicationPhase::Provisioning)
    }

    pub async fn history(&self, task_id: Uuid) -> Vec<PhaseTransition> {
        self.store
            .load(task_id)
            .await
            .map(|e| e.history)
            .unwrap_or_default()
    }

    /// Seed a task's phase after a restart, from what the execution backend reports.
    pub async fn restore(&self, task_id: Uuid, phase: ApplicationPhase) {
        self.store
            .save(
                task_id,
                PhaseEntry {
                    current: phase,
                    history: Vec::new(),
                },
            )
            .await;
    }

    /// Forget a task that will never reach a terminal phase here, e.g. one
    /// abandoned by a crashed run.
    pub async fn release(&self, task_id: Uuid) {
        self.store.remove(task_id).await;
    }

    pub async fn transition(
        &self,
        task_id: Uuid,
        user_id: &str,
        to: ApplicationPhase,
        trigger: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<PhaseTransition, PhaseError> {
        let mut entry = self.store.load(task_id).await.unwrap_or_default();
        let from = entry.current;

        if !from.can_transition_to(to) {
            warn!(
                "Rejected phase transition for task {}: {} -> {} (trigger: {})",
                task_id, from, to, trigger
            );
            return Err(PhaseError::InvalidTransition { task_id, from, to });
        }

        let transition = PhaseTransition {
            from,
            to,
            trigger: trigger.to_string(),
            at: self.clock.now(),
            metadata,
        };

        if to.is_terminal() {
            self.store.remove(task_id).await;
        } else {
            entry.current = to;
            entry.history.push(transition.clone());
            self.store.save(task_id, entry).await;
        }

        debug!("Task {} phase {} -> {} ({})", task_id, from, to, trigger);

        let event = FleetEvent::StateChange {
            task_id,
            from,
            to,
            trigger: transition.trigger.clone(),
            metadata: transition.metadata.clone(),
            at: transition.at,
        };
        if let Err(e) = self.publisher.publish(user_id, event).await {
            warn!("Failed to publish state change for task {}: {}", task_id, e);
        }

        Ok(transition)
    }

    /// Publish a progress tick. Never changes the phase and never fails.
    pub async fn emit_progress(&self, update: ProgressUpdate) {
        let phase = self.store.load(update.task_id).await.map(|e| e.current);
        let event = FleetEvent::Progress {
            task_id: update.task_id,
            percent: update.percent.min(100),
            step: update.step,
            phase,
            at: self.clock.now(),
        };
        if let Err(e) = self.publisher.publish(&update.user_id, event).await {
            warn!(
                "Failed to publish progress for task {}: {}",
                update.task_id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::clock::ManualClock;
    use crate::test_support::RecordingPublisher;
    use ApplicationPhase::*;

    fn tracker(publisher: Arc<RecordingPublisher>) -> (PhaseTracker, Arc<InMemoryPhaseStore>) {
        let store = Arc::new(InMemoryPhaseStore::new());
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        (PhaseTracker::new(store.clone(), publisher, clock), store)
    }

    async fn drive(tracker: &PhaseTracker, task_id: Uuid, path: &[ApplicationPhase]) {
        for phase in path {
            tracker
                .transition(task_id, "user-1", *phase, "step", None)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn unseen_task_starts_in_provisioning() {
        let (tracker, _) = tracker(Arc::new(RecordingPublisher::default()));
        assert_eq!(tracker.current_phase(Uuid::new_v4()).await, Provisioning);
    }

    #[tokio::test]
    async fn filling_to_uploading_appends_one_entry() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (tracker, _) = tracker(publisher.clone());
        let task_id = Uuid::new_v4();
        drive(&tracker, task_id, &[Navigating, Analyzing, Filling]).await;
        let before = tracker.history(task_id).await.len();

        let transition = tracker
            .transition(task_id, "user-1", Uploading, "file_input_found", None)
            .await
            .unwrap();

        let history = tracker.history(task_id).await;
        assert_eq!(history.len(), before + 1);
        assert_eq!(history.last(), Some(&transition));
        assert_eq!(transition.from, Filling);
        assert_eq!(tracker.current_phase(task_id).await, Uploading);
        assert_eq!(publisher.events().len(), 4);
    }

    #[tokio::test]
    async fn terminal_transition_drops_the_entry() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (tracker, store) = tracker(publisher.clone());
        let task_id = Uuid::new_v4();
        drive(
            &tracker,
            task_id,
            &[Navigating, Analyzing, Filling, Submitting, Verifying, Completed],
        )
        .await;

        assert!(store.is_empty());
        assert!(tracker.history(task_id).await.is_empty());
        assert_eq!(publisher.events().len(), 6);

        for to in [Completed, Submitting, Verifying] {
            let err = tracker
                .transition(task_id, "user-1", to, "late", None)
                .await
                .unwrap_err();
            assert_eq!(
                err,
                PhaseError::InvalidTransition {
                    task_id,
                    from: Provisioning,
                    to
                }
            );
        }
        assert!(store.is_empty());
        assert_eq!(publisher.events().len(), 6);
    }

    #[tokio::test]
    async fn many_finished_runs_leave_nothing_behind() {
        let (tracker, store) = tracker(Arc::new(RecordingPublisher::default()));
        for _ in 0..50 {
            let task_id = Uuid::new_v4();
            drive(&tracker, task_id, &[Navigating, Failed]).await;
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn invalid_edge_leaves_state_untouched() {
        let (tracker, _) = tracker(Arc::new(RecordingPublisher::default()));
        let task_id = Uuid::new_v4();
        assert!(tracker
            .transition(task_id, "user-1", Submitting, "skip", None)
            .await
            .is_err());
        assert_eq!(tracker.current_phase(task_id).await, Provisioning);
        assert!(tracker.history(task_id).await.is_empty());
    }

    #[tokio::test]
    async fn publish_failure_does_not_fail_transition() {
        let publisher = Arc::new(RecordingPublisher::failing());
        let (tracker, _) = tracker(publisher);
        let task_id = Uuid::new_v4();
        assert!(tracker
            .transition(task_id, "user-1", Navigating, "start", None)
            .await
            .is_ok());

        tracker
            .emit_progress(ProgressUpdate {
                task_id,
                user_id: "user-1".to_string(),
                percent: 40,
                step: "typing".to_string(),
            })
            .await;
        assert_eq!(tracker.current_phase(task_id).await, Navigating);
    }

    #[tokio::test]
    async fn progress_is_clamped_and_tagged_with_phase() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (tracker, _) = tracker(publisher.clone());
        let task_id = Uuid::new_v4();
        tracker.restore(task_id, Filling).await;

        tracker
            .emit_progress(ProgressUpdate {
                task_id,
                user_id: "user-2".to_string(),
                percent: 150,
                step: "answering questions".to_string(),
            })
            .await;

        let events = publisher.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "user-2");
        match &events[0].1 {
            FleetEvent::Progress { percent, phase, .. } => {
                assert_eq!(*percent, 100);
                assert_eq!(*phase, Some(Filling));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn release_forgets_task() {
        let (tracker, store) = tracker(Arc::new(RecordingPublisher::default()));
        let task_id = Uuid::new_v4();
        drive(&tracker, task_id, &[Navigating, Analyzing]).await;
        assert_eq!(store.len(), 1);
        tracker.release(task_id).await;
        assert!(store.is_empty());
    }
}
