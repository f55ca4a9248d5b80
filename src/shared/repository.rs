use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{
    DatabaseError, ExecutionResult, MachineType, NewSandbox, Sandbox, SandboxUpdate, Task,
    TaskStatus,
};

/// Read/write access to sandbox records.
#[async_trait]
pub trait SandboxRepository: Send + Sync {
    async fn find_by_machine_type(
        &self,
        machine_type: MachineType,
    ) -> Result<Vec<Sandbox>, DatabaseError>;

    /// Active sandboxes whose auto-stop policy is enabled. The per-sandbox
    /// idle threshold is applied by the caller.
    async fn find_auto_stop_candidates(&self) -> Result<Vec<Sandbox>, DatabaseError>;

    /// Every sandbox that is not terminated.
    async fn find_live(&self) -> Result<Vec<Sandbox>, DatabaseError>;

    async fn create(&self, sandbox: NewSandbox) -> Result<Sandbox, DatabaseError>;

    async fn update(&self, id: Uuid, fields: SandboxUpdate) -> Result<(), DatabaseError>;
}

/// Position just past the last task of a page of stuck tasks. Pages are
/// ordered by `(updated_at, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckCursor {
    pub updated_at: DateTime<Utc>,
    pub id: Uuid,
}

impl StuckCursor {
    pub fn after(task: &Task) -> Self {
        Self {
            updated_at: task.updated_at,
            id: task.id,
        }
    }
}

/// Read/write access to task records.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn count_queued(&self) -> Result<i64, DatabaseError>;

    /// Non-terminal tasks not updated for at least `minutes_threshold`
    /// minutes, oldest first, at most `limit` of them, starting after `after`.
    async fn find_stuck_jobs(
        &self,
        minutes_threshold: i64,
        after: Option<StuckCursor>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Set the status and, when given, the execution result in one guarded
    /// write. Returns `false` when the task was already terminal and left
    /// untouched.
    async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: Option<ExecutionResult>,
    ) -> Result<bool, DatabaseError>;
}
