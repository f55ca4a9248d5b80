use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::constants::*;
use super::DatabaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Queued,
    InProgress,
    WaitingHuman,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => TASK_STATUS_CREATED,
            TaskStatus::Queued => TASK_STATUS_QUEUED,
            TaskStatus::InProgress => TASK_STATUS_IN_PROGRESS,
            TaskStatus::WaitingHuman => TASK_STATUS_WAITING_HUMAN,
            TaskStatus::Completed => TASK_STATUS_COMPLETED,
            TaskStatus::Failed => TASK_STATUS_FAILED,
            TaskStatus::Cancelled => TASK_STATUS_CANCELLED,
        }
    }

    /// Completed, failed and cancelled tasks are never touched again by the controller.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            TASK_STATUS_CREATED => Ok(TaskStatus::Created),
            TASK_STATUS_QUEUED => Ok(TaskStatus::Queued),
            TASK_STATUS_IN_PROGRESS => Ok(TaskStatus::InProgress),
            TASK_STATUS_WAITING_HUMAN => Ok(TaskStatus::WaitingHuman),
            TASK_STATUS_COMPLETED => Ok(TaskStatus::Completed),
            TASK_STATUS_FAILED => Ok(TaskStatus::Failed),
            TASK_STATUS_CANCELLED => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub user_id: String,
    pub status: TaskStatus,
    /// Opaque handle into the execution backend; absent until dispatched.
    pub execution_ref: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: String,
    pub user_id: String,
    pub status: String,
    pub execution_ref: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DatabaseError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: Uuid::parse_str(&row.id)?,
            user_id: row.user_id,
            status: row.status.parse().map_err(DatabaseError::Internal)?,
            execution_ref: row.execution_ref.filter(|r| !r.trim().is_empty()),
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: String,
    pub message: String,
}

/// Outcome written back to the task record when execution ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub reference: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub completed_at: DateTime<Utc>,
}
