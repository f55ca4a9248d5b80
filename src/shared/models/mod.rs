use thiserror::Error;

pub mod constants;
pub mod sandbox;
pub mod task;

pub use sandbox::{
    HealthStatus, MachineType, NewSandbox, Sandbox, SandboxRow, SandboxStatus, SandboxUpdate,
};
pub use task::{ExecutionResult, Task, TaskError, TaskRow, TaskStatus};

// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    Connection(sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("UUID parse error: {0}")]
    UuidParse(#[from] uuid::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("row not found".to_string()),
            other => DatabaseError::Connection(other),
        }
    }
}
