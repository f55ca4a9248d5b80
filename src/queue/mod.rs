//! Dispatch gateway in front of the durable job queue.
//!
//! A queue that is down or unconfigured is reported as [`QueueUnavailable`]
//! rather than an internal error, so the scaling loops can skip a tick and
//! carry on.

mod mysql;

pub use mysql::MySqlQueueBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub task_id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("Job queue unavailable: {reason}")]
pub struct QueueUnavailable {
    pub reason: String,
}

impl QueueUnavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Storage behind the gateway.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn push(&self, queue_name: &str, job: &QueueJob) -> anyhow::Result<String>;
    async fn cancel(&self, job_id: &str) -> anyhow::Result<bool>;
    async fn stats(&self) -> anyhow::Result<QueueStats>;
}

pub struct TaskQueueGateway {
    backend: Option<Arc<dyn QueueBackend>>,
    shared_queue: String,
    timeout: Duration,
}

impl TaskQueueGateway {
    pub fn new(
        backend: Option<Arc<dyn QueueBackend>>,
        shared_queue: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            shared_queue: shared_queue.into(),
            timeout,
        }
    }

    /// Queue a job to the shared pool, or to one worker's own queue when a
    /// routing hint names that worker.
    pub async fn enqueue(
        &self,
        job: &QueueJob,
        routing_hint: Option<&str>,
    ) -> Result<String, QueueUnavailable> {
        let queue_name = self.queue_name(routing_hint);
        let backend = self.backend()?;
        self.bounded("enqueue", backend.push(&queue_name, job)).await
    }

    /// `true` when a still-queued job was cancelled. Unavailability reads as `false`.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let backend = match self.backend() {
            Ok(backend) => backend,
            Err(e) => {
                warn!("Cannot cancel job {}: {}", job_id, e);
                return false;
            }
        };
        match self.bounded("cancel", backend.cancel(job_id)).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!("Cannot cancel job {}: {}", job_id, e);
                false
            }
        }
    }

    pub async fn get_stats(&self) -> Result<QueueStats, QueueUnavailable> {
        let backend = self.backend()?;
        self.bounded("stats", backend.stats()).await
    }

    pub fn queue_name(&self, routing_hint: Option<&str>) -> String {
        match routing_hint.map(str::trim).filter(|w| !w.is_empty()) {
            Some(worker) => format!("{}:worker:{}", self.shared_queue, worker),
            None => self.shared_queue.clone(),
        }
    }

    fn backend(&self) -> Result<&Arc<dyn QueueBackend>, QueueUnavailable> {
        self.backend
            .as_ref()
            .ok_or_else(|| QueueUnavailable::new("queue backend not configured"))
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T, QueueUnavailable>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(QueueUnavailable::new(format!("{} failed: {}", op, e))),
            Err(_) => Err(QueueUnavailable::new(format!(
                "{} timed out after {:?}",
                op, self.timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeQueueBackend;

    fn job() -> QueueJob {
        QueueJob {
            task_id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            payload: serde_json::json!({ "url": "https://jobs.example.com/123" }),
        }
    }

    fn gateway(backend: Arc<FakeQueueBackend>) -> TaskQueueGateway {
        TaskQueueGateway::new(Some(backend), "applications", Duration::from_millis(200))
    }

    #[tokio::test]
    async fn routing_hint_targets_worker_queue() {
        let backend = Arc::new(FakeQueueBackend::default());
        let gateway = gateway(backend.clone());

        gateway.enqueue(&job(), Some("sandbox-7")).await.unwrap();
        gateway.enqueue(&job(), None).await.unwrap();
        gateway.enqueue(&job(), Some("  ")).await.unwrap();

        assert_eq!(
            backend.pushed_queues(),
            vec![
                "applications:worker:sandbox-7".to_string(),
                "applications".to_string(),
                "applications".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn missing_backend_is_unavailable_not_a_panic() {
        let gateway = TaskQueueGateway::new(None, "applications", Duration::from_secs(1));
        assert!(gateway.enqueue(&job(), None).await.is_err());
        assert!(gateway.get_stats().await.is_err());
        assert!(!gateway.cancel("job-1").await);
    }

    #[tokio::test]
    async fn backend_errors_surface_as_unavailable() {
        let backend = Arc::new(FakeQueueBackend::down());
        let gateway = gateway(backend);
        let err = gateway.get_stats().await.unwrap_err();
        assert!(err.reason.contains("stats failed"));
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let backend = Arc::new(FakeQueueBackend::default().with_delay(Duration::from_secs(5)));
        let gateway = gateway(backend);
        let err = gateway.get_stats().await.unwrap_err();
        assert!(err.reason.contains("timed out"));
    }

    #[tokio::test]
    async fn cancel_reports_backend_answer() {
        let backend = Arc::new(FakeQueueBackend::default());
        let gateway = gateway(backend.clone());
        let id = gateway.enqueue(&job(), None).await.unwrap();
        assert!(gateway.cancel(&id).await);
        assert!(!gateway.cancel(&id).await);
    }
}
