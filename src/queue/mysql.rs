use anyhow::Result;
use async_trait::async_trait;
use sqlx::MySqlPool;
use tracing::info;
use uuid::Uuid;

use super::{QueueBackend, QueueJob, QueueStats};

/// Job queue kept in the `queue_jobs` table; workers claim rows by queue name.
#[derive(Clone)]
pub struct MySqlQueueBackend {
    pool: MySqlPool,
}

impl MySqlQueueBackend {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueBackend for MySqlQueueBackend {
    async fn push(&self, queue_name: &str, job: &QueueJob) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_value(job)?;

        sqlx::query(
            r#"
            INSERT INTO queue_jobs (id, queue_name, task_id, payload, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'queued', NOW(), NOW())
            "#,
        )
        .bind(&id)
        .bind(queue_name)
        .bind(job.task_id.to_string())
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to enqueue task {}: {}", job.task_id, e))?;

        info!(
            "Enqueued job {} for task {} on queue {}",
            id, job.task_id, queue_name
        );
        Ok(id)
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM queue_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.as_str() {
                "queued" => stats.queued += count,
                "active" => stats.active += count,
                "completed" => stats.completed += count,
                "failed" => stats.failed += count,
                _ => {}
            }
            stats.total += count;
        }
        Ok(stats)
    }
}
