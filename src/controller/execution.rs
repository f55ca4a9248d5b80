use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::shared::models::TaskStatus;

/// Result of asking the execution backend to re-sync one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub task_updated: bool,
    pub job_updated: bool,
    #[serde(default)]
    pub previous_status: Option<TaskStatus>,
    #[serde(default)]
    pub new_status: Option<TaskStatus>,
}

impl SyncOutcome {
    /// Whether the sync changed anything locally.
    pub fn changed(&self) -> bool {
        self.task_updated || self.job_updated
    }
}

/// The external system that actually runs automation jobs and owns their
/// authoritative status.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn sync_status(&self, task_id: Uuid) -> Result<SyncOutcome>;
}

pub struct HttpExecutionBackend {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpExecutionBackend {
    pub fn new(base_url: &str, api_token: Option<String>, timeout: Duration) -> Result<Self> {
        url::Url::parse(base_url)
            .map_err(|e| anyhow!("Invalid execution backend URL {}: {}", base_url, e))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }
}

#[async_trait]
impl ExecutionBackend for HttpExecutionBackend {
    async fn sync_status(&self, task_id: Uuid) -> Result<SyncOutcome> {
        let url = format!("{}/tasks/{}/sync", self.base_url, task_id);
        let mut request = self.client.post(&url);
        if let Some(token) = &self.api_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Execution backend sync for task {} failed ({}): {}",
                task_id,
                status,
                error_text
            ));
        }
        Ok(response.json::<SyncOutcome>().await?)
    }
}
