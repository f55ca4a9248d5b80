//! Real-time events pushed to the owning user's UI.
//!
//! Delivery is at-most-once. Publishers report failure to the caller, and every
//! caller in this crate logs the error and carries on.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::automation::phase::ApplicationPhase;
use crate::shared::models::{TaskError, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    StateChange {
        task_id: Uuid,
        from: ApplicationPhase,
        to: ApplicationPhase,
        trigger: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        at: DateTime<Utc>,
    },
    Progress {
        task_id: Uuid,
        percent: u8,
        step: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<ApplicationPhase>,
        at: DateTime<Utc>,
    },
    TaskUpdate {
        task_id: Uuid,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<TaskError>,
        at: DateTime<Utc>,
    },
}

impl FleetEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            FleetEvent::StateChange { task_id, .. }
            | FleetEvent::Progress { task_id, .. }
            | FleetEvent::TaskUpdate { task_id, .. } => *task_id,
        }
    }
}

/// An event addressed to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    pub user_id: String,
    pub event: FleetEvent,
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, user_id: &str, event: FleetEvent) -> Result<()>;
}

/// In-process fan-out to any number of subscribers (websocket bridges, tests).
#[derive(Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<UserEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, user_id: &str, event: FleetEvent) -> Result<()> {
        let message = UserEvent {
            user_id: user_id.to_string(),
            event,
        };
        // No subscribers simply means nobody is watching right now.
        if self.sender.send(message).is_err() {
            debug!("No subscribers for event to user {}", user_id);
        }
        Ok(())
    }
}

/// POSTs each event as JSON to a relay that fans it out to browsers.
pub struct WebhookPublisher {
    client: Client,
    url: String,
}

impl WebhookPublisher {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(url).map_err(|e| anyhow!("Invalid webhook URL {}: {}", url, e))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            client,
            url: parsed.to_string(),
        })
    }
}

#[async_trait]
impl EventPublisher for WebhookPublisher {
    async fn publish(&self, user_id: &str, event: FleetEvent) -> Result<()> {
        let body = UserEvent {
            user_id: user_id.to_string(),
            event,
        };
        let response = self.client.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "Event webhook returned {} for user {}",
                response.status(),
                user_id
            ));
        }
        Ok(())
    }
}
