use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    AssignedMachine, MachineActionResult, MachineState, MachineStatus, ProviderError,
    SandboxProvider,
};
use crate::shared::config::BrowserServiceConfig;
use crate::shared::models::{MachineType, Sandbox, SandboxStatus};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionView {
    id: String,
    #[serde(default)]
    connect_url: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a str>,
    user_metadata: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseSessionRequest<'a> {
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a str>,
}

/// Map the browser service's session status onto [`MachineState`].
pub fn map_session_status(status: &str) -> MachineState {
    match status.trim().to_ascii_uppercase().as_str() {
        "PENDING" | "CREATED" => MachineState::Starting,
        "RUNNING" => MachineState::Running,
        "COMPLETED" | "TIMED_OUT" => MachineState::Stopped,
        "ERROR" => MachineState::Terminated,
        _ => MachineState::Unknown,
    }
}

/// Hosted browser sessions. The session id is the backing id and its CDP
/// connect URL is the session handle the automation attaches to.
pub struct ManagedBrowserProvider {
    client: Client,
    api_url: String,
    api_key: String,
    project_id: Option<String>,
}

impl ManagedBrowserProvider {
    pub fn new(config: &BrowserServiceConfig, request_timeout: Duration) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(
                ProviderError::Config("browser_service.api_key is required".to_string()).into(),
            );
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            project_id: config.project_id.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .header("X-BB-API-Key", &self.api_key)
    }

    async fn fetch_session(&self, session_id: &str) -> Result<SessionView> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/sessions/{}", session_id))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(response.json::<SessionView>().await?),
            StatusCode::NOT_FOUND => Err(anyhow!("Browser session {} not found", session_id)),
            status => Err(anyhow!(
                "Failed to fetch browser session {} ({})",
                session_id,
                status
            )),
        }
    }
}

#[async_trait]
impl SandboxProvider for ManagedBrowserProvider {
    fn machine_type(&self) -> MachineType {
        MachineType::BrowserService
    }

    async fn start_machine(&self, sandbox: &Sandbox) -> Result<MachineActionResult> {
        let body = CreateSessionRequest {
            project_id: self.project_id.as_deref(),
            user_metadata: serde_json::json!({ "sandboxId": sandbox.id.to_string() }),
        };
        let response = self
            .request(reqwest::Method::POST, "/v1/sessions")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            warn!(
                "Browser service refused session for sandbox {}: {} {}",
                sandbox.id, status, error_text
            );
            return Ok(MachineActionResult::failed(format!(
                "Browser service refused session ({}): {}",
                status, error_text
            )));
        }

        let session = response.json::<SessionView>().await?;
        let state = session
            .status
            .as_deref()
            .map(map_session_status)
            .unwrap_or(MachineState::Running);
        info!("Created browser session {} for sandbox {}", session.id, sandbox.id);

        Ok(MachineActionResult::ok(
            format!("Browser session {} created", session.id),
            state.sandbox_status().or(Some(SandboxStatus::Active)),
        )
        .with_backing_state(state)
        .with_assigned(AssignedMachine {
            instance_id: Some(session.id),
            session_handle: session.connect_url,
            ..Default::default()
        }))
    }

    async fn stop_machine(&self, sandbox: &Sandbox) -> Result<MachineActionResult> {
        let Some(session_id) = sandbox.instance_id.as_deref() else {
            return Ok(MachineActionResult::ok(
                "No browser session; nothing to release",
                Some(SandboxStatus::Stopped),
            ));
        };

        let body = ReleaseSessionRequest {
            status: "REQUEST_RELEASE",
            project_id: self.project_id.as_deref(),
        };
        let response = self
            .request(reqwest::Method::POST, &format!("/v1/sessions/{}", session_id))
            .json(&body)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(MachineActionResult::ok(
                format!("Browser session {} released", session_id),
                Some(SandboxStatus::Stopped),
            )
            .with_backing_state(MachineState::Stopped)),
            StatusCode::NOT_FOUND => Ok(MachineActionResult::ok(
                format!("Browser session {} already gone", session_id),
                Some(SandboxStatus::Stopped),
            )),
            status => Ok(MachineActionResult::failed(format!(
                "Failed to release browser session {} ({})",
                session_id, status
            ))),
        }
    }

    async fn get_machine_status(&self, sandbox: &Sandbox) -> Result<MachineStatus> {
        let Some(session_id) = sandbox.instance_id.as_deref() else {
            return Ok(MachineStatus::of(MachineState::Unknown));
        };
        let session = self.fetch_session(session_id).await?;
        Ok(MachineStatus::of(
            session
                .status
                .as_deref()
                .map(map_session_status)
                .unwrap_or(MachineState::Unknown),
        ))
    }

    fn get_agent_url(&self, sandbox: &Sandbox) -> Result<String, ProviderError> {
        sandbox
            .session_handle
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .ok_or(ProviderError::NoAgentAddress {
                sandbox_id: sandbox.id,
            })
    }

    async fn ping_agent(&self, sandbox: &Sandbox) -> bool {
        let Some(session_id) = sandbox.instance_id.as_deref() else {
            return false;
        };
        match self.fetch_session(session_id).await {
            Ok(session) => {
                session.status.as_deref().map(map_session_status) == Some(MachineState::Running)
            }
            Err(e) => {
                debug!("Browser session ping for sandbox {} failed: {}", sandbox.id, e);
                false
            }
        }
    }
}
