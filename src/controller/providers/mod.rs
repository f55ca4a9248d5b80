//! Machine-type adapters behind one lifecycle contract.

mod browser_service;
mod cloud_vm;
mod docker;
mod host;

pub use browser_service::ManagedBrowserProvider;
pub use cloud_vm::{CloudComputeClient, CloudVmProvider};
pub use docker::LocalContainerProvider;
pub use host::AlwaysOnHostProvider;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::shared::models::{MachineType, Sandbox, SandboxStatus, SandboxUpdate};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("No provider registered for machine type '{0}'")]
    NotRegistered(MachineType),

    #[error("Sandbox {sandbox_id} has no usable agent address")]
    NoAgentAddress { sandbox_id: Uuid },

    #[error("Provider configuration error: {0}")]
    Config(String),
}

/// Canonical machine power state across every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Running,
    Stopped,
    Starting,
    Stopping,
    Terminated,
    Unknown,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Running => "running",
            MachineState::Stopped => "stopped",
            MachineState::Starting => "starting",
            MachineState::Stopping => "stopping",
            MachineState::Terminated => "terminated",
            MachineState::Unknown => "unknown",
        }
    }

    /// Lifecycle status implied by the machine state, if any.
    pub fn sandbox_status(&self) -> Option<SandboxStatus> {
        match self {
            MachineState::Running => Some(SandboxStatus::Active),
            MachineState::Starting => Some(SandboxStatus::Provisioning),
            MachineState::Stopping => Some(SandboxStatus::Stopping),
            MachineState::Stopped => Some(SandboxStatus::Stopped),
            MachineState::Terminated => Some(SandboxStatus::Terminated),
            MachineState::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineStatus {
    pub state: MachineState,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

impl MachineStatus {
    pub fn of(state: MachineState) -> Self {
        Self {
            state,
            public_ip: None,
            private_ip: None,
        }
    }
}

/// Backing identity handed out by a start call (new instance, session, container IP).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignedMachine {
    pub instance_id: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub session_handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineActionResult {
    pub success: bool,
    pub message: String,
    pub new_status: Option<SandboxStatus>,
    pub assigned: Option<AssignedMachine>,
    pub backing_state: Option<MachineState>,
}

impl MachineActionResult {
    pub fn ok(message: impl Into<String>, new_status: Option<SandboxStatus>) -> Self {
        Self {
            success: true,
            message: message.into(),
            new_status,
            assigned: None,
            backing_state: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            new_status: None,
            assigned: None,
            backing_state: None,
        }
    }

    pub fn with_assigned(mut self, assigned: AssignedMachine) -> Self {
        self.assigned = Some(assigned);
        self
    }

    pub fn with_backing_state(mut self, state: MachineState) -> Self {
        self.backing_state = Some(state);
        self
    }

    /// Record changes implied by this result.
    pub fn to_update(&self) -> SandboxUpdate {
        let assigned = self.assigned.clone().unwrap_or_default();
        SandboxUpdate {
            status: self.new_status,
            instance_id: assigned.instance_id,
            public_ip: assigned.public_ip,
            private_ip: assigned.private_ip,
            session_handle: assigned.session_handle,
            backing_state: self.backing_state.map(|s| s.as_str().to_string()),
            ..Default::default()
        }
    }
}

/// Uniform lifecycle contract implemented once per machine type.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn machine_type(&self) -> MachineType;

    async fn start_machine(&self, sandbox: &Sandbox) -> anyhow::Result<MachineActionResult>;

    async fn stop_machine(&self, sandbox: &Sandbox) -> anyhow::Result<MachineActionResult>;

    async fn get_machine_status(&self, sandbox: &Sandbox) -> anyhow::Result<MachineStatus>;

    fn get_agent_url(&self, sandbox: &Sandbox) -> Result<String, ProviderError>;

    /// Bounded health probe. Any failure reads as `false`.
    async fn ping_agent(&self, sandbox: &Sandbox) -> bool;
}

/// HTTP health probe shared by the agent-hosting providers.
#[derive(Clone)]
pub struct AgentProbe {
    client: Client,
}

impl AgentProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { client })
    }

    pub async fn ping(&self, agent_url: &str) -> bool {
        let url = format!("{}/health", agent_url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Agent ping to {} failed: {}", url, e);
                false
            }
        }
    }
}

/// `http://<ip>:<port>` from the sandbox's public address, else its private one.
pub fn agent_url_from_ips(sandbox: &Sandbox, port: u16) -> Result<String, ProviderError> {
    let ip = sandbox
        .public_ip
        .as_deref()
        .or(sandbox.private_ip.as_deref())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .ok_or(ProviderError::NoAgentAddress {
            sandbox_id: sandbox.id,
        })?;

    let url = url::Url::parse(&format!("http://{}:{}", ip, port)).map_err(|_| {
        ProviderError::NoAgentAddress {
            sandbox_id: sandbox.id,
        }
    })?;
    Ok(url.as_str().trim_end_matches('/').to_string())
}
