use anyhow::{anyhow, Result};
use async_trait::async_trait;
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use super::{
    agent_url_from_ips, AgentProbe, MachineActionResult, MachineState, MachineStatus,
    ProviderError, SandboxProvider,
};
use crate::shared::config::HostAgentConfig;
use crate::shared::models::{MachineType, Sandbox, SandboxStatus};

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentClaims {
    pub sub: String,
    pub sandbox_id: String,
    pub exp: usize,
    pub iat: usize,
    pub iss: String,
}

/// Physical machines that never power off. Start is a no-op; stop asks the
/// host agent to shut its browser session down.
pub struct AlwaysOnHostProvider {
    client: Client,
    agent_port: u16,
    token_secret: String,
    probe: AgentProbe,
}

impl AlwaysOnHostProvider {
    pub fn new(config: &HostAgentConfig, request_timeout: Duration, probe: AgentProbe) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            agent_port: config.agent_port,
            token_secret: config.token_secret.clone(),
            probe,
        })
    }

    /// Short-lived bearer token scoped to one sandbox.
    fn control_token(&self, sandbox: &Sandbox) -> Result<Option<String>> {
        if self.token_secret.is_empty() {
            return Ok(None);
        }
        let now = chrono::Utc::now();
        let claims = AgentClaims {
            sub: "applyfleet-controller".to_string(),
            sandbox_id: sandbox.id.to_string(),
            exp: (now + chrono::Duration::minutes(5)).timestamp() as usize,
            iat: now.timestamp() as usize,
            iss: "applyfleet-controller".to_string(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.token_secret.as_ref()),
        )
        .map_err(|e| anyhow!("Failed to generate agent token: {}", e))?;
        Ok(Some(token))
    }
}

#[async_trait]
impl SandboxProvider for AlwaysOnHostProvider {
    fn machine_type(&self) -> MachineType {
        MachineType::AlwaysOnHost
    }

    async fn start_machine(&self, sandbox: &Sandbox) -> Result<MachineActionResult> {
        info!("Sandbox {} is an always-on host; start is a no-op", sandbox.id);
        Ok(MachineActionResult::ok(
            "Always-on host has no power control; nothing to start",
            Some(SandboxStatus::Active),
        ))
    }

    async fn stop_machine(&self, sandbox: &Sandbox) -> Result<MachineActionResult> {
        let agent_url = match self.get_agent_url(sandbox) {
            Ok(url) => url,
            Err(e) => return Ok(MachineActionResult::failed(e.to_string())),
        };
        let token = match self.control_token(sandbox) {
            Ok(token) => token,
            Err(e) => return Ok(MachineActionResult::failed(e.to_string())),
        };

        let mut request = self.client.post(format!("{}/shutdown", agent_url));
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                info!("Host agent for sandbox {} accepted shutdown", sandbox.id);
                Ok(MachineActionResult::ok(
                    "Shutdown command accepted by host agent",
                    Some(SandboxStatus::Stopped),
                ))
            }
            Ok(response) => {
                let status = response.status();
                warn!(
                    "Host agent for sandbox {} rejected shutdown: {}",
                    sandbox.id, status
                );
                Ok(MachineActionResult::failed(format!(
                    "Host agent rejected shutdown ({})",
                    status
                )))
            }
            Err(e) => {
                warn!("Could not reach host agent for sandbox {}: {}", sandbox.id, e);
                Ok(MachineActionResult::failed(format!(
                    "Host agent unreachable: {}",
                    e
                )))
            }
        }
    }

    async fn get_machine_status(&self, sandbox: &Sandbox) -> Result<MachineStatus> {
        let state = if self.ping_agent(sandbox).await {
            MachineState::Running
        } else {
            MachineState::Unknown
        };
        Ok(MachineStatus {
            state,
            public_ip: sandbox.public_ip.clone(),
            private_ip: sandbox.private_ip.clone(),
        })
    }

    fn get_agent_url(&self, sandbox: &Sandbox) -> Result<String, ProviderError> {
        agent_url_from_ips(sandbox, self.agent_port)
    }

    async fn ping_agent(&self, sandbox: &Sandbox) -> bool {
        match self.get_agent_url(sandbox) {
            Ok(url) => self.probe.ping(&url).await,
            Err(_) => false,
        }
    }
}
