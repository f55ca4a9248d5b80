use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use super::{
    agent_url_from_ips, AgentProbe, AssignedMachine, MachineActionResult, MachineState,
    MachineStatus, ProviderError, SandboxProvider,
};
use crate::shared::config::CloudVmConfig;
use crate::shared::models::{MachineType, Sandbox, SandboxStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceView {
    pub instance_id: String,
    pub state: String,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub private_ip: Option<String>,
}

#[derive(Debug, Serialize)]
struct LaunchRequest<'a> {
    launch_template: &'a str,
    region: &'a str,
    name: &'a str,
    tags: serde_json::Value,
}

/// Client for the compute gateway that fronts the cloud provider's instance API.
pub struct CloudComputeClient {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl CloudComputeClient {
    pub fn new(base_url: &str, api_token: Option<String>, timeout: Duration) -> Result<Self> {
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

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match &self.api_token {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }

    async fn read_instance(response: reqwest::Response, op: &str) -> Result<InstanceView> {
        match response.status() {
            status if status.is_success() => Ok(response.json::<InstanceView>().await?),
            StatusCode::NOT_FOUND => Err(anyhow!("{}: instance not found", op)),
            status => {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                Err(anyhow!("{} failed ({}): {}", op, status, error_text))
            }
        }
    }

    pub async fn launch(
        &self,
        launch_template: &str,
        region: &str,
        sandbox: &Sandbox,
    ) -> Result<InstanceView> {
        let body = LaunchRequest {
            launch_template,
            region,
            name: &sandbox.name,
            tags: serde_json::json!({
                "applyfleet.sandbox_id": sandbox.id.to_string(),
                "applyfleet.environment": sandbox.environment,
            }),
        };
        let response = self
            .request(reqwest::Method::POST, "/instances")
            .json(&body)
            .send()
            .await?;
        Self::read_instance(response, "launch instance").await
    }

    pub async fn start(&self, instance_id: &str) -> Result<InstanceView> {
        let response = self
            .request(reqwest::Method::POST, &format!("/instances/{}/start", instance_id))
            .send()
            .await?;
        Self::read_instance(response, "start instance").await
    }

    pub async fn stop(&self, instance_id: &str) -> Result<InstanceView> {
        let response = self
            .request(reqwest::Method::POST, &format!("/instances/{}/stop", instance_id))
            .send()
            .await?;
        Self::read_instance(response, "stop instance").await
    }

    pub async fn describe(&self, instance_id: &str) -> Result<InstanceView> {
        let response = self
            .request(reqwest::Method::GET, &format!("/instances/{}", instance_id))
            .send()
            .await?;
        Self::read_instance(response, "describe instance").await
    }
}

/// Map the cloud API's instance state names onto [`MachineState`].
pub fn map_instance_state(state: &str) -> MachineState {
    match state.trim().to_ascii_lowercase().as_str() {
        "pending" => MachineState::Starting,
        "running" => MachineState::Running,
        "shutting-down" | "stopping" => MachineState::Stopping,
        "stopped" => MachineState::Stopped,
        "terminated" => MachineState::Terminated,
        _ => MachineState::Unknown,
    }
}

pub struct CloudVmProvider {
    compute: CloudComputeClient,
    launch_template: Option<String>,
    region: String,
    agent_port: u16,
    probe: AgentProbe,
}

impl CloudVmProvider {
    pub fn new(config: &CloudVmConfig, request_timeout: Duration, probe: AgentProbe) -> Result<Self> {
        let compute =
            CloudComputeClient::new(&config.api_url, config.api_token.clone(), request_timeout)?;
        Ok(Self {
            compute,
            launch_template: config.launch_template.clone(),
            region: config.region.clone(),
            agent_port: config.agent_port,
            probe,
        })
    }

    fn result_from_instance(message: String, view: InstanceView) -> MachineActionResult {
        let state = map_instance_state(&view.state);
        MachineActionResult::ok(message, state.sandbox_status())
            .with_backing_state(state)
            .with_assigned(AssignedMachine {
                instance_id: Some(view.instance_id),
                public_ip: view.public_ip,
                private_ip: view.private_ip,
                session_handle: None,
            })
    }
}

#[async_trait]
impl SandboxProvider for CloudVmProvider {
    fn machine_type(&self) -> MachineType {
        MachineType::CloudVm
    }

    async fn start_machine(&self, sandbox: &Sandbox) -> Result<MachineActionResult> {
        match sandbox.instance_id.as_deref() {
            Some(instance_id) => {
                info!("Starting instance {} for sandbox {}", instance_id, sandbox.id);
                let view = self.compute.start(instance_id).await?;
                Ok(Self::result_from_instance(
                    format!("Instance {} start requested", instance_id),
                    view,
                ))
            }
            None => {
                let Some(template) = self.launch_template.as_deref() else {
                    return Ok(MachineActionResult::failed(format!(
                        "Sandbox {} has no instance and no launch template is configured",
                        sandbox.id
                    )));
                };
                info!(
                    "Launching instance from template {} for sandbox {}",
                    template, sandbox.id
                );
                let view = self.compute.launch(template, &self.region, sandbox).await?;
                Ok(Self::result_from_instance(
                    format!("Instance {} launched", view.instance_id),
                    view,
                ))
            }
        }
    }

    async fn stop_machine(&self, sandbox: &Sandbox) -> Result<MachineActionResult> {
        let Some(instance_id) = sandbox.instance_id.as_deref() else {
            warn!("Sandbox {} has no instance to stop", sandbox.id);
            return Ok(MachineActionResult::ok(
                "No backing instance; nothing to stop",
                Some(SandboxStatus::Stopped),
            ));
        };

        info!("Stopping instance {} for sandbox {}", instance_id, sandbox.id);
        let view = self.compute.stop(instance_id).await?;
        let state = map_instance_state(&view.state);
        Ok(MachineActionResult::ok(
            format!("Instance {} stop requested", instance_id),
            state.sandbox_status().or(Some(SandboxStatus::Stopping)),
        )
        .with_backing_state(state))
    }

    async fn get_machine_status(&self, sandbox: &Sandbox) -> Result<MachineStatus> {
        let Some(instance_id) = sandbox.instance_id.as_deref() else {
            return Ok(MachineStatus::of(MachineState::Unknown));
        };
        let view = self.compute.describe(instance_id).await?;
        Ok(MachineStatus {
            state: map_instance_state(&view.state),
            public_ip: view.public_ip,
            private_ip: view.private_ip,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sandbox;

    fn provider(launch_template: Option<&str>) -> CloudVmProvider {
        let config = CloudVmConfig {
            api_url: "http://127.0.0.1:9/".to_string(),
            api_token: None,
            launch_template: launch_template.map(str::to_string),
            region: "us-east-1".to_string(),
            agent_port: 8080,
        };
        let probe = AgentProbe::new(Duration::from_millis(100)).unwrap();
        CloudVmProvider::new(&config, Duration::from_millis(200), probe).unwrap()
    }

    #[test]
    fn maps_cloud_states() {
        assert_eq!(map_instance_state("pending"), MachineState::Starting);
        assert_eq!(map_instance_state("running"), MachineState::Running);
        assert_eq!(map_instance_state("shutting-down"), MachineState::Stopping);
        assert_eq!(map_instance_state("stopping"), MachineState::Stopping);
        assert_eq!(map_instance_state("stopped"), MachineState::Stopped);
        assert_eq!(map_instance_state("terminated"), MachineState::Terminated);
        assert_eq!(map_instance_state("rebooting"), MachineState::Unknown);
    }

    #[tokio::test]
    async fn start_without_instance_or_template_fails_softly() {
        let result = provider(None)
            .start_machine(&sandbox(MachineType::CloudVm))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.new_status.is_none());
    }

    #[tokio::test]
    async fn stop_without_instance_is_a_no_op() {
        let result = provider(Some("lt-1"))
            .stop_machine(&sandbox(MachineType::CloudVm))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.new_status, Some(SandboxStatus::Stopped));
    }

    #[tokio::test]
    async fn unreachable_api_is_an_error_not_a_panic() {
        let mut sbx = sandbox(MachineType::CloudVm);
        sbx.instance_id = Some("i-0abc".to_string());
        assert!(provider(None).get_machine_status(&sbx).await.is_err());
        assert!(!provider(None).ping_agent(&sbx).await);
    }

    #[test]
    fn instance_view_becomes_assignment() {
        let result = CloudVmProvider::result_from_instance(
            "launched".to_string(),
            InstanceView {
                instance_id: "i-9".to_string(),
                state: "pending".to_string(),
                public_ip: None,
                private_ip: Some("10.1.2.3".to_string()),
            },
        );
        assert_eq!(result.new_status, Some(SandboxStatus::Provisioning));
        let assigned = result.assigned.unwrap();
        assert_eq!(assigned.instance_id.as_deref(), Some("i-9"));
        assert_eq!(assigned.private_ip.as_deref(), Some("10.1.2.3"));
    }
}
