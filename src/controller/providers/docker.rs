use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, StartContainerOptions,
        StopContainerOptions,
    },
    models::{ContainerInspectResponse, ContainerStateStatusEnum, HostConfig},
    Docker,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info, warn};

use super::{
    agent_url_from_ips, AgentProbe, AssignedMachine, MachineActionResult, MachineState,
    MachineStatus, ProviderError, SandboxProvider,
};
use crate::shared::config::LocalContainerConfig;
use crate::shared::models::{MachineType, Sandbox, SandboxStatus};

pub fn map_container_state(status: Option<ContainerStateStatusEnum>) -> MachineState {
    match status {
        Some(ContainerStateStatusEnum::RUNNING) => MachineState::Running,
        Some(ContainerStateStatusEnum::CREATED) | Some(ContainerStateStatusEnum::RESTARTING) => {
            MachineState::Starting
        }
        Some(ContainerStateStatusEnum::REMOVING) => MachineState::Stopping,
        Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::PAUSED) => {
            MachineState::Stopped
        }
        Some(ContainerStateStatusEnum::DEAD) => MachineState::Terminated,
        _ => MachineState::Unknown,
    }
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_not_modified(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

/// First address the container holds on any attached network.
fn container_ip(info: &ContainerInspectResponse) -> Option<String> {
    let settings = info.network_settings.as_ref()?;
    settings
        .networks
        .as_ref()
        .and_then(|networks| {
            networks
                .values()
                .filter_map(|endpoint| endpoint.ip_address.clone())
                .find(|ip| !ip.is_empty())
        })
        .or_else(|| settings.ip_address.clone().filter(|ip| !ip.is_empty()))
}

/// Containers on the local Docker daemon, used for development fleets.
pub struct LocalContainerProvider {
    docker: Docker,
    image: String,
    agent_port: u16,
    network: Option<String>,
    op_timeout: Duration,
    probe: AgentProbe,
}

impl LocalContainerProvider {
    pub fn new(config: &LocalContainerConfig, op_timeout: Duration, probe: AgentProbe) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| anyhow!("Failed to connect to Docker: {}", e))?;
        Ok(Self {
            docker,
            image: config.image.clone(),
            agent_port: config.agent_port,
            network: config.network.clone(),
            op_timeout,
            probe,
        })
    }

    pub fn container_name(sandbox: &Sandbox) -> String {
        format!("applyfleet_sandbox_{}", sandbox.id)
    }

    fn target(sandbox: &Sandbox) -> String {
        sandbox
            .instance_id
            .clone()
            .unwrap_or_else(|| Self::container_name(sandbox))
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T, bollard::errors::Error>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context(format!("Docker {} failed", op))),
            Err(_) => Err(anyhow!("Docker {} timed out after {:?}", op, self.op_timeout)),
        }
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInspectResponse>> {
        let result = tokio::time::timeout(
            self.op_timeout,
            self.docker
                .inspect_container(name, None::<InspectContainerOptions>),
        )
        .await
        .map_err(|_| anyhow!("Docker inspect of {} timed out", name))?;

        match result {
            Ok(info) => Ok(Some(info)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(anyhow!("Failed to inspect container {}: {}", name, e)),
        }
    }

    async fn create(&self, sandbox: &Sandbox, name: &str) -> Result<String> {
        let mut labels = HashMap::new();
        labels.insert("applyfleet.sandbox_id".to_string(), sandbox.id.to_string());
        labels.insert(
            "applyfleet.environment".to_string(),
            sandbox.environment.clone(),
        );

        let config = Config {
            image: Some(self.image.clone()),
            hostname: Some(format!("sandbox-{}", &sandbox.id.simple().to_string()[..8])),
            labels: Some(labels),
            env: Some(vec![
                format!("SANDBOX_ID={}", sandbox.id),
                format!("AGENT_PORT={}", self.agent_port),
            ]),
            host_config: Some(HostConfig {
                network_mode: self.network.clone(),
                extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        };

        let created = self
            .bounded("create", self.docker.create_container(Some(options), config))
            .await?;
        info!("Container {} created for sandbox {}", name, sandbox.id);
        Ok(created.id)
    }
}

#[async_trait]
impl SandboxProvider for LocalContainerProvider {
    fn machine_type(&self) -> MachineType {
        MachineType::LocalContainer
    }

    async fn start_machine(&self, sandbox: &Sandbox) -> Result<MachineActionResult> {
        let name = Self::target(sandbox);

        let existing = self.inspect(&name).await?;
        let running = existing
            .as_ref()
            .and_then(|info| info.state.as_ref())
            .and_then(|state| state.running)
            .unwrap_or(false);

        if existing.is_none() {
            self.create(sandbox, &name).await?;
        }
        if !running {
            match self
                .bounded(
                    "start",
                    self.docker
                        .start_container(&name, None::<StartContainerOptions<String>>),
                )
                .await
            {
                Ok(()) => info!("Container {} started", name),
                Err(e) => {
                    error!("Failed to start container {}: {}", name, e);
                    return Ok(MachineActionResult::failed(format!(
                        "Failed to start container {}: {}",
                        name, e
                    )));
                }
            }
        }

        let info = self.inspect(&name).await?;
        let state = map_container_state(
            info.as_ref()
                .and_then(|i| i.state.as_ref())
                .and_then(|s| s.status),
        );
        let private_ip = info.as_ref().and_then(container_ip);

        Ok(MachineActionResult::ok(
            format!("Container {} running", name),
            state.sandbox_status().or(Some(SandboxStatus::Active)),
        )
        .with_backing_state(state)
        .with_assigned(AssignedMachine {
            instance_id: Some(name),
            private_ip,
            ..Default::default()
        }))
    }

    async fn stop_machine(&self, sandbox: &Sandbox) -> Result<MachineActionResult> {
        let name = Self::target(sandbox);
        info!("Stopping container {}", name);

        let result = tokio::time::timeout(
            self.op_timeout,
            self.docker
                .stop_container(&name, Some(StopContainerOptions { t: 10 })),
        )
        .await
        .map_err(|_| anyhow!("Docker stop of {} timed out", name))?;

        match result {
            Ok(()) => Ok(MachineActionResult::ok(
                format!("Container {} stopped", name),
                Some(SandboxStatus::Stopped),
            )
            .with_backing_state(MachineState::Stopped)),
            Err(e) if is_not_found(&e) || is_not_modified(&e) => {
                warn!(
                    "Container {} already stopped or doesn't exist, treating as success",
                    name
                );
                Ok(MachineActionResult::ok(
                    format!("Container {} already stopped", name),
                    Some(SandboxStatus::Stopped),
                ))
            }
            Err(e) => {
                error!("Failed to stop container {}: {}", name, e);
                Ok(MachineActionResult::failed(format!(
                    "Failed to stop container {}: {}",
                    name, e
                )))
            }
        }
    }

    async fn get_machine_status(&self, sandbox: &Sandbox) -> Result<MachineStatus> {
        let name = Self::target(sandbox);
        let Some(info) = self.inspect(&name).await? else {
            return Ok(MachineStatus::of(MachineState::Terminated));
        };
        Ok(MachineStatus {
            state: map_container_state(info.state.as_ref().and_then(|s| s.status)),
            public_ip: None,
            private_ip: container_ip(&info),
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
