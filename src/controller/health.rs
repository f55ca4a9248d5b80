use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::lifecycle::settle_transitional;
use super::providers::MachineState;
use super::registry::ProviderRegistry;
use crate::shared::clock::Clock;
use crate::shared::models::{HealthStatus, Sandbox, SandboxStatus, SandboxUpdate};
use crate::shared::repository::SandboxRepository;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HealthSummary {
    pub checked: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub failed: usize,
    /// Provisioning or stopping sandboxes whose machine reached a new state.
    pub settled: usize,
}

/// Pings every live sandbox's agent and records the result. A dead agent
/// triggers a machine-status lookup so a stopped machine is recorded as
/// stopped rather than merely unhealthy. Sandboxes still provisioning or
/// stopping are moved on once their machine reports where it landed.
pub struct HealthMonitor {
    sandboxes: Arc<dyn SandboxRepository>,
    registry: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
}

impl HealthMonitor {
    pub fn new(
        sandboxes: Arc<dyn SandboxRepository>,
        registry: Arc<ProviderRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sandboxes,
            registry,
            clock,
        }
    }

    pub async fn tick(&self) -> HealthSummary {
        match self.check_sandbox_health().await {
            Ok(summary) => {
                if summary.degraded > 0 || summary.failed > 0 {
                    warn!(
                        "Health check: {} healthy, {} degraded, {} failed",
                        summary.healthy, summary.degraded, summary.failed
                    );
                }
                summary
            }
            Err(e) => {
                error!("Error checking sandbox health: {:#}", e);
                HealthSummary::default()
            }
        }
    }

    async fn check_sandbox_health(&self) -> Result<HealthSummary> {
        let live = self
            .sandboxes
            .find_live()
            .await
            .context("Failed to list live sandboxes")?;

        let mut summary = HealthSummary::default();
        for sandbox in live {
            if matches!(
                sandbox.status,
                SandboxStatus::Provisioning | SandboxStatus::Stopping
            ) {
                match settle_transitional(&self.registry, self.sandboxes.as_ref(), &sandbox).await {
                    Ok(Some(_)) => summary.settled += 1,
                    Ok(None) => {}
                    Err(e) => {
                        error!("Could not settle sandbox {}: {:#}", sandbox.id, e);
                        summary.failed += 1;
                    }
                }
                continue;
            }
            if sandbox.status != SandboxStatus::Active && sandbox.status != SandboxStatus::Unhealthy
            {
                continue;
            }
            summary.checked += 1;
            match self.check_one(&sandbox).await {
                Ok(true) => summary.healthy += 1,
                Ok(false) => summary.degraded += 1,
                Err(e) => {
                    error!("Health check for sandbox {} failed: {:#}", sandbox.id, e);
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn check_one(&self, sandbox: &Sandbox) -> Result<bool> {
        let provider = self.registry.get_provider(sandbox)?;
        let now = self.clock.now();

        if provider.ping_agent(sandbox).await {
            let mut update = SandboxUpdate {
                health_status: Some(HealthStatus::Healthy),
                last_health_check: Some(now),
                ..Default::default()
            };
            if sandbox.status == SandboxStatus::Unhealthy {
                info!("Sandbox {} agent is responding again", sandbox.id);
                update.status = Some(SandboxStatus::Active);
            }
            self.sandboxes.update(sandbox.id, update).await?;
            return Ok(true);
        }

        debug!("Sandbox {} agent did not answer its ping", sandbox.id);
        let mut update = SandboxUpdate {
            health_status: Some(HealthStatus::Degraded),
            last_health_check: Some(now),
            ..Default::default()
        };

        match provider.get_machine_status(sandbox).await {
            Ok(status) => {
                update.backing_state = Some(status.state.as_str().to_string());
                match status.state {
                    MachineState::Stopped | MachineState::Terminated => {
                        info!(
                            "Sandbox {} machine is {}; syncing lifecycle status",
                            sandbox.id,
                            status.state.as_str()
                        );
                        update.status = status.state.sandbox_status();
                        update.health_status = Some(HealthStatus::Unhealthy);
                    }
                    MachineState::Running => {
                        warn!(
                            "Sandbox {} machine is running but its agent is unreachable",
                            sandbox.id
                        );
                        update.status = Some(SandboxStatus::Unhealthy);
                        update.health_status = Some(HealthStatus::Unhealthy);
                    }
                    _ => {}
                }
            }
            Err(e) => {
                warn!("Could not read machine status for sandbox {}: {}", sandbox.id, e);
            }
        }

        self.sandboxes.update(sandbox.id, update).await?;
        Ok(false)
    }
}
