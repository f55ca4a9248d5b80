//! Provider calls paired with the record write-back they imply.

use anyhow::Result;
use tracing::{error, info, warn};

use super::providers::{MachineActionResult, MachineState};
use super::registry::ProviderRegistry;
use crate::shared::models::{Sandbox, SandboxStatus, SandboxUpdate};
use crate::shared::repository::SandboxRepository;

/// Start through the sandbox's provider. A refused or failed start leaves
/// the record `unhealthy`.
pub async fn start_and_record(
    registry: &ProviderRegistry,
    sandboxes: &dyn SandboxRepository,
    sandbox: &Sandbox,
) -> Result<MachineActionResult> {
    let provider = registry.get_provider(sandbox)?;

    let result = match provider.start_machine(sandbox).await {
        Ok(result) => result,
        Err(e) => {
            error!("Failed to start sandbox {}: {}", sandbox.id, e);
            sandboxes
                .update(sandbox.id, SandboxUpdate::status(SandboxStatus::Unhealthy))
                .await?;
            return Err(e);
        }
    };

    if result.success {
        let update = result.to_update();
        if !update.is_empty() {
            sandboxes.update(sandbox.id, update).await?;
        }
        info!("Sandbox {} started: {}", sandbox.id, result.message);
    } else {
        warn!("Sandbox {} did not start: {}", sandbox.id, result.message);
        sandboxes
            .update(sandbox.id, SandboxUpdate::status(SandboxStatus::Unhealthy))
            .await?;
    }
    Ok(result)
}

/// Stop through the sandbox's provider. Only a successful stop touches the
/// record; a soft failure is returned for the caller to log.
pub async fn stop_and_record(
    registry: &ProviderRegistry,
    sandboxes: &dyn SandboxRepository,
    sandbox: &Sandbox,
) -> Result<MachineActionResult> {
    let provider = registry.get_provider(sandbox)?;
    let result = provider.stop_machine(sandbox).await?;

    if result.success {
        let update = result.to_update();
        if !update.is_empty() {
            sandboxes.update(sandbox.id, update).await?;
        }
        info!("Sandbox {} stopped: {}", sandbox.id, result.message);
    } else {
        warn!("Sandbox {} did not stop: {}", sandbox.id, result.message);
    }
    Ok(result)
}

/// Ask the provider where a `provisioning` or `stopping` sandbox has got to
/// and record the settled status with any addresses it reported. Returns the
/// new status when it changed.
pub async fn settle_transitional(
    registry: &ProviderRegistry,
    sandboxes: &dyn SandboxRepository,
    sandbox: &Sandbox,
) -> Result<Option<SandboxStatus>> {
    let provider = registry.get_provider(sandbox)?;
    let machine = provider.get_machine_status(sandbox).await?;

    let settled = match (sandbox.status, machine.state) {
        (_, MachineState::Unknown) => None,
        (SandboxStatus::Provisioning, MachineState::Starting) => None,
        (SandboxStatus::Stopping, MachineState::Stopping) => None,
        (SandboxStatus::Stopping, MachineState::Running | MachineState::Starting) => None,
        (_, state) => state.sandbox_status(),
    };

    let update = SandboxUpdate {
        status: settled.filter(|status| *status != sandbox.status),
        public_ip: machine.public_ip,
        private_ip: machine.private_ip,
        backing_state: Some(machine.state.as_str().to_string()),
        ..Default::default()
    };
    let changed = update.status;
    sandboxes.update(sandbox.id, update).await?;

    if let Some(status) = changed {
        info!(
            "Sandbox {} settled from {} to {} (machine {})",
            sandbox.id,
            sandbox.status,
            status,
            machine.state.as_str()
        );
    }
    Ok(changed)
}
