use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use super::providers::{
    AgentProbe, AlwaysOnHostProvider, CloudVmProvider, LocalContainerProvider,
    ManagedBrowserProvider, ProviderError, SandboxProvider,
};
use crate::shared::config::ProvidersConfig;
use crate::shared::models::{MachineType, Sandbox};

/// One provider slot per machine type. Resolution is an exhaustive match, so a
/// new `MachineType` variant does not compile until it gets a slot here.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    cloud_vm: Option<Arc<dyn SandboxProvider>>,
    always_on_host: Option<Arc<dyn SandboxProvider>>,
    browser_service: Option<Arc<dyn SandboxProvider>>,
    local_container: Option<Arc<dyn SandboxProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every provider that has a configuration section.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self> {
        let probe = AgentProbe::new(config.agent_ping_timeout())?;
        let request_timeout = config.request_timeout();
        let mut registry = Self::new();

        if let Some(cloud) = &config.cloud_vm {
            registry.register(Arc::new(CloudVmProvider::new(
                cloud,
                request_timeout,
                probe.clone(),
            )?));
        }
        if let Some(host) = &config.always_on_host {
            registry.register(Arc::new(AlwaysOnHostProvider::new(
                host,
                request_timeout,
                probe.clone(),
            )?));
        }
        if let Some(browser) = &config.browser_service {
            registry.register(Arc::new(ManagedBrowserProvider::new(
                browser,
                request_timeout,
            )?));
        }
        if let Some(container) = &config.local_container {
            registry.register(Arc::new(LocalContainerProvider::new(
                container,
                request_timeout,
                probe,
            )?));
        }

        let types: Vec<String> = registry
            .registered_types()
            .iter()
            .map(|t| t.to_string())
            .collect();
        info!("Registered sandbox providers: [{}]", types.join(", "));
        Ok(registry)
    }

    fn slot(&self, machine_type: MachineType) -> &Option<Arc<dyn SandboxProvider>> {
        match machine_type {
            MachineType::CloudVm => &self.cloud_vm,
            MachineType::AlwaysOnHost => &self.always_on_host,
            MachineType::BrowserService => &self.browser_service,
            MachineType::LocalContainer => &self.local_container,
        }
    }

    fn slot_mut(&mut self, machine_type: MachineType) -> &mut Option<Arc<dyn SandboxProvider>> {
        match machine_type {
            MachineType::CloudVm => &mut self.cloud_vm,
            MachineType::AlwaysOnHost => &mut self.always_on_host,
            MachineType::BrowserService => &mut self.browser_service,
            MachineType::LocalContainer => &mut self.local_container,
        }
    }

    /// Register under the provider's own machine type, replacing any earlier one.
    pub fn register(&mut self, provider: Arc<dyn SandboxProvider>) {
        let machine_type = provider.machine_type();
        *self.slot_mut(machine_type) = Some(provider);
    }

    pub fn get_by_type(
        &self,
        machine_type: MachineType,
    ) -> Result<Arc<dyn SandboxProvider>, ProviderError> {
        self.slot(machine_type)
            .clone()
            .ok_or(ProviderError::NotRegistered(machine_type))
    }

    /// Provider for a sandbox record. Records without a machine type belong to
    /// the cloud VM provider.
    pub fn get_provider(&self, sandbox: &Sandbox) -> Result<Arc<dyn SandboxProvider>, ProviderError> {
        self.get_by_type(sandbox.machine_type.unwrap_or(MachineType::CloudVm))
    }

    pub fn registered_types(&self) -> Vec<MachineType> {
        MachineType::ALL
            .into_iter()
            .filter(|t| self.slot(*t).is_some())
            .collect()
    }

    /// Fail when any of `required` has no provider.
    pub fn validate(&self, required: &[MachineType]) -> Result<(), ProviderError> {
        for machine_type in required {
            self.get_by_type(*machine_type)?;
        }
        Ok(())
    }
}
