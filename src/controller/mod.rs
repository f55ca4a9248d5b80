//! Fleet controller: provider adapters plus the background control loops.

pub mod auto_stop;
pub mod autoscale;
pub mod execution;
pub mod health;
pub mod lifecycle;
pub mod providers;
pub mod reconciler;
pub mod registry;
pub mod ticker;

pub use auto_stop::AutoStopper;
pub use autoscale::{AutoScaler, ScaleDecision};
pub use execution::{ExecutionBackend, HttpExecutionBackend, SyncOutcome};
pub use health::HealthMonitor;
pub use reconciler::{ReconciliationSummary, StaleTaskReconciler};
pub use registry::ProviderRegistry;
pub use ticker::{spawn_periodic, LoopHandle};

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::{BroadcastPublisher, EventPublisher, WebhookPublisher};
use crate::queue::{MySqlQueueBackend, QueueBackend, TaskQueueGateway};
use crate::shared::clock::{Clock, SystemClock};
use crate::shared::config::FleetConfig;
use crate::shared::database::{init_database, MySqlSandboxRepository, MySqlTaskRepository};
use crate::shared::repository::{SandboxRepository, TaskRepository};

/// Wire every component from `config`, run the enabled loops until ctrl-c,
/// then stop them and wait for in-flight ticks.
pub async fn run(config: FleetConfig) -> Result<()> {
    info!("Starting applyfleet controller...");

    let pool = init_database(
        &config.database_url,
        Duration::from_secs(config.database_acquire_timeout_secs),
    )
    .await?;
    info!("Connected to MySQL");

    let sandboxes: Arc<dyn SandboxRepository> = Arc::new(MySqlSandboxRepository::new(pool.clone()));
    let tasks: Arc<dyn TaskRepository> = Arc::new(MySqlTaskRepository::new(pool.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let registry = Arc::new(ProviderRegistry::from_config(&config.providers)?);
    if config.auto_scale.enabled {
        registry.validate(&[config.auto_scale.machine_type])?;
    }

    let queue_backend: Option<Arc<dyn QueueBackend>> = if config.queue.enabled {
        Some(Arc::new(MySqlQueueBackend::new(pool.clone())))
    } else {
        warn!("Job queue disabled; queue depth falls back to the task table");
        None
    };
    let queue = Arc::new(TaskQueueGateway::new(
        queue_backend,
        config.queue.shared_queue.clone(),
        Duration::from_millis(config.queue.operation_timeout_ms),
    ));

    let publisher: Arc<dyn EventPublisher> = match config.events.webhook_url.as_deref() {
        Some(url) => {
            info!("Publishing events to webhook {}", url);
            Arc::new(WebhookPublisher::new(url, config.providers.request_timeout())?)
        }
        None => Arc::new(BroadcastPublisher::new(config.events.channel_capacity)),
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Shutting down applyfleet controller...");
        signal_token.cancel();
    })?;

    let mut handles: Vec<LoopHandle> = Vec::new();

    if config.auto_scale.enabled {
        let scaler = Arc::new(AutoScaler::new(
            config.auto_scale.clone(),
            sandboxes.clone(),
            tasks.clone(),
            registry.clone(),
            queue.clone(),
            clock.clone(),
        ));
        handles.push(spawn_periodic(
            "auto-scale",
            config.auto_scale.interval(),
            false,
            &shutdown,
            move || {
                let scaler = scaler.clone();
                async move {
                    scaler.tick().await;
                }
            },
        ));
    }

    if config.auto_stop.enabled {
        let stopper = Arc::new(AutoStopper::new(
            sandboxes.clone(),
            registry.clone(),
            clock.clone(),
        ));
        handles.push(spawn_periodic(
            "auto-stop",
            config.auto_stop.interval(),
            true,
            &shutdown,
            move || {
                let stopper = stopper.clone();
                async move {
                    stopper.tick().await;
                }
            },
        ));
    }

    if config.reconciliation.enabled {
        let url = config
            .execution_backend
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("reconciliation requires execution_backend.url"))?;
        let backend = Arc::new(HttpExecutionBackend::new(
            url,
            config.execution_backend.api_token.clone(),
            Duration::from_secs(config.execution_backend.timeout_secs),
        )?);
        let reconciler = Arc::new(StaleTaskReconciler::new(
            config.reconciliation.clone(),
            tasks.clone(),
            backend,
            publisher.clone(),
            clock.clone(),
        ));
        handles.push(spawn_periodic(
            "reconciliation",
            config.reconciliation.interval(),
            true,
            &shutdown,
            move || {
                let reconciler = reconciler.clone();
                async move {
                    reconciler.tick().await;
                }
            },
        ));
    }

    if config.health.enabled {
        let monitor = Arc::new(HealthMonitor::new(
            sandboxes.clone(),
            registry.clone(),
            clock.clone(),
        ));
        handles.push(spawn_periodic(
            "health",
            config.health.interval(),
            true,
            &shutdown,
            move || {
                let monitor = monitor.clone();
                async move {
                    monitor.tick().await;
                }
            },
        ));
    }

    if handles.is_empty() {
        warn!("No control loops enabled; controller is idle");
    } else {
        let names: Vec<&str> = handles.iter().map(|h| h.name()).collect();
        info!("Control loops running: {}", names.join(", "));
    }

    shutdown.cancelled().await;

    futures::future::join_all(handles.into_iter().map(LoopHandle::stop)).await;
    pool.close().await;
    info!("Controller stopped");
    Ok(())
}
