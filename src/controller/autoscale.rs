use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::lifecycle::{settle_transitional, start_and_record, stop_and_record};
use super::registry::ProviderRegistry;
use crate::queue::TaskQueueGateway;
use crate::shared::clock::Clock;
use crate::shared::config::AutoScaleConfig;
use crate::shared::models::{NewSandbox, Sandbox, SandboxStatus};
use crate::shared::repository::{SandboxRepository, TaskRepository};

/// Outcome of one auto-scale tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    ScaleUp { sandbox_id: Uuid },
    ScaleDown { sandbox_id: Uuid },
    NoAction { reason: String },
    Cooldown,
}

impl ScaleDecision {
    fn no_action(reason: impl Into<String>) -> Self {
        ScaleDecision::NoAction {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ScaleDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleDecision::ScaleUp { sandbox_id } => write!(f, "scale up ({})", sandbox_id),
            ScaleDecision::ScaleDown { sandbox_id } => write!(f, "scale down ({})", sandbox_id),
            ScaleDecision::NoAction { reason } => write!(f, "no action: {}", reason),
            ScaleDecision::Cooldown => f.write_str("cooldown"),
        }
    }
}

/// Name prefix of the records this scaler creates.
const AUTOSCALE_PREFIX: &str = "autoscale-";

/// Managed sandboxes split by what they contribute to capacity.
#[derive(Debug, Default)]
struct FleetSnapshot {
    running: Vec<Sandbox>,
    idle: Vec<Sandbox>,
    pending: usize,
    /// Our own records whose start failed; retried before creating more.
    failed: Vec<Sandbox>,
}

impl FleetSnapshot {
    fn partition(sandboxes: Vec<Sandbox>) -> Self {
        let mut snapshot = FleetSnapshot::default();
        for sandbox in sandboxes {
            match sandbox.status {
                SandboxStatus::Active if sandbox.is_idle() => {
                    snapshot.idle.push(sandbox.clone());
                    snapshot.running.push(sandbox);
                }
                SandboxStatus::Active => snapshot.running.push(sandbox),
                SandboxStatus::Provisioning => snapshot.pending += 1,
                SandboxStatus::Unhealthy if sandbox.name.starts_with(AUTOSCALE_PREFIX) => {
                    snapshot.failed.push(sandbox)
                }
                _ => {}
            }
        }
        snapshot
    }

    /// Running plus already-requested capacity.
    fn active_count(&self) -> usize {
        self.running.len() + self.pending
    }

    /// The sandbox idle the longest: oldest `updated_at`, then lowest id.
    fn longest_idle(&self) -> Option<&Sandbox> {
        oldest(&self.idle)
    }

    fn retry_candidate(&self) -> Option<&Sandbox> {
        oldest(&self.failed)
    }
}

fn oldest(sandboxes: &[Sandbox]) -> Option<&Sandbox> {
    sandboxes
        .iter()
        .min_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)))
}

/// Grows or shrinks the policy-managed part of the fleet by at most one
/// sandbox per tick.
pub struct AutoScaler {
    config: AutoScaleConfig,
    sandboxes: Arc<dyn SandboxRepository>,
    tasks: Arc<dyn TaskRepository>,
    registry: Arc<ProviderRegistry>,
    queue: Arc<TaskQueueGateway>,
    clock: Arc<dyn Clock>,
    last_scale_event: Mutex<Option<DateTime<Utc>>>,
}

impl AutoScaler {
    pub fn new(
        config: AutoScaleConfig,
        sandboxes: Arc<dyn SandboxRepository>,
        tasks: Arc<dyn TaskRepository>,
        registry: Arc<ProviderRegistry>,
        queue: Arc<TaskQueueGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            sandboxes,
            tasks,
            registry,
            queue,
            clock,
            last_scale_event: Mutex::new(None),
        }
    }

    pub fn last_scale_event(&self) -> Option<DateTime<Utc>> {
        *self
            .last_scale_event
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    fn record_scale_event(&self, at: DateTime<Utc>) {
        let mut last = self
            .last_scale_event
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        *last = Some(at);
    }

    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        match self.last_scale_event() {
            Some(last) => now - last < self.config.cooldown(),
            None => false,
        }
    }

    /// One tick. Errors are logged and reported as `NoAction`; they never
    /// escape to the loop.
    pub async fn tick(&self) -> ScaleDecision {
        let decision = match self.evaluate().await {
            Ok(decision) => decision,
            Err(e) => {
                error!("Error processing auto-scale: {:#}", e);
                ScaleDecision::no_action(format!("error: {}", e))
            }
        };
        match &decision {
            ScaleDecision::NoAction { reason } => debug!("Auto-scale: no action ({})", reason),
            ScaleDecision::Cooldown => debug!("Auto-scale: in cooldown"),
            other => info!("Auto-scale: {}", other),
        }
        decision
    }

    async fn evaluate(&self) -> Result<ScaleDecision> {
        let now = self.clock.now();
        if self.in_cooldown(now) {
            return Ok(ScaleDecision::Cooldown);
        }

        let queue_depth = self.queue_depth().await?;
        let mut managed = self
            .sandboxes
            .find_by_machine_type(self.config.machine_type)
            .await
            .context("Failed to list managed sandboxes")?;
        for sandbox in managed
            .iter_mut()
            .filter(|s| s.status == SandboxStatus::Provisioning)
        {
            match settle_transitional(&self.registry, self.sandboxes.as_ref(), sandbox).await {
                Ok(Some(status)) => sandbox.status = status,
                Ok(None) => {}
                Err(e) => warn!("Could not settle provisioning sandbox {}: {:#}", sandbox.id, e),
            }
        }
        let fleet = FleetSnapshot::partition(managed);

        debug!(
            "Auto-scale snapshot: depth={} running={} idle={} pending={}",
            queue_depth,
            fleet.running.len(),
            fleet.idle.len(),
            fleet.pending
        );

        if queue_depth > 0 && fleet.idle.is_empty() && fleet.active_count() < self.config.max_sandboxes
        {
            let sandbox_id = match fleet.retry_candidate() {
                Some(failed) => self.retry_start(failed, now).await,
                None => self.scale_up(now).await?,
            };
            return Ok(ScaleDecision::ScaleUp { sandbox_id });
        }

        if queue_depth == 0 && fleet.idle.len() > self.config.min_sandboxes {
            if let Some(target) = fleet.longest_idle() {
                self.scale_down(target, now).await?;
                return Ok(ScaleDecision::ScaleDown {
                    sandbox_id: target.id,
                });
            }
        }

        Ok(ScaleDecision::no_action(format!(
            "depth={} idle={} active={}",
            queue_depth,
            fleet.idle.len(),
            fleet.active_count()
        )))
    }

    /// Queued work from the job queue, falling back to the task table when
    /// the queue cannot be reached.
    async fn queue_depth(&self) -> Result<u64> {
        match self.queue.get_stats().await {
            Ok(stats) => Ok(stats.queued),
            Err(unavailable) => {
                warn!("{}; counting queued tasks instead", unavailable);
                let count = self
                    .tasks
                    .count_queued()
                    .await
                    .context("Failed to count queued tasks")?;
                Ok(count.max(0) as u64)
            }
        }
    }

    async fn scale_up(&self, now: DateTime<Utc>) -> Result<Uuid> {
        let short_id = Uuid::new_v4().simple().to_string();
        let new_sandbox = NewSandbox {
            name: format!("{}{}", AUTOSCALE_PREFIX, &short_id[..8]),
            environment: self.config.environment.clone(),
            machine_type: self.config.machine_type,
            capacity: self.config.capacity,
            auto_stop_enabled: true,
            idle_minutes_before_stop: self.config.idle_minutes_before_stop,
        };
        let sandbox = self
            .sandboxes
            .create(new_sandbox)
            .await
            .context("Failed to create autoscaled sandbox record")?;
        info!(
            "Scaling up: provisioning sandbox {} ({})",
            sandbox.id, sandbox.name
        );
        self.record_scale_event(now);

        if let Err(e) = start_and_record(&self.registry, self.sandboxes.as_ref(), &sandbox).await {
            error!("Failed to start autoscaled sandbox {}: {}", sandbox.id, e);
        }
        Ok(sandbox.id)
    }

    async fn retry_start(&self, sandbox: &Sandbox, now: DateTime<Utc>) -> Uuid {
        info!(
            "Scaling up: restarting failed sandbox {} ({})",
            sandbox.id, sandbox.name
        );
        self.record_scale_event(now);

        if let Err(e) = start_and_record(&self.registry, self.sandboxes.as_ref(), sandbox).await {
            error!("Failed to restart autoscaled sandbox {}: {}", sandbox.id, e);
        }
        sandbox.id
    }

    async fn scale_down(&self, target: &Sandbox, now: DateTime<Utc>) -> Result<()> {
        info!(
            "Scaling down: stopping idle sandbox {} (idle since {})",
            target.id, target.updated_at
        );
        self.record_scale_event(now);
        stop_and_record(&self.registry, self.sandboxes.as_ref(), target).await?;
        Ok(())
    }
}
