use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::lifecycle::stop_and_record;
use super::registry::ProviderRegistry;
use crate::shared::clock::Clock;
use crate::shared::repository::SandboxRepository;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AutoStopSummary {
    pub candidates: usize,
    pub stopped: usize,
    pub not_due: usize,
    pub failed: usize,
}

/// Stops sandboxes that have sat idle past their own threshold.
pub struct AutoStopper {
    sandboxes: Arc<dyn SandboxRepository>,
    registry: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
}

impl AutoStopper {
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

    pub async fn tick(&self) -> AutoStopSummary {
        match self.process_auto_stop().await {
            Ok(summary) => {
                if summary.stopped > 0 || summary.failed > 0 {
                    info!(
                        "Auto-stop: {} stopped, {} failed, {} not yet due",
                        summary.stopped, summary.failed, summary.not_due
                    );
                }
                summary
            }
            Err(e) => {
                error!("Error processing auto-stop: {:#}", e);
                AutoStopSummary::default()
            }
        }
    }

    async fn process_auto_stop(&self) -> Result<AutoStopSummary> {
        let candidates = self
            .sandboxes
            .find_auto_stop_candidates()
            .await
            .context("Failed to find sandboxes to auto-stop")?;
        let now = self.clock.now();
        let mut summary = AutoStopSummary {
            candidates: candidates.len(),
            ..Default::default()
        };

        for sandbox in candidates {
            if !sandbox.is_past_idle_threshold(now) {
                debug!(
                    "Sandbox {} idle for {}m of {}m; leaving it running",
                    sandbox.id,
                    (now - sandbox.updated_at).num_minutes(),
                    sandbox.idle_minutes_before_stop
                );
                summary.not_due += 1;
                continue;
            }

            info!(
                "Auto-stopping sandbox {} due to idle timeout ({}m)",
                sandbox.id, sandbox.idle_minutes_before_stop
            );
            match stop_and_record(&self.registry, self.sandboxes.as_ref(), &sandbox).await {
                Ok(result) if result.success => summary.stopped += 1,
                Ok(result) => {
                    warn!("Auto-stop of sandbox {} refused: {}", sandbox.id, result.message);
                    summary.failed += 1;
                }
                Err(e) => {
                    error!("Failed to auto-stop sandbox {}: {}", sandbox.id, e);
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }
}
