use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Handle to a running periodic loop.
pub struct LoopHandle {
    name: &'static str,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl LoopHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Cancel the timer and wait for an in-flight tick to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            warn!("{} loop ended abnormally: {}", self.name, e);
        }
    }
}

/// Run `tick` every `interval` until `parent` (or the returned handle) is
/// cancelled. Slow ticks delay the next one instead of queueing a burst.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    run_immediately: bool,
    parent: &CancellationToken,
    tick: F,
) -> LoopHandle
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let token = parent.child_token();
    let loop_token = token.clone();

    let join = tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        if !run_immediately {
            // interval() fires once right away; swallow it.
            timer.tick().await;
        }
        info!("{} loop started (every {:?})", name, interval);

        loop {
            tokio::select! {
                biased;
                _ = loop_token.cancelled() => break,
                _ = timer.tick() => {}
            }
            tick().await;
        }

        info!("{} loop stopped", name);
    });

    LoopHandle { name, token, join }
}
