//! [`TieredWatchdog`] – heartbeat staleness detection, one loop per tier.
//!
//! Every running kernel should call
//! [`KernelContext::heartbeat`][crate::handle::KernelContext::heartbeat] at
//! regular intervals.  Each tier gets an independent polling task; on every
//! tick it looks at the `Running` kernels of its tier and considers a kernel
//! *stale* when
//!
//! - its last heartbeat is older than the staleness threshold, and
//! - the heartbeat's generation matches the kernel's current generation (a
//!   kernel that is already being replaced is left alone).
//!
//! A stale kernel is marked `Degraded`, `kernel_degraded` is emitted and the
//! [`RestartManager`] takes over.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use kernos_types::{EventType, KernelState, KernosError, SupervisionEvent};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::orchestrator::Orchestrator;
use crate::restart::{RestartManager, RestartOutcome};

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// Polling period of each tier loop.
    pub interval: Duration,
    /// Heartbeat age beyond which a running kernel is stale.
    pub staleness: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            staleness: Duration::from_secs(30),
        }
    }
}

/// A kernel found stale by [`TieredWatchdog::detect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleKernel {
    pub id: String,
    pub stale_for: Duration,
    pub generation: u64,
}

pub struct TieredWatchdog {
    orchestrator: Orchestrator,
    restarts: Arc<RestartManager>,
    config: WatchdogConfig,
}

impl TieredWatchdog {
    pub fn new(orchestrator: Orchestrator, restarts: Arc<RestartManager>, config: WatchdogConfig) -> Self {
        Self {
            orchestrator,
            restarts,
            config,
        }
    }

    /// Stale `Running` kernels of `tier`.  Read-only.
    pub fn detect(&self, tier: u32) -> Vec<StaleKernel> {
        let ctx = self.orchestrator.context();
        self.orchestrator
            .registry()
            .in_tier(tier)
            .into_iter()
            .filter_map(|k| {
                let status = ctx.status(&k.id)?;
                if status.state != KernelState::Running {
                    return None;
                }
                let (seen, generation) = ctx.heartbeats().last_seen(&k.id)?;
                if generation != status.generation {
                    return None;
                }
                let stale_for = seen.elapsed();
                (stale_for > self.config.staleness).then(|| StaleKernel {
                    id: k.id.clone(),
                    stale_for,
                    generation,
                })
            })
            .collect()
    }

    /// Mark every stale kernel of `tier` `Degraded` and emit
    /// `kernel_degraded`.  Returns the ids that still need a restart.
    fn degrade_stale(&self, tier: u32) -> Vec<String> {
        let ctx = self.orchestrator.context();
        let mut degraded = Vec::new();
        for stale in self.detect(tier) {
            if !ctx.transition_if(&stale.id, stale.generation, KernelState::Running, KernelState::Degraded) {
                continue;
            }
            let stale_ms = stale.stale_for.as_millis() as u64;
            let reason = KernosError::KernelCrashed {
                kernel: stale.id.clone(),
                reason: format!("no heartbeat for {stale_ms} ms"),
            };
            warn!(kernel = %stale.id, tier, stale_ms, generation = stale.generation, "heartbeat stale");
            ctx.emit_for(
                &stale.id,
                SupervisionEvent::new(EventType::KernelDegraded, &stale.id)
                    .with("reason", reason.to_string())
                    .with("stale_ms", stale_ms)
                    .with("generation", stale.generation),
            );
            degraded.push(stale.id);
        }
        degraded
    }

    /// One polling pass over `tier`: degrade every stale kernel and run its
    /// restart to completion.  Returns the restart outcome per kernel.
    pub async fn sweep(&self, tier: u32) -> Vec<(String, Result<RestartOutcome, KernosError>)> {
        let degraded = self.degrade_stale(tier);
        let outcomes = join_all(degraded.iter().map(|id| self.restarts.restart(id))).await;
        degraded.into_iter().zip(outcomes).collect()
    }

    /// Spawn one polling task per declared tier.  The tasks end when the
    /// orchestrator's shutdown token fires.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        self.orchestrator
            .registry()
            .tiers()
            .into_iter()
            .map(|tier| {
                let this = self.clone();
                tokio::spawn(async move { this.run_tier(tier).await })
            })
            .collect()
    }

    /// Restarts run as their own tasks so that a kernel sitting in backoff
    /// does not hold up detection for the rest of its tier.
    async fn run_tier(&self, tier: u32) {
        let shutdown = self.orchestrator.shutdown_token();
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        debug!(tier, interval_ms = self.config.interval.as_millis() as u64, "watchdog started");

        let mut restarts = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = restarts.join_next(), if !restarts.is_empty() => log_restart(joined),
                _ = ticker.tick() => {
                    for id in self.degrade_stale(tier) {
                        let manager = self.restarts.clone();
                        restarts.spawn(async move {
                            let outcome = manager.restart(&id).await;
                            (id, outcome)
                        });
                    }
                }
            }
        }
        // Pending restarts see the same shutdown token and wind down.
        while let Some(joined) = restarts.join_next().await {
            log_restart(joined);
        }
        debug!(tier, "watchdog stopped");
    }
}

fn log_restart(joined: Result<(String, Result<RestartOutcome, KernosError>), JoinError>) {
    match joined {
        Ok((id, Ok(outcome))) => debug!(kernel = %id, ?outcome, "restart finished"),
        Ok((id, Err(e))) => warn!(kernel = %id, error = %e, "restart failed"),
        Err(e) => warn!(error = %e, "restart task panicked"),
    }
}
