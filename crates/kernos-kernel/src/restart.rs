//! [`RestartManager`] – bounded, per-kernel serialized restarts.
//!
//! Every kernel has one [`RestartState`] behind its own async mutex.  A
//! restart holds that mutex for its whole duration; a second request that
//! finds it taken returns [`RestartOutcome::Coalesced`] without doing
//! anything.
//!
//! Budget: `attempt_count` never exceeds the kernel's `max_restarts`.  A
//! request that finds the budget spent marks the kernel `Failed`, emits
//! `kernel_failed` and leaves it alone until [`RestartManager::manual_restart`].
//! The count drops back to zero once a restarted kernel has stayed `Running`
//! at the same generation for the stability window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kernos_types::{EventType, KernelState, KernosError, SupervisionEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Uninterrupted `Running` time after which the budget is refilled.
    pub stability_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            stability_window: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    /// `base * 2^attempt`, capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartState {
    pub attempt_count: u32,
    pub last_attempt_at: Option<Instant>,
    pub backoff_until: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RestartOutcome {
    /// A new instance is running.
    Restarted { attempt: u32, generation: u64 },
    /// Another restart of the same kernel was already in flight.
    Coalesced,
    /// The budget was spent; the kernel is now `Failed`.
    BudgetExhausted { attempts: u32 },
    /// Shutdown began while the restart was pending.
    Cancelled,
}

pub struct RestartManager {
    orchestrator: Orchestrator,
    policy: RestartPolicy,
    slots: HashMap<String, Arc<Mutex<RestartState>>>,
}

impl RestartManager {
    pub fn new(orchestrator: Orchestrator, policy: RestartPolicy) -> Self {
        let slots = orchestrator
            .registry()
            .ids()
            .map(|id| (id.to_string(), Arc::new(Mutex::new(RestartState::default()))))
            .collect();
        Self {
            orchestrator,
            policy,
            slots,
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Restart `id` within its budget, retrying failed attempts with
    /// backoff.
    ///
    /// # Errors
    ///
    /// [`KernosError::UnknownKernel`] for an unregistered id.
    pub async fn restart(&self, id: &str) -> Result<RestartOutcome, KernosError> {
        let slot = self.slot(id)?;
        let Ok(mut state) = slot.try_lock() else {
            debug!(kernel = %id, "restart already in flight, coalescing");
            return Ok(RestartOutcome::Coalesced);
        };
        self.attempt_until_running(id, &mut state).await
    }

    /// Operator-requested restart.  Refills the budget and makes one
    /// immediate attempt, even from `Failed`.
    pub async fn manual_restart(&self, id: &str) -> Result<RestartOutcome, KernosError> {
        let slot = self.slot(id)?;
        let Ok(mut state) = slot.try_lock() else {
            return Ok(RestartOutcome::Coalesced);
        };
        *state = RestartState::default();
        let ctx = self.orchestrator.context();
        ctx.set_restart_attempts(id, 0);
        info!(kernel = %id, "manual restart");
        ctx.emit_for(
            id,
            SupervisionEvent::new(EventType::KernelRestarting, id)
                .with("attempt", 0)
                .with("delay_ms", 0)
                .with("manual", true),
        );

        let shutdown = self.orchestrator.shutdown_token();
        self.orchestrator.stop_instance(id).await;
        let generation = ctx.advance_generation(id);
        match self.orchestrator.start_kernel(id, &shutdown).await {
            Ok(()) => {
                self.watch_stability(id, generation);
                Ok(RestartOutcome::Restarted {
                    attempt: 0,
                    generation,
                })
            }
            Err(KernosError::Cancelled(_)) => Ok(RestartOutcome::Cancelled),
            Err(e) => {
                warn!(kernel = %id, error = %e, "manual restart failed");
                ctx.apply(
                    id,
                    KernelState::Failed,
                    SupervisionEvent::new(EventType::KernelFailed, id)
                        .with("reason", e.to_string())
                        .with("manual", true),
                );
                Err(e)
            }
        }
    }

    /// Attempts used so far for `id`.  `None` while a restart holds the slot.
    pub fn attempts(&self, id: &str) -> Option<u32> {
        let slot = self.slots.get(id)?;
        slot.try_lock().ok().map(|s| s.attempt_count)
    }

    async fn attempt_until_running(
        &self,
        id: &str,
        state: &mut RestartState,
    ) -> Result<RestartOutcome, KernosError> {
        let descriptor = self.orchestrator.registry().require(id)?;
        let ctx = self.orchestrator.context();
        let shutdown = self.orchestrator.shutdown_token();

        loop {
            if state.attempt_count >= descriptor.max_restarts {
                let err = KernosError::RestartBudgetExhausted {
                    kernel: id.to_string(),
                    attempts: state.attempt_count,
                };
                warn!(kernel = %id, attempts = state.attempt_count, "restart budget exhausted");
                self.orchestrator.stop_instance(id).await;
                ctx.apply(
                    id,
                    KernelState::Failed,
                    SupervisionEvent::new(EventType::KernelFailed, id)
                        .with("reason", err.to_string())
                        .with("attempts", state.attempt_count)
                        .with("max_restarts", descriptor.max_restarts),
                );
                return Ok(RestartOutcome::BudgetExhausted {
                    attempts: state.attempt_count,
                });
            }

            state.attempt_count += 1;
            let attempt = state.attempt_count;
            let delay = self.policy.backoff_for(attempt - 1);
            let now = Instant::now();
            state.last_attempt_at = Some(now);
            state.backoff_until = Some(now + delay);
            ctx.set_restart_attempts(id, attempt);

            info!(kernel = %id, attempt, delay_ms = delay.as_millis() as u64, "restarting kernel");
            ctx.emit_for(
                id,
                SupervisionEvent::new(EventType::KernelRestarting, id)
                    .with("attempt", attempt)
                    .with("max_restarts", descriptor.max_restarts)
                    .with("delay_ms", delay.as_millis() as u64),
            );

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(RestartOutcome::Cancelled),
                _ = sleep(delay) => {}
            }

            self.orchestrator.stop_instance(id).await;
            let generation = ctx.advance_generation(id);
            match self.orchestrator.start_kernel(id, &shutdown).await {
                Ok(()) => {
                    self.watch_stability(id, generation);
                    return Ok(RestartOutcome::Restarted {
                        attempt,
                        generation,
                    });
                }
                Err(KernosError::Cancelled(_)) => return Ok(RestartOutcome::Cancelled),
                Err(e) => {
                    warn!(kernel = %id, attempt, error = %e, "restart attempt failed");
                    ctx.apply(
                        id,
                        KernelState::Degraded,
                        SupervisionEvent::new(EventType::KernelDegraded, id)
                            .with("reason", e.to_string())
                            .with("attempt", attempt),
                    );
                }
            }
        }
    }

    /// Refill the budget of `id` if generation `generation` stays `Running`
    /// for the whole stability window.
    fn watch_stability(&self, id: &str, generation: u64) {
        let Some(slot) = self.slots.get(id).cloned() else {
            return;
        };
        let ctx = self.orchestrator.context().clone();
        let shutdown = self.orchestrator.shutdown_token();
        let window = self.policy.stability_window;
        let id = id.to_string();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(window) => {}
            }
            let still_up = |ctx: &crate::context::SupervisionContext| {
                ctx.status(&id)
                    .is_some_and(|s| s.state == KernelState::Running && s.generation == generation)
            };
            if !still_up(&ctx) {
                return;
            }
            let mut state = slot.lock().await;
            if still_up(&ctx) && state.attempt_count > 0 {
                debug!(kernel = %id, generation, "kernel stable, restart budget refilled");
                state.attempt_count = 0;
                ctx.set_restart_attempts(&id, 0);
            }
        });
    }

    fn slot(&self, id: &str) -> Result<&Arc<Mutex<RestartState>>, KernosError> {
        self.slots
            .get(id)
            .ok_or_else(|| KernosError::UnknownKernel(id.to_string()))
    }
}
