//! [`Orchestrator`] – walks the boot batches and owns the single-kernel
//! start/stop primitives.
//!
//! # Boot
//!
//! 1. [`schedule`] the registry.  A scheduling error (cycle, unknown
//!    dependency) emits `boot_aborted` and is returned before any kernel is
//!    touched.
//! 2. For each batch, start every kernel on its own task (`JoinSet`) and wait
//!    for all of them.  Each start is bounded by the kernel's ready timeout.
//!    - `can_fail` kernels that fail become `Degraded` (`kernel_degraded`).
//!    - A required kernel that fails becomes `Failed` (`kernel_failed`); the
//!      rest of its batch is cancelled and no later batch runs.
//! 3. The optional [`Guardian`] reviews every finished batch.
//! 4. `boot_complete` or `boot_aborted` is emitted with every kernel's final
//!    snapshot.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use kernos_middleware::EventBus;
use kernos_types::{
    BOOT_SUBJECT, BootOutcome, EventType, KernelSnapshot, KernelState, KernosError,
    SupervisionEvent,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::context::SupervisionContext;
use crate::guardian::{BatchReview, Guardian, Verdict};
use crate::handle::KernelContext;
use crate::registry::KernelRegistry;
use crate::scheduler::{BootBatch, schedule};

/// How long a guardian may deliberate before its silence counts as a
/// rejection.
const GUARDIAN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Default readiness deadline for kernels without their own.
    pub ready_timeout: Duration,
    /// Time `stop()` gets before the instance is force-terminated.
    pub stop_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(3),
        }
    }
}

/// Result of one [`Orchestrator::boot`] run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BootReport {
    pub outcome: BootOutcome,
    pub batches: Vec<BootBatch>,
    pub kernels: Vec<KernelSnapshot>,
    pub elapsed: Duration,
}

impl BootReport {
    pub fn is_complete(&self) -> bool {
        self.outcome == BootOutcome::Complete
    }

    pub fn kernel(&self, id: &str) -> Option<&KernelSnapshot> {
        self.kernels.iter().find(|k| k.id == id)
    }
}

/// Cheap to clone; clones share the registry, the context and the shutdown
/// token.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<KernelRegistry>,
    ctx: Arc<SupervisionContext>,
    config: OrchestratorConfig,
    guardian: Option<Arc<dyn Guardian>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(registry: KernelRegistry, bus: EventBus, config: OrchestratorConfig) -> Self {
        let ctx = Arc::new(SupervisionContext::new(&registry, bus));
        Self {
            registry: Arc::new(registry),
            ctx,
            config,
            guardian: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_guardian(mut self, guardian: Arc<dyn Guardian>) -> Self {
        self.guardian = Some(guardian);
        self
    }

    pub fn context(&self) -> &Arc<SupervisionContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<KernelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Cancelled by [`shutdown`](Self::shutdown).  Watchdogs and restarts
    /// stop when it fires.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start every kernel in dependency order.
    ///
    /// # Errors
    ///
    /// Only scheduling errors are returned; kernel failures are reported in
    /// the [`BootReport`].
    #[instrument(skip(self), fields(kernels = self.registry.len()))]
    pub async fn boot(&self) -> Result<BootReport, KernosError> {
        let started_at = Instant::now();
        let batches = match schedule(&self.registry) {
            Ok(batches) => batches,
            Err(e) => {
                error!(error = %e, "boot aborted before any kernel was started");
                self.ctx.emit(
                    SupervisionEvent::new(EventType::BootAborted, BOOT_SUBJECT)
                        .with("reason", e.to_string()),
                );
                return Err(e);
            }
        };
        info!(batches = batches.len(), "boot started");
        self.ctx.emit(
            SupervisionEvent::new(EventType::BootStarted, BOOT_SUBJECT)
                .with("batches", serde_json::to_value(&batches)?),
        );

        let mut abort: Option<String> = None;
        let mut total_degraded: Vec<String> = Vec::new();

        for batch in &batches {
            if self.shutdown.is_cancelled() {
                abort = Some("shutdown requested during boot".into());
                break;
            }
            debug!(batch = batch.index, kernels = ?batch.kernels, "starting batch");

            let cancel = self.shutdown.child_token();
            let mut starts = JoinSet::new();
            for id in &batch.kernels {
                let this = self.clone();
                let id = id.clone();
                let cancel = cancel.clone();
                starts.spawn(async move {
                    let result = this.start_kernel(&id, &cancel).await;
                    (id, result)
                });
            }

            let mut started = Vec::new();
            let mut degraded = Vec::new();
            while let Some(joined) = starts.join_next().await {
                let (id, result) = match joined {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "kernel start task did not finish");
                        abort.get_or_insert_with(|| format!("kernel start task failed: {e}"));
                        cancel.cancel();
                        continue;
                    }
                };
                match result {
                    Ok(()) => started.push(id),
                    Err(KernosError::Cancelled(_)) => {
                        debug!(kernel = %id, "start cancelled");
                    }
                    Err(e) if self.registry.get(&id).is_some_and(|k| k.can_fail) => {
                        warn!(kernel = %id, error = %e, "optional kernel degraded");
                        self.ctx.apply(
                            &id,
                            KernelState::Degraded,
                            SupervisionEvent::new(EventType::KernelDegraded, &id)
                                .with("reason", e.to_string()),
                        );
                        degraded.push(id);
                    }
                    Err(e) => {
                        error!(kernel = %id, error = %e, "required kernel failed to start");
                        self.ctx.apply(
                            &id,
                            KernelState::Failed,
                            SupervisionEvent::new(EventType::KernelFailed, &id)
                                .with("reason", e.to_string()),
                        );
                        abort.get_or_insert_with(|| format!("required kernel {id} failed: {e}"));
                        cancel.cancel();
                    }
                }
            }

            // A start task that vanished leaves its kernel in `Starting`.
            for id in &batch.kernels {
                if self.ctx.state(id) == Some(KernelState::Starting) {
                    self.stop_instance(id).await;
                    self.ctx.apply(
                        id,
                        KernelState::Failed,
                        SupervisionEvent::new(EventType::KernelFailed, id)
                            .with("reason", "start task did not complete"),
                    );
                }
            }

            if abort.is_some() {
                break;
            }
            total_degraded.extend(degraded.iter().cloned());

            if let Some(guardian) = &self.guardian {
                let review = BatchReview {
                    index: batch.index,
                    started,
                    degraded: degraded.clone(),
                    total_degraded: total_degraded.clone(),
                };
                let verdict = timeout(GUARDIAN_TIMEOUT, guardian.review(&review))
                    .await
                    .unwrap_or_else(|_| Verdict::Abort {
                        reason: "guardian did not answer in time".into(),
                    });
                if let Verdict::Abort { reason } = verdict {
                    warn!(batch = batch.index, %reason, "guardian rejected boot");
                    for id in &degraded {
                        self.ctx.apply(
                            id,
                            KernelState::Failed,
                            SupervisionEvent::new(EventType::KernelFailed, id)
                                .with("reason", format!("rejected by guardian: {reason}")),
                        );
                    }
                    abort = Some(format!("guardian rejected batch {}: {reason}", batch.index));
                    break;
                }
            }
        }

        let kernels = self.snapshot();
        let elapsed = started_at.elapsed();
        let (outcome, event) = match abort {
            None => {
                info!(elapsed_ms = elapsed.as_millis() as u64, "boot complete");
                (
                    BootOutcome::Complete,
                    SupervisionEvent::new(EventType::BootComplete, BOOT_SUBJECT),
                )
            }
            Some(reason) => {
                error!(%reason, "boot aborted");
                (
                    BootOutcome::Aborted {
                        reason: reason.clone(),
                    },
                    SupervisionEvent::new(EventType::BootAborted, BOOT_SUBJECT)
                        .with("reason", reason),
                )
            }
        };
        self.ctx.emit(
            event
                .with("kernels", serde_json::to_value(&kernels)?)
                .with("elapsed_ms", elapsed.as_millis() as u64),
        );

        Ok(BootReport {
            outcome,
            batches,
            kernels,
            elapsed,
        })
    }

    /// Start one kernel and wait for it to become ready.
    ///
    /// Shared by boot and the restart manager.  Refuses to start while a
    /// required dependency is not `Running`.  On success the kernel is
    /// `Running` and `kernel_started` has been emitted; on failure the
    /// instance has been stopped and the caller decides the resulting state,
    /// except for cancellation which leaves the kernel `Stopped` (or `Failed`
    /// when it had to be force-terminated).
    pub async fn start_kernel(&self, id: &str, cancel: &CancellationToken) -> Result<(), KernosError> {
        let descriptor = self.registry.require(id)?;
        for dep in &descriptor.dependencies {
            let required = self.registry.get(dep).is_none_or(|d| !d.can_fail);
            if required && self.ctx.state(dep) != Some(KernelState::Running) {
                return Err(KernosError::DependencyNotReady {
                    kernel: id.to_string(),
                    dependency: dep.clone(),
                });
            }
        }

        let generation = self.ctx.generation(id);
        let instance = CancellationToken::new();
        self.ctx.set_instance(id, instance.clone());
        self.ctx.transition(id, KernelState::Starting, None);

        let (ready_tx, mut ready_rx) = watch::channel(false);
        let kernel_ctx = KernelContext::new(
            id,
            generation,
            self.ctx.heartbeats().clone(),
            ready_tx,
            instance,
        );
        let limit = descriptor.ready_timeout.unwrap_or(self.config.ready_timeout);
        let handle = descriptor.handle.clone();
        debug!(kernel = %id, generation, timeout_ms = limit.as_millis() as u64, "starting kernel");

        let attempt = async {
            handle.start(kernel_ctx).await?;
            let ready = ready_rx.wait_for(|ready| *ready).await.is_ok();
            if ready {
                Ok(())
            } else {
                Err(KernosError::KernelStartFailed {
                    kernel: id.to_string(),
                    reason: "kernel released its context without reporting ready".into(),
                })
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KernosError::Cancelled(format!("start of kernel {id}"))),
            res = timeout(limit, attempt) => res.unwrap_or_else(|_| {
                Err(KernosError::KernelStartTimeout {
                    kernel: id.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }),
        };

        match outcome {
            Ok(()) => {
                self.ctx.heartbeats().record(id, generation);
                self.ctx.apply(
                    id,
                    KernelState::Running,
                    SupervisionEvent::new(EventType::KernelStarted, id)
                        .with("generation", generation)
                        .with("tier", descriptor.tier),
                );
                info!(kernel = %id, generation, "kernel running");
                Ok(())
            }
            Err(e) => {
                let forced = self.stop_instance(id).await.unwrap_or(false);
                if matches!(e, KernosError::Cancelled(_)) {
                    let state = if forced {
                        KernelState::Failed
                    } else {
                        KernelState::Stopped
                    };
                    self.ctx.transition(id, state, Some(e.to_string()));
                }
                Err(e)
            }
        }
    }

    /// Stop one kernel.  Returns the resulting state: `Stopped`, or `Failed`
    /// when the kernel ignored its grace period.  A kernel without a live
    /// instance keeps its current state.
    pub async fn stop_kernel(&self, id: &str) -> Result<KernelState, KernosError> {
        self.registry.require(id)?;
        let (state, reason) = match self.stop_instance(id).await {
            None => return Ok(self.ctx.state(id).unwrap_or(KernelState::Stopped)),
            Some(true) => (KernelState::Failed, "force-terminated after grace period"),
            Some(false) => (KernelState::Stopped, "stopped"),
        };
        self.ctx.transition(id, state, Some(reason.to_string()));
        Ok(state)
    }

    /// Cancel the live instance of `id`, give `stop()` the grace period and
    /// force-terminate on overrun.  Returns whether termination was forced,
    /// or `None` when there was no live instance.
    pub(crate) async fn stop_instance(&self, id: &str) -> Option<bool> {
        let descriptor = self.registry.get(id)?;
        let instance = self.ctx.take_instance(id)?;
        instance.cancel();

        let grace = self.config.stop_grace;
        let forced = match timeout(grace, descriptor.handle.stop(grace)).await {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                warn!(kernel = %id, error = %e, "stop failed, terminating");
                true
            }
            Err(_) => {
                warn!(kernel = %id, grace_ms = grace.as_millis() as u64, "stop overran grace period, terminating");
                true
            }
        };
        if forced && timeout(grace, descriptor.handle.terminate()).await.is_err() {
            error!(kernel = %id, "terminate did not return");
        }
        Some(forced)
    }

    /// Stop every started kernel, last batch first.  Also cancels the
    /// shutdown token so that watchdogs and pending restarts wind down.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let order: Vec<Vec<String>> = match schedule(&self.registry) {
            Ok(batches) => batches.into_iter().rev().map(|b| b.kernels).collect(),
            Err(_) => vec![self.registry.ids().map(str::to_string).collect()],
        };
        for batch in order {
            let live: Vec<&String> = batch
                .iter()
                .filter(|id| {
                    matches!(
                        self.ctx.state(id),
                        Some(KernelState::Starting | KernelState::Running | KernelState::Degraded)
                    )
                })
                .collect();
            for (id, result) in live
                .iter()
                .zip(join_all(live.iter().map(|id| self.stop_kernel(id))).await)
            {
                match result {
                    Ok(state) => debug!(kernel = %id, %state, "kernel stopped"),
                    Err(e) => warn!(kernel = %id, error = %e, "failed to stop kernel"),
                }
            }
        }
        info!("all kernels stopped");
    }

    /// Current view of every kernel, ordered by tier then id.
    pub fn snapshot(&self) -> Vec<KernelSnapshot> {
        let mut kernels: Vec<KernelSnapshot> = self
            .registry
            .iter()
            .filter_map(|k| {
                let status = self.ctx.status(&k.id)?;
                let last_heartbeat_ms = if status.state == KernelState::Pending {
                    None
                } else {
                    self.ctx
                        .heartbeats()
                        .elapsed(&k.id)
                        .map(|d| d.as_millis() as u64)
                };
                Some(KernelSnapshot {
                    id: k.id.clone(),
                    tier: k.tier,
                    state: status.state,
                    generation: status.generation,
                    can_fail: k.can_fail,
                    restart_attempts: status.restart_attempts,
                    max_restarts: k.max_restarts,
                    last_heartbeat_ms,
                    reason: status.reason,
                    last_event: status.last_event,
                })
            })
            .collect();
        kernels.sort_by(|a, b| (a.tier, &a.id).cmp(&(b.tier, &b.id)));
        kernels
    }
}
