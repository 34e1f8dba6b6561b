//! The kernel capability seam.
//!
//! Every kernel kind implements [`KernelHandle`].  The orchestrator never
//! knows what a kernel does; it only starts it, waits for readiness, and stops
//! it.  A started kernel receives a [`KernelContext`] through which it
//! reports readiness, sends heartbeats and observes cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kernos_types::KernosError;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::heartbeat::HeartbeatStore;

/// Start/stop capability set shared by every kernel kind.
///
/// # Contract
///
/// * `start` launches the kernel and returns once it has been handed off
///   (long-running work belongs in a spawned task).  Readiness is signalled
///   separately through [`KernelContext::report_ready`] or the first
///   [`KernelContext::heartbeat`]; the orchestrator bounds both by the
///   kernel's ready timeout.
/// * `stop` asks the running instance to shut down.  The orchestrator has
///   already cancelled the context's token and gives `stop` at most `grace`.
/// * `terminate` is called when `stop` overran its grace period.
#[async_trait]
pub trait KernelHandle: Send + Sync {
    async fn start(&self, ctx: KernelContext) -> Result<(), KernosError>;

    async fn stop(&self, grace: Duration) -> Result<(), KernosError>;

    /// Force-terminate the instance.  Kernels holding OS resources (child
    /// processes, sockets) override this.
    async fn terminate(&self) {}
}

/// Per-instance handle given to [`KernelHandle::start`].
///
/// Cheap to clone; kernels typically move a clone into their worker task.
#[derive(Clone)]
pub struct KernelContext {
    kernel_id: Arc<str>,
    generation: u64,
    heartbeats: Arc<HeartbeatStore>,
    ready: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
}

impl KernelContext {
    pub(crate) fn new(
        kernel_id: &str,
        generation: u64,
        heartbeats: Arc<HeartbeatStore>,
        ready: watch::Sender<bool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            kernel_id: Arc::from(kernel_id),
            generation,
            heartbeats,
            ready: Arc::new(ready),
            cancel,
        }
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    /// Generation of this instance.  Incremented by every restart.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Explicitly signal readiness.  Also counts as a heartbeat.
    pub fn report_ready(&self) {
        if self.heartbeats.record(&self.kernel_id, self.generation) {
            self.ready.send_replace(true);
        }
    }

    /// Record a liveness heartbeat.  The first accepted heartbeat also
    /// signals readiness.
    ///
    /// Returns `false` when the heartbeat was discarded because this instance
    /// has been superseded.
    pub fn heartbeat(&self) -> bool {
        let accepted = self.heartbeats.record(&self.kernel_id, self.generation);
        if accepted && !*self.ready.borrow() {
            self.ready.send_replace(true);
        }
        accepted
    }

    /// Resolves once the orchestrator wants this instance gone.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Owned copy of the cancellation token, for moving into spawned tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
