//! Concrete kernel kinds and their declarative form.
//!
//! A [`KernelSpec`] is what the configuration file holds; [`KernelSpec::descriptor`]
//! turns it into a [`KernelDescriptor`] with a live handle.
//!
//! | Kind | Behaviour |
//! |---|---|
//! | [`KernelKind::Pulse`] | In-process worker that heartbeats on a fixed interval after an optional startup delay. |
//! | [`KernelKind::Command`] | Child process.  Heartbeats while the process is alive, once `ready_after` has elapsed. |

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kernos_kernel::{DEFAULT_MAX_RESTARTS, KernelContext, KernelDescriptor, KernelHandle};
use kernos_types::KernosError;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, timeout};
use tracing::{debug, info, warn};

fn default_max_restarts() -> u32 {
    DEFAULT_MAX_RESTARTS
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

/// Declarative description of one kernel, as stored in `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub id: String,
    #[serde(default)]
    pub tier: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub can_fail: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub ready_timeout: Option<Duration>,
    #[serde(default)]
    pub kind: KernelKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelKind {
    Pulse {
        #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
        interval: Duration,
        #[serde(default, with = "humantime_serde")]
        startup_delay: Duration,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        /// The process must stay up this long before it counts as ready.
        #[serde(default, with = "humantime_serde")]
        ready_after: Duration,
        #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
        heartbeat_interval: Duration,
    },
}

impl Default for KernelKind {
    fn default() -> Self {
        KernelKind::Pulse {
            interval: default_heartbeat_interval(),
            startup_delay: Duration::ZERO,
        }
    }
}

impl KernelSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier: 0,
            dependencies: Vec::new(),
            can_fail: false,
            max_restarts: DEFAULT_MAX_RESTARTS,
            ready_timeout: None,
            kind: KernelKind::default(),
        }
    }

    /// Build the descriptor and its handle.
    pub fn descriptor(&self) -> KernelDescriptor {
        let handle: Arc<dyn KernelHandle> = match &self.kind {
            KernelKind::Pulse {
                interval,
                startup_delay,
            } => Arc::new(PulseKernel::new(*interval, *startup_delay)),
            KernelKind::Command {
                program,
                args,
                ready_after,
                heartbeat_interval,
            } => Arc::new(CommandKernel::new(
                program.clone(),
                args.clone(),
                *ready_after,
                *heartbeat_interval,
            )),
        };
        let mut descriptor = KernelDescriptor::new(self.id.clone(), handle)
            .tier(self.tier)
            .can_fail(self.can_fail)
            .max_restarts(self.max_restarts);
        for dep in &self.dependencies {
            descriptor = descriptor.depends_on(dep.clone());
        }
        if let Some(t) = self.ready_timeout {
            descriptor = descriptor.ready_timeout(t);
        }
        descriptor
    }
}

/// Slot for the worker task of the live instance.
#[derive(Default)]
struct Worker(Mutex<Option<JoinHandle<()>>>);

impl Worker {
    fn replace(&self, handle: JoinHandle<()>) {
        let mut slot = match self.0.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    fn take(&self) -> Option<JoinHandle<()>> {
        match self.0.lock() {
            Ok(mut s) => s.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Wait for the worker to notice cancellation.
    ///
    /// If the grace period runs out, or the caller drops this future first,
    /// the handle goes back into the slot so [`Worker::abort`] can still
    /// reach it.
    async fn join(&self, grace: Duration) -> Result<(), KernosError> {
        let Some(handle) = self.take() else {
            return Ok(());
        };
        let mut pending = Pending {
            worker: self,
            handle: Some(handle),
        };
        let Some(handle) = pending.handle.as_mut() else {
            return Ok(());
        };
        let joined = match timeout(grace, handle).await {
            Ok(joined) => joined,
            Err(_) => return Err(KernosError::Cancelled("worker ignored cancellation".into())),
        };
        pending.handle = None;
        match joined {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(KernosError::Channel(format!("worker task failed: {e}"))),
        }
    }

    /// Put back a handle taken by `join`, unless a newer instance has
    /// claimed the slot meanwhile.
    fn restore(&self, handle: JoinHandle<()>) {
        let mut slot = match self.0.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_none() {
            *slot = Some(handle);
        } else {
            handle.abort();
        }
    }

    fn abort(&self) {
        if let Some(handle) = self.take() {
            handle.abort();
        }
    }
}

/// A handle being joined; returned to its worker unless the join finished.
struct Pending<'a> {
    worker: &'a Worker,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.worker.restore(handle);
        }
    }
}

// ---------------------------------------------------------------------------
// Pulse
// ---------------------------------------------------------------------------

pub struct PulseKernel {
    interval: Duration,
    startup_delay: Duration,
    worker: Worker,
}

impl PulseKernel {
    pub fn new(interval: Duration, startup_delay: Duration) -> Self {
        Self {
            interval,
            startup_delay,
            worker: Worker::default(),
        }
    }
}

#[async_trait]
impl KernelHandle for PulseKernel {
    async fn start(&self, ctx: KernelContext) -> Result<(), KernosError> {
        let period = self.interval;
        let delay = self.startup_delay;
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = sleep(delay) => {}
            }
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = ticker.tick() => {
                        if !ctx.heartbeat() {
                            debug!(kernel = %ctx.kernel_id(), generation = ctx.generation(), "superseded, stopping pulse");
                            break;
                        }
                    }
                }
            }
        });
        self.worker.replace(handle);
        Ok(())
    }

    async fn stop(&self, grace: Duration) -> Result<(), KernosError> {
        self.worker.join(grace).await
    }

    async fn terminate(&self) {
        self.worker.abort();
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

pub struct CommandKernel {
    program: String,
    args: Vec<String>,
    ready_after: Duration,
    heartbeat_interval: Duration,
    worker: Worker,
}

impl CommandKernel {
    pub fn new(program: String, args: Vec<String>, ready_after: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            program,
            args,
            ready_after,
            heartbeat_interval,
            worker: Worker::default(),
        }
    }
}

#[async_trait]
impl KernelHandle for CommandKernel {
    async fn start(&self, ctx: KernelContext) -> Result<(), KernosError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KernosError::KernelStartFailed {
                kernel: ctx.kernel_id().to_string(),
                reason: format!("cannot spawn {}: {e}", self.program),
            })?;
        info!(kernel = %ctx.kernel_id(), pid = child.id(), program = %self.program, "kernel process spawned");

        let ready_at = Instant::now() + self.ready_after;
        let period = self.heartbeat_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let exited = loop {
                tokio::select! {
                    _ = ctx.cancelled() => break None,
                    status = child.wait() => break Some(status),
                    _ = ticker.tick() => {
                        if Instant::now() >= ready_at {
                            ctx.heartbeat();
                        }
                    }
                }
            };
            match exited {
                // Heartbeats stop; the watchdog takes it from here.
                Some(status) => warn!(kernel = %ctx.kernel_id(), ?status, "kernel process exited"),
                None => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    debug!(kernel = %ctx.kernel_id(), "kernel process stopped");
                }
            }
        });
        self.worker.replace(handle);
        Ok(())
    }

    async fn stop(&self, grace: Duration) -> Result<(), KernosError> {
        self.worker.join(grace).await
    }

    async fn terminate(&self) {
        // Dropping the aborted task drops the child, which kills it.
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernos_kernel::{KernelRegistry, Orchestrator, OrchestratorConfig};
    use kernos_middleware::EventBus;
    use kernos_types::KernelState;

    fn orchestrator(specs: &[KernelSpec], config: OrchestratorConfig) -> Orchestrator {
        let mut registry = KernelRegistry::new();
        for spec in specs {
            registry.register(spec.descriptor()).unwrap();
        }
        Orchestrator::new(registry, EventBus::default(), config)
    }

    #[test]
    fn spec_defaults_fill_in() {
        let spec: KernelSpec = serde_json::from_str(r#"{"id":"memory"}"#).unwrap();
        assert_eq!(spec, KernelSpec::new("memory"));
        assert_eq!(spec.max_restarts, DEFAULT_MAX_RESTARTS);
    }

    #[test]
    fn command_spec_parses_humantime() {
        let raw = r#"{
            "id": "ingest",
            "tier": 2,
            "dependencies": ["memory"],
            "can_fail": true,
            "ready_timeout": "10s",
            "kind": {"type": "command", "program": "ingestd", "args": ["--fast"], "ready_after": "500ms"}
        }"#;
        let spec: KernelSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(spec.ready_timeout, Some(Duration::from_secs(10)));
        match spec.kind {
            KernelKind::Command { ready_after, heartbeat_interval, ref args, .. } => {
                assert_eq!(ready_after, Duration::from_millis(500));
                assert_eq!(heartbeat_interval, Duration::from_secs(5));
                assert_eq!(args, &vec!["--fast".to_string()]);
            }
            other => panic!("expected command kind, got {other:?}"),
        }
        let descriptor = spec.descriptor();
        assert!(descriptor.can_fail);
        assert!(descriptor.dependencies.contains("memory"));
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_kernel_stays_fresh() {
        let mut spec = KernelSpec::new("memory");
        spec.kind = KernelKind::Pulse {
            interval: Duration::from_secs(2),
            startup_delay: Duration::from_secs(1),
        };
        let orch = orchestrator(&[spec], OrchestratorConfig::default());

        let report = orch.boot().await.unwrap();
        assert!(report.is_complete());

        sleep(Duration::from_secs(60)).await;
        let elapsed = orch.context().heartbeats().elapsed("memory").unwrap();
        assert!(elapsed <= Duration::from_secs(2));

        orch.shutdown().await;
        assert_eq!(orch.context().state("memory"), Some(KernelState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_pulse_misses_its_ready_timeout() {
        let mut spec = KernelSpec::new("memory");
        spec.ready_timeout = Some(Duration::from_secs(1));
        spec.kind = KernelKind::Pulse {
            interval: Duration::from_secs(1),
            startup_delay: Duration::from_secs(10),
        };
        let orch = orchestrator(&[spec], OrchestratorConfig::default());

        let report = orch.boot().await.unwrap();
        assert!(!report.is_complete());
        assert_eq!(orch.context().state("memory"), Some(KernelState::Failed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_kernel_runs_and_stops() {
        let mut spec = KernelSpec::new("sleeper");
        spec.kind = KernelKind::Command {
            program: "sleep".into(),
            args: vec!["30".into()],
            ready_after: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(20),
        };
        let orch = orchestrator(&[spec], OrchestratorConfig::default());

        assert!(orch.boot().await.unwrap().is_complete());
        orch.shutdown().await;
        assert_eq!(orch.context().state("sleeper"), Some(KernelState::Stopped));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_that_exits_early_never_becomes_ready() {
        let mut spec = KernelSpec::new("oneshot");
        spec.ready_timeout = Some(Duration::from_millis(500));
        spec.kind = KernelKind::Command {
            program: "true".into(),
            args: Vec::new(),
            ready_after: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(20),
        };
        let orch = orchestrator(&[spec], OrchestratorConfig::default());

        let report = orch.boot().await.unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.kernel("oneshot").map(|k| k.state), Some(KernelState::Failed));
    }

    #[tokio::test]
    async fn abort_after_missed_grace_kills_the_worker() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
        let worker = Worker::default();
        worker.replace(tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        }));

        let err = worker.join(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, KernosError::Cancelled(_)));

        worker.abort();
        // The sender is dropped with the aborted task.
        let closed = timeout(Duration::from_millis(500), rx.recv()).await;
        assert_eq!(closed, Ok(None));
    }

    #[tokio::test]
    async fn dropped_join_keeps_the_worker_reachable() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
        let worker = Worker::default();
        worker.replace(tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        }));

        // An outer deadline shorter than the join's own grace period.
        assert!(timeout(Duration::from_millis(10), worker.join(Duration::from_secs(60))).await.is_err());

        worker.abort();
        assert_eq!(timeout(Duration::from_millis(500), rx.recv()).await, Ok(None));
    }

    #[tokio::test]
    async fn restore_yields_to_a_newer_worker() {
        let (old_tx, mut old_rx) = tokio::sync::mpsc::channel::<()>(1);
        let worker = Worker::default();
        worker.replace(tokio::spawn(async move {
            let _tx = old_tx;
            std::future::pending::<()>().await;
        }));
        let stale = worker.take().unwrap();
        worker.replace(tokio::spawn(std::future::pending::<()>()));

        worker.restore(stale);
        assert_eq!(timeout(Duration::from_millis(500), old_rx.recv()).await, Ok(None));
        assert!(worker.take().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminated_command_kernel_leaves_no_child() {
        let mut spec = KernelSpec::new("sleeper");
        spec.kind = KernelKind::Command {
            program: "sleep".into(),
            args: vec!["30".into()],
            ready_after: Duration::ZERO,
            heartbeat_interval: Duration::from_millis(20),
        };
        let orch = orchestrator(&[spec], OrchestratorConfig::default());
        assert!(orch.boot().await.unwrap().is_complete());

        let handle = orch.registry().get("sleeper").unwrap().handle.clone();
        handle.terminate().await;
        sleep(Duration::from_millis(300)).await;
        // Heartbeats stop once the worker and its child are gone.
        let before = orch.context().heartbeats().get("sleeper").unwrap();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(orch.context().heartbeats().get("sleeper").unwrap(), before);
    }

    #[tokio::test]
    async fn missing_program_fails_start() {
        let mut spec = KernelSpec::new("ghost");
        spec.kind = KernelKind::Command {
            program: "/nonexistent/kernos-test-binary".into(),
            args: Vec::new(),
            ready_after: Duration::ZERO,
            heartbeat_interval: Duration::from_secs(1),
        };
        let orch = orchestrator(&[spec], OrchestratorConfig::default());

        let report = orch.boot().await.unwrap();
        let ghost = report.kernel("ghost").unwrap();
        assert_eq!(ghost.state, KernelState::Failed);
        assert!(ghost.reason.as_deref().unwrap_or_default().contains("cannot spawn"));
    }
}
