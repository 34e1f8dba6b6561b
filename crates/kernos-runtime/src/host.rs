//! The application host: one process running every configured kernel.
//!
//! [`Host::build`] wires the registry, event journal, orchestrator, restart
//! manager and watchdog together.  [`Host::run`] boots, serves the control
//! endpoint, keeps the watchdog running until a shutdown signal or a
//! `shutdown` control request, then stops all kernels in reverse order.
//!
//! The process exit code tells the outer supervisor what happened; see
//! [`HostExit`].

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use kernos_kernel::{
    DegradedLimitGuardian, KernelRegistry, Orchestrator, OrchestratorConfig, RestartManager, RestartPolicy,
    TieredWatchdog, WatchdogConfig,
};
use kernos_middleware::{EventBus, EventJournal};
use kernos_types::KernosError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::control::{ControlHandler, ControlRequest, ControlResponse, ControlServer, DEFAULT_CONTROL_PORT};
use crate::kernels::KernelSpec;

/// Everything the host needs, already resolved from configuration.
#[derive(Debug, Clone)]
pub struct HostSettings {
    pub control_port: u16,
    pub orchestrator: OrchestratorConfig,
    pub watchdog: WatchdogConfig,
    pub restart: RestartPolicy,
    /// Abort boot once more than this many kernels are degraded.
    pub max_degraded: Option<usize>,
    pub kernels: Vec<KernelSpec>,
    /// Event journal; `None` keeps events in memory only.
    pub journal_path: Option<PathBuf>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            control_port: DEFAULT_CONTROL_PORT,
            orchestrator: OrchestratorConfig::default(),
            watchdog: WatchdogConfig::default(),
            restart: RestartPolicy::default(),
            max_degraded: None,
            kernels: Vec::new(),
            journal_path: None,
        }
    }
}

/// How [`Host::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostExit {
    /// Shut down on request.
    Clean,
    /// A required kernel failed or the guardian stopped the boot.
    BootAborted,
    /// The kernel graph or the host setup is invalid; relaunching cannot help.
    Config,
}

impl HostExit {
    pub fn code(self) -> i32 {
        match self {
            HostExit::Clean => 0,
            HostExit::BootAborted => 1,
            HostExit::Config => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(HostExit::Clean),
            1 => Some(HostExit::BootAborted),
            2 => Some(HostExit::Config),
            _ => None,
        }
    }
}

/// Build a registry from declarative specs.
pub fn build_registry(specs: &[KernelSpec]) -> Result<KernelRegistry, KernosError> {
    let mut registry = KernelRegistry::new();
    for spec in specs {
        registry.register(spec.descriptor())?;
    }
    registry.validate()?;
    Ok(registry)
}

pub struct Host {
    control_port: u16,
    orchestrator: Orchestrator,
    restarts: Arc<RestartManager>,
    watchdog: Arc<TieredWatchdog>,
}

impl Host {
    pub fn build(settings: &HostSettings) -> Result<Self, KernosError> {
        let bus = EventBus::default();
        if let Some(path) = &settings.journal_path {
            bus.attach(Arc::new(EventJournal::open(path)?));
        }
        Self::with_bus(settings, bus)
    }

    pub fn with_bus(settings: &HostSettings, bus: EventBus) -> Result<Self, KernosError> {
        let registry = build_registry(&settings.kernels)?;
        let mut orchestrator = Orchestrator::new(registry, bus, settings.orchestrator);
        if let Some(max) = settings.max_degraded {
            orchestrator = orchestrator.with_guardian(Arc::new(DegradedLimitGuardian::new(max)));
        }
        let restarts = Arc::new(RestartManager::new(orchestrator.clone(), settings.restart));
        let watchdog = Arc::new(TieredWatchdog::new(
            orchestrator.clone(),
            Arc::clone(&restarts),
            settings.watchdog,
        ));
        Ok(Self {
            control_port: settings.control_port,
            orchestrator,
            restarts,
            watchdog,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run until `signal` resolves or a `shutdown` control request arrives.
    pub async fn run<F>(self, signal: F) -> HostExit
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let control_stop = CancellationToken::new();

        let control = Arc::new(HostControl {
            orchestrator: self.orchestrator.clone(),
            restarts: Arc::clone(&self.restarts),
            stop: stop.clone(),
            started: Instant::now(),
        });
        let server = match ControlServer::bind(self.control_port, control).await {
            Ok(server) => server,
            Err(e) => {
                error!(error = %e, "cannot open control endpoint");
                return HostExit::Config;
            }
        };
        let server_task = tokio::spawn(server.serve(control_stop.clone()));

        {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = signal => {
                        info!("termination signal received");
                        stop.cancel();
                    }
                    _ = stop.cancelled() => {}
                }
            });
        }
        {
            // A stop request also cancels an in-flight boot.
            let stop = stop.clone();
            let root = self.orchestrator.shutdown_token();
            tokio::spawn(async move {
                stop.cancelled().await;
                root.cancel();
            });
        }

        let exit = match self.orchestrator.boot().await {
            Err(e) => {
                error!(error = %e, "boot rejected");
                HostExit::Config
            }
            Ok(_) if stop.is_cancelled() => HostExit::Clean,
            Ok(report) if !report.is_complete() => {
                warn!(outcome = ?report.outcome, "boot aborted");
                HostExit::BootAborted
            }
            Ok(report) => {
                info!(kernels = report.kernels.len(), elapsed_ms = report.elapsed.as_millis() as u64, "host ready");
                let watchdogs = Arc::clone(&self.watchdog).spawn();
                stop.cancelled().await;
                for handle in watchdogs {
                    let _ = handle.await;
                }
                HostExit::Clean
            }
        };

        self.orchestrator.shutdown().await;
        control_stop.cancel();
        let _ = server_task.await;
        info!(code = exit.code(), "host exited");
        exit
    }
}

struct HostControl {
    orchestrator: Orchestrator,
    restarts: Arc<RestartManager>,
    stop: CancellationToken,
    started: Instant,
}

#[async_trait]
impl ControlHandler for HostControl {
    async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Snapshot => ControlResponse::Snapshot {
                pid: std::process::id(),
                uptime_ms: self.started.elapsed().as_millis() as u64,
                kernels: self.orchestrator.snapshot(),
            },
            ControlRequest::RestartKernel { id } => {
                if self.stop.is_cancelled() {
                    return ControlResponse::Error {
                        message: "host is shutting down".into(),
                    };
                }
                match self.restarts.manual_restart(&id).await {
                    Ok(outcome) => ControlResponse::Restart { outcome },
                    Err(e) => ControlResponse::Error { message: e.to_string() },
                }
            }
            ControlRequest::Shutdown { actor } => {
                info!(%actor, "shutdown requested over control endpoint");
                self.stop.cancel();
                ControlResponse::Ack
            }
        }
    }
}

/// Resolves on Ctrl-C or, on Unix, `SIGTERM`.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
