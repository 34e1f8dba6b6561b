//! Process supervisor: keeps the host process alive unless the kill switch is
//! set.
//!
//! The supervisor runs as its own process (`kernos supervise`).  It launches
//! the host, waits for it to exit, and then consults the persisted
//! `manual_shutdown` flag.  With the flag clear the exit counts as a crash:
//! it emits `process_crash_detected`, backs off, re-checks the flag and
//! relaunches.  With the flag set it emits `process_restart_suppressed` and
//! stays down.  Relaunches are bounded; the budget refills after the host
//! has stayed up for `min_uptime`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kernos_middleware::EventSink;
use kernos_runtime::HostExit;
use kernos_types::{EventType, PROCESS_SUBJECT, SupervisionEvent};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::state::{PidKind, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorPolicy {
    pub max_relaunches: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub min_uptime: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            max_relaunches: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            min_uptime: Duration::from_secs(30),
        }
    }
}

impl SupervisorPolicy {
    pub fn backoff_for(&self, relaunch: u32) -> Duration {
        let factor = 1u32.checked_shl(relaunch).unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Starts one instance of the wrapped process.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn Workload>>;
}

/// A running instance of the wrapped process.
#[async_trait]
pub trait Workload: Send {
    fn pid(&self) -> Option<u32>;

    /// Resolves with the exit code; `None` when killed by a signal.
    async fn wait(&mut self) -> Result<Option<i32>>;

    /// Ask the process to go away and wait for it.
    async fn terminate(&mut self);
}

/// Why [`ProcessSupervisor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The kill switch was set, before launch or after an exit.
    ManualShutdown,
    /// The host reported an invalid configuration.
    ConfigError,
    BudgetExhausted,
    /// The supervisor itself was told to stop.
    Cancelled,
}

pub struct ProcessSupervisor<L> {
    launcher: L,
    store: StateStore,
    events: Arc<dyn EventSink>,
    policy: SupervisorPolicy,
}

impl<L: Launcher> ProcessSupervisor<L> {
    pub fn new(launcher: L, store: StateStore, events: Arc<dyn EventSink>, policy: SupervisorPolicy) -> Self {
        Self {
            launcher,
            store,
            events,
            policy,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<SupervisorExit> {
        if self.store.read()?.manual_shutdown {
            info!("manual shutdown in effect, not launching");
            return Ok(SupervisorExit::ManualShutdown);
        }

        let mut relaunches = 0u32;
        loop {
            let started = Instant::now();
            let exit_code = match self.launcher.launch().await {
                Ok(mut workload) => {
                    if let Some(pid) = workload.pid() {
                        self.store.write_pid(PidKind::Host, pid)?;
                        info!(pid, "host launched");
                    }
                    let exit = tokio::select! {
                        exit = workload.wait() => Some(exit),
                        _ = cancel.cancelled() => None,
                    };
                    let Some(exit) = exit else {
                        workload.terminate().await;
                        self.store.clear_pid(PidKind::Host);
                        return Ok(SupervisorExit::Cancelled);
                    };
                    self.store.clear_pid(PidKind::Host);
                    exit.context("Failed to wait for host")?
                }
                Err(e) => {
                    error!(error = %e, "host launch failed");
                    None
                }
            };
            let uptime = started.elapsed();

            let state = self.store.read()?;
            if state.manual_shutdown {
                self.emit(
                    SupervisionEvent::new(EventType::ProcessRestartSuppressed, PROCESS_SUBJECT)
                        .with("reason", "manual shutdown")
                        .with("actor", state.actor)
                        .with("exit_code", exit_code),
                );
                return Ok(SupervisorExit::ManualShutdown);
            }
            if exit_code == Some(HostExit::Config.code()) {
                self.emit(
                    SupervisionEvent::new(EventType::ProcessRestartSuppressed, PROCESS_SUBJECT)
                        .with("reason", "configuration error")
                        .with("exit_code", exit_code),
                );
                return Ok(SupervisorExit::ConfigError);
            }

            if uptime >= self.policy.min_uptime {
                relaunches = 0;
            }
            warn!(?exit_code, uptime_ms = uptime.as_millis() as u64, "host exited unexpectedly");
            self.emit(
                SupervisionEvent::new(EventType::ProcessCrashDetected, PROCESS_SUBJECT)
                    .with("exit_code", exit_code)
                    .with("uptime_ms", uptime.as_millis() as u64)
                    .with("relaunches", relaunches),
            );

            if relaunches >= self.policy.max_relaunches {
                error!(relaunches, "relaunch budget exhausted");
                self.emit(
                    SupervisionEvent::new(EventType::ProcessRestartSuppressed, PROCESS_SUBJECT)
                        .with("reason", "restart budget exhausted")
                        .with("attempts", relaunches),
                );
                return Ok(SupervisorExit::BudgetExhausted);
            }

            let delay = self.policy.backoff_for(relaunches);
            relaunches += 1;
            info!(relaunch = relaunches, delay_ms = delay.as_millis() as u64, "relaunching host after backoff");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => return Ok(SupervisorExit::Cancelled),
            }

            let state = self.store.read()?;
            if state.manual_shutdown {
                self.emit(
                    SupervisionEvent::new(EventType::ProcessRestartSuppressed, PROCESS_SUBJECT)
                        .with("reason", "manual shutdown")
                        .with("actor", state.actor),
                );
                return Ok(SupervisorExit::ManualShutdown);
            }
        }
    }

    fn emit(&self, event: SupervisionEvent) {
        if let Err(e) = self.events.write(&event) {
            warn!(event = %event.event_type, error = %e, "failed to record event");
        }
    }
}

// ---------------------------------------------------------------------------
// Real host process
// ---------------------------------------------------------------------------

/// Launches `<current exe> host --home <home>`.
pub struct HostLauncher {
    program: std::path::PathBuf,
    home: std::path::PathBuf,
}

impl HostLauncher {
    pub fn new(program: std::path::PathBuf, home: std::path::PathBuf) -> Self {
        Self { program, home }
    }
}

#[async_trait]
impl Launcher for HostLauncher {
    async fn launch(&self) -> Result<Box<dyn Workload>> {
        let child = tokio::process::Command::new(&self.program)
            .arg("--home")
            .arg(&self.home)
            .arg("host")
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program.display()))?;
        Ok(Box::new(ChildWorkload(child)))
    }
}

struct ChildWorkload(tokio::process::Child);

#[async_trait]
impl Workload for ChildWorkload {
    fn pid(&self) -> Option<u32> {
        self.0.id()
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        Ok(self.0.wait().await?.code())
    }

    async fn terminate(&mut self) {
        if let Some(pid) = self.0.id() {
            let _ = crate::state::signal_pid(pid as i32, nix::sys::signal::Signal::SIGTERM);
        }
        if tokio::time::timeout(Duration::from_secs(10), self.0.wait()).await.is_err() {
            let _ = self.0.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;
    use kernos_middleware::MemorySink;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Each launch pops the next scripted run: how long it lives and its exit
    /// code.  An empty script launches a process that never exits.
    #[derive(Clone, Default)]
    struct Script {
        runs: Arc<Mutex<VecDeque<(Duration, Option<i32>)>>>,
        launches: Arc<Mutex<u32>>,
        /// Set the kill switch right after this launch number exits.
        stop_after: Option<(u32, StateStore)>,
    }

    impl Script {
        fn new(runs: &[(u64, Option<i32>)]) -> Self {
            Self {
                runs: Arc::new(Mutex::new(
                    runs.iter().map(|(secs, code)| (Duration::from_secs(*secs), *code)).collect(),
                )),
                ..Self::default()
            }
        }

        fn launches(&self) -> u32 {
            *self.launches.lock().unwrap()
        }
    }

    struct FakeWorkload {
        life: Option<(Duration, Option<i32>)>,
        on_exit: Option<StateStore>,
    }

    #[async_trait]
    impl Workload for FakeWorkload {
        fn pid(&self) -> Option<u32> {
            None
        }

        async fn wait(&mut self) -> Result<Option<i32>> {
            match self.life {
                Some((life, code)) => {
                    sleep(life).await;
                    if let Some(store) = &self.on_exit {
                        store.set_manual_shutdown(true, "cli:stop")?;
                    }
                    Ok(code)
                }
                None => std::future::pending().await,
            }
        }

        async fn terminate(&mut self) {}
    }

    #[async_trait]
    impl Launcher for Script {
        async fn launch(&self) -> Result<Box<dyn Workload>> {
            let n = {
                let mut launches = self.launches.lock().unwrap();
                *launches += 1;
                *launches
            };
            let on_exit = self
                .stop_after
                .as_ref()
                .filter(|(at, _)| *at == n)
                .map(|(_, store)| store.clone());
            Ok(Box::new(FakeWorkload {
                life: self.runs.lock().unwrap().pop_front(),
                on_exit,
            }))
        }
    }

    fn setup() -> (tempfile::TempDir, StateStore, Arc<MemorySink>) {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store = StateStore::new(&Paths::resolve(Some(dir.path().to_path_buf())));
        (dir, store, Arc::new(MemorySink::new()))
    }

    fn count(sink: &MemorySink, event_type: EventType) -> usize {
        sink.count(event_type, PROCESS_SUBJECT)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = SupervisorPolicy::default();
        assert_eq!(policy.backoff_for(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_for(6), Duration::from_secs(60));
        assert_eq!(policy.backoff_for(40), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_shutdown_prevents_launch() {
        let (_dir, store, sink) = setup();
        store.set_manual_shutdown(true, "cli:stop").unwrap();
        let script = Script::new(&[]);
        let supervisor = ProcessSupervisor::new(script.clone(), store, sink.clone(), SupervisorPolicy::default());

        let exit = supervisor.run(CancellationToken::new()).await.unwrap();
        assert_eq!(exit, SupervisorExit::ManualShutdown);
        assert_eq!(script.launches(), 0);
        assert!(sink.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn crashes_are_relaunched_until_the_budget_runs_out() {
        let (_dir, store, sink) = setup();
        let script = Script::new(&[(1, Some(101)); 6]);
        let supervisor = ProcessSupervisor::new(script.clone(), store, sink.clone(), SupervisorPolicy::default());

        let exit = supervisor.run(CancellationToken::new()).await.unwrap();
        assert_eq!(exit, SupervisorExit::BudgetExhausted);
        assert_eq!(script.launches(), 6);
        assert_eq!(count(&sink, EventType::ProcessCrashDetected), 6);
        assert_eq!(count(&sink, EventType::ProcessRestartSuppressed), 1);

        let last = sink.events().pop().unwrap();
        assert_eq!(last.reason(), Some("restart budget exhausted"));
        assert_eq!(last.payload["attempts"], 5);
    }

    #[tokio::test(start_paused = true)]
    async fn kill_switch_set_during_run_suppresses_relaunch() {
        let (_dir, store, sink) = setup();
        let mut script = Script::new(&[(5, Some(0)), (5, Some(0)), (5, Some(0))]);
        script.stop_after = Some((2, store.clone()));
        let supervisor = ProcessSupervisor::new(script.clone(), store, sink.clone(), SupervisorPolicy::default());

        let exit = supervisor.run(CancellationToken::new()).await.unwrap();
        assert_eq!(exit, SupervisorExit::ManualShutdown);
        assert_eq!(script.launches(), 2);
        assert_eq!(count(&sink, EventType::ProcessCrashDetected), 1);

        let last = sink.events().pop().unwrap();
        assert_eq!(last.event_type, EventType::ProcessRestartSuppressed);
        assert_eq!(last.reason(), Some("manual shutdown"));
        assert_eq!(last.payload["actor"], "cli:stop");
    }

    #[tokio::test(start_paused = true)]
    async fn long_uptime_refills_the_budget() {
        let (_dir, store, sink) = setup();
        let policy = SupervisorPolicy {
            max_relaunches: 1,
            ..SupervisorPolicy::default()
        };
        // crash, crash after a long run (budget refills), crash, crash.
        let script = Script::new(&[(1, Some(1)), (120, Some(1)), (1, Some(1)), (1, Some(1))]);
        let supervisor = ProcessSupervisor::new(script.clone(), store, sink.clone(), policy);

        let exit = supervisor.run(CancellationToken::new()).await.unwrap();
        assert_eq!(exit, SupervisorExit::BudgetExhausted);
        assert_eq!(script.launches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_errors_are_not_relaunched() {
        let (_dir, store, sink) = setup();
        let script = Script::new(&[(0, Some(HostExit::Config.code()))]);
        let supervisor = ProcessSupervisor::new(script.clone(), store, sink.clone(), SupervisorPolicy::default());

        assert_eq!(
            supervisor.run(CancellationToken::new()).await.unwrap(),
            SupervisorExit::ConfigError
        );
        assert_eq!(script.launches(), 1);
        assert_eq!(count(&sink, EventType::ProcessCrashDetected), 0);
        assert_eq!(sink.events()[0].reason(), Some("configuration error"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_terminates_the_running_host() {
        let (_dir, store, sink) = setup();
        let script = Script::new(&[]);
        let supervisor = ProcessSupervisor::new(script.clone(), store, sink.clone(), SupervisorPolicy::default());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });
        assert_eq!(supervisor.run(cancel).await.unwrap(), SupervisorExit::Cancelled);
        assert_eq!(script.launches(), 1);
        assert!(sink.events().is_empty());
    }
}
