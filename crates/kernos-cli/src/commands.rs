//! Implementations of the user-facing commands.

use std::fs::OpenOptions;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};
use kernos_middleware::{EventJournal, EventSink, JournalReader};
use kernos_runtime::{ControlClient, ControlRequest, ControlResponse};
use kernos_types::{BOOT_SUBJECT, EventType, KernelSnapshot, KernelState, PROCESS_SUBJECT, SupervisionEvent};
use nix::sys::signal::Signal;
use serde::Serialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::config::{self, Config, Paths, ensure_private_dir};
use crate::state::{PidKind, StateStore, pid_alive, signal_pid};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const KERNEL_RESTART_TIMEOUT: Duration = Duration::from_secs(60);

// ─────────────────────────────────────────────────────────────────────────────
// start / stop / restart
// ─────────────────────────────────────────────────────────────────────────────

pub async fn start(paths: &Paths, cfg: &Config) -> Result<()> {
    let store = StateStore::new(paths);
    // Cleared before anything is spawned so a racing supervisor sees it.
    store.set_manual_shutdown(false, "cli:start")?;

    let supervisor = store.live_pid(PidKind::Supervisor);
    let host = store.live_pid(PidKind::Host);
    if supervisor.is_some() || host.is_some() {
        println!("  {} kernos is already running", "•".yellow().bold());
        let status = collect_status(paths, cfg).await?;
        print!("{}", render_status(&status));
        return Ok(());
    }

    let pid = spawn_supervisor(paths)?;
    store.write_pid(PidKind::Supervisor, pid)?;
    println!("  {} kernos started (supervisor pid {})", "✓".green().bold(), pid);
    println!("  Logs:   {}", paths.log().display().to_string().dimmed());
    println!("  Events: {}", paths.events().display().to_string().dimmed());
    Ok(())
}

/// Spawn `kernos supervise` detached from this terminal.
fn spawn_supervisor(paths: &Paths) -> Result<u32> {
    ensure_private_dir(paths.home())?;
    let exe = std::env::current_exe().context("Cannot locate the kernos executable")?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log())
        .with_context(|| format!("Failed to open {}", paths.log().display()))?;

    let mut command = Command::new(exe);
    command
        .arg("--home")
        .arg(paths.home())
        .arg("supervise")
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let child = command.spawn().context("Failed to spawn the supervisor")?;
    Ok(child.id())
}

pub async fn stop(paths: &Paths, cfg: &Config) -> Result<()> {
    let store = StateStore::new(paths);
    let client = ControlClient::new(cfg.control_port).with_timeout(PROBE_TIMEOUT);

    let supervisor = store.live_pid(PidKind::Supervisor);
    let host = store.live_pid(PidKind::Host);
    let reachable = client.is_reachable().await;
    if supervisor.is_none() && host.is_none() && !reachable {
        println!("  {} kernos is already stopped", "•".dimmed());
        return Ok(());
    }

    // The kill switch must be durable before anything is signalled.
    store.set_manual_shutdown(true, "cli:stop")?;
    let journal = EventJournal::open(paths.events())?;
    journal.write(
        &SupervisionEvent::new(EventType::ManualStop, PROCESS_SUBJECT)
            .with("actor", "cli:stop")
            .with("supervisor_pid", supervisor)
            .with("host_pid", host),
    )?;

    let acknowledged = reachable
        && matches!(
            client
                .request(&ControlRequest::Shutdown {
                    actor: "cli:stop".into()
                })
                .await,
            Ok(ControlResponse::Ack)
        );
    match host {
        Some(pid) if !acknowledged => {
            debug!(pid, "control endpoint unavailable, sending SIGTERM");
            signal_pid(pid, Signal::SIGTERM)?;
        }
        None => {
            // The supervisor is idle between relaunches; wake it.
            if let Some(pid) = supervisor {
                signal_pid(pid, Signal::SIGTERM)?;
            }
        }
        _ => {}
    }

    let deadline = Instant::now() + cfg.supervisor.stop_timeout;
    let alive = |pid: Option<i32>| pid.is_some_and(pid_alive);
    while Instant::now() < deadline && (alive(supervisor) || alive(host)) {
        sleep(Duration::from_millis(100)).await;
    }
    for pid in [host, supervisor].into_iter().flatten().filter(|p| pid_alive(*p)) {
        warn!(pid, "process ignored shutdown, killing");
        signal_pid(pid, Signal::SIGKILL)?;
    }
    store.clear_pid(PidKind::Host);
    store.clear_pid(PidKind::Supervisor);

    println!("  {} kernos stopped", "✓".green().bold());
    Ok(())
}

pub async fn restart(paths: &Paths, cfg: &Config) -> Result<()> {
    stop(paths, cfg).await?;
    start(paths, cfg).await
}

// ─────────────────────────────────────────────────────────────────────────────
// status
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub manual_shutdown: bool,
    pub actor: String,
    pub updated_at: DateTime<Utc>,
    pub supervisor_pid: Option<i32>,
    pub host_pid: Option<i32>,
    pub host_uptime_ms: Option<u64>,
    pub kernels: Vec<KernelSnapshot>,
    /// Most recent process- or boot-level event.
    pub last_event: Option<SupervisionEvent>,
}

pub async fn collect_status(paths: &Paths, cfg: &Config) -> Result<StatusReport> {
    let store = StateStore::new(paths);
    let state = store.read()?;
    let supervisor_pid = store.live_pid(PidKind::Supervisor);
    let mut host_pid = store.live_pid(PidKind::Host);

    let client = ControlClient::new(cfg.control_port).with_timeout(PROBE_TIMEOUT);
    let (host_uptime_ms, kernels) = match client.request(&ControlRequest::Snapshot).await {
        Ok(ControlResponse::Snapshot { pid, uptime_ms, kernels }) => {
            host_pid = Some(pid as i32);
            (Some(uptime_ms), kernels)
        }
        Ok(other) => {
            debug!(?other, "unexpected snapshot response");
            (None, Vec::new())
        }
        Err(e) => {
            debug!(error = %e, "host not reachable");
            (None, Vec::new())
        }
    };

    let last_event = JournalReader::last_matching(paths.events(), |e| {
        e.event_type.is_process_level() || e.subject == BOOT_SUBJECT
    })?;

    Ok(StatusReport {
        running: supervisor_pid.is_some() || host_pid.is_some(),
        manual_shutdown: state.manual_shutdown,
        actor: state.actor,
        updated_at: state.updated_at,
        supervisor_pid,
        host_pid,
        host_uptime_ms,
        kernels,
        last_event,
    })
}

pub async fn status(paths: &Paths, cfg: &Config, json: bool) -> Result<()> {
    let report = collect_status(paths, cfg).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_status(&report));
    }
    Ok(())
}

fn state_label(state: KernelState) -> ColoredString {
    let label = state.as_str();
    match state {
        KernelState::Running => label.green().bold(),
        KernelState::Starting | KernelState::Pending => label.cyan(),
        KernelState::Degraded => label.yellow().bold(),
        KernelState::Failed => label.red().bold(),
        KernelState::Stopped => label.dimmed(),
    }
}

fn pid_label(pid: Option<i32>) -> String {
    pid.map_or_else(|| "-".to_string(), |p| p.to_string())
}

pub fn render_status(report: &StatusReport) -> String {
    let mut out = String::new();
    let headline = if report.running {
        "running".green().bold()
    } else {
        "stopped".red().bold()
    };
    out.push_str(&format!("\n  kernos {headline}\n"));
    out.push_str(&format!(
        "  Supervisor pid: {}   Host pid: {}\n",
        pid_label(report.supervisor_pid),
        pid_label(report.host_pid)
    ));
    if let Some(ms) = report.host_uptime_ms {
        out.push_str(&format!("  Uptime:         {}s\n", ms / 1000));
    }
    let switch = if report.manual_shutdown { "on".yellow() } else { "off".normal() };
    out.push_str(&format!(
        "  Manual stop:    {} (set by {} at {})\n",
        switch,
        report.actor,
        report.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(event) = &report.last_event {
        out.push_str(&format!("  Last event:     {}\n", format_event(event)));
    }

    if !report.kernels.is_empty() {
        out.push_str(&format!(
            "\n  {:<16} {:>4}  {:<10} {:>4}  {:>8}  {:>9}  {}\n",
            "KERNEL", "TIER", "STATE", "GEN", "RESTARTS", "HEARTBEAT", "WHY"
        ));
        for k in &report.kernels {
            let heartbeat = k
                .last_heartbeat_ms
                .map_or_else(|| "-".to_string(), |ms| format!("{:.1}s", ms as f64 / 1000.0));
            let why = match (&k.reason, k.last_event) {
                (Some(reason), Some(event)) => format!("{reason} ({event})"),
                (Some(reason), None) => reason.clone(),
                (None, Some(event)) => event.to_string(),
                (None, None) => String::new(),
            };
            // Pad before colouring so escape codes do not break alignment.
            let state = state_label(k.state);
            let pad = " ".repeat(10usize.saturating_sub(k.state.as_str().len()));
            out.push_str(&format!(
                "  {:<16} {:>4}  {}{} {:>4}  {:>8}  {:>9}  {}\n",
                k.id,
                k.tier,
                state,
                pad,
                k.generation,
                format!("{}/{}", k.restart_attempts, k.max_restarts),
                heartbeat,
                why.dimmed()
            ));
        }
    }
    out.push('\n');
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// watch
// ─────────────────────────────────────────────────────────────────────────────

pub fn format_event(event: &SupervisionEvent) -> String {
    let kind = event.event_type.as_str();
    let kind = match event.event_type {
        EventType::KernelFailed | EventType::BootAborted | EventType::ProcessCrashDetected => kind.red().bold(),
        EventType::KernelDegraded | EventType::KernelRestarting | EventType::ProcessRestartSuppressed => {
            kind.yellow()
        }
        EventType::KernelStarted | EventType::BootComplete => kind.green(),
        EventType::BootStarted | EventType::ManualStop => kind.cyan(),
    };
    let payload = if event.payload.is_empty() {
        String::new()
    } else {
        serde_json::Value::Object(event.payload.clone()).to_string()
    };
    format!(
        "{} {} {} {}",
        event.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
        kind,
        event.subject.bold(),
        payload
    )
    .trim_end()
    .to_string()
}

pub async fn watch(paths: &Paths, last: usize, follow: bool, json: bool) -> Result<()> {
    let print = |event: &SupervisionEvent| -> Result<()> {
        if json {
            println!("{}", serde_json::to_string(event)?);
        } else {
            println!("{}", format_event(event));
        }
        Ok(())
    };

    // Position the follower first so nothing written meanwhile is lost.
    let mut reader = JournalReader::at_end(paths.events())?;
    for event in &JournalReader::tail(paths.events(), last)? {
        print(event)?;
    }
    if !follow {
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = ticker.tick() => {
                for event in reader.poll()? {
                    print(&event)?;
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// kernel restart
// ─────────────────────────────────────────────────────────────────────────────

pub async fn restart_kernel(cfg: &Config, id: &str) -> Result<()> {
    let client = ControlClient::new(cfg.control_port).with_timeout(KERNEL_RESTART_TIMEOUT);
    let response = client
        .request(&ControlRequest::RestartKernel { id: id.to_string() })
        .await
        .context("Cannot reach the kernos host; is it running?")?;
    match response {
        ControlResponse::Restart { outcome } => {
            println!("  {} {id}: {}", "✓".green().bold(), serde_json::to_string(&outcome)?);
            Ok(())
        }
        ControlResponse::Error { message } => bail!("restart of {id} failed: {message}"),
        other => bail!("unexpected response from host: {other:?}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// config
// ─────────────────────────────────────────────────────────────────────────────

pub fn config_show(paths: &Paths, cfg: &Config) -> Result<()> {
    println!("# {}", paths.config().display());
    print!("{}", toml::to_string_pretty(cfg).context("Failed to serialize config")?);
    Ok(())
}

pub fn config_init(paths: &Paths, force: bool) -> Result<()> {
    let path = paths.config();
    if path.exists() && !force {
        println!(
            "  {} {} already exists (use --force to overwrite)",
            "•".yellow(),
            path.display().to_string().bold()
        );
        return Ok(());
    }
    config::save_to(&Config::default(), &path)?;
    println!("  {} Config written to {}", "✓".green().bold(), path.display().to_string().bold());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn home() -> (tempfile::TempDir, Paths, Config) {
        let dir = tempfile::tempdir().expect("tmp dir");
        let paths = Paths::resolve(Some(dir.path().to_path_buf()));
        // A port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .expect("free port");
        let cfg = Config {
            control_port: port,
            ..Config::default()
        };
        (dir, paths, cfg)
    }

    fn snapshot(id: &str, state: KernelState) -> KernelSnapshot {
        KernelSnapshot {
            id: id.into(),
            tier: 1,
            state,
            generation: 2,
            can_fail: false,
            restart_attempts: 1,
            max_restarts: 3,
            last_heartbeat_ms: Some(1500),
            reason: Some("no heartbeat for 31000 ms".into()),
            last_event: Some(EventType::KernelDegraded),
        }
    }

    #[tokio::test]
    async fn stop_is_a_no_op_when_stopped() {
        let (_dir, paths, cfg) = home();
        stop(&paths, &cfg).await.expect("first stop");
        stop(&paths, &cfg).await.expect("second stop");

        // Nothing was running, so neither the flag nor the journal changed.
        assert!(!paths.state().exists());
        assert!(!paths.events().exists());
    }

    #[tokio::test]
    async fn start_while_running_does_not_spawn() {
        let (_dir, paths, cfg) = home();
        let store = StateStore::new(&paths);
        store.set_manual_shutdown(true, "cli:stop").unwrap();
        // Pretend this test process is the supervisor.
        let me = std::process::id();
        store.write_pid(PidKind::Supervisor, me).unwrap();

        start(&paths, &cfg).await.expect("start");

        assert_eq!(store.read_pid(PidKind::Supervisor), Some(me as i32));
        let state = store.read().unwrap();
        assert!(!state.manual_shutdown);
        assert_eq!(state.actor, "cli:start");
        assert!(!paths.log().exists());
    }

    #[tokio::test]
    async fn status_cites_the_latest_process_event() {
        let (_dir, paths, cfg) = home();
        let journal = EventJournal::open(paths.events()).unwrap();
        journal
            .write(&SupervisionEvent::new(EventType::BootComplete, BOOT_SUBJECT))
            .unwrap();
        journal
            .write(&SupervisionEvent::new(EventType::KernelStarted, "memory"))
            .unwrap();
        journal
            .write(
                &SupervisionEvent::new(EventType::ProcessRestartSuppressed, PROCESS_SUBJECT)
                    .with("reason", "manual shutdown"),
            )
            .unwrap();

        let report = collect_status(&paths, &cfg).await.unwrap();
        assert!(!report.running);
        assert!(report.kernels.is_empty());
        let last = report.last_event.as_ref().expect("an event");
        assert_eq!(last.event_type, EventType::ProcessRestartSuppressed);
        assert_eq!(last.reason(), Some("manual shutdown"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["manual_shutdown"], false);
        assert_eq!(json["last_event"]["event_type"], "process_restart_suppressed");
    }

    #[tokio::test]
    async fn corrupt_journal_line_does_not_break_status() {
        let (_dir, paths, cfg) = home();
        let journal = EventJournal::open(paths.events()).unwrap();
        journal
            .write(&SupervisionEvent::new(EventType::ManualStop, PROCESS_SUBJECT))
            .unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(paths.events()).unwrap();
        std::io::Write::write_all(&mut file, b"\xff\xfe garbage\n{\"half\": ").unwrap();

        let report = collect_status(&paths, &cfg).await.unwrap();
        assert_eq!(report.last_event.map(|e| e.event_type), Some(EventType::ManualStop));
        watch(&paths, 10, false, true).await.unwrap();
    }

    #[test]
    fn rendered_status_explains_each_kernel() {
        colored::control::set_override(false);
        let report = StatusReport {
            running: true,
            manual_shutdown: false,
            actor: "cli:start".into(),
            updated_at: Utc::now(),
            supervisor_pid: Some(10),
            host_pid: Some(11),
            host_uptime_ms: Some(65_000),
            kernels: vec![snapshot("chat", KernelState::Degraded)],
            last_event: None,
        };
        let text = render_status(&report);
        assert!(text.contains("kernos running"));
        assert!(text.contains("Uptime:         65s"));
        let row = text.lines().find(|l| l.trim_start().starts_with("chat")).unwrap();
        assert!(row.contains("degraded"));
        assert!(row.contains("1/3"));
        assert!(row.contains("1.5s"));
        assert!(row.contains("no heartbeat for 31000 ms (kernel_degraded)"));
    }

    #[test]
    fn events_render_on_one_line() {
        colored::control::set_override(false);
        let event = SupervisionEvent::new(EventType::KernelRestarting, "chat").with("attempt", 2);
        let line = format_event(&event);
        assert!(line.contains("kernel_restarting chat {\"attempt\":2}"));

        let bare = format_event(&SupervisionEvent::new(EventType::BootStarted, BOOT_SUBJECT));
        assert!(bare.ends_with("boot_started boot"));
    }

    #[test]
    fn config_init_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::resolve(Some(PathBuf::from(dir.path())));
        config_init(&paths, false).unwrap();

        std::fs::write(paths.config(), "control_port = 9100\n").unwrap();
        config_init(&paths, false).unwrap();
        assert_eq!(config::load_from(&paths.config()).unwrap().unwrap().control_port, 9100);

        config_init(&paths, true).unwrap();
        assert_eq!(config::load_from(&paths.config()).unwrap().unwrap().control_port, 7878);
    }
}
