//! Configuration – reads/writes `~/.kernos/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use humantime_serde::re::humantime;
use kernos_kernel::{OrchestratorConfig, RestartPolicy, WatchdogConfig};
use kernos_runtime::{DEFAULT_CONTROL_PORT, HostSettings, KernelKind, KernelSpec};
use serde::{Deserialize, Serialize};

use crate::supervisor::SupervisorPolicy;

/// Persisted configuration stored in `~/.kernos/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Loopback TCP port of the host's control endpoint.
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    #[serde(default)]
    pub boot: BootSection,

    #[serde(default)]
    pub watchdog: WatchdogSection,

    #[serde(default)]
    pub restart: RestartSection,

    #[serde(default)]
    pub supervisor: SupervisorSection,

    #[serde(default = "default_kernels")]
    pub kernels: Vec<KernelSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootSection {
    #[serde(default = "default_ready_timeout", with = "humantime_serde")]
    pub ready_timeout: Duration,
    #[serde(default = "default_stop_grace", with = "humantime_serde")]
    pub stop_grace: Duration,
    /// Abort boot once more than this many kernels are degraded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_degraded: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogSection {
    #[serde(default = "default_watchdog_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_staleness", with = "humantime_serde")]
    pub staleness: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartSection {
    #[serde(default = "default_restart_base", with = "humantime_serde")]
    pub base_backoff: Duration,
    #[serde(default = "default_restart_max", with = "humantime_serde")]
    pub max_backoff: Duration,
    #[serde(default = "default_stability_window", with = "humantime_serde")]
    pub stability_window: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_max_relaunches")]
    pub max_relaunches: u32,
    #[serde(default = "default_relaunch_base", with = "humantime_serde")]
    pub base_backoff: Duration,
    #[serde(default = "default_relaunch_max", with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Uptime after which the relaunch budget refills.
    #[serde(default = "default_min_uptime", with = "humantime_serde")]
    pub min_uptime: Duration,
    /// How long `kernos stop` waits before killing stragglers.
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}
fn default_ready_timeout() -> Duration {
    OrchestratorConfig::default().ready_timeout
}
fn default_stop_grace() -> Duration {
    OrchestratorConfig::default().stop_grace
}
fn default_watchdog_interval() -> Duration {
    WatchdogConfig::default().interval
}
fn default_staleness() -> Duration {
    WatchdogConfig::default().staleness
}
fn default_restart_base() -> Duration {
    RestartPolicy::default().base_backoff
}
fn default_restart_max() -> Duration {
    RestartPolicy::default().max_backoff
}
fn default_stability_window() -> Duration {
    RestartPolicy::default().stability_window
}
fn default_max_relaunches() -> u32 {
    SupervisorPolicy::default().max_relaunches
}
fn default_relaunch_base() -> Duration {
    SupervisorPolicy::default().base_backoff
}
fn default_relaunch_max() -> Duration {
    SupervisorPolicy::default().max_backoff
}
fn default_min_uptime() -> Duration {
    SupervisorPolicy::default().min_uptime
}
fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

/// The stock kernel set written by `kernos config init`.
fn default_kernels() -> Vec<KernelSpec> {
    let pulse = KernelKind::Pulse {
        interval: Duration::from_secs(5),
        startup_delay: Duration::ZERO,
    };
    let kernel = |id: &str, tier: u32, deps: &[&str], can_fail: bool| KernelSpec {
        tier,
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        can_fail,
        kind: pulse.clone(),
        ..KernelSpec::new(id)
    };
    vec![
        kernel("memory", 0, &[], false),
        kernel("governance", 0, &[], false),
        kernel("chat", 1, &["memory", "governance"], false),
        kernel("ingestion", 2, &["memory"], true),
    ]
}

impl Default for BootSection {
    fn default() -> Self {
        Self {
            ready_timeout: default_ready_timeout(),
            stop_grace: default_stop_grace(),
            max_degraded: None,
        }
    }
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            interval: default_watchdog_interval(),
            staleness: default_staleness(),
        }
    }
}

impl Default for RestartSection {
    fn default() -> Self {
        Self {
            base_backoff: default_restart_base(),
            max_backoff: default_restart_max(),
            stability_window: default_stability_window(),
        }
    }
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            max_relaunches: default_max_relaunches(),
            base_backoff: default_relaunch_base(),
            max_backoff: default_relaunch_max(),
            min_uptime: default_min_uptime(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_port: default_control_port(),
            boot: BootSection::default(),
            watchdog: WatchdogSection::default(),
            restart: RestartSection::default(),
            supervisor: SupervisorSection::default(),
            kernels: default_kernels(),
        }
    }
}

impl Config {
    pub fn host_settings(&self, journal_path: PathBuf) -> HostSettings {
        HostSettings {
            control_port: self.control_port,
            orchestrator: OrchestratorConfig {
                ready_timeout: self.boot.ready_timeout,
                stop_grace: self.boot.stop_grace,
            },
            watchdog: WatchdogConfig {
                interval: self.watchdog.interval,
                staleness: self.watchdog.staleness,
            },
            restart: RestartPolicy {
                base_backoff: self.restart.base_backoff,
                max_backoff: self.restart.max_backoff,
                stability_window: self.restart.stability_window,
            },
            max_degraded: self.boot.max_degraded,
            kernels: self.kernels.clone(),
            journal_path: Some(journal_path),
        }
    }

    pub fn supervisor_policy(&self) -> SupervisorPolicy {
        SupervisorPolicy {
            max_relaunches: self.supervisor.max_relaunches,
            base_backoff: self.supervisor.base_backoff,
            max_backoff: self.supervisor.max_backoff,
            min_uptime: self.supervisor.min_uptime,
        }
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Every file `kernos` reads or writes lives under one home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    home: PathBuf,
}

impl Paths {
    /// `explicit` comes from `--home` / `KERNOS_HOME`; otherwise
    /// `$HOME/.kernos`.
    pub fn resolve(explicit: Option<PathBuf>) -> Self {
        match explicit {
            Some(home) => Self { home },
            None => Self::for_user_home(
                &std::env::var("HOME")
                    .or_else(|_| std::env::var("USERPROFILE"))
                    .unwrap_or_else(|_| ".".to_string()),
            ),
        }
    }

    pub(crate) fn for_user_home(user_home: &str) -> Self {
        Self {
            home: PathBuf::from(user_home).join(".kernos"),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn config(&self) -> PathBuf {
        self.home.join("config.toml")
    }

    pub fn state(&self) -> PathBuf {
        self.home.join("state.json")
    }

    pub fn events(&self) -> PathBuf {
        self.home.join("events.jsonl")
    }

    /// Output of the detached supervisor and the host it runs.
    pub fn log(&self) -> PathBuf {
        self.home.join("kernos.log")
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load the config from a specific path.  Returns `None` if the file does not
/// exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read config at {}", path.display()))?;
    let cfg: Config = toml::from_str(&raw).with_context(|| format!("Failed to parse config at {}", path.display()))?;
    Ok(Some(cfg))
}

/// Effective configuration: the file (or defaults) plus `KERNOS_*` overrides.
pub fn load_effective(paths: &Paths) -> Result<Config> {
    let mut cfg = load_from(&paths.config())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Apply `KERNOS_*` environment variable overrides to `cfg`.
///
/// Supported variables:
///
/// | Variable | Config field |
/// |---|---|
/// | `KERNOS_CONTROL_PORT` | `control_port` |
/// | `KERNOS_READY_TIMEOUT` | `boot.ready_timeout` (humantime, e.g. `10s`) |
/// | `KERNOS_STALENESS` | `watchdog.staleness` (humantime) |
/// | `KERNOS_MAX_RESTARTS` | `max_restarts` of every kernel |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("KERNOS_CONTROL_PORT")
        && let Ok(port) = v.trim().parse::<u16>()
    {
        cfg.control_port = port;
    }
    if let Ok(v) = std::env::var("KERNOS_READY_TIMEOUT")
        && let Ok(d) = humantime::parse_duration(v.trim())
    {
        cfg.boot.ready_timeout = d;
    }
    if let Ok(v) = std::env::var("KERNOS_STALENESS")
        && let Ok(d) = humantime::parse_duration(v.trim())
    {
        cfg.watchdog.staleness = d;
    }
    if let Ok(v) = std::env::var("KERNOS_MAX_RESTARTS")
        && let Ok(n) = v.trim().parse::<u32>()
    {
        for kernel in &mut cfg.kernels {
            kernel.max_restarts = n;
        }
    }
}

/// Save the config to a specific path, creating its directory if necessary.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }
    let raw = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    // Owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .with_context(|| format!("Failed to write config at {}", path.display()))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).with_context(|| format!("Failed to write config at {}", path.display()))?;
    Ok(())
}

/// Create `dir` restricted to the owner (rwx------) on Unix.
pub(crate) fn ensure_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", dir.display()))?;
    }
    Ok(())
}
