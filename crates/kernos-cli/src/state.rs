//! Persisted process state: the kill-switch file and the pid files.
//!
//! Every write goes to a temp file in the same directory, is fsynced, then
//! renamed over the target, so a reader never sees a torn file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kernos_types::ProcessState;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tempfile::NamedTempFile;

use crate::config::{Paths, ensure_private_dir};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidKind {
    Supervisor,
    Host,
}

impl PidKind {
    fn file_name(self) -> &'static str {
        match self {
            PidKind::Supervisor => "supervisor.pid",
            PidKind::Host => "host.pid",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    state_path: PathBuf,
}

impl StateStore {
    pub fn new(paths: &Paths) -> Self {
        Self {
            dir: paths.home().to_path_buf(),
            state_path: paths.state(),
        }
    }

    /// A missing file reads as `manual_shutdown=false`, actor `"default"`.
    pub fn read(&self) -> Result<ProcessState> {
        match fs::read_to_string(&self.state_path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt state file {}", self.state_path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ProcessState::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.state_path.display())),
        }
    }

    pub fn write(&self, state: &ProcessState) -> Result<()> {
        let raw = serde_json::to_vec_pretty(state).context("Failed to serialize process state")?;
        self.write_atomic(&self.state_path, &raw)
    }

    /// Durably record the kill switch.
    pub fn set_manual_shutdown(&self, manual_shutdown: bool, actor: &str) -> Result<ProcessState> {
        let state = ProcessState::new(manual_shutdown, actor);
        self.write(&state)?;
        Ok(state)
    }

    pub fn write_pid(&self, kind: PidKind, pid: u32) -> Result<()> {
        self.write_atomic(&self.dir.join(kind.file_name()), pid.to_string().as_bytes())
    }

    pub fn read_pid(&self, kind: PidKind) -> Option<i32> {
        fs::read_to_string(self.dir.join(kind.file_name()))
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
    }

    pub fn clear_pid(&self, kind: PidKind) {
        let _ = fs::remove_file(self.dir.join(kind.file_name()));
    }

    /// The recorded pid, if that process is still alive.
    pub fn live_pid(&self, kind: PidKind) -> Option<i32> {
        self.read_pid(kind).filter(|pid| pid_alive(*pid))
    }

    fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        ensure_private_dir(&self.dir)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("Failed to create temp file in {}", self.dir.display()))?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(target)
            .with_context(|| format!("Failed to replace {}", target.display()))?;
        Ok(())
    }
}

/// Signal 0 probe.  `EPERM` means the process exists but belongs to someone
/// else.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// Send `signal`; a process that is already gone is not an error.
pub fn signal_pid(pid: i32, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to send {signal:?} to pid {pid}")),
    }
}
