use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Subject used for events that concern the supervised process as a whole.
pub const PROCESS_SUBJECT: &str = "process";

/// Subject used for events that concern the boot sequence as a whole.
pub const BOOT_SUBJECT: &str = "boot";

/// Lifecycle state of a single kernel.
///
/// ```text
/// Pending → Starting → Running → { Degraded, Stopped }
///                    ↘ Failed (readiness timeout, can_fail = false)
/// Running → Failed (restart budget exhausted, terminal until manual restart)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    /// Declared but not yet started.
    Pending,
    /// `start()` has been invoked and readiness is awaited.
    Starting,
    /// Ready and heartbeating.
    Running,
    /// Running with reduced guarantees: a `can_fail` kernel that did not
    /// become ready, or a kernel whose heartbeat went stale.
    Degraded,
    /// Stopped on purpose.
    Stopped,
    /// Gave up on. No automatic restart will be attempted.
    Failed,
}

impl KernelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelState::Pending => "pending",
            KernelState::Starting => "starting",
            KernelState::Running => "running",
            KernelState::Degraded => "degraded",
            KernelState::Stopped => "stopped",
            KernelState::Failed => "failed",
        }
    }
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a [`SupervisionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    BootStarted,
    KernelStarted,
    KernelDegraded,
    KernelRestarting,
    KernelFailed,
    BootComplete,
    BootAborted,
    ProcessCrashDetected,
    ProcessRestartSuppressed,
    ManualStop,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BootStarted => "boot_started",
            EventType::KernelStarted => "kernel_started",
            EventType::KernelDegraded => "kernel_degraded",
            EventType::KernelRestarting => "kernel_restarting",
            EventType::KernelFailed => "kernel_failed",
            EventType::BootComplete => "boot_complete",
            EventType::BootAborted => "boot_aborted",
            EventType::ProcessCrashDetected => "process_crash_detected",
            EventType::ProcessRestartSuppressed => "process_restart_suppressed",
            EventType::ManualStop => "manual_stop",
        }
    }

    /// `true` for events emitted at process granularity by the supervisor or
    /// the command surface rather than by the in-process core.
    pub fn is_process_level(&self) -> bool {
        matches!(
            self,
            EventType::ProcessCrashDetected
                | EventType::ProcessRestartSuppressed
                | EventType::ManualStop
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable, append-only record of something the supervision core did or
/// observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisionEvent {
    pub id: Uuid,
    pub event_type: EventType,
    /// Kernel id, [`PROCESS_SUBJECT`] or [`BOOT_SUBJECT`].
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl SupervisionEvent {
    /// Create an event stamped with a fresh id and the current time.
    pub fn new(event_type: EventType, subject: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            subject: subject.into(),
            timestamp: Utc::now(),
            payload: Map::new(),
        }
    }

    /// Attach a payload entry (builder-style).
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Human-readable reason carried in the payload, if any.
    pub fn reason(&self) -> Option<&str> {
        self.payload.get("reason").and_then(Value::as_str)
    }
}

/// Persisted kill-switch record shared by the command surface and the process
/// supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessState {
    /// While `true` the supervisor never relaunches the application.
    pub manual_shutdown: bool,
    pub updated_at: DateTime<Utc>,
    /// Who set the flag, e.g. `"cli:stop"`.
    pub actor: String,
}

impl ProcessState {
    pub fn new(manual_shutdown: bool, actor: impl Into<String>) -> Self {
        Self {
            manual_shutdown,
            updated_at: Utc::now(),
            actor: actor.into(),
        }
    }
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::new(false, "default")
    }
}

/// Point-in-time view of one kernel, as reported by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSnapshot {
    pub id: String,
    pub tier: u32,
    pub state: KernelState,
    pub generation: u64,
    pub can_fail: bool,
    pub restart_attempts: u32,
    pub max_restarts: u32,
    /// Milliseconds since the last accepted heartbeat, if one was ever seen.
    pub last_heartbeat_ms: Option<u64>,
    /// Why the kernel is in its current state.
    pub reason: Option<String>,
    /// The event that most recently changed this kernel's state.
    pub last_event: Option<EventType>,
}

/// Final outcome of a boot run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BootOutcome {
    Complete,
    Aborted { reason: String },
}

/// Errors raised by the supervision core.
///
/// Runtime liveness failures are normally handled locally and surface only as
/// [`SupervisionEvent`]s; these variants are what crosses API boundaries.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KernosError {
    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Kernel {kernel} depends on unknown kernel {dependency}")]
    UnknownDependency { kernel: String, dependency: String },

    #[error("Kernel {0} is already registered")]
    DuplicateKernel(String),

    #[error("Unknown kernel: {0}")]
    UnknownKernel(String),

    #[error("Kernel {kernel} cannot start: dependency {dependency} is not running")]
    DependencyNotReady { kernel: String, dependency: String },

    #[error("Kernel {kernel} did not report readiness within {timeout_ms} ms")]
    KernelStartTimeout { kernel: String, timeout_ms: u64 },

    #[error("Kernel {kernel} failed to start: {reason}")]
    KernelStartFailed { kernel: String, reason: String },

    #[error("Kernel {kernel} stopped responding: {reason}")]
    KernelCrashed { kernel: String, reason: String },

    #[error("Kernel {kernel} exhausted its restart budget ({attempts} attempts)")]
    RestartBudgetExhausted { kernel: String, attempts: u32 },

    #[error("Supervised process exited unexpectedly (exit code {exit_code:?})")]
    ProcessCrashDetected { exit_code: Option<i32> },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("I/O Error: {0}")]
    Io(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Config Error: {0}")]
    Config(String),
}

impl From<std::io::Error> for KernosError {
    fn from(e: std::io::Error) -> Self {
        KernosError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for KernosError {
    fn from(e: serde_json::Error) -> Self {
        KernosError::Serialization(e.to_string())
    }
}
