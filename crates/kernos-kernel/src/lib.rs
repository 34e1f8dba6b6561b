//! `kernos-kernel` – Boot Orchestration & Kernel Supervision
//!
//! Starts a set of interdependent kernels in dependency order, watches their
//! heartbeats and restarts the ones that go quiet, within a bounded budget.
//! It does not know what any kernel does; it only drives the
//! [`KernelHandle`] seam.
//!
//! # Modules
//!
//! - [`handle`] – [`KernelHandle`][handle::KernelHandle] and
//!   [`KernelContext`][handle::KernelContext]: the start/stop capability every
//!   kernel kind implements, and the per-instance handle it uses to report
//!   readiness and heartbeats.
//! - [`registry`] – [`KernelRegistry`][registry::KernelRegistry]: the catalog
//!   of [`KernelDescriptor`][registry::KernelDescriptor]s and their
//!   dependency edges.
//! - [`scheduler`] – [`schedule`][scheduler::schedule]: cycle detection and
//!   batch assignment.
//! - [`heartbeat`] – [`HeartbeatStore`][heartbeat::HeartbeatStore]:
//!   generation-aware last-liveness timestamps.
//! - [`context`] – [`SupervisionContext`][context::SupervisionContext]: owns
//!   the heartbeat store, the kernel state table and the event bus.
//! - [`orchestrator`] – [`Orchestrator`][orchestrator::Orchestrator]: boot,
//!   the single-kernel start/stop primitives, shutdown and snapshots.
//! - [`guardian`] – [`Guardian`][guardian::Guardian]: optional gate consulted
//!   after every boot batch.
//! - [`restart`] – [`RestartManager`][restart::RestartManager]: per-kernel
//!   serialized restarts with exponential backoff and a refilling budget.
//! - [`watchdog`] – [`TieredWatchdog`][watchdog::TieredWatchdog]: one
//!   staleness polling loop per tier.

pub mod context;
pub mod guardian;
pub mod handle;
pub mod heartbeat;
pub mod orchestrator;
pub mod registry;
pub mod restart;
pub mod scheduler;
pub mod watchdog;

pub use context::{KernelStatus, SupervisionContext};
pub use guardian::{BatchReview, DegradedLimitGuardian, Guardian, Verdict};
pub use handle::{KernelContext, KernelHandle};
pub use heartbeat::{HeartbeatRecord, HeartbeatStore};
pub use orchestrator::{BootReport, Orchestrator, OrchestratorConfig};
pub use registry::{DEFAULT_MAX_RESTARTS, KernelDescriptor, KernelRegistry};
pub use restart::{RestartManager, RestartOutcome, RestartPolicy, RestartState};
pub use scheduler::{BootBatch, schedule};
pub use watchdog::{StaleKernel, TieredWatchdog, WatchdogConfig};
