//! `kernos-runtime` – The Application Host
//!
//! Turns declarative kernel definitions into a running, supervised process.
//!
//! # Modules
//!
//! - [`kernels`] – [`KernelSpec`][kernels::KernelSpec] and the concrete
//!   kernel kinds: [`PulseKernel`][kernels::PulseKernel], an in-process
//!   heartbeat worker, and [`CommandKernel`][kernels::CommandKernel], a child
//!   process that counts as alive while it runs.
//! - [`host`] – [`Host`][host::Host]: wires registry, journal, orchestrator,
//!   restart manager and watchdog, then boots and runs until told to stop.
//!   Its [`HostExit`][host::HostExit] code is what the process supervisor
//!   sees.
//! - [`control`] – [`ControlServer`][control::ControlServer] and
//!   [`ControlClient`][control::ControlClient]: line-delimited JSON over a
//!   loopback TCP socket, used by the CLI for status, kernel restarts and
//!   graceful shutdown.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to Jaeger, Grafana Tempo, or any OTLP-compatible collector.

pub mod control;
pub mod host;
pub mod kernels;
pub mod telemetry;

pub use control::{ControlClient, ControlHandler, ControlRequest, ControlResponse, ControlServer, DEFAULT_CONTROL_PORT};
pub use host::{Host, HostExit, HostSettings, build_registry, shutdown_signal};
pub use kernels::{CommandKernel, KernelKind, KernelSpec, PulseKernel};
pub use telemetry::{LogFormat, TelemetryGuard, init_tracing};
