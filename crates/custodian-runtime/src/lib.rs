//! `custodian-runtime` – The Agent Runtime
//!
//! Wires the kernel, perception and middleware crates into one running agent
//! and keeps it alive.
//!
//! # Modules
//!
//! - [`agent`] – [`Agent`][agent::Agent]: builds every component from
//!   persisted state, spawns the connection worker and periodic tasks, and
//!   exposes a read-only status handle plus a small operator API.
//! - [`dispatcher`] – [`CommandDispatcher`][dispatcher::CommandDispatcher]:
//!   decodes controller commands, routes them, and answers each with
//!   `command_ack` or `command_failed`.
//! - [`reporter`] – [`DeviceStateReporter`][reporter::DeviceStateReporter]:
//!   periodic, hash-suppressed device snapshots with keep-alive.
//! - [`supervisor`] – panic-contained periodic task runner.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: `tracing`
//!   subscriber with JSON output and optional OTLP export.

pub mod agent;
pub mod dispatcher;
pub mod reporter;
pub mod supervisor;
pub mod telemetry;

pub use agent::{Agent, AgentConfig, AgentStatus};
pub use dispatcher::CommandDispatcher;
pub use reporter::{DeviceStateReporter, ReportDecision, ReporterConfig, snapshot_hash};
pub use telemetry::{LogFormat, TelemetryGuard, init_tracing};
