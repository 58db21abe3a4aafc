//! `custodian-kernel` – Capabilities & Policy
//!
//! The rule-enforcing core of the agent.  It decides what the device is
//! allowed to do and holds the privileged local settings; it never talks to
//! the controller directly.
//!
//! # Modules
//!
//! - [`capability_store`] – [`CapabilityStore`][capability_store::CapabilityStore]:
//!   persisted grant flags for every [`CapabilityKind`][custodian_types::CapabilityKind].
//!   Components gate privileged work with `check`.
//! - [`orchestrator`] – [`PermissionOrchestrator`][orchestrator::PermissionOrchestrator]:
//!   requests missing capabilities one at a time in priority order, with
//!   per-kind cooldowns and a single-flight guard.
//! - [`policy`] – [`PolicyEnforcer`][policy::PolicyEnforcer]: applies the
//!   allow-list against installed apps and keeps the kiosk lock engaged.
//! - [`settings`] – [`DeviceSettings`][settings::DeviceSettings]: hashed admin
//!   password and device display name.

pub mod capability_store;
pub mod orchestrator;
pub mod policy;
pub mod settings;

pub use capability_store::CapabilityStore;
pub use orchestrator::{OrchestratorConfig, PermissionOrchestrator, TickOutcome};
pub use policy::{PolicyEnforcer, visible_apps};
pub use settings::DeviceSettings;
