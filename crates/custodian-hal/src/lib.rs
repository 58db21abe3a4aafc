//! `custodian-hal` – OS Abstraction Layer
//!
//! The runtime never calls device-owner APIs, location providers or the
//! launcher directly.  It talks to the small traits in this crate, so the
//! concrete platform can be swapped without touching policy logic.
//!
//! # Modules
//!
//! - [`apps`] – [`PackageManager`] and [`AppLauncher`] (installed packages,
//!   launching, single-app lock).
//! - [`prompt`] – [`CapabilityPrompt`]: the "request capability, await
//!   result" effect.
//! - [`probe`] – [`DeviceProbe`]: battery, storage and network readings.
//! - [`location`] – [`LocationSource`]: one-shot location fixes.
//! - [`power`] – [`Notifier`] and [`PowerControl`].
//! - [`platform`] – [`Platform`]: the bundle of trait objects handed to the
//!   runtime.
//! - [`sim`] – [`SimDevice`][sim::SimDevice]: a fully simulated device for
//!   headless tests and the CLI.

pub mod apps;
pub mod location;
pub mod platform;
pub mod power;
pub mod probe;
pub mod prompt;
pub mod sim;

pub use apps::{AppLauncher, PackageManager};
pub use location::LocationSource;
pub use platform::Platform;
pub use power::{Notifier, PowerControl};
pub use probe::DeviceProbe;
pub use prompt::{CapabilityPrompt, PromptOutcome};
pub use sim::SimDevice;
