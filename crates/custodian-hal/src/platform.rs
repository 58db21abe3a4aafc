//! [`Platform`] – the bundle of OS drivers handed to the runtime.
//!
//! Each concern is a separate trait object so a deployment can mix drivers
//! (e.g. a real package manager with a simulated location source while a
//! GNSS receiver is being bench-tested).

use std::sync::Arc;

use crate::apps::{AppLauncher, PackageManager};
use crate::location::LocationSource;
use crate::power::{Notifier, PowerControl};
use crate::probe::DeviceProbe;
use crate::prompt::CapabilityPrompt;

/// Shared handles to every platform driver.  Cheap to clone.
#[derive(Clone)]
pub struct Platform {
    pub packages: Arc<dyn PackageManager>,
    pub launcher: Arc<dyn AppLauncher>,
    pub prompt: Arc<dyn CapabilityPrompt>,
    pub probe: Arc<dyn DeviceProbe>,
    pub location: Arc<dyn LocationSource>,
    pub notifier: Arc<dyn Notifier>,
    pub power: Arc<dyn PowerControl>,
}

impl Platform {
    /// Use one device object for every concern.
    pub fn from_device<D>(device: Arc<D>) -> Self
    where
        D: PackageManager
            + AppLauncher
            + CapabilityPrompt
            + DeviceProbe
            + LocationSource
            + Notifier
            + PowerControl
            + 'static,
    {
        Self {
            packages: device.clone(),
            launcher: device.clone(),
            prompt: device.clone(),
            probe: device.clone(),
            location: device.clone(),
            notifier: device.clone(),
            power: device,
        }
    }
}
