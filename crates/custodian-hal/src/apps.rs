//! Application inventory and launcher control.
//!
//! [`PackageManager`] answers "what is installed"; [`AppLauncher`] starts
//! applications and engages the platform's single-application lock (lock-task
//! mode on Android, assigned access on Windows, a kiosk session elsewhere).

use std::collections::BTreeSet;

use custodian_types::CustodianError;

/// Read-only view of the installed application inventory.
pub trait PackageManager: Send + Sync {
    /// Return the identifiers of every launchable installed package.
    ///
    /// # Errors
    ///
    /// Returns [`CustodianError::Platform`] when the inventory cannot be read.
    fn installed_packages(&self) -> Result<BTreeSet<String>, CustodianError>;
}

/// Starts applications and controls the single-application lock.
pub trait AppLauncher: Send + Sync {
    /// Bring `package` to the foreground, starting it if necessary.
    fn launch(&self, package: &str) -> Result<(), CustodianError>;

    /// The package currently in the foreground, when the platform can tell.
    fn foreground_package(&self) -> Option<String>;

    /// Pin the device to `package`.
    fn engage_lock_task(&self, package: &str) -> Result<(), CustodianError>;

    /// Release any single-application lock.  No-op when none is engaged.
    fn release_lock_task(&self) -> Result<(), CustodianError>;

    /// Ask the home screen to redraw with `visible` as the launchable set.
    fn refresh_launcher(&self, visible: &BTreeSet<String>);
}
