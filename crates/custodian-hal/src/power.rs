//! User notifications and administrative power control.

use custodian_types::CustodianError;

/// Displays notifications to the local user.
pub trait Notifier: Send + Sync {
    fn show(&self, notification_id: &str, title: &str, body: &str) -> Result<(), CustodianError>;
}

/// Administrative power operations.  Requires the admin capability on real
/// platforms.
pub trait PowerControl: Send + Sync {
    fn reboot(&self) -> Result<(), CustodianError>;
}
