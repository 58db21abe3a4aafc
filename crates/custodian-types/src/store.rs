//! The persistence boundary.
//!
//! Components never read or write files directly.  They load their state once
//! at construction and save it through a [`StateStore`] whenever it changes.
//! Values are JSON documents addressed by the well-known [`keys`].

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::CustodianError;

/// Well-known keys of the persisted agent state.
pub mod keys {
    pub const ALLOW_LIST: &str = "policy.allow_list";
    pub const KIOSK_PACKAGE: &str = "policy.kiosk_package";
    pub const DEVICE_NAME: &str = "settings.device_name";
    pub const ADMIN_PASSWORD_HASH: &str = "settings.admin_password_hash";
    pub const LAST_SNAPSHOT_HASH: &str = "reporter.last_snapshot_hash";
    pub const CAPABILITIES: &str = "capabilities.granted";
    pub const PERMISSION_REQUESTED_AT: &str = "capabilities.requested_at";
    pub const GEOFENCE_ZONES: &str = "geofence.zones";
    pub const GEOFENCE_CONTAINMENT: &str = "geofence.containment";
    pub const LOCATION_TRACKING: &str = "location.tracking";
}

/// A key/value store of raw JSON documents.
pub trait StateStore: Send + Sync {
    fn load_raw(&self, key: &str) -> Result<Option<String>, CustodianError>;
    fn save_raw(&self, key: &str, value: &str) -> Result<(), CustodianError>;
    fn remove(&self, key: &str) -> Result<(), CustodianError>;
}

/// Typed helpers over any [`StateStore`].
pub trait StateStoreExt: StateStore {
    fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CustodianError> {
        match self.load_raw(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CustodianError> {
        let raw = serde_json::to_string(value)?;
        self.save_raw(key, &raw)
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}
