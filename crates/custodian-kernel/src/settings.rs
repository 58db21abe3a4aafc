//! [`DeviceSettings`] – admin password and device display name.
//!
//! The password is never stored in clear: only a salted SHA-256 digest is
//! persisted.  Renaming the device is a privileged operation that requires the
//! current password.

use std::sync::{Arc, RwLock};

use custodian_types::store::keys;
use custodian_types::{CustodianError, StateStore, StateStoreExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

/// Longest accepted display name, in characters.
pub const MAX_DEVICE_NAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PasswordHash {
    salt: String,
    digest: String,
}

impl PasswordHash {
    fn new(password: &str) -> Self {
        let salt = uuid::Uuid::new_v4().simple().to_string();
        let digest = digest(&salt, password);
        Self { salt, digest }
    }

    fn matches(&self, password: &str) -> bool {
        digest(&self.salt, password) == self.digest
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Default)]
struct SettingsState {
    device_name: String,
    password: Option<PasswordHash>,
}

pub struct DeviceSettings {
    store: Arc<dyn StateStore>,
    state: RwLock<SettingsState>,
}

impl DeviceSettings {
    /// Load persisted settings.
    ///
    /// `default_name` is used when no name was ever stored.  `initial_password`
    /// is hashed and stored only when no password exists yet (first run).
    pub fn load(
        store: Arc<dyn StateStore>,
        default_name: &str,
        initial_password: Option<&str>,
    ) -> Result<Self, CustodianError> {
        let device_name: String = store
            .load(keys::DEVICE_NAME)?
            .unwrap_or_else(|| default_name.to_string());
        let mut password: Option<PasswordHash> = store.load(keys::ADMIN_PASSWORD_HASH)?;
        if password.is_none() {
            if let Some(initial) = initial_password.filter(|p| !p.is_empty()) {
                let hash = PasswordHash::new(initial);
                store.save(keys::ADMIN_PASSWORD_HASH, &hash)?;
                info!("initial admin password stored");
                password = Some(hash);
            }
        }
        Ok(Self {
            store,
            state: RwLock::new(SettingsState {
                device_name,
                password,
            }),
        })
    }

    pub fn device_name(&self) -> String {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .device_name
            .clone()
    }

    pub fn has_admin_password(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .password
            .is_some()
    }

    /// Replace the admin password.  Issued by the controller.
    pub fn set_admin_password(&self, password: &str) -> Result<(), CustodianError> {
        if password.is_empty() {
            return Err(CustodianError::InvalidCommand(
                "admin password must not be empty".into(),
            ));
        }
        let hash = PasswordHash::new(password);
        self.store.save(keys::ADMIN_PASSWORD_HASH, &hash)?;
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .password = Some(hash);
        info!("admin password updated");
        Ok(())
    }

    /// `true` when `password` matches the stored hash.  Always `false` when no
    /// password was ever set.
    pub fn verify_password(&self, password: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .password
            .as_ref()
            .is_some_and(|hash| hash.matches(password))
    }

    /// Rename the device after checking the admin password.
    pub fn rename_device(&self, password: &str, name: &str) -> Result<(), CustodianError> {
        if !self.verify_password(password) {
            return Err(CustodianError::InvalidPassword);
        }
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_DEVICE_NAME_LEN {
            return Err(CustodianError::InvalidCommand(format!(
                "device name must be 1..={MAX_DEVICE_NAME_LEN} characters"
            )));
        }
        self.store.save(keys::DEVICE_NAME, name)?;
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .device_name = name.to_string();
        info!(name, "device renamed");
        Ok(())
    }
}
