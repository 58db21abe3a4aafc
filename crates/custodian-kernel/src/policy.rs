//! [`PolicyEnforcer`] – allow-list and kiosk enforcement.
//!
//! The enforcer owns the single current [`AllowListPolicy`] and the optional
//! kiosk pin.  The set of applications the home screen shows is always
//! [`visible_apps`]`(installed, policy)`, recomputed whenever either input
//! changes and published on a `watch` channel.
//!
//! While a package is pinned, every focus-lost or back-navigation signal
//! relaunches it, so the single-app lock heals itself if the user escapes it.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use custodian_hal::{AppLauncher, PackageManager};
use custodian_types::store::keys;
use custodian_types::{
    AllowListPolicy, CustodianError, PlatformSignal, StateStore, StateStoreExt,
    is_valid_package_id,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The launchable set: installed packages the policy allows.
///
/// Pure: the same inputs always yield the same set.
pub fn visible_apps(installed: &BTreeSet<String>, policy: &AllowListPolicy) -> BTreeSet<String> {
    installed.intersection(&policy.packages).cloned().collect()
}

#[derive(Default)]
struct PolicyState {
    policy: AllowListPolicy,
    kiosk: Option<String>,
}

pub struct PolicyEnforcer {
    packages: Arc<dyn PackageManager>,
    launcher: Arc<dyn AppLauncher>,
    store: Arc<dyn StateStore>,
    state: RwLock<PolicyState>,
    visible_tx: watch::Sender<BTreeSet<String>>,
}

impl PolicyEnforcer {
    pub fn new(
        packages: Arc<dyn PackageManager>,
        launcher: Arc<dyn AppLauncher>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let (visible_tx, _) = watch::channel(BTreeSet::new());
        Self {
            packages,
            launcher,
            store,
            state: RwLock::new(PolicyState::default()),
            visible_tx,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PolicyState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PolicyState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Restore the persisted policy and kiosk pin, recompute the visible set,
    /// and re-engage the lock if a package was pinned.
    pub fn restore(&self) -> Result<(), CustodianError> {
        let packages: BTreeSet<String> = self.store.load(keys::ALLOW_LIST)?.unwrap_or_default();
        let kiosk: Option<String> = self.store.load(keys::KIOSK_PACKAGE)?;
        {
            let mut state = self.write();
            state.policy = AllowListPolicy { packages };
            state.kiosk = kiosk.clone();
        }
        info!(
            allowed = self.read().policy.packages.len(),
            kiosk = ?kiosk,
            "policy restored"
        );
        self.refresh_visible()?;
        if let Some(package) = kiosk {
            self.engage(&package)?;
        }
        Ok(())
    }

    /// Validate and atomically replace the allow-list.  On any failure the
    /// prior policy stays in force.
    pub fn apply_allow_list<I, S>(&self, packages: I) -> Result<BTreeSet<String>, CustodianError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let policy = AllowListPolicy::try_from_packages(packages)?;
        self.apply_policy(policy)
    }

    /// Persist `policy`, make it current, and refresh the launcher.  Returns
    /// the new visible set.
    pub fn apply_policy(&self, policy: AllowListPolicy) -> Result<BTreeSet<String>, CustodianError> {
        self.store
            .save(keys::ALLOW_LIST, &policy.packages)
            .map_err(|e| CustodianError::PolicyApplyFailure(format!("could not persist: {e}")))?;
        let count = policy.packages.len();
        self.write().policy = policy;
        info!(allowed = count, "allow-list applied");
        self.refresh_visible()
    }

    /// Recompute the visible set from the current inventory and policy, tell
    /// the launcher, and publish it.
    pub fn refresh_visible(&self) -> Result<BTreeSet<String>, CustodianError> {
        let installed = self.packages.installed_packages()?;
        let visible = visible_apps(&installed, &self.read().policy);
        self.launcher.refresh_launcher(&visible);
        self.visible_tx.send_replace(visible.clone());
        debug!(visible = visible.len(), installed = installed.len(), "launcher refreshed");
        Ok(visible)
    }

    /// Pin the device to `package`: launch it, engage the single-app lock,
    /// and persist the pin.
    pub fn enter_kiosk(&self, package: &str) -> Result<(), CustodianError> {
        if !is_valid_package_id(package) {
            return Err(CustodianError::PolicyApplyFailure(format!(
                "invalid package id '{package}'"
            )));
        }
        if !self.packages.installed_packages()?.contains(package) {
            return Err(CustodianError::PolicyApplyFailure(format!(
                "package '{package}' is not installed"
            )));
        }
        self.engage(package)?;
        self.store.save(keys::KIOSK_PACKAGE, package)?;
        self.write().kiosk = Some(package.to_string());
        info!(package, "kiosk mode entered");
        Ok(())
    }

    fn engage(&self, package: &str) -> Result<(), CustodianError> {
        self.launcher.launch(package)?;
        self.launcher.engage_lock_task(package)
    }

    /// Release the single-app lock and forget the pin.  No-op when not pinned.
    pub fn exit_kiosk(&self) -> Result<(), CustodianError> {
        let Some(package) = self.kiosk_package() else {
            return Ok(());
        };
        self.launcher.release_lock_task()?;
        self.store.remove(keys::KIOSK_PACKAGE)?;
        self.write().kiosk = None;
        info!(package = %package, "kiosk mode exited");
        Ok(())
    }

    /// React to a platform signal.  Focus loss and back navigation relaunch
    /// the pinned package; package changes recompute the visible set.
    pub fn on_platform_signal(&self, signal: &PlatformSignal) -> Result<(), CustodianError> {
        match signal {
            PlatformSignal::FocusLost { .. } | PlatformSignal::BackNavigation => {
                if let Some(package) = self.kiosk_package() {
                    debug!(package = %package, ?signal, "relaunching pinned package");
                    if let Err(e) = self.launcher.launch(&package) {
                        warn!(package = %package, error = %e, "kiosk relaunch failed");
                        return Err(e);
                    }
                }
                Ok(())
            }
            PlatformSignal::PackagesChanged => self.refresh_visible().map(|_| ()),
            _ => Ok(()),
        }
    }

    pub fn kiosk_package(&self) -> Option<String> {
        self.read().kiosk.clone()
    }

    pub fn allow_list(&self) -> BTreeSet<String> {
        self.read().policy.packages.clone()
    }

    /// The last published visible set.
    pub fn visible(&self) -> BTreeSet<String> {
        self.visible_tx.borrow().clone()
    }

    pub fn subscribe_visible(&self) -> watch::Receiver<BTreeSet<String>> {
        self.visible_tx.subscribe()
    }
}
