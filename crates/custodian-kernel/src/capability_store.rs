//! [`CapabilityStore`] – the agent's view of which OS capabilities it holds.
//!
//! Every capability starts out missing.  The store is mutated only by the
//! permission orchestrator (prompt results and live re-reads of the platform
//! grant state) and persisted on every change, so a restart does not forget a
//! grant the OS still reports.
//!
//! Components gate their work with [`CapabilityStore::check`]; a missing
//! capability yields [`CustodianError::PermissionDenied`].

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use custodian_hal::CapabilityPrompt;
use custodian_types::store::keys;
use custodian_types::{CapabilityKind, CustodianError, StateStore, StateStoreExt};
use tracing::info;

/// Grant flags for every [`CapabilityKind`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use custodian_kernel::capability_store::CapabilityStore;
/// use custodian_memory::StateDb;
/// use custodian_types::CapabilityKind;
///
/// let store = CapabilityStore::load(Arc::new(StateDb::open_in_memory().unwrap())).unwrap();
/// assert!(store.check(CapabilityKind::Location).is_err());
/// store.set(CapabilityKind::Location, true).unwrap();
/// assert!(store.check(CapabilityKind::Location).is_ok());
/// ```
pub struct CapabilityStore {
    grants: RwLock<BTreeMap<CapabilityKind, bool>>,
    store: Arc<dyn StateStore>,
}

impl CapabilityStore {
    /// Load persisted grant flags.  Kinds never seen before start missing.
    pub fn load(store: Arc<dyn StateStore>) -> Result<Self, CustodianError> {
        let persisted: BTreeMap<CapabilityKind, bool> =
            store.load(keys::CAPABILITIES)?.unwrap_or_default();
        let grants = CapabilityKind::ALL
            .iter()
            .map(|kind| (*kind, persisted.get(kind).copied().unwrap_or(false)))
            .collect();
        Ok(Self {
            grants: RwLock::new(grants),
            store,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<CapabilityKind, bool>> {
        self.grants.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<CapabilityKind, bool>> {
        self.grants.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_granted(&self, kind: CapabilityKind) -> bool {
        self.read().get(&kind).copied().unwrap_or(false)
    }

    /// `Ok(())` when `kind` is held, [`CustodianError::PermissionDenied`]
    /// otherwise.
    pub fn check(&self, kind: CapabilityKind) -> Result<(), CustodianError> {
        if self.is_granted(kind) {
            Ok(())
        } else {
            Err(CustodianError::PermissionDenied(kind))
        }
    }

    /// Set the flag for `kind` and persist the whole map when it changed.
    ///
    /// Returns whether the flag changed.  The in-memory flag is updated even
    /// when persisting fails.
    pub fn set(&self, kind: CapabilityKind, granted: bool) -> Result<bool, CustodianError> {
        let snapshot = {
            let mut grants = self.write();
            if grants.get(&kind).copied() == Some(granted) {
                return Ok(false);
            }
            grants.insert(kind, granted);
            grants.clone()
        };
        info!(capability = %kind, granted, "capability changed");
        self.store.save(keys::CAPABILITIES, &snapshot)?;
        Ok(true)
    }

    /// Kinds not currently held, in [`CapabilityKind`] order.
    pub fn missing(&self) -> Vec<CapabilityKind> {
        self.read()
            .iter()
            .filter(|(_, granted)| !**granted)
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<CapabilityKind, bool> {
        self.read().clone()
    }

    /// Re-read the live grant state from the platform and record any
    /// difference (grants made in settings, revocations).  Returns the kinds
    /// that changed.
    pub fn sync_from(
        &self,
        prompt: &dyn CapabilityPrompt,
    ) -> Result<Vec<CapabilityKind>, CustodianError> {
        let mut changed = Vec::new();
        for kind in CapabilityKind::ALL {
            if self.set(kind, prompt.is_granted(kind))? {
                changed.push(kind);
            }
        }
        Ok(changed)
    }
}
