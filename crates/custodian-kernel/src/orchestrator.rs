//! [`PermissionOrchestrator`] – acquires missing capabilities one at a time.
//!
//! Each [`tick`][PermissionOrchestrator::tick] runs one pass of the request
//! state machine:
//!
//! 1. Re-read the live grant state from the platform.
//! 2. List the missing capabilities by ascending priority number.
//! 3. Skip those whose cooldown has not elapsed since their last request.
//! 4. Prompt for the first eligible one and await the user's decision.
//! 5. Record a grant; leave a denial missing for a later pass.
//!
//! At most one prompt is ever outstanding: a tick that overlaps an in-flight
//! request returns [`TickOutcome::Busy`] immediately.  Prompts have no
//! timeout.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use custodian_hal::{CapabilityPrompt, PromptOutcome};
use custodian_types::store::keys;
use custodian_types::{
    CapabilityKind, CustodianError, PermissionRequest, StateStore, StateStoreExt,
};
use tracing::{debug, info, warn};

use crate::capability_store::CapabilityStore;

/// Default minimum spacing between two prompts for the same capability.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub cooldown: Duration,
    /// Request order; lower numbers first.  Kinds absent from the map use
    /// [`CapabilityKind::default_priority`].
    pub priorities: BTreeMap<CapabilityKind, u32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            priorities: CapabilityKind::ALL
                .iter()
                .map(|k| (*k, k.default_priority()))
                .collect(),
        }
    }
}

impl OrchestratorConfig {
    pub fn priority_of(&self, kind: CapabilityKind) -> u32 {
        self.priorities
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_priority())
    }
}

/// Result of one orchestration pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing is missing.
    Satisfied,
    Granted(CapabilityKind),
    Denied(CapabilityKind),
    /// Something is missing but every candidate is still cooling down.
    CoolingDown,
    /// Another pass is waiting on a prompt.
    Busy,
}

/// Resets the single-flight flag when the pass ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PermissionOrchestrator {
    config: OrchestratorConfig,
    capabilities: Arc<CapabilityStore>,
    prompt: Arc<dyn CapabilityPrompt>,
    store: Arc<dyn StateStore>,
    last_requested: Mutex<BTreeMap<CapabilityKind, DateTime<Utc>>>,
    in_flight: AtomicBool,
}

impl PermissionOrchestrator {
    /// Build the orchestrator, restoring persisted last-request times so
    /// cooldowns survive restarts.
    pub fn new(
        config: OrchestratorConfig,
        capabilities: Arc<CapabilityStore>,
        prompt: Arc<dyn CapabilityPrompt>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, CustodianError> {
        let last_requested = store
            .load(keys::PERMISSION_REQUESTED_AT)?
            .unwrap_or_default();
        Ok(Self {
            config,
            capabilities,
            prompt,
            store,
            last_requested: Mutex::new(last_requested),
            in_flight: AtomicBool::new(false),
        })
    }

    fn last_requested(&self) -> MutexGuard<'_, BTreeMap<CapabilityKind, DateTime<Utc>>> {
        self.last_requested.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a prompt is currently outstanding.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Missing capabilities by ascending priority number, ties broken by kind.
    pub fn missing_by_priority(&self) -> Vec<CapabilityKind> {
        let mut missing = self.capabilities.missing();
        missing.sort_by_key(|k| (self.config.priority_of(*k), *k));
        missing
    }

    pub fn last_requested_at(&self, kind: CapabilityKind) -> Option<DateTime<Utc>> {
        self.last_requested().get(&kind).copied()
    }

    fn cooldown_elapsed(&self, kind: CapabilityKind, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_requested_at(kind) else {
            return true;
        };
        let cooldown =
            chrono::Duration::from_std(self.config.cooldown).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(last) >= cooldown
    }

    fn persist_last_requested(&self) {
        let snapshot = self.last_requested().clone();
        if let Err(e) = self.store.save(keys::PERMISSION_REQUESTED_AT, &snapshot) {
            warn!(error = %e, "failed to persist permission request times");
        }
    }

    /// Clear the cooldown of `kind` so the next tick may prompt for it at once.
    pub fn expedite(&self, kind: CapabilityKind) {
        if self.last_requested().remove(&kind).is_some() {
            debug!(capability = %kind, "cooldown cleared");
            self.persist_last_requested();
        }
    }

    /// Run one orchestration pass.
    pub async fn tick(&self) -> Result<TickOutcome, CustodianError> {
        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            return Ok(TickOutcome::Busy);
        };

        let changed = self.capabilities.sync_from(self.prompt.as_ref())?;
        if !changed.is_empty() {
            debug!(?changed, "platform grant state changed");
        }

        let missing = self.missing_by_priority();
        if missing.is_empty() {
            return Ok(TickOutcome::Satisfied);
        }

        let now = Utc::now();
        let Some(kind) = missing
            .into_iter()
            .find(|k| self.cooldown_elapsed(*k, now))
        else {
            return Ok(TickOutcome::CoolingDown);
        };

        self.last_requested().insert(kind, now);
        self.persist_last_requested();

        let mut request = PermissionRequest::for_capability(kind);
        request.priority = self.config.priority_of(kind);
        info!(capability = %kind, priority = request.priority, "requesting capability");

        match self.prompt.request(&request).await {
            PromptOutcome::Granted => {
                self.capabilities.set(kind, true)?;
                info!(capability = %kind, "capability granted");
                Ok(TickOutcome::Granted(kind))
            }
            PromptOutcome::Denied => {
                info!(capability = %kind, retry_after = ?self.config.cooldown, "capability denied");
                Ok(TickOutcome::Denied(kind))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custodian_hal::SimDevice;
    use custodian_memory::StateDb;

    fn build(
        device: Arc<SimDevice>,
        cooldown: Duration,
    ) -> (Arc<PermissionOrchestrator>, Arc<CapabilityStore>, Arc<StateDb>) {
        let db = Arc::new(StateDb::open_in_memory().unwrap());
        let caps = Arc::new(CapabilityStore::load(db.clone()).unwrap());
        let config = OrchestratorConfig {
            cooldown,
            ..OrchestratorConfig::default()
        };
        let orch = PermissionOrchestrator::new(config, caps.clone(), device, db.clone()).unwrap();
        (Arc::new(orch), caps, db)
    }

    #[tokio::test]
    async fn grants_in_priority_order_until_satisfied() {
        let device = Arc::new(SimDevice::new());
        let (orch, caps, _) = build(device.clone(), Duration::from_secs(60));

        let mut outcomes = Vec::new();
        loop {
            let outcome = orch.tick().await.unwrap();
            if outcome == TickOutcome::Satisfied {
                break;
            }
            outcomes.push(outcome);
        }
        let granted: Vec<TickOutcome> =
            CapabilityKind::ALL.iter().map(|k| TickOutcome::Granted(*k)).collect();
        assert_eq!(outcomes, granted);
        assert!(caps.missing().is_empty());
        assert_eq!(device.prompts(), CapabilityKind::ALL.to_vec());
    }

    #[tokio::test]
    async fn denial_cools_down_and_next_kind_is_tried() {
        let device = Arc::new(SimDevice::new().with_auto_answer(PromptOutcome::Denied));
        let (orch, caps, _) = build(device.clone(), Duration::from_secs(3600));

        assert_eq!(
            orch.tick().await.unwrap(),
            TickOutcome::Denied(CapabilityKind::AdminPrivilege)
        );
        assert_eq!(
            orch.tick().await.unwrap(),
            TickOutcome::Denied(CapabilityKind::HomeRole)
        );
        assert!(!caps.is_granted(CapabilityKind::AdminPrivilege));
        for _ in 0..3 {
            orch.tick().await.unwrap();
        }
        assert_eq!(orch.tick().await.unwrap(), TickOutcome::CoolingDown);
    }

    #[tokio::test]
    async fn denial_is_retried_after_cooldown() {
        let device = Arc::new(
            SimDevice::new()
                .with_granted(&[
                    CapabilityKind::AdminPrivilege,
                    CapabilityKind::HomeRole,
                    CapabilityKind::UsageAccess,
                    CapabilityKind::Notifications,
                ])
                .with_auto_answer(PromptOutcome::Denied),
        );
        let (orch, _, _) = build(device.clone(), Duration::ZERO);
        assert_eq!(
            orch.tick().await.unwrap(),
            TickOutcome::Denied(CapabilityKind::Location)
        );
        assert_eq!(
            orch.tick().await.unwrap(),
            TickOutcome::Denied(CapabilityKind::Location)
        );
        assert_eq!(device.prompts().len(), 2);
    }

    #[tokio::test]
    async fn overlapping_tick_is_busy() {
        let device = Arc::new(SimDevice::new().with_manual_prompts());
        let (orch, _, _) = build(device.clone(), Duration::from_secs(60));

        let o = orch.clone();
        let first = tokio::spawn(async move { o.tick().await });
        while !orch.is_busy() {
            tokio::task::yield_now().await;
        }
        assert_eq!(orch.tick().await.unwrap(), TickOutcome::Busy);

        device.resolve_prompt(PromptOutcome::Granted);
        assert_eq!(
            first.await.unwrap().unwrap(),
            TickOutcome::Granted(CapabilityKind::AdminPrivilege)
        );
        assert!(!orch.is_busy());
        assert_eq!(device.max_prompts_in_flight(), 1);
    }

    #[tokio::test]
    async fn revocation_is_noticed_and_rerequested() {
        let device = Arc::new(SimDevice::new().with_granted(&CapabilityKind::ALL));
        let (orch, caps, _) = build(device.clone(), Duration::from_secs(60));
        assert_eq!(orch.tick().await.unwrap(), TickOutcome::Satisfied);

        device.set_granted(CapabilityKind::Location, false);
        assert_eq!(
            orch.tick().await.unwrap(),
            TickOutcome::Granted(CapabilityKind::Location)
        );
        assert!(caps.is_granted(CapabilityKind::Location));
    }

    #[tokio::test]
    async fn expedite_clears_cooldown() {
        let device = Arc::new(
            SimDevice::new()
                .with_granted(&[
                    CapabilityKind::AdminPrivilege,
                    CapabilityKind::HomeRole,
                    CapabilityKind::UsageAccess,
                    CapabilityKind::Notifications,
                ])
                .with_auto_answer(PromptOutcome::Denied),
        );
        let (orch, _, _) = build(device.clone(), Duration::from_secs(3600));
        orch.tick().await.unwrap();
        assert_eq!(orch.tick().await.unwrap(), TickOutcome::CoolingDown);

        orch.expedite(CapabilityKind::Location);
        assert_eq!(
            orch.tick().await.unwrap(),
            TickOutcome::Denied(CapabilityKind::Location)
        );
    }

    #[tokio::test]
    async fn cooldown_survives_restart() {
        let device = Arc::new(SimDevice::new().with_auto_answer(PromptOutcome::Denied));
        let (orch, caps, db) = build(device.clone(), Duration::from_secs(3600));
        orch.tick().await.unwrap();
        let requested = orch.last_requested_at(CapabilityKind::AdminPrivilege);
        assert!(requested.is_some());

        let reloaded = PermissionOrchestrator::new(
            OrchestratorConfig {
                cooldown: Duration::from_secs(3600),
                ..OrchestratorConfig::default()
            },
            caps,
            device,
            db,
        )
        .unwrap();
        assert_eq!(
            reloaded.last_requested_at(CapabilityKind::AdminPrivilege),
            requested
        );
    }

    #[test]
    fn custom_priorities_change_order() {
        let device = Arc::new(SimDevice::new());
        let db = Arc::new(StateDb::open_in_memory().unwrap());
        let caps = Arc::new(CapabilityStore::load(db.clone()).unwrap());
        let mut config = OrchestratorConfig::default();
        config.priorities.insert(CapabilityKind::Notifications, 0);
        config.priorities.insert(CapabilityKind::AdminPrivilege, 9);
        let orch = PermissionOrchestrator::new(config, caps, device, db).unwrap();
        let order = orch.missing_by_priority();
        assert_eq!(order.first(), Some(&CapabilityKind::Notifications));
        assert_eq!(order.last(), Some(&CapabilityKind::AdminPrivilege));
    }
}
