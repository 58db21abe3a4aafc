//! [`DeviceStateReporter`] – diff-suppressed device snapshots.
//!
//! Each cycle builds a [`DeviceSnapshot`], hashes it, and enqueues it as
//! `device_info` (NORMAL) only when:
//!
//! | reason            | condition                                              |
//! |-------------------|--------------------------------------------------------|
//! | `UserInteraction` | the local user touched the device since the last cycle |
//! | `Changed`         | hash differs from the last enqueued snapshot           |
//! | `KeepAlive`       | nothing sent for longer than `max_silence`             |
//!
//! The hash of the last enqueued snapshot is persisted, so a restart with
//! unchanged state stays quiet until the keep-alive interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use custodian_hal::{DeviceProbe, PackageManager};
use custodian_kernel::{CapabilityStore, DeviceSettings, PolicyEnforcer};
use custodian_middleware::OutboundQueue;
use custodian_types::store::keys;
use custodian_types::wire::OutboundPayload;
use custodian_types::{CustodianError, DeviceSnapshot, Priority, StateStore, StateStoreExt};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub const DEFAULT_REPORT_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_SILENCE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub period: Duration,
    pub max_silence: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_REPORT_PERIOD,
            max_silence: DEFAULT_MAX_SILENCE,
        }
    }
}

/// What one reporting cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportDecision {
    UserInteraction,
    Changed,
    KeepAlive,
    /// Unchanged and within the silence window.
    Suppressed,
    /// The queue refused the snapshot; it will be retried next cycle.
    Dropped,
}

/// SHA-256 over the canonical JSON form, as lowercase hex.
pub fn snapshot_hash(snapshot: &DeviceSnapshot) -> Result<String, CustodianError> {
    let bytes = serde_json::to_vec(snapshot)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

struct LastSent {
    hash: Option<String>,
    at: Option<Instant>,
}

pub struct DeviceStateReporter {
    config: ReporterConfig,
    probe: Arc<dyn DeviceProbe>,
    packages: Arc<dyn PackageManager>,
    policy: Arc<PolicyEnforcer>,
    capabilities: Arc<CapabilityStore>,
    settings: Arc<DeviceSettings>,
    queue: Arc<OutboundQueue>,
    store: Arc<dyn StateStore>,
    last: Mutex<LastSent>,
    interaction: AtomicBool,
    wake: Arc<Notify>,
}

impl DeviceStateReporter {
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        config: ReporterConfig,
        probe: Arc<dyn DeviceProbe>,
        packages: Arc<dyn PackageManager>,
        policy: Arc<PolicyEnforcer>,
        capabilities: Arc<CapabilityStore>,
        settings: Arc<DeviceSettings>,
        queue: Arc<OutboundQueue>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, CustodianError> {
        let hash: Option<String> = store.load(keys::LAST_SNAPSHOT_HASH)?;
        // A persisted hash counts as a send at startup for keep-alive purposes.
        let at = hash.as_ref().map(|_| Instant::now());
        Ok(Self {
            config,
            probe,
            packages,
            policy,
            capabilities,
            settings,
            queue,
            store,
            last: Mutex::new(LastSent { hash, at }),
            interaction: AtomicBool::new(false),
            wake: Arc::new(Notify::new()),
        })
    }

    fn last(&self) -> MutexGuard<'_, LastSent> {
        self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn period(&self) -> Duration {
        self.config.period
    }

    /// Notified when a cycle should run ahead of schedule.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Force the next cycle to send, and run it now.
    pub fn note_user_interaction(&self) {
        self.interaction.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn last_sent_hash(&self) -> Option<String> {
        self.last().hash.clone()
    }

    /// Gather a fresh snapshot from the platform and the kernel.
    pub fn build_snapshot(&self) -> Result<DeviceSnapshot, CustodianError> {
        Ok(DeviceSnapshot {
            device_name: self.settings.device_name(),
            battery: self.probe.battery()?,
            storage: self.probe.storage()?,
            installed_apps: self.packages.installed_packages()?,
            network: self.probe.network()?,
            allow_list: self.policy.allow_list(),
            capabilities: self.capabilities.snapshot(),
            kiosk_package: self.policy.kiosk_package(),
        })
    }

    pub fn cycle(&self) -> Result<ReportDecision, CustodianError> {
        self.cycle_at(Instant::now())
    }

    /// One reporting cycle evaluated at `now`.
    pub fn cycle_at(&self, now: Instant) -> Result<ReportDecision, CustodianError> {
        let snapshot = self.build_snapshot()?;
        let hash = snapshot_hash(&snapshot)?;
        let interaction = self.interaction.swap(false, Ordering::SeqCst);

        let decision = {
            let last = self.last();
            if interaction {
                ReportDecision::UserInteraction
            } else if last.hash.as_deref() != Some(hash.as_str()) {
                ReportDecision::Changed
            } else if last
                .at
                .is_none_or(|at| now.saturating_duration_since(at) > self.config.max_silence)
            {
                ReportDecision::KeepAlive
            } else {
                return Ok(ReportDecision::Suppressed);
            }
        };

        let outcome = self
            .queue
            .push(OutboundPayload::DeviceInfo(snapshot), Priority::Normal);
        if !outcome.is_queued() {
            warn!(?decision, "device snapshot dropped by outbound queue");
            if interaction {
                self.interaction.store(true, Ordering::SeqCst);
            }
            return Ok(ReportDecision::Dropped);
        }

        {
            let mut last = self.last();
            last.hash = Some(hash.clone());
            last.at = Some(now);
        }
        if let Err(e) = self.store.save(keys::LAST_SNAPSHOT_HASH, &hash) {
            warn!(error = %e, "failed to persist snapshot hash");
        }
        match decision {
            ReportDecision::Changed => info!(hash = %&hash[..12], "device state changed"),
            _ => debug!(?decision, "device snapshot enqueued"),
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custodian_hal::SimDevice;
    use custodian_memory::StateDb;
    use custodian_types::wire::{OutboundMessage, OutboundPayload};
    use custodian_types::{CapabilityKind, Priority};

    struct Fixture {
        device: Arc<SimDevice>,
        db: Arc<StateDb>,
        policy: Arc<PolicyEnforcer>,
        caps: Arc<CapabilityStore>,
        settings: Arc<DeviceSettings>,
        queue: Arc<OutboundQueue>,
    }

    impl Fixture {
        fn new(queue_size: usize) -> Self {
            let device = Arc::new(SimDevice::new().with_installed(["com.example.mail"]));
            let db = Arc::new(StateDb::open_in_memory().unwrap());
            let policy = Arc::new(PolicyEnforcer::new(
                device.clone(),
                device.clone(),
                db.clone(),
            ));
            let caps = Arc::new(CapabilityStore::load(db.clone()).unwrap());
            let settings = Arc::new(DeviceSettings::load(db.clone(), "tablet", Some("pw")).unwrap());
            Self {
                device,
                db,
                policy,
                caps,
                settings,
                queue: Arc::new(OutboundQueue::new(queue_size)),
            }
        }

        fn reporter(&self) -> DeviceStateReporter {
            DeviceStateReporter::load(
                ReporterConfig {
                    period: Duration::from_secs(30),
                    max_silence: Duration::from_secs(900),
                },
                self.device.clone(),
                self.device.clone(),
                self.policy.clone(),
                self.caps.clone(),
                self.settings.clone(),
                self.queue.clone(),
                self.db.clone(),
            )
            .unwrap()
        }
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let a = DeviceSnapshot::default();
        let mut b = DeviceSnapshot::default();
        assert_eq!(snapshot_hash(&a).unwrap(), snapshot_hash(&b).unwrap());
        assert_eq!(snapshot_hash(&a).unwrap().len(), 64);
        b.device_name = "renamed".into();
        assert_ne!(snapshot_hash(&a).unwrap(), snapshot_hash(&b).unwrap());
    }

    #[test]
    fn unchanged_state_is_suppressed_until_keep_alive() {
        let f = Fixture::new(10);
        let reporter = f.reporter();
        let t0 = Instant::now();
        assert_eq!(reporter.cycle_at(t0).unwrap(), ReportDecision::Changed);
        assert_eq!(
            reporter.cycle_at(t0 + Duration::from_secs(30)).unwrap(),
            ReportDecision::Suppressed
        );
        assert_eq!(
            reporter.cycle_at(t0 + Duration::from_secs(901)).unwrap(),
            ReportDecision::KeepAlive
        );
        assert_eq!(f.queue.len(), 2);
    }

    #[test]
    fn state_change_is_reported() {
        let f = Fixture::new(10);
        let reporter = f.reporter();
        let t0 = Instant::now();
        reporter.cycle_at(t0).unwrap();
        f.device.set_battery(12, false);
        assert_eq!(
            reporter.cycle_at(t0 + Duration::from_secs(1)).unwrap(),
            ReportDecision::Changed
        );
        f.caps.set(CapabilityKind::Location, true).unwrap();
        assert_eq!(
            reporter.cycle_at(t0 + Duration::from_secs(2)).unwrap(),
            ReportDecision::Changed
        );
    }

    #[test]
    fn user_interaction_forces_send() {
        let f = Fixture::new(10);
        let reporter = f.reporter();
        let t0 = Instant::now();
        reporter.cycle_at(t0).unwrap();
        reporter.note_user_interaction();
        assert_eq!(
            reporter.cycle_at(t0 + Duration::from_secs(1)).unwrap(),
            ReportDecision::UserInteraction
        );
        assert_eq!(
            reporter.cycle_at(t0 + Duration::from_secs(2)).unwrap(),
            ReportDecision::Suppressed
        );
    }

    #[test]
    fn dropped_snapshot_does_not_update_hash() {
        let f = Fixture::new(1);
        // Fill the queue with a HIGH message the snapshot cannot evict.
        f.queue.enqueue(OutboundMessage::new(
            OutboundPayload::SupportMessage { text: "help".into() },
            Priority::High,
        ));
        let reporter = f.reporter();
        assert_eq!(reporter.cycle().unwrap(), ReportDecision::Dropped);
        assert!(reporter.last_sent_hash().is_none());

        let id = f.queue.dequeue_next().unwrap().id;
        f.queue.ack(&id);
        assert_eq!(reporter.cycle().unwrap(), ReportDecision::Changed);
        assert!(reporter.last_sent_hash().is_some());
    }

    #[test]
    fn restart_with_same_state_stays_quiet() {
        let f = Fixture::new(10);
        f.reporter().cycle().unwrap();
        let restarted = f.reporter();
        assert_eq!(restarted.cycle().unwrap(), ReportDecision::Suppressed);
        assert_eq!(f.queue.len(), 1);
    }
}
