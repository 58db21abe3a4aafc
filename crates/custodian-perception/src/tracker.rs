//! [`LocationTracker`] – sample filtering and geofence transitions.
//!
//! Every raw fix goes through [`LocationTracker::on_raw_sample`]:
//!
//! 1. [`accepts`] decides whether it replaces "last known".
//! 2. Containment is evaluated for every zone and compared with the stored
//!    value (default: outside).
//! 3. The sample is enqueued as `location_update` (NORMAL) and every
//!    transition as `geofence_event` (HIGH).
//!
//! | previous | current | emitted |
//! |----------|---------|---------|
//! | outside  | inside  | ENTER   |
//! | inside   | outside | EXIT    |
//! | same     | same    | –       |
//!
//! Periodic sampling is driven by [`LocationTracker::tick`].  When the
//! location capability disappears the tracker pauses and reports
//! `location_unavailable` once; the latch resets when a fix succeeds again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use custodian_hal::LocationSource;
use custodian_kernel::CapabilityStore;
use custodian_middleware::OutboundQueue;
use custodian_types::store::keys;
use custodian_types::wire::OutboundPayload;
use custodian_types::{
    CapabilityKind, CustodianError, GeofenceEvent, GeofenceTransition, GeofenceZone,
    LocationSample, Priority, StateStore, StateStoreExt,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::geo::within_radius;

/// Default periodic sampling interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Shortest interval the controller may configure.
pub const MIN_INTERVAL: Duration = Duration::from_secs(5);

// ────────────────────────────────────────────────────────────────────────────
// Pure rules
// ────────────────────────────────────────────────────────────────────────────

/// Acceptance rule: accept when there is no prior sample, when the new one is
/// more accurate, or when it is strictly newer.
pub fn accepts(previous: Option<&LocationSample>, sample: &LocationSample) -> bool {
    match previous {
        None => true,
        Some(prev) => sample.accuracy_m < prev.accuracy_m || sample.timestamp > prev.timestamp,
    }
}

/// Transition implied by a containment change, if any.
pub fn transition_for(was_inside: bool, is_inside: bool) -> Option<GeofenceTransition> {
    match (was_inside, is_inside) {
        (false, true) => Some(GeofenceTransition::Enter),
        (true, false) => Some(GeofenceTransition::Exit),
        _ => None,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Types
// ────────────────────────────────────────────────────────────────────────────

/// Persisted periodic-sampling settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_INTERVAL.as_secs(),
        }
    }
}

impl TrackingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(MIN_INTERVAL.as_secs()))
    }
}

/// Result of feeding one raw fix to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    Rejected,
    Accepted { events: Vec<GeofenceEvent> },
}

/// Result of one periodic sampling pass.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerTick {
    /// Tracking is switched off.
    Disabled,
    /// The location capability is missing; sampling is paused.
    Paused,
    /// The platform could not produce a fix.
    Unavailable,
    Sampled(SampleOutcome),
}

/// Everything a sample reads and writes, behind one lock so concurrent
/// samples are accepted, evaluated and reported in a single order.
#[derive(Default)]
struct TrackerState {
    last_known: Option<LocationSample>,
    zones: Vec<GeofenceZone>,
    containment: BTreeMap<String, bool>,
}

// ────────────────────────────────────────────────────────────────────────────
// LocationTracker
// ────────────────────────────────────────────────────────────────────────────

pub struct LocationTracker {
    source: Arc<dyn LocationSource>,
    capabilities: Arc<CapabilityStore>,
    queue: Arc<OutboundQueue>,
    store: Arc<dyn StateStore>,
    state: Mutex<TrackerState>,
    unavailable_reported: AtomicBool,
    settings_tx: watch::Sender<TrackingSettings>,
}

impl LocationTracker {
    /// Build a tracker, restoring zones, containment and tracking settings.
    pub fn load(
        source: Arc<dyn LocationSource>,
        capabilities: Arc<CapabilityStore>,
        queue: Arc<OutboundQueue>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, CustodianError> {
        let zones: Vec<GeofenceZone> = store.load(keys::GEOFENCE_ZONES)?.unwrap_or_default();
        let containment: BTreeMap<String, bool> =
            store.load(keys::GEOFENCE_CONTAINMENT)?.unwrap_or_default();
        let settings: TrackingSettings = store.load(keys::LOCATION_TRACKING)?.unwrap_or_default();
        let (settings_tx, _) = watch::channel(settings);
        debug!(zones = zones.len(), ?settings, "location tracker loaded");
        Ok(Self {
            source,
            capabilities,
            queue,
            store,
            state: Mutex::new(TrackerState {
                last_known: None,
                zones,
                containment,
            }),
            unavailable_reported: AtomicBool::new(false),
            settings_tx,
        })
    }

    fn locked(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_known(&self) -> Option<LocationSample> {
        self.locked().last_known.clone()
    }

    pub fn zones(&self) -> Vec<GeofenceZone> {
        self.locked().zones.clone()
    }

    /// Whether the device is currently recorded as inside `zone_id`.
    pub fn is_inside(&self, zone_id: &str) -> bool {
        self.locked().containment.get(zone_id).copied().unwrap_or(false)
    }

    // ── Samples ────────────────────────────────────────────────────────────

    /// Filter a raw fix, update containment and enqueue the results.
    ///
    /// The whole pass runs under the tracker lock: the containment recorded
    /// afterwards always belongs to "last known", and transitions are queued
    /// in the order they happened.
    pub fn on_raw_sample(&self, sample: LocationSample) -> SampleOutcome {
        let mut state = self.locked();
        if !accepts(state.last_known.as_ref(), &sample) {
            debug!(
                accuracy_m = sample.accuracy_m,
                timestamp = %sample.timestamp,
                "location sample rejected"
            );
            return SampleOutcome::Rejected;
        }
        state.last_known = Some(sample.clone());

        let TrackerState {
            zones, containment, ..
        } = &mut *state;
        let mut events = Vec::new();
        for zone in zones.iter() {
            let inside = within_radius(
                sample.lat,
                sample.lon,
                zone.center_lat,
                zone.center_lon,
                zone.radius_km,
            );
            let was_inside = containment.insert(zone.id.clone(), inside).unwrap_or(false);
            if let Some(transition) = transition_for(was_inside, inside) {
                events.push(GeofenceEvent {
                    zone_id: zone.id.clone(),
                    transition,
                    sample: sample.clone(),
                });
            }
        }

        if !events.is_empty() {
            if let Err(e) = self.store.save(keys::GEOFENCE_CONTAINMENT, &*containment) {
                warn!(error = %e, "failed to persist geofence containment");
            }
        }

        self.queue.push(
            OutboundPayload::LocationUpdate {
                location: sample.clone(),
            },
            Priority::Normal,
        );
        for event in &events {
            info!(zone = %event.zone_id, transition = ?event.transition, "geofence transition");
            self.queue
                .push(OutboundPayload::GeofenceEvent(event.clone()), Priority::High);
        }
        SampleOutcome::Accepted { events }
    }

    /// Take one fix now.  When it is rejected or cannot be obtained, the last
    /// known sample is pushed instead.  Returns the sample that was sent.
    pub async fn request_location(&self) -> Result<LocationSample, CustodianError> {
        match self.source.current_fix().await {
            Ok(sample) => {
                if let SampleOutcome::Accepted { .. } = self.on_raw_sample(sample.clone()) {
                    return Ok(sample);
                }
            }
            Err(e) => debug!(error = %e, "immediate fix failed, using last known"),
        }
        let Some(last) = self.last_known() else {
            return Err(CustodianError::LocationUnavailable(
                "no fix and no last known location".into(),
            ));
        };
        self.queue.push(
            OutboundPayload::LocationUpdate {
                location: last.clone(),
            },
            Priority::Normal,
        );
        Ok(last)
    }

    /// One periodic sampling pass.
    pub async fn tick(&self) -> Result<TrackerTick, CustodianError> {
        if !self.settings().enabled {
            return Ok(TrackerTick::Disabled);
        }
        if let Err(e) = self.capabilities.check(CapabilityKind::Location) {
            self.report_unavailable_once(&e.to_string());
            return Ok(TrackerTick::Paused);
        }
        match self.source.current_fix().await {
            Ok(sample) => {
                if self.unavailable_reported.swap(false, Ordering::SeqCst) {
                    info!("location available again, sampling resumed");
                }
                Ok(TrackerTick::Sampled(self.on_raw_sample(sample)))
            }
            Err(e) => {
                self.report_unavailable_once(&e.to_string());
                Ok(TrackerTick::Unavailable)
            }
        }
    }

    fn report_unavailable_once(&self, reason: &str) {
        if self.unavailable_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(reason, "location unavailable, sampling paused");
        self.queue.push(
            OutboundPayload::LocationUnavailable {
                reason: reason.to_string(),
            },
            Priority::Normal,
        );
    }

    // ── Zones ──────────────────────────────────────────────────────────────

    /// Replace the zone set.  The whole set is rejected if any zone is
    /// invalid or ids repeat.  Containment for removed zones is forgotten.
    pub fn set_zones(&self, zones: Vec<GeofenceZone>) -> Result<(), CustodianError> {
        let mut ids = BTreeSet::new();
        for zone in &zones {
            zone.validate()?;
            if !ids.insert(zone.id.clone()) {
                return Err(CustodianError::InvalidCommand(format!(
                    "duplicate geofence zone id '{}'",
                    zone.id
                )));
            }
        }
        let mut state = self.locked();
        self.store.save(keys::GEOFENCE_ZONES, &zones)?;
        let mut containment = state.containment.clone();
        containment.retain(|id, _| ids.contains(id));
        self.store.save(keys::GEOFENCE_CONTAINMENT, &containment)?;
        state.containment = containment;
        state.zones = zones;
        info!(zones = ids.len(), "geofences replaced");
        Ok(())
    }

    // ── Sampling control ───────────────────────────────────────────────────

    pub fn settings(&self) -> TrackingSettings {
        *self.settings_tx.borrow()
    }

    /// Receiver that fires whenever tracking is toggled or re-timed.
    pub fn subscribe_settings(&self) -> watch::Receiver<TrackingSettings> {
        self.settings_tx.subscribe()
    }

    pub fn set_tracking(&self, enabled: bool) -> Result<(), CustodianError> {
        let settings = TrackingSettings {
            enabled,
            ..self.settings()
        };
        self.apply_settings(settings)?;
        info!(enabled, "location tracking toggled");
        Ok(())
    }

    pub fn set_interval(&self, interval_secs: u64) -> Result<(), CustodianError> {
        if interval_secs < MIN_INTERVAL.as_secs() {
            return Err(CustodianError::InvalidCommand(format!(
                "location interval must be at least {}s",
                MIN_INTERVAL.as_secs()
            )));
        }
        let settings = TrackingSettings {
            interval_secs,
            ..self.settings()
        };
        self.apply_settings(settings)?;
        info!(interval_secs, "location interval changed");
        Ok(())
    }

    fn apply_settings(&self, settings: TrackingSettings) -> Result<(), CustodianError> {
        self.store.save(keys::LOCATION_TRACKING, &settings)?;
        self.settings_tx.send_replace(settings);
        Ok(())
    }
}
