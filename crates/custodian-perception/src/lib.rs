//! `custodian-perception` – Location & Geofences
//!
//! Turns raw, noisy location fixes into the filtered stream the controller
//! sees: accepted samples and geofence ENTER/EXIT transitions.
//!
//! # Modules
//!
//! - [`geo`] – haversine great-circle distance.
//! - [`tracker`] – [`LocationTracker`][tracker::LocationTracker]: sample
//!   acceptance, "last known" tracking, per-zone containment memory and
//!   transition detection, periodic sampling control.

pub mod geo;
pub mod tracker;

pub use tracker::{
    LocationTracker, SampleOutcome, TrackerTick, TrackingSettings, accepts, transition_for,
};
