//! `custodian-types` – shared vocabulary of the Custodian agent.
//!
//! Every other crate in the workspace speaks in these types: capability
//! kinds, location samples, geofence zones, device snapshots, the internal
//! event bus payloads and the single [`CustodianError`] taxonomy.
//!
//! # Modules
//!
//! - [`wire`] – the JSON envelopes exchanged with the remote controller.
//! - [`store`] – the [`StateStore`][store::StateStore] persistence boundary
//!   and the well-known keys stored behind it.

pub mod store;
pub mod wire;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use store::{StateStore, StateStoreExt};
pub use wire::{InboundCommand, OutboundMessage, OutboundPayload};

// ────────────────────────────────────────────────────────────────────────────
// Capabilities
// ────────────────────────────────────────────────────────────────────────────

/// An administrative or data-access privilege the OS grants to the agent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityKind {
    /// Device-administrator / device-owner rights (lock, reboot, wipe).
    AdminPrivilege,
    /// The agent is the default home launcher.
    HomeRole,
    /// Access to per-app usage statistics (foreground detection).
    UsageAccess,
    /// Fine location.
    Location,
    /// Permission to post user-visible notifications.
    Notifications,
}

impl CapabilityKind {
    /// Every capability kind, in declaration order.
    pub const ALL: [CapabilityKind; 5] = [
        CapabilityKind::AdminPrivilege,
        CapabilityKind::HomeRole,
        CapabilityKind::UsageAccess,
        CapabilityKind::Location,
        CapabilityKind::Notifications,
    ];

    /// Request priority used when no override is configured.  Lower numbers
    /// are requested first.
    pub fn default_priority(self) -> u32 {
        match self {
            CapabilityKind::AdminPrivilege => 0,
            CapabilityKind::HomeRole => 1,
            CapabilityKind::UsageAccess => 2,
            CapabilityKind::Location => 3,
            CapabilityKind::Notifications => 4,
        }
    }

    /// Short title shown in the system prompt.
    pub fn title(self) -> &'static str {
        match self {
            CapabilityKind::AdminPrivilege => "Device administration",
            CapabilityKind::HomeRole => "Default launcher",
            CapabilityKind::UsageAccess => "Usage access",
            CapabilityKind::Location => "Location",
            CapabilityKind::Notifications => "Notifications",
        }
    }

    /// One-line explanation shown in the system prompt.
    pub fn description(self) -> &'static str {
        match self {
            CapabilityKind::AdminPrivilege => {
                "Required to lock the device to approved applications and to reboot it remotely."
            }
            CapabilityKind::HomeRole => {
                "Required so that only approved applications are shown on the home screen."
            }
            CapabilityKind::UsageAccess => {
                "Required to detect which application is in the foreground."
            }
            CapabilityKind::Location => "Required to report the device position and geofences.",
            CapabilityKind::Notifications => {
                "Required to display messages sent by the administrator."
            }
        }
    }

    /// Stable wire name, e.g. `"LOCATION"`.
    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityKind::AdminPrivilege => "ADMIN_PRIVILEGE",
            CapabilityKind::HomeRole => "HOME_ROLE",
            CapabilityKind::UsageAccess => "USAGE_ACCESS",
            CapabilityKind::Location => "LOCATION",
            CapabilityKind::Notifications => "NOTIFICATIONS",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single system-level capability prompt.  Built fresh on every
/// orchestration pass and discarded once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub capability: CapabilityKind,
    pub title: String,
    pub description: String,
    /// Lower numbers are requested first.
    pub priority: u32,
}

impl PermissionRequest {
    /// Build a request with the default title, description and priority for
    /// `capability`.
    pub fn for_capability(capability: CapabilityKind) -> Self {
        Self {
            capability,
            title: capability.title().to_string(),
            description: capability.description().to_string(),
            priority: capability.default_priority(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Queue priority and connection state
// ────────────────────────────────────────────────────────────────────────────

/// Delivery priority of an outbound message.  `High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// State of the single logical control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Fallback,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Fallback => "FALLBACK",
            ConnectionState::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Location & geofences
// ────────────────────────────────────────────────────────────────────────────

/// A single location fix as delivered by a platform provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub lat: f64,
    pub lon: f64,
    /// Horizontal accuracy radius in metres.  Smaller is better.
    pub accuracy_m: f32,
    /// Provider label, e.g. `"gps"` or `"network"`.
    pub provider: String,
    pub timestamp: DateTime<Utc>,
}

/// A circular geofence pushed by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeofenceZone {
    pub id: String,
    pub name: String,
    pub center_lat: f64,
    pub center_lon: f64,
    pub radius_km: f64,
}

impl GeofenceZone {
    /// Reject zones whose geometry cannot be evaluated.
    pub fn validate(&self) -> Result<(), CustodianError> {
        if self.id.trim().is_empty() {
            return Err(CustodianError::InvalidCommand(
                "geofence zone id must not be empty".to_string(),
            ));
        }
        let coords_ok = self.center_lat.is_finite()
            && self.center_lon.is_finite()
            && self.center_lat.abs() <= 90.0
            && self.center_lon.abs() <= 180.0;
        if !coords_ok {
            return Err(CustodianError::InvalidCommand(format!(
                "geofence zone '{}' has an invalid centre",
                self.id
            )));
        }
        if !(self.radius_km.is_finite() && self.radius_km > 0.0) {
            return Err(CustodianError::InvalidCommand(format!(
                "geofence zone '{}' must have a positive radius",
                self.id
            )));
        }
        Ok(())
    }
}

/// Direction of a containment change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GeofenceTransition {
    Enter,
    Exit,
}

/// Derived from a containment change; enqueued immediately and not retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceEvent {
    pub zone_id: String,
    #[serde(rename = "event")]
    pub transition: GeofenceTransition,
    pub sample: LocationSample,
}

// ────────────────────────────────────────────────────────────────────────────
// Allow-list policy
// ────────────────────────────────────────────────────────────────────────────

/// The set of package identifiers the user may see and launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowListPolicy {
    pub packages: BTreeSet<String>,
}

impl AllowListPolicy {
    /// Build a policy, rejecting the whole payload if any identifier is
    /// malformed.
    pub fn try_from_packages<I, S>(packages: I) -> Result<Self, CustodianError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for raw in packages {
            let id: String = raw.into();
            if !is_valid_package_id(&id) {
                return Err(CustodianError::PolicyApplyFailure(format!(
                    "invalid package identifier '{id}'"
                )));
            }
            set.insert(id);
        }
        Ok(Self { packages: set })
    }
}

/// `true` for identifiers of the form `segment(.segment)+` where every
/// segment starts with an ASCII letter and contains only `[A-Za-z0-9_]`.
pub fn is_valid_package_id(id: &str) -> bool {
    let segments: Vec<&str> = id.split('.').collect();
    segments.len() >= 2
        && segments.iter().all(|seg| {
            let mut chars = seg.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

// ────────────────────────────────────────────────────────────────────────────
// Device snapshot
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryInfo {
    pub level_percent: u8,
    pub charging: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub connected: bool,
    /// e.g. `"wifi"`, `"cellular"`, `"ethernet"`, `"none"`.
    pub transport: String,
    pub ip_address: Option<String>,
}

/// Everything the controller needs to render a device.  Carries no
/// timestamp so that its content hash only changes when the state does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_name: String,
    pub battery: BatteryInfo,
    pub storage: StorageInfo,
    pub installed_apps: BTreeSet<String>,
    pub network: NetworkInfo,
    pub allow_list: BTreeSet<String>,
    pub capabilities: BTreeMap<CapabilityKind, bool>,
    pub kiosk_package: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal event bus
// ────────────────────────────────────────────────────────────────────────────

/// Raw platform callbacks, normalised into one event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlatformSignal {
    /// The foreground window lost focus; `foreground` is the package now on
    /// top, when known.
    FocusLost { foreground: Option<String> },
    /// The user pressed back / navigated away.
    BackNavigation,
    /// A package was installed, updated or removed.
    PackagesChanged,
    /// Network connectivity came up.
    LinkUp,
    /// Network connectivity was lost.
    LinkDown,
    /// The local user touched the device UI.
    UserInteraction,
    /// The local user acknowledged a notification shown earlier.
    NotificationConfirmed { notification_id: String },
}

/// Unified event wrapper for the internal bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"custodian-middleware::connection"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// An undecoded text frame received from the controller.
    InboundFrame(String),
    Platform(PlatformSignal),
    ConnectionChanged(ConnectionState),
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error taxonomy for the whole runtime.  Components contain their own
/// failures; only command failures and connection transitions are ever
/// surfaced to the controller.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CustodianError {
    #[error("Permission denied: {0}")]
    PermissionDenied(CapabilityKind),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send failure: {0}")]
    SendFailure(String),

    #[error("Location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("Policy apply failure: {0}")]
    PolicyApplyFailure(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid admin password")]
    InvalidPassword,

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Channel error: {0}")]
    Channel(String),
}

impl CustodianError {
    /// Stable snake-case tag reported in `command_failed.error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            CustodianError::PermissionDenied(_) => "permission_denied",
            CustodianError::Connection(_) => "connection_error",
            CustodianError::SendFailure(_) => "send_failure",
            CustodianError::LocationUnavailable(_) => "location_unavailable",
            CustodianError::PolicyApplyFailure(_) => "policy_apply_failure",
            CustodianError::InvalidCommand(_) => "invalid_command",
            CustodianError::InvalidPassword => "invalid_password",
            CustodianError::Platform(_) => "platform_error",
            CustodianError::Storage(_) => "storage_error",
            CustodianError::Serialization(_) => "serialization_error",
            CustodianError::Channel(_) => "channel_error",
        }
    }
}

impl From<serde_json::Error> for CustodianError {
    fn from(e: serde_json::Error) -> Self {
        CustodianError::Serialization(e.to_string())
    }
}
