//! Controller wire contract.
//!
//! Every frame is a JSON object with a `type` discriminator and the
//! variant's fields at the top level:
//!
//! ```json
//! { "type": "update_app_permissions", "command_id": "c-17", "packages": ["com.example.mail"] }
//! ```
//!
//! The same envelope shape travels over the persistent WebSocket and over the
//! HTTP fallback.  Inbound frames may carry an optional `command_id` that is
//! echoed back in `command_ack` / `command_failed`.  Outbound frames gain an
//! `id` and a `timestamp` when they are serialised by
//! [`OutboundMessage::to_frame`].

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    ConnectionState, CustodianError, DeviceSnapshot, GeofenceEvent, GeofenceZone, LocationSample,
    Priority,
};

/// Attempts allowed before a message is dropped as a permanent failure.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

// ────────────────────────────────────────────────────────────────────────────
// Inbound
// ────────────────────────────────────────────────────────────────────────────

/// Commands the controller may send to the agent.
#[derive(Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundCommand {
    /// Replace the application allow-list.
    UpdateAppPermissions { packages: Vec<String> },
    /// Replace the local administrator password.
    SetAdminPassword { password: String },
    /// Push a location fix immediately.
    RequestLocation,
    /// Start or stop periodic location sampling.
    ToggleLocationTracking { enabled: bool },
    /// Change the periodic sampling interval.
    SetLocationInterval { interval_secs: u64 },
    /// Ask the user for the location capability again, ignoring cooldown.
    EnableLocation,
    /// Display a notification to the local user.
    ShowNotification {
        notification_id: String,
        title: String,
        body: String,
    },
    /// Reboot after a short local notice.
    RebootDevice {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Replace the geofence zone set.
    SetGeofences { zones: Vec<GeofenceZone> },
    /// Pin the device to a single application.
    EnterKiosk { package: String },
    /// Release the single-application lock.
    ExitKiosk,
}

impl InboundCommand {
    /// The wire `type` string of this command.
    pub fn name(&self) -> &'static str {
        match self {
            InboundCommand::UpdateAppPermissions { .. } => "update_app_permissions",
            InboundCommand::SetAdminPassword { .. } => "set_admin_password",
            InboundCommand::RequestLocation => "request_location",
            InboundCommand::ToggleLocationTracking { .. } => "toggle_location_tracking",
            InboundCommand::SetLocationInterval { .. } => "set_location_interval",
            InboundCommand::EnableLocation => "enable_location",
            InboundCommand::ShowNotification { .. } => "show_notification",
            InboundCommand::RebootDevice { .. } => "reboot_device",
            InboundCommand::SetGeofences { .. } => "set_geofences",
            InboundCommand::EnterKiosk { .. } => "enter_kiosk",
            InboundCommand::ExitKiosk => "exit_kiosk",
        }
    }
}

// Passwords must never reach the logs.
impl std::fmt::Debug for InboundCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InboundCommand::SetAdminPassword { .. } => f
                .debug_struct("SetAdminPassword")
                .field("password", &"<redacted>")
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// A successfully decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCommand {
    pub command_id: Option<String>,
    pub command: InboundCommand,
}

/// A frame that could not be decoded into an [`InboundCommand`].  Carries
/// whatever could be salvaged so the failure can be reported upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDecodeError {
    pub command_type: Option<String>,
    pub command_id: Option<String>,
    pub reason: String,
}

/// Decode a text frame received from the controller.
pub fn decode_command(text: &str) -> Result<DecodedCommand, CommandDecodeError> {
    let value: Value = serde_json::from_str(text).map_err(|e| CommandDecodeError {
        command_type: None,
        command_id: None,
        reason: format!("malformed JSON: {e}"),
    })?;
    let command_type = value.get("type").and_then(Value::as_str).map(str::to_string);
    let command_id = value
        .get("command_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    match serde_json::from_value::<InboundCommand>(value) {
        Ok(command) => Ok(DecodedCommand {
            command_id,
            command,
        }),
        Err(e) => Err(CommandDecodeError {
            command_type,
            command_id,
            reason: e.to_string(),
        }),
    }
}

/// JSON Schema of the inbound command set, for controller implementers.
pub fn inbound_command_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(InboundCommand)).unwrap_or(Value::Null)
}

// ────────────────────────────────────────────────────────────────────────────
// Outbound
// ────────────────────────────────────────────────────────────────────────────

/// Telemetry and acknowledgements produced by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundPayload {
    DeviceInfo(DeviceSnapshot),
    LocationUpdate {
        location: LocationSample,
    },
    GeofenceEvent(GeofenceEvent),
    NotificationReceived {
        notification_id: String,
    },
    NotificationConfirmed {
        notification_id: String,
    },
    SupportMessage {
        text: String,
    },
    CommandAck {
        command: String,
        command_id: Option<String>,
    },
    CommandFailed {
        command: String,
        command_id: Option<String>,
        error_kind: String,
        reason: String,
    },
    LocationUnavailable {
        reason: String,
    },
    ConnectionState {
        state: ConnectionState,
    },
}

impl OutboundPayload {
    /// The wire `type` string of this payload.
    pub fn name(&self) -> &'static str {
        match self {
            OutboundPayload::DeviceInfo(_) => "device_info",
            OutboundPayload::LocationUpdate { .. } => "location_update",
            OutboundPayload::GeofenceEvent(_) => "geofence_event",
            OutboundPayload::NotificationReceived { .. } => "notification_received",
            OutboundPayload::NotificationConfirmed { .. } => "notification_confirmed",
            OutboundPayload::SupportMessage { .. } => "support_message",
            OutboundPayload::CommandAck { .. } => "command_ack",
            OutboundPayload::CommandFailed { .. } => "command_failed",
            OutboundPayload::LocationUnavailable { .. } => "location_unavailable",
            OutboundPayload::ConnectionState { .. } => "connection_state",
        }
    }
}

/// A queued outbound message.  Owned by the outbound queue until it is acked,
/// exhausts its attempts or expires.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub payload: OutboundPayload,
    pub priority: Priority,
    pub attempts: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(payload: OutboundPayload, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            priority,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Serialise into the wire envelope, adding `id` and `timestamp`.
    pub fn to_frame(&self) -> Result<String, CustodianError> {
        let mut value = serde_json::to_value(&self.payload)?;
        let Some(object) = value.as_object_mut() else {
            return Err(CustodianError::Serialization(format!(
                "{} did not serialise to an object",
                self.payload.name()
            )));
        };
        object.insert("id".to_string(), Value::String(self.id.to_string()));
        object.insert(
            "timestamp".to_string(),
            Value::String(self.enqueued_at.to_rfc3339()),
        );
        Ok(value.to_string())
    }
}
