//! [`CommandDispatcher`] – routes controller commands to their owners.
//!
//! Frames arrive undecoded on the bus [`Commands`][custodian_middleware::Topic::Commands]
//! topic.  Each one is decoded, dispatched, and answered with exactly one
//! envelope:
//!
//! - `command_ack` (NORMAL) when the command succeeded;
//! - `command_failed` (HIGH) with the error kind and reason otherwise.
//!
//! | command                    | handled by                         |
//! |----------------------------|------------------------------------|
//! | `update_app_permissions`   | `PolicyEnforcer::apply_allow_list` |
//! | `set_admin_password`       | `DeviceSettings`                   |
//! | `request_location`         | `LocationTracker::request_location`|
//! | `toggle_location_tracking` | `LocationTracker::set_tracking`    |
//! | `set_location_interval`    | `LocationTracker::set_interval`    |
//! | `enable_location`          | `PermissionOrchestrator::expedite` |
//! | `show_notification`        | platform notifier                  |
//! | `reboot_device`            | platform power, after a notice     |
//! | `set_geofences`            | `LocationTracker::set_zones`       |
//! | `enter_kiosk` / `exit_kiosk` | `PolicyEnforcer`                 |

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use custodian_hal::{Notifier, PowerControl};
use custodian_kernel::{CapabilityStore, DeviceSettings, PermissionOrchestrator, PolicyEnforcer};
use custodian_middleware::{OutboundQueue, TopicReceiver};
use custodian_perception::LocationTracker;
use custodian_types::wire::{CommandDecodeError, InboundCommand, OutboundPayload, decode_command};
use custodian_types::{CapabilityKind, CustodianError, EventPayload, PlatformSignal, Priority};
use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::supervisor::{shutdown_requested, supervise_until_shutdown};

/// Default delay between the local reboot notice and the reboot itself.
pub const DEFAULT_REBOOT_NOTICE: Duration = Duration::from_secs(5);

const REBOOT_NOTIFICATION_ID: &str = "custodian.reboot";

pub struct CommandDispatcher {
    pub(crate) policy: Arc<PolicyEnforcer>,
    pub(crate) settings: Arc<DeviceSettings>,
    pub(crate) tracker: Arc<LocationTracker>,
    pub(crate) orchestrator: Arc<PermissionOrchestrator>,
    pub(crate) capabilities: Arc<CapabilityStore>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) power: Arc<dyn PowerControl>,
    pub(crate) queue: Arc<OutboundQueue>,
    pub(crate) reboot_notice: Duration,
}

impl CommandDispatcher {
    /// Decode, dispatch and answer one inbound frame.  A handler that panics
    /// is answered with `command_failed` like any other failure.
    pub async fn handle_frame(&self, frame: &str) {
        match decode_command(frame) {
            Ok(decoded) => {
                let name = decoded.command.name();
                debug!(command = name, command_id = ?decoded.command_id, "dispatching command");
                let result = AssertUnwindSafe(self.dispatch(decoded.command))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!(command = name, "command handler panicked");
                        Err(CustodianError::Platform(format!("{name} handler panicked")))
                    });
                self.answer(name, decoded.command_id, result);
            }
            Err(e) => self.reject(e),
        }
    }

    fn answer(&self, command: &str, command_id: Option<String>, result: Result<(), CustodianError>) {
        match result {
            Ok(()) => {
                self.queue.push(
                    OutboundPayload::CommandAck {
                        command: command.to_string(),
                        command_id,
                    },
                    Priority::Normal,
                );
            }
            Err(e) => {
                warn!(command, error = %e, "command failed");
                self.queue.push(
                    OutboundPayload::CommandFailed {
                        command: command.to_string(),
                        command_id,
                        error_kind: e.kind().to_string(),
                        reason: e.to_string(),
                    },
                    Priority::High,
                );
            }
        }
    }

    /// A malformed allow-list payload is a policy failure; anything else that
    /// cannot be decoded is an invalid command.
    fn reject(&self, e: CommandDecodeError) {
        let command = e.command_type.unwrap_or_else(|| "unknown".to_string());
        let error = if command == "update_app_permissions" {
            CustodianError::PolicyApplyFailure(e.reason)
        } else {
            CustodianError::InvalidCommand(e.reason)
        };
        self.answer(&command, e.command_id, Err(error));
    }

    /// Route one decoded command to its owner.
    pub async fn dispatch(&self, command: InboundCommand) -> Result<(), CustodianError> {
        match command {
            InboundCommand::UpdateAppPermissions { packages } => {
                self.policy.apply_allow_list(packages).map(|_| ())
            }
            InboundCommand::SetAdminPassword { password } => {
                self.settings.set_admin_password(&password)
            }
            InboundCommand::RequestLocation => self.tracker.request_location().await.map(|_| ()),
            InboundCommand::ToggleLocationTracking { enabled } => {
                self.tracker.set_tracking(enabled)
            }
            InboundCommand::SetLocationInterval { interval_secs } => {
                self.tracker.set_interval(interval_secs)
            }
            InboundCommand::EnableLocation => {
                self.orchestrator.expedite(CapabilityKind::Location);
                let orchestrator = self.orchestrator.clone();
                tokio::spawn(async move {
                    match orchestrator.tick().await {
                        Ok(outcome) => debug!(?outcome, "expedited permission pass"),
                        Err(e) => warn!(error = %e, "expedited permission pass failed"),
                    }
                });
                Ok(())
            }
            InboundCommand::ShowNotification {
                notification_id,
                title,
                body,
            } => {
                self.capabilities.check(CapabilityKind::Notifications)?;
                self.notifier.show(&notification_id, &title, &body)?;
                self.queue.push(
                    OutboundPayload::NotificationReceived { notification_id },
                    Priority::Normal,
                );
                Ok(())
            }
            InboundCommand::RebootDevice { reason } => self.schedule_reboot(reason),
            InboundCommand::SetGeofences { zones } => self.tracker.set_zones(zones),
            InboundCommand::EnterKiosk { package } => self.policy.enter_kiosk(&package),
            InboundCommand::ExitKiosk => self.policy.exit_kiosk(),
        }
    }

    fn schedule_reboot(&self, reason: Option<String>) -> Result<(), CustodianError> {
        self.capabilities.check(CapabilityKind::AdminPrivilege)?;
        let body = reason.unwrap_or_else(|| "Requested by your administrator.".to_string());
        // The notice is best-effort; the reboot goes ahead without it.
        if let Err(e) = self
            .notifier
            .show(REBOOT_NOTIFICATION_ID, "This device will restart shortly", &body)
        {
            warn!(error = %e, "could not show reboot notice");
        }
        let power = self.power.clone();
        let notice = self.reboot_notice;
        info!(?notice, "reboot scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(notice).await;
            if let Err(e) = power.reboot() {
                warn!(error = %e, "reboot failed");
            }
        });
        Ok(())
    }

    /// Local-user notification acknowledgements are forwarded to the
    /// controller.
    pub fn on_platform_signal(&self, signal: &PlatformSignal) {
        if let PlatformSignal::NotificationConfirmed { notification_id } = signal {
            self.queue.push(
                OutboundPayload::NotificationConfirmed {
                    notification_id: notification_id.clone(),
                },
                Priority::Normal,
            );
        }
    }

    /// Consume inbound frames until shutdown.
    pub async fn run(self: Arc<Self>, mut commands: TopicReceiver, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                event = commands.next() => match event {
                    Some(event) => {
                        if let EventPayload::InboundFrame(frame) = event.payload {
                            let body = async {
                                self.handle_frame(&frame).await;
                                Ok(())
                            };
                            if supervise_until_shutdown("dispatcher", body, &mut shutdown)
                                .await
                                .is_none()
                            {
                                break;
                            }
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("command dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custodian_hal::SimDevice;
    use custodian_kernel::OrchestratorConfig;
    use custodian_memory::StateDb;
    use custodian_middleware::{EventBus, Topic};
    use custodian_types::{Event, GeofenceZone};
    use serde_json::Value;

    struct Fixture {
        device: Arc<SimDevice>,
        dispatcher: CommandDispatcher,
    }

    fn fixture() -> Fixture {
        let device = Arc::new(
            SimDevice::new()
                .with_installed(["com.example.mail", "com.example.pos"])
                .with_granted(&CapabilityKind::ALL)
                .with_stationary_location(0.0, 0.0),
        );
        let db = Arc::new(StateDb::open_in_memory().unwrap());
        let caps = Arc::new(CapabilityStore::load(db.clone()).unwrap());
        caps.sync_from(device.as_ref()).unwrap();
        let queue = Arc::new(OutboundQueue::new(100));
        let policy = Arc::new(PolicyEnforcer::new(device.clone(), device.clone(), db.clone()));
        let settings = Arc::new(DeviceSettings::load(db.clone(), "tablet", None).unwrap());
        let tracker = Arc::new(
            LocationTracker::load(device.clone(), caps.clone(), queue.clone(), db.clone()).unwrap(),
        );
        let orchestrator = Arc::new(
            PermissionOrchestrator::new(
                OrchestratorConfig::default(),
                caps.clone(),
                device.clone(),
                db.clone(),
            )
            .unwrap(),
        );
        let dispatcher = CommandDispatcher {
            policy,
            settings,
            tracker,
            orchestrator,
            capabilities: caps,
            notifier: device.clone(),
            power: device.clone(),
            queue,
            reboot_notice: Duration::from_millis(10),
        };
        Fixture { device, dispatcher }
    }

    /// Queued envelopes, parsed back into JSON, in delivery order.
    fn sent(f: &Fixture) -> Vec<Value> {
        f.dispatcher
            .queue
            .snapshot()
            .iter()
            .map(|m| serde_json::from_str(&m.to_frame().unwrap()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn allow_list_update_is_acked() {
        let f = fixture();
        f.dispatcher
            .handle_frame(r#"{"type":"update_app_permissions","command_id":"c1","packages":["com.example.mail"]}"#)
            .await;
        let sent = sent(&f);
        assert_eq!(sent[0]["type"], "command_ack");
        assert_eq!(sent[0]["command"], "update_app_permissions");
        assert_eq!(sent[0]["command_id"], "c1");
        assert!(f.device.launcher_visible().contains("com.example.mail"));
    }

    #[tokio::test]
    async fn malformed_allow_list_is_policy_failure() {
        let f = fixture();
        f.dispatcher
            .handle_frame(r#"{"type":"update_app_permissions","command_id":"c2","packages":"nope"}"#)
            .await;
        let sent = sent(&f);
        assert_eq!(sent[0]["type"], "command_failed");
        assert_eq!(sent[0]["error_kind"], "policy_apply_failure");
        assert_eq!(sent[0]["command_id"], "c2");
    }

    #[tokio::test]
    async fn invalid_package_id_is_policy_failure() {
        let f = fixture();
        f.dispatcher
            .handle_frame(r#"{"type":"update_app_permissions","packages":["bad id"]}"#)
            .await;
        assert_eq!(sent(&f)[0]["error_kind"], "policy_apply_failure");
    }

    #[tokio::test]
    async fn unknown_and_garbage_frames_are_invalid_commands() {
        let f = fixture();
        f.dispatcher.handle_frame(r#"{"type":"self_destruct"}"#).await;
        f.dispatcher.handle_frame("not json").await;
        let sent = sent(&f);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|v| v["error_kind"] == "invalid_command"));
        assert!(sent.iter().any(|v| v["command"] == "self_destruct"));
        assert!(sent.iter().any(|v| v["command"] == "unknown"));
    }

    #[tokio::test]
    async fn notification_is_shown_and_reported() {
        let f = fixture();
        f.dispatcher
            .handle_frame(r#"{"type":"show_notification","notification_id":"n1","title":"Hi","body":"There"}"#)
            .await;
        assert_eq!(f.device.notifications()[0].id, "n1");
        let types: Vec<_> = sent(&f).iter().map(|v| v["type"].clone()).collect();
        assert!(types.contains(&Value::from("notification_received")));
        assert!(types.contains(&Value::from("command_ack")));

        f.dispatcher
            .on_platform_signal(&PlatformSignal::NotificationConfirmed {
                notification_id: "n1".into(),
            });
        assert!(
            sent(&f)
                .iter()
                .any(|v| v["type"] == "notification_confirmed" && v["notification_id"] == "n1")
        );
    }

    #[tokio::test]
    async fn reboot_waits_for_notice() {
        let f = fixture();
        f.dispatcher
            .handle_frame(r#"{"type":"reboot_device","reason":"update"}"#)
            .await;
        assert_eq!(f.device.reboot_count(), 0);
        assert_eq!(f.device.notifications()[0].body, "update");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.device.reboot_count(), 1);
    }

    #[tokio::test]
    async fn request_location_pushes_fix() {
        let f = fixture();
        f.dispatcher.handle_frame(r#"{"type":"request_location"}"#).await;
        let sent = sent(&f);
        assert!(sent.iter().any(|v| v["type"] == "location_update"));
        assert!(sent.iter().any(|v| v["type"] == "command_ack"));
    }

    #[tokio::test]
    async fn interval_below_minimum_fails() {
        let f = fixture();
        f.dispatcher
            .handle_frame(r#"{"type":"set_location_interval","interval_secs":1}"#)
            .await;
        assert_eq!(sent(&f)[0]["error_kind"], "invalid_command");
    }

    #[tokio::test]
    async fn geofences_and_kiosk_commands() {
        let f = fixture();
        let zones = serde_json::json!({
            "type": "set_geofences",
            "zones": [GeofenceZone {
                id: "hq".into(),
                name: "HQ".into(),
                center_lat: 0.0,
                center_lon: 0.0,
                radius_km: 1.0,
            }],
        });
        f.dispatcher.handle_frame(&zones.to_string()).await;
        assert_eq!(f.dispatcher.tracker.zones().len(), 1);

        f.dispatcher
            .handle_frame(r#"{"type":"enter_kiosk","package":"com.example.pos"}"#)
            .await;
        assert_eq!(f.device.lock_task().as_deref(), Some("com.example.pos"));
        f.dispatcher.handle_frame(r#"{"type":"exit_kiosk"}"#).await;
        assert!(f.device.lock_task().is_none());
        assert!(sent(&f).iter().all(|v| v["type"] == "command_ack"));
    }

    struct CrashingNotifier;

    impl Notifier for CrashingNotifier {
        fn show(&self, _id: &str, _title: &str, _body: &str) -> Result<(), CustodianError> {
            panic!("notification service crashed")
        }
    }

    fn show_frame(id: &str) -> String {
        format!(
            r#"{{"type":"show_notification","command_id":"{id}","notification_id":"{id}","title":"t","body":"b"}}"#
        )
    }

    #[tokio::test]
    async fn panicking_handler_is_answered_as_failure() {
        let mut f = fixture();
        f.dispatcher.notifier = Arc::new(CrashingNotifier);
        f.dispatcher.handle_frame(&show_frame("n1")).await;
        let sent = sent(&f);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "command_failed");
        assert_eq!(sent[0]["command_id"], "n1");
        assert_eq!(sent[0]["error_kind"], "platform_error");
    }

    #[tokio::test]
    async fn run_loop_survives_a_panicking_command() {
        let mut f = fixture();
        f.dispatcher.notifier = Arc::new(CrashingNotifier);
        let queue = f.dispatcher.queue.clone();
        let dispatcher = Arc::new(f.dispatcher);

        let bus = EventBus::default();
        let commands = bus.subscribe_to(Topic::Commands);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(dispatcher.run(commands, shutdown_rx));

        for frame in [show_frame("n1"), r#"{"type":"exit_kiosk","command_id":"k1"}"#.to_string()] {
            bus.publish_to(Topic::Commands, Event::new("test", EventPayload::InboundFrame(frame)))
                .unwrap();
        }

        let answered = |id: &str| {
            queue.snapshot().iter().any(|m| {
                let v: Value = serde_json::from_str(&m.to_frame().unwrap()).unwrap();
                v["command_id"] == id
            })
        };
        for _ in 0..200 {
            if answered("n1") && answered("k1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(answered("n1"));
        assert!(answered("k1"));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("dispatcher stops on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn admin_password_then_rename() {
        let f = fixture();
        f.dispatcher
            .handle_frame(r#"{"type":"set_admin_password","password":"s3cret"}"#)
            .await;
        assert!(f.dispatcher.settings.rename_device("s3cret", "lobby").is_ok());
        assert!(f.dispatcher.settings.rename_device("wrong", "x").is_err());
    }
}
