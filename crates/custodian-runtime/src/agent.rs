//! [`Agent`] – wires every component and runs the agent's tasks.
//!
//! # Tasks
//!
//! | task          | drives                                                |
//! |---------------|-------------------------------------------------------|
//! | `connection`  | [`ConnectionManager::run`]: channel and queue drain   |
//! | `dispatcher`  | [`CommandDispatcher::run`]: inbound commands          |
//! | `platform`    | platform signals to the policy, reporter, dispatcher  |
//! | `permissions` | [`PermissionOrchestrator::tick`] passes               |
//! | `location`    | [`LocationTracker::tick`] at the configured interval  |
//! | `reporter`    | [`DeviceStateReporter::cycle`], early on interaction  |
//!
//! All tasks share one `watch<bool>` shutdown flag.  The UI side holds only
//! the read-only receivers and the small operator API on [`Agent`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use custodian_hal::{Platform, SimDevice};
//! use custodian_memory::StateDb;
//! use custodian_middleware::loopback;
//! use custodian_runtime::{Agent, AgentConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), custodian_types::CustodianError> {
//! let device = Arc::new(SimDevice::new());
//! let store = Arc::new(StateDb::open_in_memory()?);
//! let (transport, _controller) = loopback();
//! let agent = Agent::start(
//!     AgentConfig::default(),
//!     Platform::from_device(device),
//!     store,
//!     Box::new(transport),
//!     None,
//! )
//! .await?;
//! println!("{:?}", agent.status());
//! agent.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use custodian_hal::Platform;
use custodian_kernel::{
    CapabilityStore, DeviceSettings, OrchestratorConfig, PermissionOrchestrator, PolicyEnforcer,
    TickOutcome,
};
use custodian_middleware::queue::DEFAULT_MAX_SIZE;
use custodian_middleware::{
    ConnectionConfig, ConnectionManager, EventBus, FallbackTransport, OutboundQueue, Topic,
    TopicReceiver, Transport,
};
use custodian_perception::LocationTracker;
use custodian_types::wire::OutboundPayload;
use custodian_types::{
    CapabilityKind, ConnectionState, CustodianError, Event, EventPayload, LocationSample,
    PlatformSignal, Priority, StateStore,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::{CommandDispatcher, DEFAULT_REBOOT_NOTICE};
use crate::reporter::{DeviceStateReporter, ReporterConfig};
use crate::supervisor::{run_periodic, shutdown_requested, supervise, supervise_until_shutdown};

const SOURCE: &str = "custodian-runtime::agent";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AgentConfig {
    /// Display name used until the operator renames the device.
    pub device_name: String,
    /// Stored as the admin password on first run only.
    pub initial_admin_password: Option<String>,
    pub queue_max_size: usize,
    pub bus_capacity: usize,
    pub connection: ConnectionConfig,
    pub orchestrator: OrchestratorConfig,
    /// Period of the permission orchestration pass.
    pub orchestrator_period: Duration,
    pub reporter: ReporterConfig,
    pub reboot_notice: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_name: "custodian-device".to_string(),
            initial_admin_password: None,
            queue_max_size: DEFAULT_MAX_SIZE,
            bus_capacity: 256,
            connection: ConnectionConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            orchestrator_period: Duration::from_secs(10),
            reporter: ReporterConfig::default(),
            reboot_notice: DEFAULT_REBOOT_NOTICE,
        }
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("device_name", &self.device_name)
            .field(
                "initial_admin_password",
                &self.initial_admin_password.as_ref().map(|_| "<redacted>"),
            )
            .field("queue_max_size", &self.queue_max_size)
            .field("bus_capacity", &self.bus_capacity)
            .field("connection", &self.connection)
            .field("orchestrator", &self.orchestrator)
            .field("orchestrator_period", &self.orchestrator_period)
            .field("reporter", &self.reporter)
            .field("reboot_notice", &self.reboot_notice)
            .finish()
    }
}

/// Point-in-time view for the local UI.
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub device_name: String,
    pub connection: ConnectionState,
    pub queued_messages: usize,
    pub missing_capabilities: Vec<CapabilityKind>,
    pub allow_list: BTreeSet<String>,
    pub visible_apps: BTreeSet<String>,
    pub kiosk_package: Option<String>,
    pub last_location: Option<LocationSample>,
    pub location_tracking: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────────────────────────

pub struct Agent {
    bus: EventBus,
    queue: Arc<OutboundQueue>,
    capabilities: Arc<CapabilityStore>,
    policy: Arc<PolicyEnforcer>,
    settings: Arc<DeviceSettings>,
    tracker: Arc<LocationTracker>,
    reporter: Arc<DeviceStateReporter>,
    connection: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Agent {
    /// Build every component from persisted state and spawn the agent's
    /// tasks on the current Tokio runtime.
    pub async fn start(
        config: AgentConfig,
        platform: Platform,
        store: Arc<dyn StateStore>,
        transport: Box<dyn Transport>,
        fallback: Option<Arc<dyn FallbackTransport>>,
    ) -> Result<Self, CustodianError> {
        info!(?config, "starting agent");
        let bus = EventBus::new(config.bus_capacity);
        let queue = Arc::new(OutboundQueue::new(config.queue_max_size));

        let capabilities = Arc::new(CapabilityStore::load(store.clone())?);
        if let Err(e) = capabilities.sync_from(platform.prompt.as_ref()) {
            warn!(error = %e, "initial capability sync failed");
        }
        let orchestrator = Arc::new(PermissionOrchestrator::new(
            config.orchestrator.clone(),
            capabilities.clone(),
            platform.prompt.clone(),
            store.clone(),
        )?);

        let policy = Arc::new(PolicyEnforcer::new(
            platform.packages.clone(),
            platform.launcher.clone(),
            store.clone(),
        ));
        if let Err(e) = policy.restore() {
            warn!(error = %e, "policy restore incomplete");
        }

        let settings = Arc::new(DeviceSettings::load(
            store.clone(),
            &config.device_name,
            config.initial_admin_password.as_deref(),
        )?);
        let tracker = Arc::new(LocationTracker::load(
            platform.location.clone(),
            capabilities.clone(),
            queue.clone(),
            store.clone(),
        )?);
        let reporter = Arc::new(DeviceStateReporter::load(
            config.reporter.clone(),
            platform.probe.clone(),
            platform.packages.clone(),
            policy.clone(),
            capabilities.clone(),
            settings.clone(),
            queue.clone(),
            store.clone(),
        )?);
        let dispatcher = Arc::new(CommandDispatcher {
            policy: policy.clone(),
            settings: settings.clone(),
            tracker: tracker.clone(),
            orchestrator: orchestrator.clone(),
            capabilities: capabilities.clone(),
            notifier: platform.notifier.clone(),
            power: platform.power.clone(),
            queue: queue.clone(),
            reboot_notice: config.reboot_notice,
        });

        // Subscribe before the connection worker can publish anything.
        let commands = bus.subscribe_to(Topic::Commands);
        let signals = bus.subscribe_to(Topic::Platform);

        let mut manager =
            ConnectionManager::new(config.connection.clone(), transport, queue.clone(), bus.clone());
        if let Some(fallback) = fallback {
            manager = manager.with_fallback(fallback);
        }
        let connection = manager.subscribe_state();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(("connection", tokio::spawn(manager.run(shutdown_rx.clone()))));
        tasks.push((
            "dispatcher",
            tokio::spawn(dispatcher.clone().run(commands, shutdown_rx.clone())),
        ));
        tasks.push((
            "platform",
            tokio::spawn(platform_loop(
                signals,
                policy.clone(),
                reporter.clone(),
                dispatcher,
                shutdown_rx.clone(),
            )),
        ));

        let orch = orchestrator.clone();
        tasks.push((
            "permissions",
            tokio::spawn(run_periodic(
                "permissions",
                config.orchestrator_period,
                None,
                shutdown_rx.clone(),
                move || {
                    let orch = orch.clone();
                    async move { permission_pass(&orch).await }
                },
            )),
        ));

        tasks.push((
            "location",
            tokio::spawn(location_loop(tracker.clone(), shutdown_rx.clone())),
        ));

        let rep = reporter.clone();
        tasks.push((
            "reporter",
            tokio::spawn(run_periodic(
                "reporter",
                reporter.period(),
                Some(reporter.wake_handle()),
                shutdown_rx,
                move || {
                    let rep = rep.clone();
                    async move { rep.cycle().map(|decision| debug!(?decision, "report cycle")) }
                },
            )),
        ));

        info!(tasks = tasks.len(), "agent started");
        Ok(Self {
            bus,
            queue,
            capabilities,
            policy,
            settings,
            tracker,
            reporter,
            connection,
            shutdown_tx,
            tasks,
        })
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            device_name: self.settings.device_name(),
            connection: *self.connection.borrow(),
            queued_messages: self.queue.len(),
            missing_capabilities: self.capabilities.missing(),
            allow_list: self.policy.allow_list(),
            visible_apps: self.policy.visible(),
            kiosk_package: self.policy.kiosk_package(),
            last_location: self.tracker.last_known(),
            location_tracking: self.tracker.settings().enabled,
        }
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn subscribe_visible_apps(&self) -> watch::Receiver<BTreeSet<String>> {
        self.policy.subscribe_visible()
    }

    pub fn queue(&self) -> Arc<OutboundQueue> {
        self.queue.clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Rename the device (requires the admin password).  The new name reaches
    /// the controller with the next snapshot, which is sent right away.
    pub fn rename_device(&self, password: &str, name: &str) -> Result<(), CustodianError> {
        self.settings.rename_device(password, name)?;
        self.reporter.wake_handle().notify_one();
        Ok(())
    }

    /// Queue a free-text message from the local user to the controller.
    pub fn send_support_message(&self, text: &str) -> Result<(), CustodianError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CustodianError::InvalidCommand(
                "support message must not be empty".into(),
            ));
        }
        let outcome = self.queue.push(
            OutboundPayload::SupportMessage {
                text: text.to_string(),
            },
            Priority::Normal,
        );
        if outcome.is_queued() {
            Ok(())
        } else {
            Err(CustodianError::SendFailure("outbound queue is full".into()))
        }
    }

    /// Inject a platform signal, as the OS glue would.
    pub fn publish_signal(&self, signal: PlatformSignal) -> Result<(), CustodianError> {
        self.bus
            .publish_to(Topic::Platform, Event::new(SOURCE, EventPayload::Platform(signal)))
            .map(|_| ())
    }

    pub fn report_user_interaction(&self) -> Result<(), CustodianError> {
        self.publish_signal(PlatformSignal::UserInteraction)
    }

    /// Flip the shutdown flag and wait for every task to finish.
    pub async fn shutdown(self) {
        info!("agent shutting down");
        // Best-effort: receivers may already be gone.
        let _ = self.shutdown_tx.send(true);
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "task ended abnormally");
            }
        }
        info!("agent stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task bodies
// ─────────────────────────────────────────────────────────────────────────────

/// Prompt for missing capabilities until every candidate is satisfied,
/// cooling down, or already being asked for.
async fn permission_pass(orchestrator: &PermissionOrchestrator) -> Result<(), CustodianError> {
    loop {
        match orchestrator.tick().await? {
            TickOutcome::Granted(kind) => debug!(capability = %kind, "granted, continuing"),
            TickOutcome::Denied(kind) => debug!(capability = %kind, "denied, continuing"),
            TickOutcome::Satisfied | TickOutcome::CoolingDown | TickOutcome::Busy => {
                return Ok(());
            }
        }
    }
}

/// Sample on the tracker's own interval, re-timing as soon as the controller
/// changes it.
async fn location_loop(tracker: Arc<LocationTracker>, mut shutdown: watch::Receiver<bool>) {
    let mut settings = tracker.subscribe_settings();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let t = tracker.clone();
        let body = async move { t.tick().await.map(|tick| debug!(?tick, "location tick")) };
        if supervise_until_shutdown("location", body, &mut shutdown)
            .await
            .is_none()
        {
            break;
        }

        let interval = settings.borrow_and_update().interval();
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = tokio::time::sleep(interval) => {}
            changed = settings.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *settings.borrow();
                debug!(settings = ?current, "location settings changed");
            }
        }
    }
    debug!("location loop stopped");
}

async fn platform_loop(
    mut signals: TopicReceiver,
    policy: Arc<PolicyEnforcer>,
    reporter: Arc<DeviceStateReporter>,
    dispatcher: Arc<CommandDispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            event = signals.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let EventPayload::Platform(signal) = event.payload else {
            continue;
        };
        debug!(?signal, "platform signal");
        supervise("platform", async {
            handle_signal(&signal, &policy, &reporter, &dispatcher)
        })
        .await;
    }
    debug!("platform loop stopped");
}

/// Route one platform signal.  Link changes belong to the connection worker.
fn handle_signal(
    signal: &PlatformSignal,
    policy: &PolicyEnforcer,
    reporter: &DeviceStateReporter,
    dispatcher: &CommandDispatcher,
) -> Result<(), CustodianError> {
    match signal {
        PlatformSignal::FocusLost { .. } | PlatformSignal::BackNavigation => {
            policy.on_platform_signal(signal)
        }
        PlatformSignal::PackagesChanged => {
            reporter.wake_handle().notify_one();
            policy.on_platform_signal(signal)
        }
        PlatformSignal::UserInteraction => {
            reporter.note_user_interaction();
            Ok(())
        }
        PlatformSignal::NotificationConfirmed { .. } => {
            dispatcher.on_platform_signal(signal);
            Ok(())
        }
        PlatformSignal::LinkUp | PlatformSignal::LinkDown => Ok(()),
    }
}
