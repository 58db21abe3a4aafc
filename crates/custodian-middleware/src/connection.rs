//! Connection Manager – owner of the single logical control channel.
//!
//! [`ConnectionManager::run`] is the one long-lived worker that connects,
//! health-checks, reconnects with backoff, falls back to periodic polling, and
//! drains the [`OutboundQueue`].  Nothing else ever sends to the controller.
//!
//! # State machine
//!
//! ```text
//! DISCONNECTED ─► CONNECTING ─► CONNECTED ─(error / missed pong / link down)─► RECONNECTING
//!                     ▲   │                                                         │
//!                     │   └─(connect failed)───────────────────────────────────────►│
//!                     └──────────────────────(backoff elapsed or link up)───────────┘
//!
//! CONNECTING ─(failures > max_reconnect_attempts)─► FALLBACK ─(background connect ok)─► CONNECTED
//! any ─(shutdown)─► DISCONNECTED
//! ```
//!
//! While in FALLBACK the manager keeps attempting the persistent channel in the
//! background without leaving FALLBACK, and exchanges queued messages and
//! pending commands over the [`FallbackTransport`] every poll interval.
//!
//! # Side effects of transitions
//!
//! | transition | effect |
//! |---|---|
//! | any | new state on the `watch` channel and the bus [`Topic::Status`] lane |
//! | → CONNECTED | backoff and failure counter reset; `connection_state` enqueued HIGH |
//! | → FALLBACK | `connection_state` enqueued HIGH; first poll runs immediately |

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use custodian_types::{
    ConnectionState, CustodianError, Event, EventPayload, OutboundPayload, PlatformSignal,
    Priority,
};
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::bus::{EventBus, Topic, TopicReceiver};
use crate::health::{ProbeHealth, ProbeTracker};
use crate::queue::OutboundQueue;
use crate::transport::{FallbackTransport, Transport, TransportEvent};

const SOURCE: &str = "custodian-middleware::connection";

/// Messages sent per drain pass before the serve loop polls its other inputs.
const DRAIN_BATCH: usize = 16;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Timing and retry parameters of the connection worker.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Upper bound on one connect attempt.
    pub connect_timeout: Duration,
    /// Upper bound on one frame send.
    pub send_timeout: Duration,
    /// Period of the liveness probe while connected.
    pub ping_interval: Duration,
    /// How long a probe may go unanswered.
    pub pong_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: u32,
    /// Consecutive failed attempts tolerated before entering FALLBACK.
    pub max_reconnect_attempts: u32,
    /// Period of the fallback request/response exchange.
    pub fallback_poll_interval: Duration,
    /// Maximum messages carried by one fallback exchange.
    pub fallback_batch_size: usize,
    /// Queued messages older than this are purged undelivered.
    pub message_ttl: Duration,
    /// Link-up signals may trigger at most this many early reconnects per
    /// minute.
    pub link_up_reconnects_per_minute: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            backoff_multiplier: 2,
            max_reconnect_attempts: 3,
            fallback_poll_interval: Duration::from_secs(60),
            fallback_batch_size: 20,
            message_ttl: Duration::from_secs(24 * 60 * 60),
            link_up_reconnects_per_minute: 6,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionFsm
// ─────────────────────────────────────────────────────────────────────────────

/// Whether `from → to` is a legal transition.
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    if from == to {
        return false;
    }
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Reconnecting)
            | (Connecting, Fallback)
            | (Connected, Reconnecting)
            | (Reconnecting, Connecting)
            | (Fallback, Connected)
            | (_, Disconnected)
    )
}

/// The connection state machine without any I/O.
///
/// Exactly one [`ConnectionState`] is current at any time; every accepted
/// transition is published on a `watch` channel.
pub struct ConnectionFsm {
    state: ConnectionState,
    failed_attempts: u32,
    max_reconnect_attempts: u32,
    backoff: Backoff,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionFsm {
    pub fn new(max_reconnect_attempts: u32, backoff: Backoff) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state: ConnectionState::Disconnected,
            failed_attempts: 0,
            max_reconnect_attempts,
            backoff,
            state_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed connect attempts since the last CONNECTED.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Apply `to` if the transition table allows it.  An illegal transition
    /// is logged and refused.
    pub fn transition(&mut self, to: ConnectionState) -> bool {
        if !is_valid_transition(self.state, to) {
            error!(from = %self.state, to = %to, "refusing illegal connection transition");
            return false;
        }
        info!(from = %self.state, to = %to, "connection state changed");
        self.state = to;
        self.state_tx.send_replace(to);
        true
    }

    /// Called before each connect attempt.  Background attempts made from
    /// FALLBACK keep the state.
    pub fn begin_attempt(&mut self) {
        if self.state != ConnectionState::Fallback {
            self.transition(ConnectionState::Connecting);
        }
    }

    pub fn on_connected(&mut self) {
        self.failed_attempts = 0;
        self.backoff.reset();
        self.transition(ConnectionState::Connected);
    }

    /// Record a failed attempt and return the delay before the next one.
    pub fn on_connect_failed(&mut self) -> Duration {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        match self.state {
            ConnectionState::Fallback => {}
            _ if self.failed_attempts > self.max_reconnect_attempts => {
                self.transition(ConnectionState::Fallback);
            }
            _ => {
                self.transition(ConnectionState::Reconnecting);
            }
        }
        self.backoff.next_delay()
    }

    /// Record the loss of an established channel and return the retry delay.
    pub fn on_connection_lost(&mut self) -> Duration {
        self.transition(ConnectionState::Reconnecting);
        self.backoff.next_delay()
    }

    pub fn on_shutdown(&mut self) {
        if self.state != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionManager
// ─────────────────────────────────────────────────────────────────────────────

enum Served {
    Shutdown,
    Lost(CustodianError),
}

enum Waited {
    Retry,
    Shutdown,
}

/// Resolves once the shutdown flag is set or its sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// The connection worker.  Build it, take a state receiver with
/// [`subscribe_state`][Self::subscribe_state], then move it into
/// [`run`][Self::run] on its own task.
pub struct ConnectionManager {
    config: ConnectionConfig,
    fsm: ConnectionFsm,
    transport: Box<dyn Transport>,
    fallback: Option<Arc<dyn FallbackTransport>>,
    queue: Arc<OutboundQueue>,
    bus: EventBus,
    platform: TopicReceiver,
    platform_open: bool,
    link_up_limiter: DirectRateLimiter,
    probe: ProbeTracker,
    next_fallback_poll: Instant,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        transport: Box<dyn Transport>,
        queue: Arc<OutboundQueue>,
        bus: EventBus,
    ) -> Self {
        let backoff = Backoff::new(
            config.backoff_min,
            config.backoff_max,
            config.backoff_multiplier,
        );
        let per_minute =
            NonZeroU32::new(config.link_up_reconnects_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            fsm: ConnectionFsm::new(config.max_reconnect_attempts, backoff),
            probe: ProbeTracker::new(config.pong_timeout),
            link_up_limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            platform: bus.subscribe_to(Topic::Platform),
            platform_open: true,
            next_fallback_poll: Instant::now(),
            transport,
            fallback: None,
            queue,
            bus,
            config,
        }
    }

    /// Enable the periodic request/response path used in FALLBACK.
    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackTransport>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.fsm.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.fsm.subscribe()
    }

    /// Drive the channel until `shutdown` flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(endpoint = %self.transport.endpoint(), "connection manager started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let before = self.fsm.state();
            self.fsm.begin_attempt();
            self.announce(before);

            let attempt =
                tokio::time::timeout(self.config.connect_timeout, self.transport.connect()).await;
            let result = attempt.unwrap_or_else(|_| {
                Err(CustodianError::Connection(format!(
                    "connect timed out after {:?}",
                    self.config.connect_timeout
                )))
            });

            let delay = match result {
                Ok(()) => {
                    let before = self.fsm.state();
                    self.fsm.on_connected();
                    self.announce(before);

                    let served = self.serve_connected(&mut shutdown).await;
                    self.probe.reset();
                    self.transport.close().await;
                    match served {
                        Served::Shutdown => break,
                        Served::Lost(e) => {
                            warn!(error = %e, "control channel lost");
                            let before = self.fsm.state();
                            let delay = self.fsm.on_connection_lost();
                            self.announce(before);
                            delay
                        }
                    }
                }
                Err(e) => {
                    let before = self.fsm.state();
                    let delay = self.fsm.on_connect_failed();
                    self.announce(before);
                    warn!(
                        error = %e,
                        failed_attempts = self.fsm.failed_attempts(),
                        retry_in = ?delay,
                        state = %self.fsm.state(),
                        "connect attempt failed"
                    );
                    if before != ConnectionState::Fallback
                        && self.fsm.state() == ConnectionState::Fallback
                    {
                        self.next_fallback_poll = Instant::now();
                    }
                    delay
                }
            };

            if let Waited::Shutdown = self.wait_before_retry(delay, &mut shutdown).await {
                break;
            }
        }

        self.transport.close().await;
        let before = self.fsm.state();
        self.fsm.on_shutdown();
        self.announce(before);
        info!("connection manager stopped");
    }

    /// Serve an established channel until it fails or shutdown is requested.
    async fn serve_connected(&mut self, shutdown: &mut watch::Receiver<bool>) -> Served {
        let mut backlog = true;
        let mut ping_timer = tokio::time::interval(self.config.ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping_timer.reset();

        loop {
            let pong_deadline = self.probe.deadline();
            tokio::select! {
                _ = shutdown_requested(shutdown) => return Served::Shutdown,
                event = self.transport.recv() => match event {
                    TransportEvent::Text(frame) => self.publish_inbound(frame),
                    TransportEvent::Pong(payload) => {
                        if self.probe.on_pong(&payload, Instant::now()) {
                            debug!(rtt = ?self.probe.last_rtt(), "probe answered");
                        }
                    }
                    TransportEvent::Closed(reason) => {
                        return Served::Lost(CustodianError::Connection(reason));
                    }
                },
                _ = ping_timer.tick() => {
                    if !self.probe.is_awaiting() {
                        let payload = self.probe.start(Instant::now());
                        if let Err(e) = self.transport.ping(payload).await {
                            return Served::Lost(e);
                        }
                    }
                }
                _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    return Served::Lost(CustodianError::Connection(format!(
                        "no pong within {:?}",
                        self.config.pong_timeout
                    )));
                }
                _ = self.queue.notified(), if !backlog => backlog = true,
                _ = std::future::ready(()), if backlog => match self.drain(shutdown).await {
                    Ok(_) if *shutdown.borrow() => return Served::Shutdown,
                    Ok(more) => backlog = more,
                    Err(e) => return Served::Lost(e),
                },
                event = self.platform.next(), if self.platform_open => match event.map(|e| e.payload) {
                    Some(EventPayload::Platform(PlatformSignal::LinkDown)) => {
                        return Served::Lost(CustodianError::Connection("network link down".into()));
                    }
                    Some(_) => {}
                    None => self.platform_open = false,
                },
            }
        }
    }

    /// Wait out `delay`, polling the fallback path when active.  A link-up
    /// signal cuts the wait short, subject to the rate limit.
    async fn wait_before_retry(
        &mut self,
        delay: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Waited {
        let deadline = Instant::now() + delay;
        loop {
            let fallback_active =
                self.fsm.state() == ConnectionState::Fallback && self.fallback.is_some();
            tokio::select! {
                _ = sleep_until(deadline) => return Waited::Retry,
                _ = shutdown_requested(shutdown) => return Waited::Shutdown,
                _ = sleep_until(self.next_fallback_poll), if fallback_active => {
                    self.poll_fallback().await;
                    self.next_fallback_poll = Instant::now() + self.config.fallback_poll_interval;
                }
                event = self.platform.next(), if self.platform_open => match event.map(|e| e.payload) {
                    Some(EventPayload::Platform(PlatformSignal::LinkUp)) => {
                        if self.link_up_limiter.check().is_ok() {
                            info!("network link up; reconnecting now");
                            return Waited::Retry;
                        }
                        debug!("link-up reconnect rate-limited");
                    }
                    Some(_) => {}
                    None => self.platform_open = false,
                },
            }
        }
    }

    /// Send up to [`DRAIN_BATCH`] queued messages, one at a time.
    ///
    /// Stops early when shutdown is requested and fails once the outstanding
    /// probe is overdue, so a large backlog never hides either.  Returns
    /// whether messages remain queued.  A failed send nacks the message and
    /// reports the channel as broken.
    async fn drain(&mut self, shutdown: &watch::Receiver<bool>) -> Result<bool, CustodianError> {
        let expired = self.queue.purge_expired(self.config.message_ttl);
        if !expired.is_empty() {
            warn!(count = expired.len(), "purged expired outbound messages");
        }

        for _ in 0..DRAIN_BATCH {
            if *shutdown.borrow() {
                return Ok(!self.queue.is_empty());
            }
            if self.probe.health(Instant::now()) == ProbeHealth::TimedOut {
                return Err(CustodianError::Connection(format!(
                    "no pong within {:?}",
                    self.config.pong_timeout
                )));
            }
            let Some(message) = self.queue.dequeue_next() else {
                return Ok(false);
            };
            let frame = match message.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    error!(id = %message.id, error = %e, "discarding unserialisable message");
                    self.queue.ack(&message.id);
                    continue;
                }
            };

            let sent = tokio::time::timeout(self.config.send_timeout, self.transport.send(frame))
                .await
                .unwrap_or_else(|_| Err(CustodianError::SendFailure("send timed out".into())));

            match sent {
                Ok(()) => {
                    debug!(id = %message.id, message_type = message.payload.name(), "delivered");
                    self.queue.ack(&message.id);
                }
                Err(e) => {
                    self.queue.nack(&message.id);
                    return Err(e);
                }
            }
        }
        Ok(!self.queue.is_empty())
    }

    /// One request/response exchange over the fallback path.
    async fn poll_fallback(&mut self) {
        let Some(fallback) = self.fallback.clone() else {
            return;
        };
        self.queue.purge_expired(self.config.message_ttl);

        let mut frames = Vec::new();
        let mut ids = Vec::new();
        for message in self
            .queue
            .snapshot()
            .into_iter()
            .take(self.config.fallback_batch_size)
        {
            match message.to_frame() {
                Ok(frame) => {
                    frames.push(frame);
                    ids.push(message.id);
                }
                Err(e) => {
                    error!(id = %message.id, error = %e, "discarding unserialisable message");
                    self.queue.ack(&message.id);
                }
            }
        }

        match fallback.exchange(frames).await {
            Ok(commands) => {
                for id in &ids {
                    self.queue.ack(id);
                }
                debug!(
                    endpoint = %fallback.endpoint(),
                    sent = ids.len(),
                    received = commands.len(),
                    "fallback exchange complete"
                );
                for command in commands {
                    self.publish_inbound(command);
                }
            }
            Err(e) => {
                warn!(endpoint = %fallback.endpoint(), error = %e, "fallback exchange failed");
                for id in &ids {
                    self.queue.nack(id);
                }
            }
        }
    }

    fn publish_inbound(&self, frame: String) {
        let event = Event::new(SOURCE, EventPayload::InboundFrame(frame));
        if let Err(e) = self.bus.publish_to(Topic::Commands, event) {
            warn!(error = %e, "inbound frame dropped; no dispatcher listening");
        }
    }

    fn announce(&self, before: ConnectionState) {
        let state = self.fsm.state();
        if state == before {
            return;
        }
        // Best-effort publish.
        let _ = self.bus.publish_to(
            Topic::Status,
            Event::new(SOURCE, EventPayload::ConnectionChanged(state)),
        );
        if matches!(state, ConnectionState::Connected | ConnectionState::Fallback) {
            self.queue
                .push(OutboundPayload::ConnectionState { state }, Priority::High);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackController, loopback};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(200),
            send_timeout: Duration::from_millis(200),
            ping_interval: Duration::from_millis(40),
            pong_timeout: Duration::from_millis(40),
            backoff_min: Duration::from_millis(5),
            backoff_max: Duration::from_millis(40),
            backoff_multiplier: 2,
            max_reconnect_attempts: 3,
            fallback_poll_interval: Duration::from_millis(20),
            fallback_batch_size: 20,
            message_ttl: Duration::from_secs(3600),
            link_up_reconnects_per_minute: 60,
        }
    }

    struct Harness {
        controller: LoopbackController,
        queue: Arc<OutboundQueue>,
        bus: EventBus,
        state: watch::Receiver<ConnectionState>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(config: ConnectionConfig, fallback: Option<Arc<dyn FallbackTransport>>) -> Harness {
        let (transport, controller) = loopback();
        let queue = Arc::new(OutboundQueue::new(64));
        let bus = EventBus::default();
        let mut manager =
            ConnectionManager::new(config, Box::new(transport), queue.clone(), bus.clone());
        if let Some(fallback) = fallback {
            manager = manager.with_fallback(fallback);
        }
        let state = manager.subscribe_state();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(manager.run(shutdown_rx));
        Harness {
            controller,
            queue,
            bus,
            state,
            shutdown,
            task,
        }
    }

    async fn wait_state(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
            .await
            .expect("state not reached in time")
            .expect("state channel closed");
    }

    async fn eventually(pred: impl Fn() -> bool) -> bool {
        for _ in 0..400 {
            if pred() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    // ── state machine ────────────────────────────────────────────────────────

    #[test]
    fn fsm_enters_fallback_after_threshold() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(40), 2);
        let mut fsm = ConnectionFsm::new(3, backoff);

        let mut delays = Vec::new();
        for _ in 0..3 {
            fsm.begin_attempt();
            assert_eq!(fsm.state(), ConnectionState::Connecting);
            delays.push(fsm.on_connect_failed());
            assert_eq!(fsm.state(), ConnectionState::Reconnecting);
        }
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(40)));

        fsm.begin_attempt();
        fsm.on_connect_failed();
        assert_eq!(fsm.state(), ConnectionState::Fallback);

        // Background attempts keep FALLBACK.
        fsm.begin_attempt();
        assert_eq!(fsm.state(), ConnectionState::Fallback);

        fsm.on_connected();
        assert_eq!(fsm.state(), ConnectionState::Connected);
        assert_eq!(fsm.failed_attempts(), 0);
        assert_eq!(fsm.on_connection_lost(), Duration::from_millis(10));
    }

    #[test]
    fn fsm_refuses_illegal_transition() {
        let mut fsm = ConnectionFsm::new(3, Backoff::default());
        assert!(!fsm.transition(ConnectionState::Connected));
        assert_eq!(fsm.state(), ConnectionState::Disconnected);
        assert!(!is_valid_transition(
            ConnectionState::Connected,
            ConnectionState::Fallback
        ));
    }

    #[test]
    fn fsm_publishes_on_watch() {
        let mut fsm = ConnectionFsm::new(3, Backoff::default());
        let rx = fsm.subscribe();
        fsm.begin_attempt();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
    }

    // ── manager ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn connects_and_drains_in_priority_order() {
        let mut h = start(fast_config(), None);
        h.queue.push(
            OutboundPayload::SupportMessage { text: "hello".into() },
            Priority::Normal,
        );
        wait_state(&mut h.state, ConnectionState::Connected).await;

        let found = h
            .controller
            .wait_for(Duration::from_secs(2), |v| v["type"] == "support_message")
            .await;
        assert!(found.is_some());

        let sent = h.controller.sent_json();
        assert_eq!(sent[0]["type"], "connection_state");
        assert_eq!(sent[0]["state"], "CONNECTED");
        assert!(h.queue.is_empty());

        let _ = h.shutdown.send(true);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn inbound_frames_reach_commands_topic() {
        let bus_probe = {
            let h = start(fast_config(), None);
            let mut commands = h.bus.subscribe_to(Topic::Commands);
            h.controller.push_command(r#"{"type":"request_location"}"#);
            let event = tokio::time::timeout(Duration::from_secs(2), commands.recv())
                .await
                .expect("frame must arrive")
                .unwrap();
            let _ = h.shutdown.send(true);
            h.task.await.unwrap();
            event
        };
        match bus_probe.payload {
            EventPayload::InboundFrame(frame) => assert!(frame.contains("request_location")),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconnects_after_drop_and_keeps_queue() {
        let mut h = start(fast_config(), None);
        wait_state(&mut h.state, ConnectionState::Connected).await;

        h.controller.drop_connection();
        wait_state(&mut h.state, ConnectionState::Reconnecting).await;
        wait_state(&mut h.state, ConnectionState::Connected).await;
        assert!(h.controller.connect_count() >= 2);

        let _ = h.shutdown.send(true);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn missed_pong_forces_reconnect() {
        let h = start(fast_config(), None);
        h.controller.answer_pings(false);
        let controller = h.controller.clone();
        assert!(eventually(|| controller.connect_count() >= 2).await);
        let _ = h.shutdown.send(true);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn link_down_forces_reconnect() {
        let mut h = start(fast_config(), None);
        wait_state(&mut h.state, ConnectionState::Connected).await;
        h.bus
            .publish_to(
                Topic::Platform,
                Event::new("test", EventPayload::Platform(PlatformSignal::LinkDown)),
            )
            .unwrap();
        wait_state(&mut h.state, ConnectionState::Reconnecting).await;
        let _ = h.shutdown.send(true);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn failed_send_is_retried_after_reconnect() {
        let mut h = start(fast_config(), None);
        wait_state(&mut h.state, ConnectionState::Connected).await;
        // Let the CONNECTED announcement go out first.
        let controller = h.controller.clone();
        assert!(eventually(|| !controller.sent().is_empty()).await);

        h.controller.fail_next_sends(1);
        h.queue.push(
            OutboundPayload::SupportMessage { text: "retry me".into() },
            Priority::Normal,
        );
        let found = h
            .controller
            .wait_for(Duration::from_secs(2), |v| v["text"] == "retry me")
            .await;
        assert!(found.is_some());
        assert!(h.controller.connect_count() >= 2);

        let _ = h.shutdown.send(true);
        h.task.await.unwrap();
    }

    #[derive(Default)]
    struct RecordingFallback {
        exchanges: Mutex<Vec<Vec<String>>>,
        pending: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FallbackTransport for RecordingFallback {
        async fn exchange(&self, frames: Vec<String>) -> Result<Vec<String>, CustodianError> {
            self.exchanges
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(frames);
            Ok(std::mem::take(
                &mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()),
            ))
        }

        fn endpoint(&self) -> String {
            "recording".into()
        }
    }

    #[tokio::test]
    async fn falls_back_then_recovers() {
        let fallback = Arc::new(RecordingFallback::default());
        fallback
            .pending
            .lock()
            .unwrap()
            .push(r#"{"type":"exit_kiosk"}"#.to_string());

        let (transport, controller) = loopback();
        controller.fail_next_connects(u32::MAX);
        let queue = Arc::new(OutboundQueue::new(64));
        let bus = EventBus::default();
        let mut commands = bus.subscribe_to(Topic::Commands);
        let manager =
            ConnectionManager::new(fast_config(), Box::new(transport), queue.clone(), bus.clone())
                .with_fallback(fallback.clone());
        let mut state = manager.subscribe_state();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(manager.run(shutdown_rx));

        wait_state(&mut state, ConnectionState::Fallback).await;

        let event = tokio::time::timeout(Duration::from_secs(2), commands.recv())
            .await
            .expect("fallback command must arrive")
            .unwrap();
        assert!(matches!(event.payload, EventPayload::InboundFrame(ref f) if f.contains("exit_kiosk")));

        let fb = fallback.clone();
        assert!(
            eventually(|| {
                fb.exchanges
                    .lock()
                    .unwrap()
                    .iter()
                    .flatten()
                    .any(|f| f.contains("FALLBACK"))
            })
            .await
        );

        controller.fail_next_connects(0);
        wait_state(&mut state, ConnectionState::Connected).await;

        let _ = shutdown.send(true);
        task.await.unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn link_up_reconnects_without_waiting_for_backoff() {
        let (transport, controller) = loopback();
        controller.fail_next_connects(1);
        let config = ConnectionConfig {
            backoff_min: Duration::from_secs(30),
            backoff_max: Duration::from_secs(30),
            ..fast_config()
        };
        let bus = EventBus::default();
        let manager = ConnectionManager::new(
            config,
            Box::new(transport),
            Arc::new(OutboundQueue::new(64)),
            bus.clone(),
        );
        let mut state = manager.subscribe_state();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(manager.run(shutdown_rx));

        wait_state(&mut state, ConnectionState::Reconnecting).await;
        bus.publish_to(
            Topic::Platform,
            Event::new("test", EventPayload::Platform(PlatformSignal::LinkUp)),
        )
        .unwrap();
        wait_state(&mut state, ConnectionState::Connected).await;
        assert_eq!(controller.connect_count(), 2);

        let _ = shutdown.send(true);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn link_up_reconnects_are_rate_limited() {
        let (transport, controller) = loopback();
        controller.fail_next_connects(2);
        let config = ConnectionConfig {
            backoff_min: Duration::from_secs(30),
            backoff_max: Duration::from_secs(30),
            link_up_reconnects_per_minute: 1,
            ..fast_config()
        };
        let bus = EventBus::default();
        let manager = ConnectionManager::new(
            config,
            Box::new(transport),
            Arc::new(OutboundQueue::new(64)),
            bus.clone(),
        );
        let mut state = manager.subscribe_state();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(manager.run(shutdown_rx));
        let link_up = || Event::new("test", EventPayload::Platform(PlatformSignal::LinkUp));

        wait_state(&mut state, ConnectionState::Reconnecting).await;
        bus.publish_to(Topic::Platform, link_up()).unwrap();
        let c = controller.clone();
        assert!(eventually(|| c.connect_count() == 2).await);

        bus.publish_to(Topic::Platform, link_up()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(controller.connect_count(), 2);
        assert_eq!(*state.borrow(), ConnectionState::Reconnecting);

        let _ = shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("shutdown must cut the backoff short")
            .unwrap();
    }

    // ── draining ─────────────────────────────────────────────────────────────

    async fn connected_manager(config: ConnectionConfig) -> (ConnectionManager, LoopbackController) {
        let (transport, controller) = loopback();
        let mut manager = ConnectionManager::new(
            config,
            Box::new(transport),
            Arc::new(OutboundQueue::new(64)),
            EventBus::default(),
        );
        manager.transport.connect().await.unwrap();
        (manager, controller)
    }

    fn queue_support_messages(queue: &OutboundQueue, n: usize) {
        for i in 0..n {
            queue.push(
                OutboundPayload::SupportMessage { text: format!("m{i}") },
                Priority::Normal,
            );
        }
    }

    #[tokio::test]
    async fn drain_sends_in_batches_until_empty() {
        let (mut manager, controller) = connected_manager(fast_config()).await;
        queue_support_messages(&manager.queue, 40);
        let (_shutdown, shutdown_rx) = watch::channel(false);

        assert!(manager.drain(&shutdown_rx).await.unwrap());
        assert_eq!(controller.sent().len(), DRAIN_BATCH);

        let mut passes = 1;
        loop {
            passes += 1;
            if !manager.drain(&shutdown_rx).await.unwrap() {
                break;
            }
        }
        assert_eq!(passes, 3);
        let texts: Vec<_> = controller
            .sent_json()
            .iter()
            .map(|v| v["text"].as_str().unwrap_or_default().to_string())
            .collect();
        let expected: Vec<_> = (0..40).map(|i| format!("m{i}")).collect();
        assert_eq!(texts, expected);
        assert!(manager.queue.is_empty());
    }

    #[tokio::test]
    async fn drain_stops_when_shutdown_is_requested() {
        let (mut manager, controller) = connected_manager(fast_config()).await;
        queue_support_messages(&manager.queue, 5);
        let (_shutdown, shutdown_rx) = watch::channel(true);

        assert!(manager.drain(&shutdown_rx).await.unwrap());
        assert!(controller.sent().is_empty());
        assert_eq!(manager.queue.len(), 5);
    }

    #[tokio::test]
    async fn overdue_pong_interrupts_drain() {
        let config = ConnectionConfig {
            pong_timeout: Duration::from_millis(1),
            ..fast_config()
        };
        let (mut manager, controller) = connected_manager(config).await;
        manager.probe.start(Instant::now());
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue_support_messages(&manager.queue, 3);
        let (_shutdown, shutdown_rx) = watch::channel(false);

        let err = manager.drain(&shutdown_rx).await.unwrap_err();
        assert!(matches!(err, CustodianError::Connection(_)));
        assert!(controller.sent().is_empty());
        assert_eq!(manager.queue.len(), 3);
    }

    #[tokio::test]
    async fn large_backlog_is_delivered_and_shutdown_still_prompt() {
        let h = start(fast_config(), None);
        queue_support_messages(&h.queue, 60);
        let controller = h.controller.clone();
        assert!(eventually(|| controller.sent_of_type("support_message").len() == 60).await);

        let _ = h.shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(1), h.task)
            .await
            .expect("shutdown must finish")
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_ends_disconnected() {
        let mut h = start(fast_config(), None);
        wait_state(&mut h.state, ConnectionState::Connected).await;
        let _ = h.shutdown.send(true);
        h.task.await.unwrap();
        assert_eq!(*h.state.borrow(), ConnectionState::Disconnected);
        assert!(!h.controller.is_connected());
    }
}
