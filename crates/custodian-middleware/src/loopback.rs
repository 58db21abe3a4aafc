//! In-process controller for tests and offline runs.
//!
//! [`loopback`] returns a connected pair: a [`LoopbackTransport`] handed to
//! the connection manager, and a [`LoopbackController`] that plays the
//! controller side.  The controller can push command frames, inspect every
//! frame the agent sent, drop the channel, and script connect/send failures.
//!
//! # Example
//!
//! ```rust
//! use custodian_middleware::loopback::loopback;
//! use custodian_middleware::transport::{Transport, TransportEvent};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (mut transport, controller) = loopback();
//! transport.connect().await.unwrap();
//! controller.push_command(r#"{"type":"request_location"}"#);
//! assert!(matches!(transport.recv().await, TransportEvent::Text(_)));
//! transport.send("{}".into()).await.unwrap();
//! assert_eq!(controller.sent().len(), 1);
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use custodian_types::CustodianError;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};

use crate::transport::{Transport, TransportEvent};

enum Signal {
    Frame(String),
    Pong(Vec<u8>),
    Close(String),
}

#[derive(Default)]
struct Script {
    connected: bool,
    connects: u32,
    failing_connects: u32,
    failing_sends: u32,
    answer_pings: bool,
    sent: Vec<String>,
}

struct Shared {
    script: Mutex<Script>,
    sent_notify: Notify,
    signals: mpsc::UnboundedSender<Signal>,
}

impl Shared {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Agent side of the loopback channel.
pub struct LoopbackTransport {
    shared: Arc<Shared>,
    signals: mpsc::UnboundedReceiver<Signal>,
}

/// Controller side of the loopback channel.  Cheap to clone.
#[derive(Clone)]
pub struct LoopbackController {
    shared: Arc<Shared>,
}

/// Create a connected transport/controller pair.  Pings are answered.
pub fn loopback() -> (LoopbackTransport, LoopbackController) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        script: Mutex::new(Script {
            answer_pings: true,
            ..Script::default()
        }),
        sent_notify: Notify::new(),
        signals: tx,
    });
    (
        LoopbackTransport {
            shared: shared.clone(),
            signals: rx,
        },
        LoopbackController { shared },
    )
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&mut self) -> Result<(), CustodianError> {
        let mut script = self.shared.script();
        script.connects += 1;
        if script.failing_connects > 0 {
            script.failing_connects -= 1;
            return Err(CustodianError::Connection("scripted connect failure".into()));
        }
        script.connected = true;
        Ok(())
    }

    async fn send(&mut self, frame: String) -> Result<(), CustodianError> {
        {
            let mut script = self.shared.script();
            if !script.connected {
                return Err(CustodianError::SendFailure("channel is not open".into()));
            }
            if script.failing_sends > 0 {
                script.failing_sends -= 1;
                return Err(CustodianError::SendFailure("scripted send failure".into()));
            }
            script.sent.push(frame);
        }
        self.shared.sent_notify.notify_waiters();
        Ok(())
    }

    async fn ping(&mut self, payload: Vec<u8>) -> Result<(), CustodianError> {
        let answer = {
            let script = self.shared.script();
            if !script.connected {
                return Err(CustodianError::Connection("channel is not open".into()));
            }
            script.answer_pings
        };
        if answer {
            let _ = self.shared.signals.send(Signal::Pong(payload));
        }
        Ok(())
    }

    async fn recv(&mut self) -> TransportEvent {
        loop {
            match self.signals.recv().await {
                Some(Signal::Frame(text)) => return TransportEvent::Text(text),
                Some(Signal::Pong(payload)) => return TransportEvent::Pong(payload),
                Some(Signal::Close(reason)) => {
                    let mut script = self.shared.script();
                    // A drop requested while already down is stale.
                    if script.connected {
                        script.connected = false;
                        return TransportEvent::Closed(reason);
                    }
                }
                None => return TransportEvent::Closed("controller gone".into()),
            }
        }
    }

    async fn close(&mut self) {
        self.shared.script().connected = false;
    }

    fn endpoint(&self) -> String {
        "loopback".to_string()
    }
}

impl LoopbackController {
    /// Queue a command frame for the agent.  Frames pushed while the channel
    /// is down are delivered after the next connect.
    pub fn push_command(&self, frame: impl Into<String>) {
        let _ = self.shared.signals.send(Signal::Frame(frame.into()));
    }

    /// Drop the channel as a network failure would.
    pub fn drop_connection(&self) {
        let _ = self
            .shared
            .signals
            .send(Signal::Close("dropped by controller".into()));
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.script().failing_connects = n;
    }

    /// Make the next `n` sends fail.
    pub fn fail_next_sends(&self, n: u32) {
        self.shared.script().failing_sends = n;
    }

    /// Stop (or resume) answering liveness probes.
    pub fn answer_pings(&self, answer: bool) {
        self.shared.script().answer_pings = answer;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.script().connected
    }

    pub fn connect_count(&self) -> u32 {
        self.shared.script().connects
    }

    /// Every frame the agent delivered, oldest first.
    pub fn sent(&self) -> Vec<String> {
        self.shared.script().sent.clone()
    }

    /// Delivered frames parsed as JSON.
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent()
            .iter()
            .filter_map(|f| serde_json::from_str(f).ok())
            .collect()
    }

    /// Delivered envelopes with the given `type`.
    pub fn sent_of_type(&self, message_type: &str) -> Vec<Value> {
        self.sent_json()
            .into_iter()
            .filter(|v| v["type"] == message_type)
            .collect()
    }

    /// Wait until a frame satisfying `pred` has been delivered, or `timeout`
    /// elapses.  Returns the matching envelope.
    pub async fn wait_for<F>(&self, timeout: Duration, pred: F) -> Option<Value>
    where
        F: Fn(&Value) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.sent_notify.notified();
            if let Some(found) = self.sent_json().into_iter().find(|v| pred(v)) {
                return Some(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}
