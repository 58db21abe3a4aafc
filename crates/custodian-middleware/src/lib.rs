//! `custodian-middleware` – The Nervous System
//!
//! Moves messages between the agent and its controller, and between the
//! agent's own components, without caring about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – Headless, typed, topic-based publish/subscribe event bus built
//!   on Tokio broadcast channels.
//! - [`queue`] – [`OutboundQueue`]: the bounded, priority-ordered, retrying
//!   buffer every outbound message passes through.
//! - [`backoff`] – exponential reconnect delays.
//! - [`health`] – ping/pong liveness tracking.
//! - [`connection`] – [`ConnectionManager`]: connect, health-check,
//!   reconnect, fall back, and drain the queue.
//! - [`transport`] – the [`Transport`] / [`FallbackTransport`] seam, with
//!   [`ws_transport`] (WebSocket), [`http_fallback`] (HTTP poll) and
//!   [`loopback`] (in-process) implementations.

pub mod backoff;
pub mod bus;
pub mod connection;
pub mod health;
pub mod http_fallback;
pub mod loopback;
pub mod queue;
pub mod transport;
pub mod ws_transport;

pub use backoff::Backoff;
pub use bus::{EventBus, Topic, TopicReceiver};
pub use connection::{ConnectionConfig, ConnectionFsm, ConnectionManager};
pub use http_fallback::HttpFallback;
pub use loopback::{LoopbackController, LoopbackTransport, loopback};
pub use queue::{EnqueueOutcome, NackOutcome, OutboundQueue};
pub use transport::{FallbackTransport, Transport, TransportEvent};
pub use ws_transport::WsTransport;
