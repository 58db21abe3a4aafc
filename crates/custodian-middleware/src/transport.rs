//! The transport seam.
//!
//! The connection manager never speaks WebSocket or HTTP directly.  It drives
//! a [`Transport`] for the persistent channel and, once reconnects keep
//! failing, a [`FallbackTransport`] for the periodic request/response path.
//!
//! # Overview
//!
//! - [`Transport`] – the persistent, bidirectional channel.
//! - [`FallbackTransport`] – one request/response exchange per poll.
//! - [`WsTransport`][crate::ws_transport::WsTransport] – WebSocket client.
//! - [`HttpFallback`][crate::http_fallback::HttpFallback] – HTTP poll client.
//! - [`LoopbackTransport`][crate::loopback::LoopbackTransport] – in-process
//!   controller for tests and offline runs.

use async_trait::async_trait;
use custodian_types::CustodianError;

/// Something that arrived on the persistent channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame carrying one JSON envelope.
    Text(String),
    /// Answer to an earlier [`Transport::ping`].
    Pong(Vec<u8>),
    /// The peer closed the channel or it failed.
    Closed(String),
}

/// Every persistent-channel implementation must implement this trait.
///
/// # Contract
///
/// * `connect` – establish the channel.  The caller applies the timeout.
/// * `send` – write one text frame.  An error means the frame was not
///   delivered and the channel should be considered broken.
/// * `ping` – send a liveness probe whose answer surfaces as
///   [`TransportEvent::Pong`] with the same payload.
/// * `recv` – wait for the next inbound event.  Must be cancel-safe: the
///   caller polls it inside `tokio::select!`.
/// * `close` – tear down the channel.  Infallible and idempotent.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), CustodianError>;

    async fn send(&mut self, frame: String) -> Result<(), CustodianError>;

    async fn ping(&mut self, payload: Vec<u8>) -> Result<(), CustodianError>;

    async fn recv(&mut self) -> TransportEvent;

    async fn close(&mut self);

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// The periodic request/response path used while in fallback.
#[async_trait]
pub trait FallbackTransport: Send + Sync {
    /// Deliver `frames` (possibly none) and return any commands the controller
    /// has pending for this device, as raw envelope frames.
    async fn exchange(&self, frames: Vec<String>) -> Result<Vec<String>, CustodianError>;

    fn endpoint(&self) -> String;
}
