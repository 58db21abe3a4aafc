//! WebSocket implementation of [`Transport`].
//!
//! Connects to the controller with `tokio-tungstenite`, identifying the device
//! with an `X-Device-Id` header and, when configured, a bearer enrollment
//! token.  Ping/Pong control frames carry the liveness probe.

use async_trait::async_trait;
use custodian_types::CustodianError;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::transport::{Transport, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client for the persistent control channel.
pub struct WsTransport {
    url: String,
    device_id: String,
    token: Option<String>,
    stream: Option<WsStream>,
}

impl WsTransport {
    /// `url` should be a `ws://` or `wss://` controller endpoint.
    pub fn new(url: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            device_id: device_id.into(),
            token: None,
            stream: None,
        }
    }

    /// Send `Authorization: Bearer <token>` on connect.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn stream(&mut self) -> Result<&mut WsStream, CustodianError> {
        self.stream
            .as_mut()
            .ok_or_else(|| CustodianError::SendFailure("channel is not open".into()))
    }
}

fn header(value: &str) -> Result<HeaderValue, CustodianError> {
    HeaderValue::from_str(value)
        .map_err(|e| CustodianError::Connection(format!("invalid header value: {e}")))
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&mut self) -> Result<(), CustodianError> {
        self.close().await;

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| CustodianError::Connection(format!("invalid controller url: {e}")))?;
        request
            .headers_mut()
            .insert("X-Device-Id", header(&self.device_id)?);
        if let Some(token) = &self.token {
            request
                .headers_mut()
                .insert("Authorization", header(&format!("Bearer {token}"))?);
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| CustodianError::Connection(format!("WebSocket connect failed: {e}")))?;
        debug!(url = %self.url, status = %response.status(), "WebSocket handshake complete");
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, frame: String) -> Result<(), CustodianError> {
        self.stream()?
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| CustodianError::SendFailure(e.to_string()))
    }

    async fn ping(&mut self, payload: Vec<u8>) -> Result<(), CustodianError> {
        self.stream()?
            .send(Message::Ping(payload.into()))
            .await
            .map_err(|e| CustodianError::Connection(format!("ping failed: {e}")))
    }

    async fn recv(&mut self) -> TransportEvent {
        let Some(stream) = self.stream.as_mut() else {
            return TransportEvent::Closed("channel is not open".into());
        };
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return TransportEvent::Text(text.as_str().to_owned());
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return TransportEvent::Text(text),
                    Err(_) => debug!("ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Pong(payload))) => return TransportEvent::Pong(payload.to_vec()),
                // tungstenite answers pings on the next write.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_owned())
                        .unwrap_or_else(|| "closed by peer".into());
                    return TransportEvent::Closed(reason);
                }
                Some(Err(e)) => return TransportEvent::Closed(e.to_string()),
                None => return TransportEvent::Closed("stream ended".into()),
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}
