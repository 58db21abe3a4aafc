//! HTTP implementation of [`FallbackTransport`].
//!
//! Each poll is one `POST` to the fallback endpoint:
//!
//! ```text
//! → { "device_id": "...", "messages": [ <envelope>, ... ] }
//! ← { "commands": [ <envelope>, ... ] }
//! ```
//!
//! Envelopes have exactly the shape used on the WebSocket channel.

use std::time::Duration;

use async_trait::async_trait;
use custodian_types::CustodianError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::transport::FallbackTransport;

#[derive(Serialize)]
struct PollRequest<'a> {
    device_id: &'a str,
    messages: Vec<Value>,
}

#[derive(Deserialize, Default)]
struct PollResponse {
    #[serde(default)]
    commands: Vec<Value>,
}

/// Periodic-pull client for the fallback path.
pub struct HttpFallback {
    url: String,
    device_id: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpFallback {
    /// Create a client posting to `url` with a per-request `timeout`.
    pub fn new(url: impl Into<String>, device_id: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: url.into(),
            device_id: device_id.into(),
            token: None,
            client,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Parse outbound frames back into JSON values so the batch is a proper array.
/// Frames that are not JSON are skipped; they cannot be valid envelopes.
fn frames_to_values(frames: Vec<String>) -> Vec<Value> {
    frames
        .into_iter()
        .filter_map(|frame| match serde_json::from_str::<Value>(&frame) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "skipping malformed outbound frame");
                None
            }
        })
        .collect()
}

#[async_trait]
impl FallbackTransport for HttpFallback {
    async fn exchange(&self, frames: Vec<String>) -> Result<Vec<String>, CustodianError> {
        let body = PollRequest {
            device_id: &self.device_id,
            messages: frames_to_values(frames),
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response: PollResponse = request
            .send()
            .await
            .map_err(|e| CustodianError::Connection(format!("fallback request failed: {e}")))?
            .error_for_status()
            .map_err(|e| CustodianError::Connection(format!("fallback rejected: {e}")))?
            .json()
            .await
            .map_err(|e| CustodianError::Serialization(format!("fallback response: {e}")))?;

        Ok(response.commands.into_iter().map(|c| c.to_string()).collect())
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}
