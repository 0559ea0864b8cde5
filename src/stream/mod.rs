//! Streaming transport: connectors, the multiplexed channel, subscriptions.

mod channel;
mod subscription;

use std::time::Duration;

use async_trait::async_trait;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::info;

pub use channel::{ChannelExit, ChannelOptions, StreamChannel};
pub use subscription::Subscription;

use crate::error::SdkError;

/// Establishes streaming channels. The seam lets tests swap the network out.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, endpoint: &str, options: &ChannelOptions) -> Result<StreamChannel, SdkError>;
}

/// WebSocket connector with a bounded handshake.
#[derive(Debug, Clone)]
pub struct WsConnector {
    handshake_timeout: Duration,
    auth_token: Option<String>,
}

impl WsConnector {
    #[must_use]
    pub fn new(handshake_timeout: Duration, auth_token: Option<String>) -> Self {
        Self { handshake_timeout, auth_token }
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, endpoint: &str, options: &ChannelOptions) -> Result<StreamChannel, SdkError> {
        let mut request = endpoint.into_client_request().map_err(|e| SdkError::connection(endpoint, e))?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| SdkError::connection(endpoint, e))?;
            request.headers_mut().insert("authorization", value);
        }

        let (socket, response) = tokio::time::timeout(self.handshake_timeout, connect_async(request))
            .await
            .map_err(|_| SdkError::connection(endpoint, "handshake timed out"))?
            .map_err(|e| SdkError::connection(endpoint, e))?;

        info!(endpoint = %endpoint, status = %response.status(), "stream: connected");
        Ok(StreamChannel::spawn(socket, options))
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
