//! WebSocket client for the provider's event stream.
//!
//! [`ProviderClient`] holds the connection configuration. Call
//! [`ProviderClient::connect`] to establish a live
//! [`ProviderConnection`].

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Configuration handle for the provider event socket.
pub struct ProviderClient {
    ws_url: String,
    client_id: String,
    api_key: Option<String>,
}

/// A live WebSocket connection to the provider.
pub struct ProviderConnection {
    /// Client id sent during the handshake; REST submissions use the
    /// same id so the provider routes their events to this socket.
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl ProviderClient {
    /// * `ws_url`    - WebSocket endpoint, e.g. `wss://socket.provider.example/ws`.
    /// * `client_id` - Stable id for this process.
    /// * `api_key`   - Optional bearer token sent in the handshake.
    pub fn new(ws_url: String, client_id: String, api_key: Option<String>) -> Self {
        Self {
            ws_url,
            client_id,
            api_key,
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Connect to the event socket, appending `clientId` to the URL and
    /// the bearer token to the handshake when one is configured.
    pub async fn connect(&self) -> Result<ProviderConnection, ProviderClientError> {
        let url = format!("{}?clientId={}", self.ws_url, self.client_id);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ProviderClientError::Connection(format!("Invalid URL {url}: {e}")))?;

        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| ProviderClientError::Protocol(format!("Invalid API key: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws_stream, _response) = connect_async(request).await.map_err(|e| {
            ProviderClientError::Connection(format!(
                "Failed to connect to provider at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %self.client_id,
            "Connected to provider at {}",
            self.ws_url,
        );

        Ok(ProviderConnection {
            client_id: self.client_id.clone(),
            ws_stream,
        })
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ProviderClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level problem with the handshake or stream.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
