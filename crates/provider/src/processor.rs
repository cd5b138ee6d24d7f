//! WebSocket frame processing loop.
//!
//! Reads raw frames from the provider connection and routes each JSON
//! text frame to its project channel. No decoding beyond "is it JSON"
//! happens here; the engine decodes strictly when it correlates.

use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;

use crate::channels::ProjectChannels;

/// Process frames until the socket closes, errors, or the stream ends.
pub async fn process_frames(
    ws_stream: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    channels: &ProjectChannels,
) {
    while let Some(msg_result) = ws_stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                handle_text_frame(&text, channels).await;
            }
            Ok(Message::Binary(_)) => {
                tracing::trace!("Ignoring binary frame");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Handled automatically by tungstenite.
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "Provider WebSocket closed");
                break;
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                tracing::error!(error = %e, "WebSocket receive error");
                break;
            }
        }
    }
}

/// Parse one text frame and hand it to the router.
///
/// Frames may carry a single event object or an array of them.
pub async fn handle_text_frame(text: &str, channels: &ProjectChannels) {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Array(events)) => {
            for event in events {
                route_object(event, channels).await;
            }
        }
        Ok(event) => route_object(event, channels).await,
        Err(e) => {
            tracing::warn!(
                error = %e,
                raw_message = %text,
                "Failed to parse provider frame",
            );
        }
    }
}

async fn route_object(event: serde_json::Value, channels: &ProjectChannels) {
    if !event.is_object() {
        tracing::warn!(raw_message = %event, "Ignoring non-object provider frame");
        return;
    }
    channels.route(event).await;
}
