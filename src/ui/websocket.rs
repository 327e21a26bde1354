//! Signaling WebSocket
//!
//! Each socket gets a writer task fed by an unbounded queue (sessions and
//! pollers enqueue from anywhere) and a read loop that hands text frames to
//! the connection's [`SignalingEndpoint`] in order.
//!
//! [`SignalingEndpoint`]: crate::signaling::SignalingEndpoint

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::audio::engine::Feed;
use crate::signaling::OutboundMessage;
use crate::ui::server::AppState;

pub fn upgrade(
    ws: WebSocketUpgrade,
    state: Arc<AppState>,
    feed: Feed,
    user_agent: Option<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, feed, user_agent))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    feed: Feed,
    user_agent: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let endpoint = state.signaling.endpoint(feed, tx);

    tracing::info!(
        "Connection {} opened ({} feed, {})",
        endpoint.conn_id(),
        feed.as_str(),
        user_agent.as_deref().unwrap_or("unknown agent")
    );

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("Cannot encode outbound message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => endpoint.handle_text(&text).await,
            Ok(Message::Binary(_)) => endpoint.reject_binary(),
            Ok(Message::Close(_)) => break,
            // Protocol-level ping/pong is answered by axum
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Connection {} read error: {}", endpoint.conn_id(), e);
                break;
            }
        }
    }

    endpoint.shutdown();
    writer.abort();
    tracing::info!("Connection {} closed", endpoint.conn_id());
}
