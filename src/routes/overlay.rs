use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};

use crate::AppState;

const GREETING: &str = "Connected to backend";

pub async fn overlay_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Forward broadcast frames to one overlay display until either side closes.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (client_id, mut frames) = state.overlay.register().await;

    let greeting = serde_json::json!({ "type": "connection", "message": GREETING }).to_string();
    if sender.send(Message::Text(greeting)).await.is_ok() {
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                inbound = receiver.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("Overlay client {} says: {}", client_id, text);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::warn!("Overlay client {} socket error: {}", client_id, e);
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    state.overlay.unregister(client_id).await;
}
