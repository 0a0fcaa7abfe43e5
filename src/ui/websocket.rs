//! Control WebSocket
//!
//! Each client first gets the full state, then every change notification
//! rendered as a [`ControlMessage`]. Commands arrive as JSON text frames and
//! their replies go back to the same client only.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::protocol::ControlMessage;
use crate::ui::server::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let node = state.node.clone();
    let (mut sender, mut receiver) = socket.split();
    let mut notifications = node.notifier().subscribe();
    tracing::info!("Control client connected");

    for message in node.snapshot() {
        if send(&mut sender, &message).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            notification = notifications.recv() => {
                let outgoing = match notification {
                    Ok(notification) => vec![node.render(notification)],
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Control client lagged by {} notifications, resending state", skipped);
                        node.snapshot()
                    }
                    Err(RecvError::Closed) => break,
                };
                if send_all(&mut sender, &outgoing).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };

                let replies = match serde_json::from_str::<ControlMessage>(&text) {
                    Ok(command) => node.handle_control(command).await,
                    Err(e) => {
                        tracing::warn!("Unreadable control message: {}", e);
                        vec![ControlMessage::Error { message: format!("invalid message: {}", e) }]
                    }
                };
                if send_all(&mut sender, &replies).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!("Control client disconnected");
}

type Sender = futures_util::stream::SplitSink<WebSocket, Message>;

async fn send(sender: &mut Sender, message: &ControlMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            tracing::warn!("Failed to encode control message: {}", e);
            Ok(())
        }
    }
}

async fn send_all(sender: &mut Sender, messages: &[ControlMessage]) -> Result<(), axum::Error> {
    for message in messages {
        send(sender, message).await?;
    }
    Ok(())
}
