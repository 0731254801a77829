//! WebSocket endpoint for status subscriptions.
//!
//! Clients send `{"action":"subscribe","topic":"task:<id>"}` (or
//! `unsubscribe`) and receive every [`StatusEvent`] published on their topics.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::broadcaster::{EventBroadcaster, SubscriberId};

/// Messages from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

/// Control replies sent back on the socket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    Subscribed { topic: String },
    Unsubscribed { topic: String },
    Error { message: String },
}

/// Drive one upgraded socket until either side closes.
pub async fn handle_socket(mut socket: WebSocket, broadcaster: Arc<EventBroadcaster>) {
    let (subscriber, mut rx) = broadcaster.connect();
    info!(subscriber = %subscriber, "WebSocket client connected");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    debug!(subscriber = %subscriber, "Subscriber channel closed");
                    break;
                };
                if let Ok(json) = serde_json::to_string(&event) {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        debug!("Client disconnected during send");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_message(&text, subscriber, &broadcaster);
                        if let Ok(json) = serde_json::to_string(&reply) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(subscriber = %subscriber, "WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    broadcaster.disconnect(subscriber);
}

fn handle_client_message(
    text: &str,
    subscriber: SubscriberId,
    broadcaster: &EventBroadcaster,
) -> ControlReply {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { topic }) => {
            if topic.trim().is_empty() {
                return ControlReply::Error {
                    message: "topic must not be empty".into(),
                };
            }
            broadcaster.subscribe(subscriber, &topic);
            debug!(subscriber = %subscriber, topic = %topic, "Subscribed");
            ControlReply::Subscribed { topic }
        }
        Ok(ClientMessage::Unsubscribe { topic }) => {
            broadcaster.unsubscribe(subscriber, &topic);
            ControlReply::Unsubscribed { topic }
        }
        Err(e) => {
            warn!(error = %e, "Invalid WebSocket message");
            ControlReply::Error {
                message: format!("invalid message: {e}"),
            }
        }
    }
}
