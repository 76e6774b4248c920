//! Event stream at `/api/ws`
//!
//! Clients send `{"type": "subscribe", "payload": {"topics": ["recording.*"]}}`
//! and receive matching [`SystemEvent`]s as JSON text frames. This is how a
//! persistence collaborator learns about completed clips.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::SystemEvent;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload")]
enum SubscriptionRequest {
    #[serde(rename = "subscribe")]
    Subscribe { topics: Vec<String> },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { topics: Vec<String> },

    #[serde(rename = "ping")]
    Ping,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = state.events.subscribe();
    let mut topics: Vec<String> = Vec::new();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    info!("Event client connected");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => apply_request(&text, &mut topics),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!("Event socket receive error: {}", e);
                    break;
                }
                _ => {}
            },

            event = event_rx.recv() => match event {
                Ok(event) => {
                    if !should_send_event(&event, &topics) {
                        continue;
                    }
                    let Ok(json) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event client lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("Event client disconnected");
}

fn apply_request(text: &str, topics: &mut Vec<String>) {
    match serde_json::from_str::<SubscriptionRequest>(text) {
        Ok(SubscriptionRequest::Subscribe { topics: new_topics }) => {
            debug!("Event client subscribed to {:?}", new_topics);
            *topics = new_topics;
        }
        Ok(SubscriptionRequest::Unsubscribe { topics: removed }) => {
            topics.retain(|t| !removed.contains(t));
        }
        Ok(SubscriptionRequest::Ping) => {}
        Err(e) => warn!("Ignoring malformed event client message: {}", e),
    }
}

fn should_send_event(event: &SystemEvent, topics: &[String]) -> bool {
    topics.iter().any(|topic| event.matches_topic(topic))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip_completed() -> SystemEvent {
        SystemEvent::ClipCompleted {
            source_id: "0".to_string(),
            path: "/videos/event_0_0.mjpeg".to_string(),
            completed_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_topic_filtering() {
        let event = clip_completed();
        assert!(!should_send_event(&event, &[]));
        assert!(should_send_event(&event, &["*".to_string()]));
        assert!(should_send_event(&event, &["recording.*".to_string()]));
        assert!(should_send_event(&event, &["recording.clip_completed".to_string()]));
        assert!(!should_send_event(&event, &["signaling.*".to_string()]));
    }

    #[test]
    fn test_subscription_requests() {
        let mut topics = Vec::new();
        apply_request(
            r#"{"type": "subscribe", "payload": {"topics": ["recording.*", "signaling.*"]}}"#,
            &mut topics,
        );
        assert_eq!(topics.len(), 2);

        apply_request(
            r#"{"type": "unsubscribe", "payload": {"topics": ["signaling.*"]}}"#,
            &mut topics,
        );
        assert_eq!(topics, vec!["recording.*".to_string()]);

        apply_request("not json", &mut topics);
        apply_request(r#"{"type": "ping"}"#, &mut topics);
        assert_eq!(topics.len(), 1);
    }
}
