//! Event system for state notifications
//!
//! A process-wide event bus broadcasting recorder and signaling events to
//! any subscriber (persistence hand-off, logging, tests).

pub mod types;

pub use types::SystemEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event bus for broadcasting system events
///
/// Backed by a tokio broadcast channel; every active subscriber receives
/// every event.
///
/// # Example
///
/// ```no_run
/// use vigil::events::{EventBus, SystemEvent};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(SystemEvent::RecordingFailed {
///     source_id: "0".to_string(),
///     kind: "timeout".to_string(),
///     reason: "sub-graph did not attach".to_string(),
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Events published while nobody listens are dropped.
    pub fn publish(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// A subscriber that falls too far behind receives `Lagged` and misses
    /// events.
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SystemEvent::SignalingStateChanged {
            state: "connecting".to_string(),
            peer_id: Some("7".to_string()),
            reason: None,
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SystemEvent::SignalingStateChanged { .. }));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(SystemEvent::RecordingFailed {
            source_id: "0".to_string(),
            kind: "timeout".to_string(),
            reason: "test".to_string(),
        });
    }
}
