use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ConfigStore;
use crate::engine::Engine;
use crate::events::EventBus;

/// Application-wide state shared across handlers
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Graph, recorders and signaling
    pub engine: Arc<Engine>,
    /// Event bus for real-time notifications (the engine's)
    pub events: Arc<EventBus>,
    /// Cancelled once on shutdown; long-lived handlers watch it
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ConfigStore, engine: Arc<Engine>, shutdown: CancellationToken) -> Arc<Self> {
        let events = engine.events().clone();
        Arc::new(Self {
            config,
            engine,
            events,
            shutdown,
        })
    }
}
