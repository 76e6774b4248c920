//! Registry of recording sessions keyed by source id

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::session::{RecordingSession, SessionStatus};
use crate::error::{AppError, Result};

/// Routes `record(source_id)` to the session of that source
#[derive(Default)]
pub struct MultiRecorder {
    sessions: RwLock<BTreeMap<String, Arc<RecordingSession>>>,
}

impl MultiRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; a session already registered for the id is replaced
    pub fn register(&self, session: Arc<RecordingSession>) {
        let id = session.source_id().to_string();
        if let Some(previous) = self.sessions.write().insert(id.clone(), session) {
            previous.uninstall();
            info!("Replaced recorder for source '{}'", id);
        }
    }

    pub fn session(&self, source_id: &str) -> Result<Arc<RecordingSession>> {
        self.sessions
            .read()
            .get(source_id)
            .cloned()
            .ok_or_else(|| AppError::UnknownSource(source_id.to_string()))
    }

    /// Trigger a clip on `source_id`
    pub fn record(&self, source_id: &str) -> Result<PathBuf> {
        // Release the registry lock before a possibly blocking trigger
        let session = self.session(source_id)?;
        session.trigger()
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.sessions.read().values().map(|s| s.status()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Finish every running clip and unlink all sessions from their sources
    pub fn shutdown(&self) {
        for session in self.sessions.read().values() {
            session.finish_now();
            session.uninstall();
        }
    }
}
