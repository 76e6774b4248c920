//! System event types
//!
//! Events published by the recorder and the signaling client. The
//! persistence collaborator subscribes to `recording.clip_completed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System event enumeration
///
/// Serialized with the event name as tag:
/// ```json
/// {
///   "event": "recording.clip_completed",
///   "data": { "source_id": "0", "path": "/videos/event_0_0.mjpeg", "completed_at": "..." }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    // ============================================================================
    // Recording Events
    // ============================================================================
    /// Recording session changed state
    #[serde(rename = "recording.state_changed")]
    RecordingStateChanged {
        source_id: String,
        /// "idle", "starting", "recording" or "finishing"
        state: String,
        /// Clip being written, if any
        path: Option<String>,
    },

    /// A clip file is complete (end-of-stream observed, sink closed)
    #[serde(rename = "recording.clip_completed")]
    ClipCompleted {
        source_id: String,
        path: String,
        completed_at: DateTime<Utc>,
    },

    /// A recording could not be started or finished cleanly
    #[serde(rename = "recording.failed")]
    RecordingFailed {
        source_id: String,
        /// Error kind, see `AppError::kind`
        kind: String,
        reason: String,
    },

    // ============================================================================
    // Signaling Events
    // ============================================================================
    /// Signaling client changed state
    #[serde(rename = "signaling.state_changed")]
    SignalingStateChanged {
        /// "disconnected", "connecting", "negotiating", "connected" or "error"
        state: String,
        peer_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl SystemEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::RecordingStateChanged { .. } => "recording.state_changed",
            Self::ClipCompleted { .. } => "recording.clip_completed",
            Self::RecordingFailed { .. } => "recording.failed",
            Self::SignalingStateChanged { .. } => "signaling.state_changed",
        }
    }

    /// Check if event matches a topic pattern
    ///
    /// Supports `*` (all events), `prefix.*` and exact names.
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if topic.ends_with(".*") {
            let prefix = topic.trim_end_matches(".*");
            event_name.starts_with(prefix)
        } else {
            event_name == topic
        }
    }
}
