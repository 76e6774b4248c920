//! Triggered clip recording
//!
//! One [`RecordingSession`] per source keeps a lookback buffer of the most
//! recent samples and, when triggered, attaches a clip-writing sub-graph that
//! receives the buffered samples followed by live ones until its stop timer
//! runs out. [`MultiRecorder`] maps source ids to sessions.

pub mod lookback;
pub mod multi;
pub mod session;

pub use lookback::LookbackBuffer;
pub use multi::MultiRecorder;
pub use session::{RecordingSession, RecordingState, SessionSettings, SessionStatus};
