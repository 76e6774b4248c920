//! On-demand WebRTC streaming
//!
//! ```text
//! signaling server <──ws──> SignalingClient ──SESSION_OK──> PeerFactory::create
//!                                 │
//!                                 v
//!          GraphMutator::attach(distribution point, queue ! track sink)
//!                                 │
//!                                 v
//!                        TrackSink ──> RTCPeerConnection ──> browser
//! ```

pub mod client;
pub mod peer;
pub mod signaling;
pub mod track;

pub use client::{SignalingClient, StartStreamResponse, StreamStatus};
pub use peer::{PeerEndpoint, PeerFactory, RtcPeer, RtcPeerFactory};
pub use signaling::{ClientMessage, IceCandidate, ServerMessage, SignalingState};
pub use track::{TrackSink, VideoTrack};
