//! Outgoing WebRTC video track
//!
//! The streaming sub-graph ends in a [`TrackSink`]: each sample the
//! sub-graph's worker thread pulls from its queue is written to a
//! `TrackLocalStaticSample`, which packetizes it for every bound peer.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, trace};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::StreamCodec;
use crate::error::{AppError, Result};
use crate::graph::{MediaSink, Sample};

/// RTP clock rate for video
pub const VIDEO_CLOCK_RATE: u32 = 90000;

pub fn mime_type(codec: StreamCodec) -> &'static str {
    match codec {
        StreamCodec::Vp8 => "video/VP8",
        StreamCodec::H264 => "video/H264",
    }
}

fn sdp_fmtp(codec: StreamCodec) -> &'static str {
    match codec {
        StreamCodec::Vp8 => "",
        StreamCodec::H264 => "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
    }
}

/// Create RTP codec capability for the outgoing track
pub fn codec_capability(codec: StreamCodec) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: mime_type(codec).to_string(),
        clock_rate: VIDEO_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: sdp_fmtp(codec).to_string(),
        rtcp_feedback: vec![],
    }
}

/// Sample track shared by the peer connection and the streaming sink
pub struct VideoTrack {
    codec: StreamCodec,
    track: Arc<TrackLocalStaticSample>,
}

impl VideoTrack {
    pub fn new(codec: StreamCodec, track_id: &str, stream_id: &str) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            codec_capability(codec),
            track_id.to_string(),
            stream_id.to_string(),
        ));
        Self { codec, track }
    }

    /// Get track as TrackLocal for peer connection
    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Sink writing into this track from a non-runtime thread
    pub fn sink(&self, handle: Handle) -> TrackSink {
        TrackSink {
            codec: self.codec,
            track: self.track.clone(),
            handle,
            frames: 0,
            bytes: 0,
        }
    }
}

/// Terminal stage of the streaming sub-graph
pub struct TrackSink {
    codec: StreamCodec,
    track: Arc<TrackLocalStaticSample>,
    handle: Handle,
    frames: u64,
    bytes: u64,
}

impl MediaSink for TrackSink {
    fn describe(&self) -> String {
        format!("webrtc-track codec={}", mime_type(self.codec))
    }

    fn write(&mut self, sample: &Sample) -> Result<()> {
        let media = webrtc::media::Sample {
            data: sample.data.clone(),
            duration: sample.duration,
            ..Default::default()
        };
        // Runs on the sub-graph worker thread, outside the runtime
        self.handle
            .block_on(self.track.write_sample(&media))
            .map_err(|e| AppError::WebRtcError(format!("write_sample failed: {}", e)))?;
        self.frames += 1;
        self.bytes += sample.data.len() as u64;
        trace!("Track sample {}: {} bytes", sample.sequence, sample.data.len());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        debug!(
            "Track sink finished: {} frames, {} bytes",
            self.frames, self.bytes
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_codec_capability() {
        let vp8 = codec_capability(StreamCodec::Vp8);
        assert_eq!(vp8.mime_type, "video/VP8");
        assert_eq!(vp8.clock_rate, VIDEO_CLOCK_RATE);
        assert!(codec_capability(StreamCodec::H264)
            .sdp_fmtp_line
            .contains("packetization-mode=1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sink_writes_from_worker_thread() {
        let track = VideoTrack::new(StreamCodec::Vp8, "video0", "vigil");
        let mut sink = track.sink(Handle::current());
        assert_eq!(sink.describe(), "webrtc-track codec=video/VP8");

        let written = std::thread::spawn(move || {
            // Unbound track: samples are accepted and dropped
            let sample = Sample::new(vec![0u8; 16], Duration::ZERO, Duration::from_millis(33), 0);
            sink.write(&sample).and_then(|_| sink.finish()).map(|_| sink.frames)
        })
        .join()
        .unwrap();
        assert_eq!(written.unwrap(), 1);
    }
}
