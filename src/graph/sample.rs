//! Media samples and capabilities flowing through the live graph

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One encoded unit of media (typically one video frame)
///
/// Cloning is cheap: the payload is reference counted.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Encoded payload
    pub data: Bytes,
    /// Presentation timestamp relative to the source start
    pub pts: Duration,
    /// Sample duration
    pub duration: Duration,
    /// Monotonic sequence number assigned by the producer
    pub sequence: u64,
}

impl Sample {
    pub fn new(data: impl Into<Bytes>, pts: Duration, duration: Duration, sequence: u64) -> Self {
        Self {
            data: data.into(),
            pts,
            duration,
            sequence,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Negotiated stream capabilities of a flow point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caps {
    /// Media type, e.g. `image/jpeg` or `video/x-vp8`
    pub media_type: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Caps {
    pub fn new(media_type: impl Into<String>, width: u32, height: u32, fps: u32) -> Self {
        Self {
            media_type: media_type.into(),
            width,
            height,
            fps,
        }
    }

    /// Caps are usable for a downstream consumer only when fully fixed
    pub fn is_fixed(&self) -> bool {
        !self.media_type.is_empty() && self.width > 0 && self.height > 0 && self.fps > 0
    }

    /// Nominal duration of one sample at this frame rate
    pub fn frame_duration(&self) -> Duration {
        if self.fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / self.fps
        }
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},width={},height={},framerate={}/1",
            self.media_type, self.width, self.height, self.fps
        )
    }
}
