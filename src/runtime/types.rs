//! Buffer types flowing between software stages

use bytes::Bytes;
use std::time::{Duration, Instant};

use super::Caps;

/// Timestamp representation for media buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    /// Microseconds since the source started
    pub micros: i64,
}

impl Timestamp {
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from instant relative to base
    pub fn from_instant(instant: Instant, base: Instant) -> Self {
        Self {
            micros: instant.saturating_duration_since(base).as_micros() as i64,
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.micros.max(0) as u64)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}us", self.micros)
    }
}

/// One buffer of media data with its format
#[derive(Clone)]
pub struct Frame {
    /// Format of `data`
    pub caps: Caps,

    /// Raw, encoded or packetized payload
    pub data: Bytes,

    /// Presentation timestamp
    pub pts: Timestamp,

    /// Running buffer counter, starting at zero for each source
    pub sequence: u64,

    /// Whether this buffer can be decoded on its own
    pub is_keyframe: bool,

    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Create a raw video frame
    pub fn raw(data: Bytes, pts: Timestamp, sequence: u64, width: u32, height: u32) -> Self {
        Self {
            caps: Caps::RawVideo,
            data,
            pts,
            sequence,
            is_keyframe: true,
            width,
            height,
        }
    }

    /// Size of the payload in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("caps", &self.caps)
            .field("pts", &self.pts)
            .field("sequence", &self.sequence)
            .field("is_keyframe", &self.is_keyframe)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("size", &self.size())
            .finish()
    }
}
