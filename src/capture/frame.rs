use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::ops::Add;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Access unit with zero-copy payload
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded bytes - shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// Wall-clock time at which the device read completed
    pub captured_at: Timestamp,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_keyframe(&self) -> bool {
        self.meta.keyframe
    }
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub keyframe: bool,
}

/// Seconds + microseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(Duration);

impl Timestamp {
    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default(),
        )
    }

    pub fn from_secs_micros(secs: u64, micros: u32) -> Self {
        Self(Duration::from_secs(secs) + Duration::from_micros(u64::from(micros)))
    }

    pub fn secs(&self) -> u64 {
        self.0.as_secs()
    }

    pub fn subsec_micros(&self) -> u32 {
        self.0.subsec_micros()
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Elapsed time from `earlier`, zero if `earlier` is later
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs)
    }
}

impl From<Duration> for Timestamp {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

/// Stream formats we carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    H264,
    Mjpeg,
}

impl PixelFormat {
    /// Whether the payload is an Annex-B byte stream
    pub fn is_annexb(self) -> bool {
        matches!(self, PixelFormat::H264)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_parts() {
        let ts = Timestamp::from_secs_micros(12, 345_678);
        assert_eq!(ts.secs(), 12);
        assert_eq!(ts.subsec_micros(), 345_678);
    }

    #[test]
    fn test_timestamp_micros_carry_into_seconds() {
        let ts = Timestamp::from_secs_micros(1, 900_000) + Duration::from_micros(200_000);
        assert_eq!(ts.secs(), 2);
        assert_eq!(ts.subsec_micros(), 100_000);
    }

    #[test]
    fn test_saturating_since() {
        let a = Timestamp::from_secs_micros(5, 0);
        let b = Timestamp::from_secs_micros(5, 200_000);
        assert_eq!(b.saturating_since(a), Duration::from_millis(200));
        assert_eq!(a.saturating_since(b), Duration::ZERO);
    }
}
