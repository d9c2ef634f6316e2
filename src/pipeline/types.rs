//! Core types for the pipeline system

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stream timestamp in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub nanos: u64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { nanos: 0 };

    /// Create a new timestamp from nanoseconds
    pub fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Create a new timestamp from milliseconds
    pub fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis.saturating_mul(1_000_000),
        }
    }

    /// Create a timestamp from a duration
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            nanos: duration.as_nanos() as u64,
        }
    }

    /// Convert to duration
    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.nanos)
    }

    /// Whole milliseconds, used for fragment timecode comparisons
    pub fn as_millis(&self) -> u64 {
        self.nanos / 1_000_000
    }

    /// Add a duration to this timestamp
    pub fn add(&self, duration: Duration) -> Self {
        Self {
            nanos: self.nanos.saturating_add(duration.as_nanos() as u64),
        }
    }

    /// Distance from `base`, zero if `base` is ahead
    pub fn since(&self, base: Timestamp) -> Self {
        Self {
            nanos: self.nanos.saturating_sub(base.nanos),
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ns", self.nanos)
    }
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
        }
    }
}

/// Which media kinds the session carries, fixed once tracks are known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    AudioVideo,
    VideoOnly,
    AudioOnly,
}

impl MediaType {
    /// Derive the media type from the number of registered tracks per kind
    pub fn from_track_counts(video: usize, audio: usize) -> Option<Self> {
        match (video > 0, audio > 0) {
            (true, true) => Some(MediaType::AudioVideo),
            (true, false) => Some(MediaType::VideoOnly),
            (false, true) => Some(MediaType::AudioOnly),
            (false, false) => None,
        }
    }

    pub fn requires_video(&self) -> bool {
        matches!(self, MediaType::AudioVideo | MediaType::VideoOnly)
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MediaType::AudioVideo => "audio+video",
            MediaType::VideoOnly => "video-only",
            MediaType::AudioOnly => "audio-only",
        };
        f.write_str(s)
    }
}

/// Upstream buffer flags that mark a frame as unusable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    pub corrupted: bool,
    pub decode_only: bool,
    /// Set when the only information the buffer carries is a discontinuity
    pub discont_only: bool,
}

/// Frame as delivered by an upstream track source
#[derive(Clone)]
pub struct MediaFrame {
    /// Encoded media payload
    pub data: Bytes,

    /// Presentation timestamp, frames without one are dropped
    pub pts: Option<Timestamp>,

    /// Decode timestamp, synthesized when missing
    pub dts: Option<Timestamp>,

    /// Whether the frame can be decoded on its own
    pub is_keyframe: bool,

    pub flags: BufferFlags,
}

impl MediaFrame {
    /// Create a new video frame
    pub fn video(data: Bytes, pts: Timestamp, dts: Timestamp, is_keyframe: bool) -> Self {
        Self {
            data,
            pts: Some(pts),
            dts: Some(dts),
            is_keyframe,
            flags: BufferFlags::default(),
        }
    }

    /// Create a new audio frame, audio DTS equals PTS
    pub fn audio(data: Bytes, pts: Timestamp) -> Self {
        Self {
            data,
            pts: Some(pts),
            dts: Some(pts),
            is_keyframe: true,
            flags: BufferFlags::default(),
        }
    }

    /// Frames the backend can never accept
    pub fn is_droppable(&self) -> bool {
        self.flags.corrupted || self.flags.decode_only || self.flags.discont_only || self.pts.is_none()
    }

    /// Get the size of the frame data in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for MediaFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaFrame")
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("is_keyframe", &self.is_keyframe)
            .field("flags", &self.flags)
            .field("size", &self.size())
            .finish()
    }
}

/// Ordered, normalized frame ready for submission to the backend
#[derive(Clone, PartialEq, Eq)]
pub struct OutgoingFrame {
    pub track_id: u64,
    pub kind: MediaKind,
    pub pts: Timestamp,
    pub dts: Timestamp,
    pub data: Bytes,
    pub is_keyframe: bool,
}

impl std::fmt::Debug for OutgoingFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingFrame")
            .field("track_id", &self.track_id)
            .field("kind", &self.kind)
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("is_keyframe", &self.is_keyframe)
            .field("size", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_conversions() {
        let ts = Timestamp::from_millis(1500);
        assert_eq!(ts.nanos, 1_500_000_000);
        assert_eq!(ts.as_millis(), 1500);
        assert_eq!(ts.as_duration(), Duration::from_millis(1500));
        assert_eq!(ts.add(Duration::from_millis(2)).as_millis(), 1502);
        assert_eq!(Timestamp::from_millis(100).since(ts), Timestamp::ZERO);
    }

    #[test]
    fn test_media_type_from_counts() {
        assert_eq!(MediaType::from_track_counts(1, 1), Some(MediaType::AudioVideo));
        assert_eq!(MediaType::from_track_counts(1, 0), Some(MediaType::VideoOnly));
        assert_eq!(MediaType::from_track_counts(0, 1), Some(MediaType::AudioOnly));
        assert_eq!(MediaType::from_track_counts(0, 0), None);
        assert!(!MediaType::AudioOnly.requires_video());
    }

    #[test]
    fn test_droppable_frames() {
        let mut frame = MediaFrame::audio(Bytes::from_static(b"aac"), Timestamp::ZERO);
        assert!(!frame.is_droppable());

        frame.flags.corrupted = true;
        assert!(frame.is_droppable());

        let mut frame = MediaFrame::audio(Bytes::from_static(b"aac"), Timestamp::ZERO);
        frame.pts = None;
        assert!(frame.is_droppable());
    }
}
