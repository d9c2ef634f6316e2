//! Stream backend boundary
//!
//! The transport that serializes frames and talks to the remote service is
//! not part of this crate. It is reached through [`StreamBackend`] and
//! reports back through a generation-tagged [`CallbackHandle`], so
//! callbacks from a torn-down stream can be recognized and discarded.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::{SinkConfig, StreamingType};
use crate::credentials::Credentials;
use crate::error::{Result, StatusCode};
use crate::pipeline::tracks::TrackInfo;
use crate::pipeline::types::{MediaKind, MediaType, OutgoingFrame, Timestamp};

pub const AUDIO_CODEC_ID: &str = "A_AAC";
pub const AUDIO_TRACK_NAME: &str = "audio";
pub const CONTENT_TYPE_AUDIO_VIDEO: &str = "video/h264,audio/aac";
pub const CONTENT_TYPE_AUDIO: &str = "audio/aac";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDefinition {
    pub track_id: u64,
    pub name: String,
    pub codec_id: String,
    pub kind: MediaKind,
}

/// Everything the backend needs to create a stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDefinition {
    pub stream_name: String,
    pub region: String,
    pub retention: Duration,
    pub kms_key_id: Option<String>,
    pub streaming_type: StreamingType,
    pub content_type: String,
    pub max_latency: Duration,
    pub fragment_duration: Duration,
    pub timecode_scale: Duration,
    pub key_frame_fragmentation: bool,
    pub frame_timecodes: bool,
    pub absolute_fragment_times: bool,
    pub fragment_acks: bool,
    pub restart_on_error: bool,
    pub recalculate_metrics: bool,
    pub framerate: u32,
    pub avg_bandwidth_bps: u32,
    pub buffer_duration: Duration,
    pub replay_duration: Duration,
    pub connection_staleness: Duration,
    pub storage_size_mb: u32,
    pub tags: BTreeMap<String, String>,
    pub tracks: Vec<TrackDefinition>,
}

impl StreamDefinition {
    /// Stream definition for the registered `tracks`.
    ///
    /// Content type, codec and fragmentation follow the media type: audio
    /// tracks always use AAC, and audio-only streams cannot fragment on key
    /// frames.
    pub fn derive(config: &SinkConfig, media_type: MediaType, tracks: &[TrackInfo], region: &str) -> Self {
        let (content_type, key_frame_fragmentation) = match media_type {
            MediaType::AudioVideo => (CONTENT_TYPE_AUDIO_VIDEO.to_string(), config.key_frame_fragmentation),
            MediaType::VideoOnly => (config.content_type.clone(), config.key_frame_fragmentation),
            MediaType::AudioOnly => (CONTENT_TYPE_AUDIO.to_string(), false),
        };

        let tracks = tracks
            .iter()
            .map(|track| match track.kind {
                MediaKind::Video => TrackDefinition {
                    track_id: track.track_id,
                    name: config.track_name.clone(),
                    codec_id: config.codec_id.clone(),
                    kind: MediaKind::Video,
                },
                MediaKind::Audio => TrackDefinition {
                    track_id: track.track_id,
                    name: AUDIO_TRACK_NAME.to_string(),
                    codec_id: AUDIO_CODEC_ID.to_string(),
                    kind: MediaKind::Audio,
                },
            })
            .collect();

        Self {
            stream_name: config.stream_name.clone(),
            region: region.to_string(),
            retention: Duration::from_secs(u64::from(config.retention_period_hours) * 3600),
            kms_key_id: config.kms_key_id.clone().filter(|k| !k.is_empty()),
            streaming_type: config.streaming_type,
            content_type,
            max_latency: config.max_latency(),
            fragment_duration: Duration::from_millis(config.fragment_duration_ms),
            timecode_scale: Duration::from_millis(config.timecode_scale_ms),
            key_frame_fragmentation,
            frame_timecodes: config.frame_timecodes,
            absolute_fragment_times: config.uses_absolute_fragment_times(),
            fragment_acks: config.fragment_acks,
            restart_on_error: config.restart_on_error,
            recalculate_metrics: config.recalculate_metrics,
            framerate: config.framerate,
            avg_bandwidth_bps: config.avg_bandwidth_bps,
            buffer_duration: Duration::from_secs(config.buffer_duration_seconds),
            replay_duration: Duration::from_secs(config.replay_duration_seconds),
            connection_staleness: config.connection_staleness(),
            storage_size_mb: config.storage_size_mb,
            tags: config.stream_tags.clone(),
            tracks,
        }
    }
}

/// Callback from the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    StreamReady,
    FrameAccepted { track_id: u64, timestamp: Timestamp },
    FrameRejected { track_id: u64, timestamp: Timestamp, code: StatusCode },
    ConnectionStale,
    FatalError(StatusCode),
}

/// Callback sink handed to the backend when a stream is created.
///
/// Every event is tagged with the generation the stream belongs to.
#[derive(Debug, Clone)]
pub struct CallbackHandle {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, BackendEvent)>,
}

impl CallbackHandle {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, BackendEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn send(&self, event: BackendEvent) {
        // the controller is gone, nothing left to notify
        let _ = self.tx.send((self.generation, event));
    }

    pub fn stream_ready(&self) {
        self.send(BackendEvent::StreamReady);
    }

    pub fn frame_accepted(&self, track_id: u64, timestamp: Timestamp) {
        self.send(BackendEvent::FrameAccepted { track_id, timestamp });
    }

    pub fn frame_rejected(&self, track_id: u64, timestamp: Timestamp, code: StatusCode) {
        self.send(BackendEvent::FrameRejected {
            track_id,
            timestamp,
            code,
        });
    }

    pub fn connection_stale(&self) {
        self.send(BackendEvent::ConnectionStale);
    }

    pub fn fatal_error(&self, code: StatusCode) {
        self.send(BackendEvent::FatalError(code));
    }
}

/// Factory for backend streams
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Create a stream. Fails with `BackendUnavailable` or `Authentication`.
    async fn create_stream(
        &self,
        definition: &StreamDefinition,
        credentials: &Credentials,
        callbacks: CallbackHandle,
    ) -> Result<Box<dyn BackendStream>>;
}

/// One live backend stream, owned by the controller for its generation
#[async_trait]
pub trait BackendStream: Send {
    /// Announce a track and its codec private data
    async fn start_track(&mut self, track_id: u64, codec_private_data: &Bytes) -> Result<(), StatusCode>;

    /// Queue a frame. Acceptance is reported later through the callbacks.
    fn put_frame(&mut self, frame: &OutgoingFrame) -> Result<(), StatusCode>;

    fn put_fragment_metadata(&mut self, name: &str, value: &str, persistent: bool) -> Result<(), StatusCode>;

    /// Tear the stream down, waiting for outstanding acks when `flush` is set
    async fn stop(&mut self, flush: bool);
}
