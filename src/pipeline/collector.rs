//! Frame collector: merges per-track sources into one ordered sequence
//!
//! Every open track must have a pending frame before one is released, so
//! audio and video never drift apart because one side is late. The frame
//! with the smallest presentation timestamp goes first; frames of different
//! kinds that fall in the same millisecond are released video first so a
//! fragment never ends with an audio frame sharing the timecode of the next
//! fragment's key frame.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::pipeline::clock::SessionClock;
use crate::pipeline::health::SessionHealth;
use crate::pipeline::session::SessionState;
use crate::pipeline::types::{MediaFrame, MediaKind, MediaType, OutgoingFrame, Timestamp};

/// Duration assumed for a frame when its DTS has to be synthesized
pub const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(2);

/// Fragment-level tag delivered in-band by an upstream source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentMetadata {
    pub name: String,
    pub value: String,
    pub persistent: bool,
}

/// Item pulled from an upstream track source
#[derive(Debug, Clone)]
pub enum SourceItem {
    /// Codec private data, normally sent once before the first frame
    CodecData(Bytes),
    Frame(MediaFrame),
    Metadata(FragmentMetadata),
}

/// Per-track pull source
///
/// `recv` must be cancel-safe: the collector is polled inside `select!`.
#[async_trait]
pub trait TrackSource: Send {
    /// Next item, `None` once the track reached end of stream
    async fn recv(&mut self) -> Option<SourceItem>;
}

#[async_trait]
impl TrackSource for mpsc::Receiver<SourceItem> {
    async fn recv(&mut self) -> Option<SourceItem> {
        mpsc::Receiver::recv(self).await
    }
}

/// Output of the collector
#[derive(Debug, Clone)]
pub enum Collected {
    CodecData { track_id: u64, data: Bytes },
    Metadata { track_id: u64, metadata: FragmentMetadata },
    Frame(OutgoingFrame),
}

/// Timestamp handling options taken from the session configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingMode {
    /// Pass timestamps through untouched
    pub absolute: bool,
    /// Offline upload: DTS is always synthesized
    pub offline: bool,
    /// Added to every PTS (offline uploads with a file start time)
    pub pts_offset: Option<Timestamp>,
}

struct CollectedTrack {
    track_id: u64,
    kind: MediaKind,
    source: Box<dyn TrackSource>,
    pending: Option<MediaFrame>,
    /// Last raw PTS released from this track
    last_released: Option<Timestamp>,
    open: bool,
}

pub struct FrameCollector {
    tracks: Vec<CollectedTrack>,
    /// Items that bypass ordering (codec data, metadata)
    side_items: Vec<Collected>,
    session: Option<Arc<SessionState>>,
    timing: TimingMode,
    clock: SessionClock,
    health: Arc<SessionHealth>,
    frames_gated: u64,
}

impl FrameCollector {
    pub fn new(timing: TimingMode, clock: SessionClock, health: Arc<SessionHealth>) -> Self {
        Self {
            tracks: Vec::new(),
            side_items: Vec::new(),
            session: None,
            timing,
            clock,
            health,
            frames_gated: 0,
        }
    }

    /// Add a track. Registration order is the tie-breaker for equal timestamps.
    pub fn add_track(&mut self, track_id: u64, kind: MediaKind, source: Box<dyn TrackSource>) {
        self.tracks.push(CollectedTrack {
            track_id,
            kind,
            source,
            pending: None,
            last_released: None,
            open: true,
        });
    }

    /// Bind the collector to a new session generation.
    ///
    /// Key-frame gating and timestamp normalization restart with the new
    /// generation; frames already pending stay queued.
    pub fn attach(&mut self, session: Arc<SessionState>) {
        self.session = Some(session);
        for track in &mut self.tracks {
            track.last_released = None;
        }
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Whether any source can still deliver frames
    pub fn is_open(&self) -> bool {
        self.tracks.iter().any(|t| t.open || t.pending.is_some()) || !self.side_items.is_empty()
    }

    /// Number of frames discarded while waiting for the first key frame
    pub fn frames_gated(&self) -> u64 {
        self.frames_gated
    }

    /// Next collected item, `None` once every source is exhausted.
    ///
    /// Cancel-safe: anything received before cancellation stays queued.
    pub async fn next(&mut self) -> Option<Collected> {
        loop {
            if !self.side_items.is_empty() {
                return Some(self.side_items.remove(0));
            }

            // wait until every open track has a pending frame
            let waiting = self.tracks.iter().position(|t| t.open && t.pending.is_none());
            if let Some(idx) = waiting {
                self.pull(idx).await;
                continue;
            }

            let idx = self.select_next()?;
            let Some(frame) = self.tracks[idx].pending.take() else {
                continue;
            };
            if let Some(out) = self.release(idx, frame) {
                return Some(Collected::Frame(out));
            }
        }
    }

    async fn pull(&mut self, idx: usize) {
        let track = &mut self.tracks[idx];
        match track.source.recv().await {
            Some(SourceItem::Frame(frame)) => {
                if frame.is_droppable() {
                    debug!("FrameCollector: dropping unusable frame on track {}", track.track_id);
                    self.health.record_frame_drop();
                } else {
                    track.pending = Some(frame);
                }
            }
            Some(SourceItem::CodecData(data)) => {
                self.side_items.push(Collected::CodecData {
                    track_id: track.track_id,
                    data,
                });
            }
            Some(SourceItem::Metadata(metadata)) => {
                self.side_items.push(Collected::Metadata {
                    track_id: track.track_id,
                    metadata,
                });
            }
            None => {
                info!("FrameCollector: track {} reached end of stream", track.track_id);
                track.open = false;
            }
        }
    }

    /// Index of the track whose pending frame is due first
    fn select_next(&self) -> Option<usize> {
        let mut best: Option<(usize, Timestamp, MediaKind)> = None;

        for (idx, track) in self.tracks.iter().enumerate() {
            let Some(pts) = track.pending.as_ref().and_then(|f| f.pts) else {
                continue;
            };
            best = match best {
                None => Some((idx, pts, track.kind)),
                Some((best_idx, best_pts, best_kind)) => {
                    if Self::goes_before(pts, track.kind, best_pts, best_kind) {
                        Some((idx, pts, track.kind))
                    } else {
                        Some((best_idx, best_pts, best_kind))
                    }
                }
            };
        }

        best.map(|(idx, _, _)| idx)
    }

    /// Strict ordering between a candidate and the current best.
    /// Registration order wins when this returns `false` for both.
    fn goes_before(pts: Timestamp, kind: MediaKind, other: Timestamp, other_kind: MediaKind) -> bool {
        if kind != other_kind && pts.as_millis() == other.as_millis() {
            return kind == MediaKind::Video;
        }
        pts < other
    }

    /// Apply gating, monotonicity and normalization to a selected frame
    fn release(&mut self, idx: usize, frame: MediaFrame) -> Option<OutgoingFrame> {
        let track_id = self.tracks[idx].track_id;
        let kind = self.tracks[idx].kind;
        let raw_pts = frame.pts?;

        let Some(session) = self.session.clone() else {
            warn!("FrameCollector: no session attached, dropping frame on track {}", track_id);
            self.health.record_frame_drop();
            return None;
        };

        if let Some(last) = self.tracks[idx].last_released
            && raw_pts < last
        {
            warn!(
                "FrameCollector: track {} went back in time ({} < {}), dropping frame",
                track_id, raw_pts, last
            );
            self.health.record_frame_drop();
            return None;
        }

        let media_type = session.media_type().unwrap_or(MediaType::VideoOnly);
        if media_type.requires_video() && !session.first_video_frame_seen() {
            if kind == MediaKind::Video && frame.is_keyframe {
                session.mark_first_video_frame();
                info!("FrameCollector: first video key frame at {}", raw_pts);
            } else {
                self.frames_gated += 1;
                self.health.record_frame_drop();
                return None;
            }
        }

        self.tracks[idx].last_released = Some(raw_pts);

        let (pts, dts) = self.normalize(&session, raw_pts, frame.dts);
        session.record_forwarded(pts, dts, self.clock.now());

        let is_keyframe = match media_type {
            MediaType::AudioVideo => kind == MediaKind::Video && frame.is_keyframe,
            _ => frame.is_keyframe,
        };

        Some(OutgoingFrame {
            track_id,
            kind,
            pts,
            dts,
            data: frame.data,
            is_keyframe,
        })
    }

    fn normalize(&self, session: &SessionState, raw_pts: Timestamp, raw_dts: Option<Timestamp>) -> (Timestamp, Timestamp) {
        let synthesized = || {
            session
                .last_dts()
                .map_or(Timestamp::ZERO, |last| last.add(DEFAULT_FRAME_DURATION))
        };

        if let Some(offset) = self.timing.pts_offset {
            let pts = raw_pts.add(offset.as_duration());
            return (pts, synthesized());
        }

        if self.timing.absolute {
            let dts = match raw_dts {
                Some(dts) if !self.timing.offline => dts,
                _ => synthesized(),
            };
            return (raw_pts, dts);
        }

        let base = session.establish_pts_base(raw_pts);
        let pts = raw_pts.since(base);
        let dts = match raw_dts {
            Some(dts) if !self.timing.offline => dts.since(base),
            _ => synthesized(),
        };
        (pts, dts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(ms: u64, key: bool) -> SourceItem {
        let ts = Timestamp::from_millis(ms);
        SourceItem::Frame(MediaFrame::video(Bytes::from_static(b"h264"), ts, ts, key))
    }

    fn audio(ms: u64) -> SourceItem {
        SourceItem::Frame(MediaFrame::audio(Bytes::from_static(b"aac"), Timestamp::from_millis(ms)))
    }

    fn collector(
        timing: TimingMode,
        media_type: MediaType,
    ) -> (FrameCollector, Arc<SessionState>) {
        let health = Arc::new(SessionHealth::new());
        let mut collector = FrameCollector::new(timing, SessionClock::new(), health);
        let session = Arc::new(SessionState::new(1, timing.absolute, None));
        session.set_media_type(media_type);
        collector.attach(session.clone());
        (collector, session)
    }

    async fn drain(collector: &mut FrameCollector) -> Vec<OutgoingFrame> {
        let mut out = Vec::new();
        while let Some(item) = collector.next().await {
            if let Collected::Frame(frame) = item {
                out.push(frame);
            }
        }
        out
    }

    fn feed(items: Vec<SourceItem>) -> Box<dyn TrackSource> {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.try_send(item).unwrap();
        }
        Box::new(rx)
    }

    #[tokio::test]
    async fn test_interleaves_video_first_on_ties() {
        let (mut collector, session) = collector(TimingMode::default(), MediaType::AudioVideo);
        collector.add_track(1, MediaKind::Video, feed(vec![video(0, true), video(100, false), video(200, false)]));
        collector.add_track(2, MediaKind::Audio, feed(vec![audio(0), audio(100), audio(200)]));

        let out = drain(&mut collector).await;
        let order: Vec<(u64, u64)> = out.iter().map(|f| (f.track_id, f.pts.as_millis())).collect();
        assert_eq!(
            order,
            vec![(1, 0), (2, 0), (1, 100), (2, 100), (1, 200), (2, 200)]
        );
        assert!(out[0].is_keyframe);
        assert!(!out[1].is_keyframe);
        assert!(session.first_video_frame_seen());
    }

    #[tokio::test]
    async fn test_audio_first_registration_still_prefers_video() {
        let (mut collector, _) = collector(TimingMode::default(), MediaType::AudioVideo);
        collector.add_track(1, MediaKind::Audio, feed(vec![audio(0), audio(40)]));
        collector.add_track(2, MediaKind::Video, feed(vec![video(0, true), video(40, false)]));

        let out = drain(&mut collector).await;
        let kinds: Vec<MediaKind> = out.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![MediaKind::Video, MediaKind::Audio, MediaKind::Video, MediaKind::Audio]
        );
    }

    #[tokio::test]
    async fn test_output_is_non_decreasing() {
        let (mut collector, _) = collector(TimingMode::default(), MediaType::AudioVideo);
        collector.add_track(
            1,
            MediaKind::Video,
            feed(vec![video(0, true), video(33, false), video(20, false), video(66, false)]),
        );
        collector.add_track(2, MediaKind::Audio, feed(vec![audio(10), audio(30), audio(50), audio(70)]));

        let out = drain(&mut collector).await;
        assert!(out.windows(2).all(|w| w[0].pts <= w[1].pts));
        // the out-of-order 20ms video frame is dropped
        assert_eq!(out.len(), 7);
    }

    #[tokio::test]
    async fn test_same_millisecond_audio_is_kept() {
        let (mut collector, _) = collector(TimingMode::default(), MediaType::AudioVideo);
        let video_at = |nanos: u64, key: bool| {
            let ts = Timestamp::from_nanos(nanos);
            SourceItem::Frame(MediaFrame::video(Bytes::from_static(b"h264"), ts, ts, key))
        };
        collector.add_track(
            1,
            MediaKind::Video,
            feed(vec![video_at(0, true), video_at(100_500_000, false), video_at(200_000_000, false)]),
        );
        collector.add_track(2, MediaKind::Audio, feed(vec![audio(50), audio(100), audio(150)]));

        let out = drain(&mut collector).await;
        let order: Vec<(u64, u64)> = out.iter().map(|f| (f.track_id, f.pts.nanos)).collect();
        assert_eq!(
            order,
            vec![
                (1, 0),
                (2, 50_000_000),
                (1, 100_500_000),
                (2, 100_000_000),
                (2, 150_000_000),
                (1, 200_000_000)
            ]
        );
    }

    #[tokio::test]
    async fn test_frames_before_first_key_frame_are_gated() {
        let (mut collector, session) = collector(TimingMode::default(), MediaType::AudioVideo);
        collector.add_track(
            1,
            MediaKind::Video,
            feed(vec![video(0, false), video(100, false), video(200, true), video(300, false)]),
        );
        collector.add_track(2, MediaKind::Audio, feed(vec![audio(0), audio(100), audio(200), audio(300)]));

        let out = drain(&mut collector).await;
        assert_eq!(collector.frames_gated(), 4);
        assert_eq!(out[0].track_id, 1);
        assert!(out[0].is_keyframe);
        // the base is the first forwarded frame
        assert_eq!(out[0].pts, Timestamp::ZERO);
        assert_eq!(session.pts_base(), Some(Timestamp::from_millis(200)));
        assert_eq!(out.last().map(|f| f.pts.as_millis()), Some(100));
    }

    #[tokio::test]
    async fn test_audio_only_is_not_gated() {
        let (mut collector, session) = collector(TimingMode::default(), MediaType::AudioOnly);
        collector.add_track(1, MediaKind::Audio, feed(vec![audio(5), audio(25)]));

        let out = drain(&mut collector).await;
        assert_eq!(out.len(), 2);
        assert!(!session.first_video_frame_seen());
        assert_eq!(out[1].pts, Timestamp::from_millis(20));
    }

    #[tokio::test]
    async fn test_absolute_timing_passes_through() {
        let timing = TimingMode {
            absolute: true,
            ..Default::default()
        };
        let (mut collector, _) = collector(timing, MediaType::VideoOnly);
        collector.add_track(1, MediaKind::Video, feed(vec![video(5_000, true), video(5_040, false)]));

        let out = drain(&mut collector).await;
        assert_eq!(out[0].pts, Timestamp::from_millis(5_000));
        assert_eq!(out[1].dts, Timestamp::from_millis(5_040));
    }

    #[tokio::test]
    async fn test_offline_start_time_offsets_and_synthesizes_dts() {
        let timing = TimingMode {
            absolute: true,
            offline: true,
            pts_offset: Some(Timestamp::from_millis(1_000_000)),
        };
        let (mut collector, _) = collector(timing, MediaType::VideoOnly);
        collector.add_track(1, MediaKind::Video, feed(vec![video(0, true), video(40, false)]));

        let out = drain(&mut collector).await;
        assert_eq!(out[0].pts, Timestamp::from_millis(1_000_000));
        assert_eq!(out[1].pts, Timestamp::from_millis(1_000_040));
        assert_eq!(out[0].dts, Timestamp::ZERO);
        assert_eq!(out[1].dts, Timestamp::from_millis(2));
    }

    #[tokio::test]
    async fn test_side_items_bypass_ordering() {
        let (mut collector, _) = collector(TimingMode::default(), MediaType::VideoOnly);
        collector.add_track(
            1,
            MediaKind::Video,
            feed(vec![
                SourceItem::CodecData(Bytes::from_static(&[1, 2, 3])),
                video(0, true),
                SourceItem::Metadata(FragmentMetadata {
                    name: "camera".into(),
                    value: "front".into(),
                    persistent: true,
                }),
            ]),
        );

        assert!(matches!(collector.next().await, Some(Collected::CodecData { track_id: 1, .. })));
        assert!(matches!(collector.next().await, Some(Collected::Frame(_))));
        assert!(matches!(collector.next().await, Some(Collected::Metadata { track_id: 1, .. })));
        assert!(collector.next().await.is_none());
        assert!(!collector.is_open());
    }

    #[tokio::test]
    async fn test_waits_for_every_open_track() {
        let (mut collector, _) = collector(TimingMode::default(), MediaType::AudioVideo);
        let (video_tx, video_rx) = mpsc::channel(8);
        let (audio_tx, audio_rx) = mpsc::channel(8);
        collector.add_track(1, MediaKind::Video, Box::new(video_rx));
        collector.add_track(2, MediaKind::Audio, Box::new(audio_rx));

        video_tx.send(video(0, true)).await.unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(20), collector.next()).await;
        assert!(pending.is_err(), "must not release without an audio frame");

        audio_tx.send(audio(0)).await.unwrap();
        let next = collector.next().await;
        assert!(matches!(next, Some(Collected::Frame(f)) if f.track_id == 1));
    }
    #[tokio::test]
    async fn test_collects_on_a_spawned_task() {
        let (mut collector, _) = collector(TimingMode::default(), MediaType::AudioVideo);
        collector.add_track(1, MediaKind::Video, feed(vec![video(0, true), video(40, false)]));
        collector.add_track(2, MediaKind::Audio, feed(vec![audio(0), audio(20)]));

        let frames = tokio::spawn(async move { drain(&mut collector).await }).await.unwrap();
        assert_eq!(frames.len(), 4);
    }
}
