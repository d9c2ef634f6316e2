//! Shared per-generation session state
//!
//! One `SessionState` exists per backend stream generation. The controller
//! owns it and hands out `Arc` references to the collector and to anything
//! monitoring the session. Lifecycle flags and status codes are atomics;
//! the timing fields sit behind a mutex so readers always see a consistent
//! snapshot.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use crate::error::StatusCode;
use crate::pipeline::types::{MediaType, Timestamp};

#[derive(Debug, Default, Clone, Copy)]
struct Timing {
    last_dts: Option<Timestamp>,
    last_pts: Option<Timestamp>,
    pts_base: Option<Timestamp>,
    /// Wall time at which the frame at `pts_base` was forwarded
    epoch_wall: Option<Duration>,
    last_acked: Option<Timestamp>,
    last_accepted_wall: Option<Duration>,
}

/// Consistent copy of the session fields
#[derive(Debug, Clone, Copy)]
pub struct SessionSnapshot {
    pub generation: u64,
    pub created: bool,
    pub ready: bool,
    pub invalidated: bool,
    pub status: StatusCode,
    pub error: StatusCode,
    pub media_type: Option<MediaType>,
    pub first_video_frame_seen: bool,
    pub last_dts: Option<Timestamp>,
    pub pts_base: Option<Timestamp>,
    pub last_acked: Option<Timestamp>,
    pub last_accepted_wall: Option<Duration>,
}

pub struct SessionState {
    generation: u64,
    absolute_timing: bool,
    created: AtomicBool,
    ready: AtomicBool,
    invalidated: AtomicBool,
    status_code: AtomicU32,
    error_code: AtomicU32,
    media_type: OnceLock<MediaType>,
    first_video_frame_seen: AtomicBool,
    timing: Mutex<Timing>,
}

impl SessionState {
    /// Fresh state for `generation`.
    ///
    /// `absolute_timing` makes stream timestamps wall-clock times;
    /// `pts_base` pre-seeds the presentation base (offline uploads with a
    /// file start time).
    pub fn new(generation: u64, absolute_timing: bool, pts_base: Option<Timestamp>) -> Self {
        Self {
            generation,
            absolute_timing,
            created: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
            status_code: AtomicU32::new(0),
            error_code: AtomicU32::new(0),
            media_type: OnceLock::new(),
            first_video_frame_seen: AtomicBool::new(false),
            timing: Mutex::new(Timing {
                pts_base,
                ..Timing::default()
            }),
        }
    }

    fn timing(&self) -> MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether an event tagged with `generation` may still touch this state
    pub fn accepts(&self, generation: u64) -> bool {
        generation == self.generation && !self.is_invalidated()
    }

    pub fn uses_absolute_timing(&self) -> bool {
        self.absolute_timing
    }

    // ── Lifecycle flags ─────────────────────────────────────────

    pub fn mark_created(&self) {
        self.created.store(true, Ordering::SeqCst);
    }

    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready && !self.is_invalidated(), Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Retire this generation. No frame or acknowledgment is accepted afterwards.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    // ── Status / error codes ────────────────────────────────────

    pub fn status(&self) -> StatusCode {
        StatusCode(self.status_code.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, code: StatusCode) {
        self.status_code.store(code.0, Ordering::SeqCst);
    }

    pub fn error_code(&self) -> StatusCode {
        StatusCode(self.error_code.load(Ordering::SeqCst))
    }

    /// Record a backend error.
    ///
    /// An unresolved error is only replaced by a strictly more severe one.
    /// Returns `true` when the error field went from zero to non-zero.
    pub fn record_error(&self, code: StatusCode) -> bool {
        if code.is_success() {
            return false;
        }
        self.set_status(code);

        let mut current = self.error_code.load(Ordering::SeqCst);
        loop {
            let replace = current == 0 || code.severity() > StatusCode(current).severity();
            if !replace {
                return false;
            }
            match self
                .error_code
                .compare_exchange(current, code.0, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(previous) => return previous == 0,
                Err(actual) => current = actual,
            }
        }
    }

    /// Clear `code` if it is still the unresolved error
    pub fn resolve_error(&self, code: StatusCode) -> bool {
        self.error_code
            .compare_exchange(code.0, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    // ── Media ───────────────────────────────────────────────────

    /// Fix the media type. The first value wins.
    pub fn set_media_type(&self, media_type: MediaType) -> MediaType {
        *self.media_type.get_or_init(|| media_type)
    }

    pub fn media_type(&self) -> Option<MediaType> {
        self.media_type.get().copied()
    }

    /// Returns `true` the first time it is called
    pub fn mark_first_video_frame(&self) -> bool {
        !self.first_video_frame_seen.swap(true, Ordering::SeqCst)
    }

    pub fn first_video_frame_seen(&self) -> bool {
        self.first_video_frame_seen.load(Ordering::SeqCst)
    }

    // ── Timing ──────────────────────────────────────────────────

    pub fn last_dts(&self) -> Option<Timestamp> {
        self.timing().last_dts
    }

    pub fn last_pts(&self) -> Option<Timestamp> {
        self.timing().last_pts
    }

    pub fn pts_base(&self) -> Option<Timestamp> {
        self.timing().pts_base
    }

    /// Presentation base, established by the first call
    pub fn establish_pts_base(&self, pts: Timestamp) -> Timestamp {
        *self.timing().pts_base.get_or_insert(pts)
    }

    /// Record a forwarded frame. DTS never moves backwards.
    pub fn record_forwarded(&self, pts: Timestamp, dts: Timestamp, now_wall: Duration) {
        let mut timing = self.timing();
        timing.last_dts = Some(timing.last_dts.map_or(dts, |last| last.max(dts)));
        timing.last_pts = Some(timing.last_pts.map_or(pts, |last| last.max(pts)));
        if timing.epoch_wall.is_none() {
            // wall time of the (normalized) base timestamp
            let offset = if self.absolute_timing {
                Duration::ZERO
            } else {
                pts.as_duration()
            };
            timing.epoch_wall = Some(now_wall.saturating_sub(offset));
        }
    }

    /// Record a backend acknowledgment of the frame at `timestamp`
    pub fn record_ack(&self, timestamp: Timestamp, now_wall: Duration) {
        let mut timing = self.timing();
        timing.last_acked = Some(timing.last_acked.map_or(timestamp, |last| last.max(timestamp)));
        timing.last_accepted_wall = Some(now_wall);
    }

    pub fn last_acked(&self) -> Option<Timestamp> {
        self.timing().last_acked
    }

    /// Wall time matching a normalized stream timestamp
    pub fn wall_time_of(&self, timestamp: Timestamp) -> Option<Duration> {
        if self.absolute_timing {
            return Some(timestamp.as_duration());
        }
        self.timing()
            .epoch_wall
            .map(|epoch| epoch + timestamp.as_duration())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let timing = *self.timing();
        SessionSnapshot {
            generation: self.generation,
            created: self.is_created(),
            ready: self.is_ready(),
            invalidated: self.is_invalidated(),
            status: self.status(),
            error: self.error_code(),
            media_type: self.media_type(),
            first_video_frame_seen: self.first_video_frame_seen(),
            last_dts: timing.last_dts,
            pts_base: timing.pts_base,
            last_acked: timing.last_acked,
            last_accepted_wall: timing.last_accepted_wall,
        }
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_not_clobbered() {
        let state = SessionState::new(1, false, None);

        assert!(state.record_error(StatusCode::BUFFER_FULL));
        // a less severe error does not overwrite the unresolved one
        assert!(!state.record_error(StatusCode::INVALID_TIMESTAMP));
        assert_eq!(state.error_code(), StatusCode::BUFFER_FULL);
        assert!(!state.record_error(StatusCode::SUCCESS));
        assert_eq!(state.error_code(), StatusCode::BUFFER_FULL);

        // a more severe one does
        assert!(!state.record_error(StatusCode::CODEC_MISMATCH));
        assert_eq!(state.error_code(), StatusCode::CODEC_MISMATCH);

        // resolving a code that is no longer current is a no-op
        assert!(!state.resolve_error(StatusCode::BUFFER_FULL));
        assert!(state.resolve_error(StatusCode::CODEC_MISMATCH));
        assert!(state.error_code().is_success());
    }

    #[test]
    fn test_invalidate_blocks_generation() {
        let state = SessionState::new(4, false, None);
        state.set_ready(true);
        assert!(state.accepts(4));
        assert!(!state.accepts(3));

        state.invalidate();
        assert!(!state.is_ready());
        assert!(!state.accepts(4));

        state.set_ready(true);
        assert!(!state.is_ready());
    }

    #[test]
    fn test_dts_is_monotonic() {
        let state = SessionState::new(1, false, None);
        let wall = Duration::from_secs(100);

        state.record_forwarded(Timestamp::from_millis(0), Timestamp::from_millis(200), wall);
        state.record_forwarded(Timestamp::from_millis(100), Timestamp::from_millis(100), wall);
        assert_eq!(state.last_dts(), Some(Timestamp::from_millis(200)));
    }

    #[test]
    fn test_wall_time_mapping() {
        let relative = SessionState::new(1, false, None);
        assert_eq!(relative.wall_time_of(Timestamp::ZERO), None);

        relative.record_forwarded(Timestamp::ZERO, Timestamp::ZERO, Duration::from_secs(50));
        assert_eq!(
            relative.wall_time_of(Timestamp::from_millis(1500)),
            Some(Duration::from_millis(51_500))
        );

        let absolute = SessionState::new(1, true, None);
        assert_eq!(
            absolute.wall_time_of(Timestamp::from_millis(7)),
            Some(Duration::from_millis(7))
        );
    }

    #[test]
    fn test_first_video_frame_flag_is_sticky() {
        let state = SessionState::new(1, false, None);
        assert!(!state.first_video_frame_seen());
        assert!(state.mark_first_video_frame());
        assert!(!state.mark_first_video_frame());
        assert!(state.first_video_frame_seen());

        assert_eq!(state.set_media_type(MediaType::AudioVideo), MediaType::AudioVideo);
        assert_eq!(state.set_media_type(MediaType::AudioOnly), MediaType::AudioVideo);
    }
}
