//! Health counters for a streaming session

use std::sync::atomic::{AtomicU64, Ordering};

/// Health metrics for a session
///
/// Counters survive restarts so the summary covers the whole session.
/// All fields use atomic operations for thread-safe access.
pub struct SessionHealth {
    /// Frames handed to the backend
    pub frames_submitted: AtomicU64,

    /// Frames the backend acknowledged
    pub frames_accepted: AtomicU64,

    /// Frames the backend rejected
    pub frames_rejected: AtomicU64,

    /// Frames dropped before submission (unusable, gated, not ready)
    pub frames_dropped: AtomicU64,

    /// Total bytes handed to the backend
    pub bytes_submitted: AtomicU64,

    /// Number of key frames handed to the backend
    pub keyframes_submitted: AtomicU64,

    /// Number of stream restarts
    pub restarts: AtomicU64,
}

impl SessionHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self {
            frames_submitted: AtomicU64::new(0),
            frames_accepted: AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            bytes_submitted: AtomicU64::new(0),
            keyframes_submitted: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }

    /// Record a frame handed to the backend
    pub fn record_submitted(&self, size: usize, is_keyframe: bool) {
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);
        self.bytes_submitted.fetch_add(size as u64, Ordering::Relaxed);
        if is_keyframe {
            self.keyframes_submitted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_accepted(&self) {
        self.frames_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped frame
    pub fn record_frame_drop(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted.load(Ordering::Relaxed)
    }

    pub fn frames_accepted(&self) -> u64 {
        self.frames_accepted.load(Ordering::Relaxed)
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn bytes_submitted(&self) -> u64 {
        self.bytes_submitted.load(Ordering::Relaxed)
    }

    pub fn keyframes_submitted(&self) -> u64 {
        self.keyframes_submitted.load(Ordering::Relaxed)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Calculate the rejection rate as a percentage of submitted frames
    pub fn rejection_rate(&self) -> f64 {
        let rejected = self.frames_rejected();
        let submitted = self.frames_submitted();
        if submitted == 0 {
            return 0.0;
        }
        (rejected as f64 / submitted as f64) * 100.0
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_submitted: self.frames_submitted(),
            frames_accepted: self.frames_accepted(),
            frames_rejected: self.frames_rejected(),
            frames_dropped: self.frames_dropped(),
            bytes_submitted: self.bytes_submitted(),
            keyframes_submitted: self.keyframes_submitted(),
            restarts: self.restarts(),
            rejection_rate: self.rejection_rate(),
        }
    }
}

impl Default for SessionHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSummary {
    pub frames_submitted: u64,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub frames_dropped: u64,
    pub bytes_submitted: u64,
    pub keyframes_submitted: u64,
    pub restarts: u64,
    pub rejection_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} frames submitted ({} accepted, {} rejected, {:.2}%), {} dropped, {} bytes, {} keyframes, {} restarts",
            self.frames_submitted,
            self.frames_accepted,
            self.frames_rejected,
            self.rejection_rate,
            self.frames_dropped,
            self.bytes_submitted,
            self.keyframes_submitted,
            self.restarts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics() {
        let health = SessionHealth::new();

        health.record_submitted(1000, true);
        health.record_submitted(2000, false);
        health.record_submitted(1500, false);
        health.record_accepted();
        health.record_accepted();

        assert_eq!(health.frames_submitted(), 3);
        assert_eq!(health.bytes_submitted(), 4500);
        assert_eq!(health.keyframes_submitted(), 1);
        assert_eq!(health.frames_accepted(), 2);
        assert_eq!(health.rejection_rate(), 0.0);

        health.record_rejected();
        health.record_frame_drop();
        health.record_restart();

        let summary = health.summary();
        assert_eq!(summary.frames_rejected, 1);
        assert_eq!(summary.frames_dropped, 1);
        assert_eq!(summary.restarts, 1);
        assert!(summary.rejection_rate > 33.0 && summary.rejection_rate < 34.0);
        assert!(summary.to_string().starts_with("Health: 3 frames submitted"));
    }
}
