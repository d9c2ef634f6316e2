//! Wall clock used by the watchdogs

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Wall clock anchored on a monotonic base
///
/// The wall time is captured once and then advanced with a tokio `Instant`,
/// so the clock never jumps backwards and follows tokio's paused time in
/// tests.
#[derive(Clone, Copy)]
pub struct SessionClock {
    /// Wall time (since the Unix epoch) when the clock started
    base_wall: Duration,

    /// Monotonic instant matching `base_wall`
    base: Instant,
}

impl SessionClock {
    /// Create a new clock starting at the current system time
    pub fn new() -> Self {
        let base_wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::with_wall_base(base_wall)
    }

    /// Create a clock that reports `base_wall` right now
    pub fn with_wall_base(base_wall: Duration) -> Self {
        Self {
            base_wall,
            base: Instant::now(),
        }
    }

    /// Current wall time since the Unix epoch
    pub fn now(&self) -> Duration {
        self.base_wall + self.base.elapsed()
    }

    /// Time elapsed since the clock started
    pub fn elapsed(&self) -> Duration {
        self.base.elapsed()
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClock")
            .field("base_wall", &self.base_wall)
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_paused_time() {
        let clock = SessionClock::with_wall_base(Duration::from_secs(1_000));
        assert_eq!(clock.now(), Duration::from_secs(1_000));

        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(clock.now(), Duration::from_secs(1_031));
        assert_eq!(clock.elapsed(), Duration::from_secs(31));
    }

    #[test]
    fn test_clock_basic() {
        let clock = SessionClock::new();
        std::thread::sleep(Duration::from_millis(10));

        assert!(clock.now() > Duration::from_secs(1_500_000_000));
        assert!(clock.elapsed() >= Duration::from_millis(10));
    }
}
