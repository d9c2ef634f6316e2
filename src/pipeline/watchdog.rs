//! Latency and staleness watchdogs
//!
//! Watchdogs only judge elapsed wall time against their thresholds and
//! report verdict transitions. Recovery is the controller's decision.
//! All times are wall-clock durations since the Unix epoch as reported by
//! [`SessionClock`](crate::pipeline::clock::SessionClock).

use std::time::Duration;

use log::{info, warn};

/// Lower bound for the periodic evaluation interval
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogKind {
    Latency,
    Staleness,
}

impl std::fmt::Display for WatchdogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchdogKind::Latency => write!(f, "LatencyWatchdog"),
            WatchdogKind::Staleness => write!(f, "StalenessWatchdog"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Latency above budget
    Degraded,
    /// Nothing accepted for one staleness window
    Stale,
    /// Nothing accepted for two staleness windows
    Failed,
}

/// A verdict change reported to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub kind: WatchdogKind,
    pub from: Verdict,
    pub to: Verdict,
    /// Time since the last healthy observation
    pub elapsed: Duration,
}

/// Fresh input fed to the watchdogs
#[derive(Debug, Clone, Copy)]
pub enum Observation {
    /// The backend acknowledged a frame. `frame_wall` is the wall time the
    /// frame was produced at, when it can be mapped.
    FrameAccepted {
        now: Duration,
        frame_wall: Option<Duration>,
    },
    /// The backend itself reported a stalled connection
    ConnectionStale { now: Duration },
}

/// Flags the session when acknowledged frames lag behind wall time
#[derive(Debug, Clone)]
pub struct LatencyWatchdog {
    max_latency: Duration,
    /// Wall time of the newest acknowledged frame
    reference: Duration,
    last_healthy: Duration,
    verdict: Verdict,
}

impl LatencyWatchdog {
    pub fn new(max_latency: Duration, now: Duration) -> Self {
        Self {
            max_latency,
            reference: now,
            last_healthy: now,
            verdict: Verdict::Healthy,
        }
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn max_latency(&self) -> Duration {
        self.max_latency
    }

    /// Current lag between wall time and the newest acknowledged frame
    pub fn latency(&self, now: Duration) -> Duration {
        now.saturating_sub(self.reference)
    }

    pub fn tick(&mut self, now: Duration) -> Option<Transition> {
        let latency = self.latency(now);
        if self.verdict == Verdict::Healthy && latency > self.max_latency {
            return Some(self.enter(Verdict::Degraded, now));
        }
        None
    }

    pub fn on_ack(&mut self, now: Duration, frame_wall: Option<Duration>) -> Option<Transition> {
        let frame_wall = frame_wall.unwrap_or(now);
        self.reference = self.reference.max(frame_wall);

        let delay = now.saturating_sub(frame_wall);
        if delay <= self.max_latency {
            let transition = (self.verdict == Verdict::Degraded).then(|| self.enter(Verdict::Healthy, now));
            self.last_healthy = now;
            transition
        } else if self.verdict == Verdict::Healthy {
            Some(self.enter(Verdict::Degraded, now))
        } else {
            None
        }
    }

    pub fn reset(&mut self, now: Duration) {
        self.reference = now;
        self.last_healthy = now;
        self.verdict = Verdict::Healthy;
    }

    pub fn check_interval(&self) -> Duration {
        (self.max_latency / 4).max(MIN_CHECK_INTERVAL)
    }

    fn enter(&mut self, to: Verdict, now: Duration) -> Transition {
        let transition = Transition {
            kind: WatchdogKind::Latency,
            from: self.verdict,
            to,
            elapsed: now.saturating_sub(self.last_healthy),
        };
        self.verdict = to;
        match to {
            Verdict::Healthy => info!("LatencyWatchdog: latency back within {:?}", self.max_latency),
            _ => warn!(
                "LatencyWatchdog: latency {:?} exceeds {:?}",
                self.latency(now),
                self.max_latency
            ),
        }
        transition
    }
}

/// Flags the connection when the backend stops accepting frames
#[derive(Debug, Clone)]
pub struct StalenessWatchdog {
    threshold: Duration,
    last_accepted: Duration,
    stale_since: Option<Duration>,
    verdict: Verdict,
}

impl StalenessWatchdog {
    pub fn new(threshold: Duration, now: Duration) -> Self {
        Self {
            threshold,
            last_accepted: now,
            stale_since: None,
            verdict: Verdict::Healthy,
        }
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Time since the last accepted frame
    pub fn elapsed(&self, now: Duration) -> Duration {
        now.saturating_sub(self.last_accepted)
    }

    /// Advance at most one step: Healthy to Stale, or Stale to Failed.
    pub fn tick(&mut self, now: Duration) -> Option<Transition> {
        match self.verdict {
            Verdict::Healthy if self.elapsed(now) >= self.threshold => {
                self.stale_since = Some(self.last_accepted + self.threshold);
                Some(self.enter(Verdict::Stale, now))
            }
            Verdict::Stale => {
                let since = self.stale_since.unwrap_or(now);
                if now.saturating_sub(since) >= self.threshold {
                    Some(self.enter(Verdict::Failed, now))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// A frame was accepted. `Failed` is only left through [`reset`](Self::reset).
    pub fn on_accepted(&mut self, now: Duration) -> Option<Transition> {
        if self.verdict == Verdict::Failed {
            return None;
        }
        let transition = (self.verdict == Verdict::Stale).then(|| self.enter(Verdict::Healthy, now));
        self.last_accepted = self.last_accepted.max(now);
        self.stale_since = None;
        transition
    }

    /// Backend callback: the transport already knows the connection stalled
    pub fn force_stale(&mut self, now: Duration) -> Option<Transition> {
        if self.verdict != Verdict::Healthy {
            return None;
        }
        self.stale_since = Some(now);
        Some(self.enter(Verdict::Stale, now))
    }

    pub fn reset(&mut self, now: Duration) {
        self.last_accepted = now;
        self.stale_since = None;
        self.verdict = Verdict::Healthy;
    }

    pub fn check_interval(&self) -> Duration {
        (self.threshold / 4).max(MIN_CHECK_INTERVAL)
    }

    fn enter(&mut self, to: Verdict, now: Duration) -> Transition {
        let elapsed = self.elapsed(now);
        let transition = Transition {
            kind: WatchdogKind::Staleness,
            from: self.verdict,
            to,
            elapsed,
        };
        self.verdict = to;
        match to {
            Verdict::Healthy => info!("StalenessWatchdog: connection recovered"),
            Verdict::Failed => warn!("StalenessWatchdog: connection failed after {:?}", elapsed),
            _ => warn!("StalenessWatchdog: no frame accepted for {:?}", elapsed),
        }
        transition
    }
}

/// The two watchdog kinds behind one evaluation interface
#[derive(Debug, Clone)]
pub enum Watchdog {
    Latency(LatencyWatchdog),
    Staleness(StalenessWatchdog),
}

impl Watchdog {
    pub fn kind(&self) -> WatchdogKind {
        match self {
            Watchdog::Latency(_) => WatchdogKind::Latency,
            Watchdog::Staleness(_) => WatchdogKind::Staleness,
        }
    }

    pub fn verdict(&self) -> Verdict {
        match self {
            Watchdog::Latency(w) => w.verdict(),
            Watchdog::Staleness(w) => w.verdict(),
        }
    }

    /// Periodic evaluation against elapsed wall time
    pub fn evaluate(&mut self, now: Duration) -> Option<Transition> {
        match self {
            Watchdog::Latency(w) => w.tick(now),
            Watchdog::Staleness(w) => w.tick(now),
        }
    }

    pub fn observe(&mut self, observation: Observation) -> Option<Transition> {
        match (self, observation) {
            (Watchdog::Latency(w), Observation::FrameAccepted { now, frame_wall }) => {
                w.on_ack(now, frame_wall)
            }
            (Watchdog::Latency(_), Observation::ConnectionStale { .. }) => None,
            (Watchdog::Staleness(w), Observation::FrameAccepted { now, .. }) => w.on_accepted(now),
            (Watchdog::Staleness(w), Observation::ConnectionStale { now }) => w.force_stale(now),
        }
    }

    pub fn reset(&mut self, now: Duration) {
        match self {
            Watchdog::Latency(w) => w.reset(now),
            Watchdog::Staleness(w) => w.reset(now),
        }
    }

    pub fn check_interval(&self) -> Duration {
        match self {
            Watchdog::Latency(w) => w.check_interval(),
            Watchdog::Staleness(w) => w.check_interval(),
        }
    }

    pub fn last_healthy_observation(&self) -> Duration {
        match self {
            Watchdog::Latency(w) => w.last_healthy,
            Watchdog::Staleness(w) => w.last_accepted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_latency_degrades_and_recovers() {
        let start = secs(1_000);
        let mut watchdog = Watchdog::Latency(LatencyWatchdog::new(secs(30), start));

        assert_eq!(watchdog.evaluate(start + secs(30)), None);
        let degraded = watchdog.evaluate(start + secs(31)).unwrap();
        assert_eq!(degraded.from, Verdict::Healthy);
        assert_eq!(degraded.to, Verdict::Degraded);
        assert_eq!(degraded.elapsed, secs(31));

        // no repeated transition while degraded
        assert_eq!(watchdog.evaluate(start + secs(40)), None);

        let now = start + secs(41);
        let recovered = watchdog
            .observe(Observation::FrameAccepted {
                now,
                frame_wall: Some(now - secs(5)),
            })
            .unwrap();
        assert_eq!(recovered.to, Verdict::Healthy);
        assert_eq!(watchdog.verdict(), Verdict::Healthy);
        assert_eq!(watchdog.evaluate(now), None);
    }

    #[test]
    fn test_slow_ack_degrades() {
        let mut watchdog = LatencyWatchdog::new(secs(30), secs(0));
        let transition = watchdog.on_ack(secs(50), Some(secs(10)));
        assert_eq!(transition.map(|t| t.to), Some(Verdict::Degraded));

        // still slow, no new transition
        assert_eq!(watchdog.on_ack(secs(51), Some(secs(11))), None);
        assert_eq!(watchdog.verdict(), Verdict::Degraded);
    }

    #[test]
    fn test_latency_check_interval() {
        let watchdog = LatencyWatchdog::new(secs(60), secs(0));
        assert_eq!(watchdog.check_interval(), secs(15));

        let tiny = LatencyWatchdog::new(Duration::from_millis(20), secs(0));
        assert_eq!(tiny.check_interval(), MIN_CHECK_INTERVAL);
    }

    #[test]
    fn test_staleness_escalates_to_failed() {
        let mut watchdog = Watchdog::Staleness(StalenessWatchdog::new(secs(10), secs(0)));

        assert_eq!(watchdog.evaluate(secs(9)), None);
        let stale = watchdog.evaluate(secs(10)).unwrap();
        assert_eq!(stale.to, Verdict::Stale);

        assert_eq!(watchdog.evaluate(secs(19)), None);
        let failed = watchdog.evaluate(secs(20)).unwrap();
        assert_eq!(failed.from, Verdict::Stale);
        assert_eq!(failed.to, Verdict::Failed);
        assert_eq!(failed.elapsed, secs(20));

        // failed is terminal for the connection
        let ack = Observation::FrameAccepted {
            now: secs(21),
            frame_wall: None,
        };
        assert_eq!(watchdog.observe(ack), None);
        assert_eq!(watchdog.verdict(), Verdict::Failed);

        watchdog.reset(secs(30));
        assert_eq!(watchdog.verdict(), Verdict::Healthy);
        assert_eq!(watchdog.last_healthy_observation(), secs(30));
    }

    #[test]
    fn test_accepted_frame_clears_stale() {
        let mut watchdog = StalenessWatchdog::new(secs(10), secs(0));
        watchdog.tick(secs(12));
        assert_eq!(watchdog.verdict(), Verdict::Stale);

        let transition = watchdog.on_accepted(secs(15)).unwrap();
        assert_eq!(transition.to, Verdict::Healthy);

        // the window restarts at the accepted frame
        assert_eq!(watchdog.tick(secs(24)), None);
        assert_eq!(watchdog.tick(secs(25)).map(|t| t.to), Some(Verdict::Stale));
    }

    #[test]
    fn test_backend_reported_staleness() {
        let mut watchdog = Watchdog::Staleness(StalenessWatchdog::new(secs(10), secs(0)));
        let transition = watchdog.observe(Observation::ConnectionStale { now: secs(3) });
        assert_eq!(transition.map(|t| t.to), Some(Verdict::Stale));

        assert_eq!(watchdog.evaluate(secs(12)), None);
        assert_eq!(watchdog.evaluate(secs(13)).map(|t| t.to), Some(Verdict::Failed));

        // the latency watchdog ignores it
        let mut latency = Watchdog::Latency(LatencyWatchdog::new(secs(10), secs(0)));
        assert_eq!(latency.observe(Observation::ConnectionStale { now: secs(3) }), None);
        assert_eq!(latency.kind(), WatchdogKind::Latency);
    }
}
