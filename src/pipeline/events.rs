//! Outbound status events for the hosting pipeline

use std::time::Duration;

use log::{debug, error, warn};
use tokio::sync::mpsc;

use crate::error::StatusCode;
use crate::pipeline::health::HealthSummary;

/// Event emitted by the session controller
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session error field went from zero to non-zero, or a start
    /// attempt failed
    Error {
        generation: u64,
        code: StatusCode,
        status: StatusCode,
        message: String,
    },
    StreamReady { generation: u64 },
    LatencyExceeded { generation: u64, latency: Duration },
    LatencyRecovered { generation: u64 },
    ConnectionStale { generation: u64, elapsed: Duration },
    ConnectionRecovered { generation: u64 },
    ConnectionFailed { generation: u64, elapsed: Duration },
    /// A restart was scheduled after `delay`
    Restarting { generation: u64, delay: Duration },
    /// A new generation was started
    Restarted { generation: u64 },
    EndOfStream,
    Stopped { summary: HealthSummary },
}

impl SessionEvent {
    /// Status code carried by the event, success for informational events
    pub fn code(&self) -> StatusCode {
        match self {
            SessionEvent::Error { code, .. } => *code,
            SessionEvent::LatencyExceeded { .. } => StatusCode::LATENCY_EXCEEDED,
            SessionEvent::ConnectionStale { .. } => StatusCode::CONNECTION_STALE,
            SessionEvent::ConnectionFailed { .. } => StatusCode::CONNECTION_FAILED,
            _ => StatusCode::SUCCESS,
        }
    }

    /// Events reporting a problem, never dropped for a slow observer
    pub fn is_alert(&self) -> bool {
        !self.code().is_success()
    }
}

/// Non-blocking sender for session events
///
/// The controller never waits on its observer. When the channel is full,
/// informational events are logged and dropped while alerts are handed to
/// a task that delivers them once the observer catches up.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SessionEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: SessionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) if event.is_alert() => self.defer(event),
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("EventSink: channel full, dropping {:?}", event);
            }
            // nobody listens anymore
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn defer(&self, event: SessionEvent) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("EventSink: channel full outside a runtime, alert lost: {:?}", event);
            return;
        };
        warn!("EventSink: channel full, delaying {:?}", event);
        let tx = self.tx.clone();
        runtime.spawn(async move {
            if let Err(e) = tx.send(event).await {
                debug!("EventSink: observer gone, {:?} discarded", e.0);
            }
        });
    }
}

/// Create an event sink and the receiving end handed to the host
pub fn channel(capacity: usize) -> (EventSink, mpsc::Receiver<SessionEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_channel_drops_event() {
        let (sink, mut rx) = channel(1);
        sink.emit(SessionEvent::StreamReady { generation: 1 });
        sink.emit(SessionEvent::EndOfStream);

        assert_eq!(rx.try_recv().unwrap(), SessionEvent::StreamReady { generation: 1 });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_alerts_wait_for_capacity() {
        let (sink, mut rx) = channel(1);
        let failed = SessionEvent::ConnectionFailed {
            generation: 1,
            elapsed: Duration::from_secs(20),
        };
        sink.emit(SessionEvent::StreamReady { generation: 1 });
        sink.emit(failed.clone());
        sink.emit(SessionEvent::LatencyRecovered { generation: 1 });

        assert_eq!(rx.recv().await.unwrap(), SessionEvent::StreamReady { generation: 1 });
        assert_eq!(rx.recv().await.unwrap(), failed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_alert_without_runtime_does_not_panic() {
        let (sink, mut rx) = channel(1);
        sink.emit(SessionEvent::EndOfStream);
        sink.emit(SessionEvent::LatencyExceeded {
            generation: 1,
            latency: Duration::from_secs(31),
        });
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::EndOfStream);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (sink, rx) = channel(4);
        drop(rx);
        sink.emit(SessionEvent::EndOfStream);
    }

    #[test]
    fn test_event_codes() {
        let event = SessionEvent::ConnectionFailed {
            generation: 2,
            elapsed: Duration::from_secs(20),
        };
        assert_eq!(event.code(), StatusCode::CONNECTION_FAILED);
        assert!(SessionEvent::EndOfStream.code().is_success());
        assert!(event.is_alert());
        assert!(!SessionEvent::Restarted { generation: 3 }.is_alert());
    }
}
