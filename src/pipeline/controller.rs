//! Session controller
//!
//! Owns the backend stream, the per-generation [`SessionState`] and both
//! watchdogs. Frames come from the [`FrameCollector`], backend callbacks
//! arrive tagged with the generation they belong to, and the controller
//! decides between continuing, halting and restarting.
//!
//! A restart invalidates the current generation before the stream is torn
//! down, so late callbacks of the old stream are ignored.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SinkConfig;
use crate::credentials::{CredentialProvider, acquire_credentials};
use crate::error::{Result, Severity, SinkError, StatusCode};
use crate::pipeline::backend::{BackendEvent, BackendStream, CallbackHandle, StreamBackend, StreamDefinition};
use crate::pipeline::clock::SessionClock;
use crate::pipeline::collector::{Collected, FrameCollector, TimingMode, TrackSource};
use crate::pipeline::events::{EventSink, SessionEvent};
use crate::pipeline::health::{HealthSummary, SessionHealth};
use crate::pipeline::session::SessionState;
use crate::pipeline::state::ControllerState;
use crate::pipeline::tracks::{CodecDataUpdate, TrackRegistry};
use crate::pipeline::types::{MediaKind, OutgoingFrame, Timestamp};
use crate::pipeline::watchdog::{
    LatencyWatchdog, Observation, StalenessWatchdog, Transition, Verdict, Watchdog, WatchdogKind,
};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound for the periodic evaluation, keeps the ready timeout precise
const MAX_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// What happened to a submitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Handed to the backend
    Submitted,
    /// The stream is not ready, the frame was discarded
    Dropped,
    /// Refused by the backend, the error policy was applied
    Rejected(StatusCode),
}

pub struct SessionController {
    config: Arc<SinkConfig>,
    credentials: Arc<dyn CredentialProvider>,
    backend: Arc<dyn StreamBackend>,
    registry: TrackRegistry,
    collector: FrameCollector,
    session: Option<Arc<SessionState>>,
    stream: Option<Box<dyn BackendStream>>,
    generation: u64,
    watchdogs: Vec<Watchdog>,
    events: EventSink,
    health: Arc<SessionHealth>,
    clock: SessionClock,
    state: ControllerState,
    callback_tx: mpsc::UnboundedSender<(u64, BackendEvent)>,
    callback_rx: mpsc::UnboundedReceiver<(u64, BackendEvent)>,
    restart_delay: Duration,
    /// Wall time by which the backend must report ready
    ready_deadline: Option<Duration>,
    halted: Option<StatusCode>,
    /// Cancelled when the host shuts the session down, interrupts backoff waits
    shutdown: CancellationToken,
}

impl SessionController {
    pub fn new(
        config: SinkConfig,
        credentials: Arc<dyn CredentialProvider>,
        backend: Arc<dyn StreamBackend>,
        events: EventSink,
    ) -> Result<Self> {
        config.validate()?;

        let clock = SessionClock::new();
        let health = Arc::new(SessionHealth::new());
        let timing = TimingMode {
            absolute: config.uses_absolute_fragment_times(),
            offline: config.is_offline(),
            pts_offset: config.pts_offset(),
        };
        let collector = FrameCollector::new(timing, clock, health.clone());

        let now = clock.now();
        let mut watchdogs = Vec::with_capacity(2);
        // offline uploads carry timestamps far in the past
        if !config.is_offline() {
            watchdogs.push(Watchdog::Latency(LatencyWatchdog::new(config.max_latency(), now)));
        }
        watchdogs.push(Watchdog::Staleness(StalenessWatchdog::new(
            config.connection_staleness(),
            now,
        )));

        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let restart_delay = config.restart_policy.initial_delay();

        Ok(Self {
            config: Arc::new(config),
            credentials,
            backend,
            registry: TrackRegistry::new(),
            collector,
            session: None,
            stream: None,
            generation: 0,
            watchdogs,
            events,
            health,
            clock,
            state: ControllerState::Uninitialized,
            callback_tx,
            callback_rx,
            restart_delay,
            ready_deadline: None,
            halted: None,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Generation of the current (or last attempted) stream
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session(&self) -> Option<Arc<SessionState>> {
        self.session.clone()
    }

    pub fn health(&self) -> &Arc<SessionHealth> {
        &self.health
    }

    pub fn registry(&self) -> &TrackRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    /// Delay applied before the next restart attempt
    pub fn restart_delay(&self) -> Duration {
        self.restart_delay
    }

    pub fn verdict(&self, kind: WatchdogKind) -> Option<Verdict> {
        self.watchdogs.iter().find(|w| w.kind() == kind).map(Watchdog::verdict)
    }

    /// Register an upstream track. Tracks are fixed once the session starts.
    pub fn add_track(&mut self, kind: MediaKind, source: Box<dyn TrackSource>) -> Result<u64> {
        if self.state != ControllerState::Uninitialized {
            return Err(self.invalid_state("add tracks"));
        }
        let track_id = self.registry.register(kind)?;
        self.collector.add_track(track_id, kind, source);
        info!("SessionController: registered {} track {}", kind, track_id);
        Ok(track_id)
    }

    /// Create the first stream generation
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ControllerState::Uninitialized {
            return Err(self.invalid_state("start"));
        }
        self.start_generation().await
    }

    async fn start_generation(&mut self) -> Result<()> {
        let media_type = self
            .registry
            .media_type()
            .ok_or_else(|| SinkError::Config("no track registered".into()))?;

        let credentials = acquire_credentials(self.credentials.as_ref(), self.config.credential_timeout()).await?;
        let definition = StreamDefinition::derive(
            &self.config,
            media_type,
            self.registry.tracks(),
            &self.config.aws_region,
        );

        self.generation += 1;
        let generation = self.generation;
        let callbacks = CallbackHandle::new(generation, self.callback_tx.clone());
        let stream = self
            .backend
            .create_stream(&definition, &credentials, callbacks)
            .await
            .map_err(|e| match e {
                SinkError::Authentication(_) | SinkError::BackendUnavailable(_) => e,
                other => SinkError::BackendUnavailable(other.to_string()),
            })?;

        let session = Arc::new(SessionState::new(
            generation,
            self.config.uses_absolute_fragment_times(),
            self.config.pts_offset(),
        ));
        session.set_media_type(media_type);
        session.mark_created();
        self.collector.attach(session.clone());
        self.session = Some(session);
        self.stream = Some(stream);
        self.transition(ControllerState::Starting);

        let now = self.clock.now();
        for watchdog in &mut self.watchdogs {
            watchdog.reset(now);
        }
        self.ready_deadline = Some(now + self.config.ready_timeout());
        info!(
            "SessionController: stream {} created ({}, generation {})",
            definition.stream_name, media_type, generation
        );

        // replay codec data cached by earlier generations
        for (track_id, codec_private_data) in self.registry.codec_data_snapshot() {
            self.start_track(track_id, &codec_private_data).await?;
        }
        Ok(())
    }

    /// Announce a track to the backend, retrying with a doubling delay
    async fn start_track(&mut self, track_id: u64, codec_private_data: &Bytes) -> Result<()> {
        let attempts = self.config.handshake_attempts.max(1);
        let mut delay = self.config.restart_policy.initial_delay();
        let shutdown = self.shutdown.clone();
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        for attempt in 1..=attempts {
            match stream.start_track(track_id, codec_private_data).await {
                Ok(()) => {
                    info!("SessionController: track {} started", track_id);
                    return Ok(());
                }
                Err(code) if attempt < attempts => {
                    warn!(
                        "SessionController: starting track {} failed with {} (attempt {}/{}), retrying in {:?}",
                        track_id, code, attempt, attempts, delay
                    );
                    if !backoff(&shutdown, delay).await {
                        return Err(SinkError::Cancelled("track start"));
                    }
                    delay = delay.saturating_mul(2);
                }
                Err(code) => {
                    return Err(SinkError::BackendUnavailable(format!(
                        "track {} could not be started: status {}",
                        track_id, code
                    )));
                }
            }
        }
        Ok(())
    }

    /// Store codec private data; the first value for a track starts it on the stream
    pub async fn set_codec_private_data(&mut self, track_id: u64, data: Bytes) -> Result<()> {
        self.ensure_not_stopped("set codec private data")?;
        match self.registry.set_codec_private_data(track_id, data.clone()) {
            Ok(CodecDataUpdate::Stored) => self.start_track(track_id, &data).await,
            Ok(CodecDataUpdate::Unchanged) => Ok(()),
            Err(e @ SinkError::DuplicateCodecData { .. }) => {
                error!("SessionController: {}", e);
                self.emit_error(e.status_code(), e.to_string());
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Forward a fragment tag. Backend failures are logged, not escalated.
    pub fn put_fragment_metadata(&mut self, name: &str, value: &str, persistent: bool) -> Result<()> {
        self.ensure_not_stopped("put fragment metadata")?;
        if self.stream.is_none() {
            return Err(self.invalid_state("put fragment metadata"));
        }
        if let Some(stream) = self.stream.as_mut()
            && let Err(code) = stream.put_fragment_metadata(name, value, persistent)
        {
            warn!("SessionController: fragment metadata {}={} refused: {}", name, value, code);
        }
        Ok(())
    }

    /// Hand one ordered frame to the backend
    pub async fn submit_frame(&mut self, frame: OutgoingFrame) -> Result<SubmitOutcome> {
        self.ensure_not_stopped("submit frames")?;
        if let Some(code) = self.halted {
            return Err(SinkError::Halted(code));
        }

        let ready = self.session.as_ref().is_some_and(|s| s.is_ready());
        let streaming = ready && self.state.is_streaming();
        let Some(stream) = self.stream.as_mut().filter(|_| streaming) else {
            debug!("SessionController: stream not ready, dropping {:?}", frame);
            self.health.record_frame_drop();
            return Ok(SubmitOutcome::Dropped);
        };

        match stream.put_frame(&frame) {
            Ok(()) => {
                self.health.record_submitted(frame.data.len(), frame.is_keyframe);
                Ok(SubmitOutcome::Submitted)
            }
            Err(code) => {
                self.health.record_rejected();
                self.on_rejection(frame.track_id, frame.pts, code).await?;
                Ok(SubmitOutcome::Rejected(code))
            }
        }
    }

    /// Apply every callback queued by the backend
    pub async fn process_callbacks(&mut self) -> Result<()> {
        while let Ok((generation, event)) = self.callback_rx.try_recv() {
            self.handle_backend_event(generation, event).await?;
        }
        Ok(())
    }

    pub async fn handle_backend_event(&mut self, generation: u64, event: BackendEvent) -> Result<()> {
        let Some(session) = self.session.clone() else {
            return Ok(());
        };
        if !session.accepts(generation) {
            debug!(
                "SessionController: ignoring {:?} from retired generation {}",
                event, generation
            );
            return Ok(());
        }

        let now = self.clock.now();
        match event {
            BackendEvent::StreamReady => {
                if self.state != ControllerState::Starting {
                    debug!("SessionController: duplicate ready callback in {}", self.state);
                    return Ok(());
                }
                session.set_ready(true);
                session.set_status(StatusCode::SUCCESS);
                self.ready_deadline = None;
                self.restart_delay = self.config.restart_policy.initial_delay();
                for watchdog in &mut self.watchdogs {
                    watchdog.reset(now);
                }
                self.transition(ControllerState::Ready);
                info!("SessionController: stream ready (generation {})", generation);
                self.events.emit(SessionEvent::StreamReady { generation });
                Ok(())
            }
            BackendEvent::FrameAccepted { track_id, timestamp } => {
                debug!("SessionController: track {} acknowledged {}", track_id, timestamp);
                session.record_ack(timestamp, now);
                self.health.record_accepted();

                // the backend moved on, a skipped frame is no longer an open issue
                let unresolved = session.error_code();
                if unresolved.is_recoverable() {
                    session.resolve_error(unresolved);
                }

                let frame_wall = session.wall_time_of(timestamp);
                self.observe(Observation::FrameAccepted { now, frame_wall }).await
            }
            BackendEvent::FrameRejected {
                track_id,
                timestamp,
                code,
            } => {
                self.health.record_rejected();
                self.on_rejection(track_id, timestamp, code).await
            }
            BackendEvent::ConnectionStale => {
                warn!("SessionController: backend reported a stale connection");
                self.observe(Observation::ConnectionStale { now }).await
            }
            BackendEvent::FatalError(code) => {
                error!("SessionController: backend reported fatal error {}", code);
                let reported = self.record_error(code, format!("backend error {}", code));
                self.escalate(code, "backend error", reported).await
            }
        }
    }

    async fn on_rejection(&mut self, track_id: u64, timestamp: Timestamp, code: StatusCode) -> Result<()> {
        let err = SinkError::FrameRejected {
            track_id,
            timestamp,
            code,
        };
        warn!("SessionController: {}", err);
        let reported = self.record_error(code, err.to_string());
        self.escalate(code, "frame rejected", reported).await
    }

    /// Apply the error policy for `code`
    async fn escalate(&mut self, code: StatusCode, reason: &str, reported: bool) -> Result<()> {
        match code.severity() {
            None | Some(Severity::Recoverable) => Ok(()),
            Some(Severity::Retriable) if self.config.restart_on_error => {
                self.transition(ControllerState::Erroring);
                self.restart(reason).await
            }
            Some(_) => {
                self.halt(code, reported);
                Ok(())
            }
        }
    }

    fn halt(&mut self, code: StatusCode, reported: bool) {
        error!("SessionController: halting frame intake, status {}", code);
        self.halted = Some(code);
        self.transition(ControllerState::Erroring);
        if !reported {
            self.emit_error(code, format!("frame intake halted, status {}", code));
        }
    }

    /// Evaluate the watchdogs and the ready timeout against the current time
    pub async fn tick(&mut self) -> Result<()> {
        let now = self.clock.now();

        if self.state == ControllerState::Starting {
            if let Some(deadline) = self.ready_deadline
                && now >= deadline
            {
                warn!(
                    "SessionController: generation {} not ready after {:?}",
                    self.generation,
                    self.config.ready_timeout()
                );
                self.emit_error(StatusCode::BACKEND_UNAVAILABLE, "stream ready handshake timed out".into());
                return self.restart("stream ready handshake timed out").await;
            }
            return Ok(());
        }

        if !self.state.is_streaming() {
            return Ok(());
        }
        let transitions: Vec<Transition> = self.watchdogs.iter_mut().filter_map(|w| w.evaluate(now)).collect();
        self.apply_transitions(transitions).await
    }

    async fn observe(&mut self, observation: Observation) -> Result<()> {
        let transitions: Vec<Transition> = self
            .watchdogs
            .iter_mut()
            .filter_map(|w| w.observe(observation))
            .collect();
        self.apply_transitions(transitions).await
    }

    async fn apply_transitions(&mut self, transitions: Vec<Transition>) -> Result<()> {
        let generation = self.generation;
        for transition in transitions {
            self.on_transition(transition).await?;
            // the rest belongs to a retired generation
            if self.generation != generation {
                break;
            }
        }
        Ok(())
    }

    async fn on_transition(&mut self, transition: Transition) -> Result<()> {
        let generation = self.generation;
        match (transition.kind, transition.to) {
            (WatchdogKind::Latency, Verdict::Degraded) => {
                self.record_watchdog_error(SinkError::LatencyExceeded {
                    latency_ms: millis(transition.elapsed),
                    max_latency_ms: millis(self.config.max_latency()),
                });
                self.events.emit(SessionEvent::LatencyExceeded {
                    generation,
                    latency: transition.elapsed,
                });
                if self.state == ControllerState::Ready {
                    self.transition(ControllerState::Degraded);
                }
                if self.config.restart_on_error {
                    self.transition(ControllerState::Erroring);
                    return self.restart("latency exceeded").await;
                }
                warn!("SessionController: tolerating latency, restart on error is disabled");
            }
            (WatchdogKind::Latency, Verdict::Healthy) => {
                self.resolve_error(StatusCode::LATENCY_EXCEEDED);
                self.reassert_watchdog_errors();
                self.events.emit(SessionEvent::LatencyRecovered { generation });
                if self.state == ControllerState::Degraded {
                    self.transition(ControllerState::Ready);
                }
            }
            (WatchdogKind::Staleness, Verdict::Stale) => {
                self.record_watchdog_error(SinkError::ConnectionStale {
                    elapsed_ms: millis(transition.elapsed),
                });
                self.events.emit(SessionEvent::ConnectionStale {
                    generation,
                    elapsed: transition.elapsed,
                });
                if self.state.is_streaming() {
                    self.transition(ControllerState::Stale);
                }
            }
            (WatchdogKind::Staleness, Verdict::Healthy) => {
                self.resolve_error(StatusCode::CONNECTION_STALE);
                self.reassert_watchdog_errors();
                self.events.emit(SessionEvent::ConnectionRecovered { generation });
                if self.state == ControllerState::Stale {
                    let target = if self.verdict(WatchdogKind::Latency) == Some(Verdict::Degraded) {
                        ControllerState::Degraded
                    } else {
                        ControllerState::Ready
                    };
                    self.transition(target);
                }
            }
            (WatchdogKind::Staleness, Verdict::Failed) => {
                self.record_watchdog_error(SinkError::ConnectionFailed {
                    elapsed_ms: millis(transition.elapsed),
                });
                self.events.emit(SessionEvent::ConnectionFailed {
                    generation,
                    elapsed: transition.elapsed,
                });
                // a failed connection never heals on its own
                self.transition(ControllerState::Erroring);
                return self.restart("connection failed").await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Tear down the current generation and start a fresh one after the
    /// backoff delay. Credentials are acquired again.
    pub async fn restart(&mut self, reason: &str) -> Result<()> {
        if matches!(self.state, ControllerState::Uninitialized | ControllerState::Stopped) {
            return Err(self.invalid_state("restart"));
        }

        let previous = self.generation;
        warn!("SessionController: restarting generation {}: {}", previous, reason);
        self.transition(ControllerState::Restarting);
        self.teardown(false).await;
        self.halted = None;
        self.health.record_restart();

        let delay = self.restart_delay;
        self.restart_delay = self.config.restart_policy.next_delay(delay);
        self.events.emit(SessionEvent::Restarting {
            generation: previous,
            delay,
        });
        info!("SessionController: next attempt in {:?}", delay);
        if !backoff(&self.shutdown, delay).await {
            info!("SessionController: shutdown requested, generation {} not restarted", previous);
            return Err(SinkError::Cancelled("restart backoff"));
        }

        match self.start_generation().await {
            Ok(()) => {
                self.events.emit(SessionEvent::Restarted {
                    generation: self.generation,
                });
                Ok(())
            }
            Err(e @ SinkError::Cancelled(_)) => Err(e),
            Err(e) => {
                error!("SessionController: restart failed: {}", e);
                self.transition(ControllerState::Erroring);
                self.emit_error(e.status_code(), e.to_string());
                Err(e)
            }
        }
    }

    /// Flush if acknowledgments are expected, tear the stream down and stop
    pub async fn stop(&mut self) -> Result<HealthSummary> {
        self.ensure_not_stopped("stop")?;
        self.teardown(self.config.fragment_acks).await;
        self.transition(ControllerState::Stopped);

        let summary = self.health.summary();
        info!("SessionController: stopped. {}", summary);
        self.events.emit(SessionEvent::Stopped {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Run until every source is exhausted, the token is cancelled or the
    /// session halts on a fatal error
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<HealthSummary> {
        self.shutdown = cancel.clone();
        if self.state == ControllerState::Uninitialized {
            match self.start().await {
                Err(SinkError::Cancelled(_)) => return self.stop().await,
                other => other?,
            }
        }

        let tick_interval = self
            .watchdogs
            .iter()
            .map(Watchdog::check_interval)
            .fold(MAX_TICK_INTERVAL, Duration::min);
        let mut watchdog_timer = tokio::time::interval(tick_interval);
        watchdog_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health_timer =
            tokio::time::interval_at(tokio::time::Instant::now() + HEALTH_LOG_INTERVAL, HEALTH_LOG_INTERVAL);

        loop {
            if let Some(code) = self.halted {
                return Err(SinkError::Halted(code));
            }
            let streaming = self.state.is_streaming();

            let step = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("SessionController: cancelled");
                    return self.stop().await;
                }
                Some((generation, event)) = self.callback_rx.recv() => {
                    self.handle_backend_event(generation, event).await
                }
                _ = watchdog_timer.tick() => self.tick().await,
                _ = health_timer.tick() => {
                    info!("SessionController: {}", self.health.summary());
                    Ok(())
                }
                item = self.collector.next(), if streaming => match item {
                    Some(Collected::Frame(frame)) => self.submit_frame(frame).await.map(|_| ()),
                    Some(Collected::CodecData { track_id, data }) => {
                        self.set_codec_private_data(track_id, data).await
                    }
                    Some(Collected::Metadata { track_id, metadata }) => {
                        debug!("SessionController: metadata {} from track {}", metadata.name, track_id);
                        self.put_fragment_metadata(&metadata.name, &metadata.value, metadata.persistent)
                    }
                    None => {
                        info!("SessionController: all sources reached end of stream");
                        self.events.emit(SessionEvent::EndOfStream);
                        return self.stop().await;
                    }
                },
            };

            if let Err(e) = step {
                self.recover(e, &cancel).await?;
            }
        }
    }

    /// Decide what a failed step means for the running session
    async fn recover(&mut self, err: SinkError, cancel: &CancellationToken) -> Result<()> {
        match err {
            SinkError::Authentication(_) | SinkError::Halted(_) | SinkError::InvalidState { .. } => Err(err),
            // the loop stops on its next pass
            SinkError::Cancelled(_) => Ok(()),
            SinkError::DuplicateCodecData { .. } => {
                // keep streaming with the codec data already announced
                Ok(())
            }
            err => {
                warn!("SessionController: {}, restarting until the stream is back", err);
                loop {
                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => return Ok(()),
                        result = self.restart("recovering from error") => match result {
                            Ok(()) | Err(SinkError::Cancelled(_)) => return Ok(()),
                            Err(e @ SinkError::Authentication(_)) => return Err(e),
                            Err(e) => debug!("SessionController: attempt failed: {}", e),
                        },
                    }
                }
            }
        }
    }

    async fn teardown(&mut self, flush: bool) {
        if let Some(session) = &self.session {
            session.invalidate();
        }
        self.ready_deadline = None;
        if let Some(mut stream) = self.stream.take() {
            stream.stop(flush).await;
        }
    }

    /// Record `code` on the session. Emits an error event when the error
    /// field leaves zero and returns whether it did.
    fn record_error(&self, code: StatusCode, message: String) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        if !session.record_error(code) {
            return false;
        }
        self.events.emit(SessionEvent::Error {
            generation: self.generation,
            code,
            status: session.status(),
            message,
        });
        true
    }

    fn record_watchdog_error(&self, err: SinkError) -> bool {
        self.record_error(err.status_code(), err.to_string())
    }

    /// Both watchdogs share the session error field. Once one of them
    /// resolves its code, the other one's is recorded again if still open.
    fn reassert_watchdog_errors(&self) {
        let now = self.clock.now();
        for watchdog in &self.watchdogs {
            let err = match (watchdog, watchdog.verdict()) {
                (Watchdog::Latency(latency), Verdict::Degraded) => SinkError::LatencyExceeded {
                    latency_ms: millis(latency.latency(now)),
                    max_latency_ms: millis(self.config.max_latency()),
                },
                (Watchdog::Staleness(staleness), Verdict::Stale) => SinkError::ConnectionStale {
                    elapsed_ms: millis(staleness.elapsed(now)),
                },
                (Watchdog::Staleness(staleness), Verdict::Failed) => SinkError::ConnectionFailed {
                    elapsed_ms: millis(staleness.elapsed(now)),
                },
                _ => continue,
            };
            self.record_watchdog_error(err);
        }
    }

    fn resolve_error(&self, code: StatusCode) {
        if let Some(session) = &self.session
            && session.resolve_error(code)
        {
            info!("SessionController: status {} resolved", code);
        }
    }

    fn emit_error(&self, code: StatusCode, message: String) {
        let status = self.session.as_ref().map_or(code, |s| s.status());
        self.events.emit(SessionEvent::Error {
            generation: self.generation,
            code,
            status,
            message,
        });
    }

    fn transition(&mut self, target: ControllerState) {
        if self.state == target {
            return;
        }
        if !self.state.can_transition_to(&target) {
            warn!("SessionController: ignoring transition {} -> {}", self.state, target);
            return;
        }
        info!("SessionController: {} -> {}", self.state, target);
        self.state = target;
    }

    fn ensure_not_stopped(&self, operation: &'static str) -> Result<()> {
        if self.state.is_stopped() {
            return Err(self.invalid_state(operation));
        }
        Ok(())
    }

    fn invalid_state(&self, operation: &'static str) -> SinkError {
        SinkError::InvalidState {
            state: self.state.description(),
            operation,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Wait out `delay` unless shutdown is requested first. Returns false when cancelled.
async fn backoff(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
