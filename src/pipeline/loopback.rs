//! In-memory stream backend
//!
//! Records everything it is given and answers through the regular callback
//! path. Failures and acknowledgments can be scripted, which makes it the
//! test double for the controller and the sink of the demo binary.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};

use crate::credentials::Credentials;
use crate::error::{Result, SinkError, StatusCode};
use crate::pipeline::backend::{BackendStream, CallbackHandle, StreamBackend, StreamDefinition};
use crate::pipeline::types::OutgoingFrame;

/// What the loopback does with the next `put_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Accept and acknowledge
    Ack,
    /// Accept without acknowledging
    Silent,
    /// Refuse synchronously
    Reject(StatusCode),
    /// Accept, then report a rejection through the callbacks
    RejectLater(StatusCode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFrame {
    pub generation: u64,
    pub frame: OutgoingFrame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMetadata {
    pub generation: u64,
    pub name: String,
    pub value: String,
    pub persistent: bool,
}

struct LoopbackState {
    auto_ready: bool,
    auto_ack: bool,
    create_failures: u32,
    auth_failures: u32,
    start_track_failures: u32,
    scripted: VecDeque<PutOutcome>,
    definitions: Vec<StreamDefinition>,
    frames: Vec<RecordedFrame>,
    metadata: Vec<RecordedMetadata>,
    started_tracks: Vec<(u64, u64, Bytes)>,
    stops: Vec<(u64, bool)>,
    callbacks: Option<CallbackHandle>,
}

/// Loopback backend. Clones share the same recorded state.
#[derive(Clone)]
pub struct LoopbackBackend {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackBackend {
    /// Backend that reports ready and acknowledges every frame
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopbackState {
                auto_ready: true,
                auto_ack: true,
                create_failures: 0,
                auth_failures: 0,
                start_track_failures: 0,
                scripted: VecDeque::new(),
                definitions: Vec::new(),
                frames: Vec::new(),
                metadata: Vec::new(),
                started_tracks: Vec::new(),
                stops: Vec::new(),
                callbacks: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_auto_ready(&self, enabled: bool) {
        self.state().auto_ready = enabled;
    }

    pub fn set_auto_ack(&self, enabled: bool) {
        self.state().auto_ack = enabled;
    }

    /// Make the next `count` stream creations fail as unavailable
    pub fn fail_next_creates(&self, count: u32) {
        self.state().create_failures = count;
    }

    /// Make the next `count` stream creations fail authentication
    pub fn reject_next_credentials(&self, count: u32) {
        self.state().auth_failures = count;
    }

    pub fn fail_next_track_starts(&self, count: u32) {
        self.state().start_track_failures = count;
    }

    /// Queue outcomes for the next `put_frame` calls
    pub fn script(&self, outcomes: impl IntoIterator<Item = PutOutcome>) {
        self.state().scripted.extend(outcomes);
    }

    /// Callback handle of the most recently created stream
    pub fn callbacks(&self) -> Option<CallbackHandle> {
        self.state().callbacks.clone()
    }

    pub fn definitions(&self) -> Vec<StreamDefinition> {
        self.state().definitions.clone()
    }

    pub fn frames(&self) -> Vec<RecordedFrame> {
        self.state().frames.clone()
    }

    pub fn metadata(&self) -> Vec<RecordedMetadata> {
        self.state().metadata.clone()
    }

    /// `(generation, track_id, codec private data)` per successful track start
    pub fn started_tracks(&self) -> Vec<(u64, u64, Bytes)> {
        self.state().started_tracks.clone()
    }

    /// `(generation, flush)` per stopped stream
    pub fn stops(&self) -> Vec<(u64, bool)> {
        self.state().stops.clone()
    }

    pub fn streams_created(&self) -> usize {
        self.state().definitions.len()
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamBackend for LoopbackBackend {
    async fn create_stream(
        &self,
        definition: &StreamDefinition,
        credentials: &Credentials,
        callbacks: CallbackHandle,
    ) -> Result<Box<dyn BackendStream>> {
        let mut state = self.state();
        if state.auth_failures > 0 {
            state.auth_failures -= 1;
            return Err(SinkError::Authentication(format!(
                "loopback refused key {}",
                credentials.access_key
            )));
        }
        if state.create_failures > 0 {
            state.create_failures -= 1;
            return Err(SinkError::BackendUnavailable(format!(
                "loopback refused stream {}",
                definition.stream_name
            )));
        }

        info!(
            "Loopback: created stream {} ({}, generation {})",
            definition.stream_name,
            definition.content_type,
            callbacks.generation()
        );
        state.definitions.push(definition.clone());
        state.callbacks = Some(callbacks.clone());
        if state.auto_ready {
            callbacks.stream_ready();
        }

        Ok(Box::new(LoopbackStream {
            state: self.state.clone(),
            callbacks,
        }))
    }
}

struct LoopbackStream {
    state: Arc<Mutex<LoopbackState>>,
    callbacks: CallbackHandle,
}

impl LoopbackStream {
    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BackendStream for LoopbackStream {
    async fn start_track(&mut self, track_id: u64, codec_private_data: &Bytes) -> Result<(), StatusCode> {
        let generation = self.callbacks.generation();
        let mut state = self.state();
        if state.start_track_failures > 0 {
            state.start_track_failures -= 1;
            return Err(StatusCode::STREAM_NOT_READY);
        }
        state
            .started_tracks
            .push((generation, track_id, codec_private_data.clone()));
        Ok(())
    }

    fn put_frame(&mut self, frame: &OutgoingFrame) -> Result<(), StatusCode> {
        let generation = self.callbacks.generation();
        let mut state = self.state();
        let default = if state.auto_ack {
            PutOutcome::Ack
        } else {
            PutOutcome::Silent
        };
        let outcome = state.scripted.pop_front().unwrap_or(default);

        if let PutOutcome::Reject(code) = outcome {
            debug!("Loopback: rejecting frame {:?} with {}", frame, code);
            return Err(code);
        }
        state.frames.push(RecordedFrame {
            generation,
            frame: frame.clone(),
        });
        drop(state);

        match outcome {
            PutOutcome::Ack => self.callbacks.frame_accepted(frame.track_id, frame.pts),
            PutOutcome::RejectLater(code) => self.callbacks.frame_rejected(frame.track_id, frame.pts, code),
            PutOutcome::Silent | PutOutcome::Reject(_) => {}
        }
        Ok(())
    }

    fn put_fragment_metadata(&mut self, name: &str, value: &str, persistent: bool) -> Result<(), StatusCode> {
        let generation = self.callbacks.generation();
        self.state().metadata.push(RecordedMetadata {
            generation,
            name: name.to_string(),
            value: value.to_string(),
            persistent,
        });
        Ok(())
    }

    async fn stop(&mut self, flush: bool) {
        let generation = self.callbacks.generation();
        info!("Loopback: stopping generation {} (flush: {})", generation, flush);
        self.state().stops.push((generation, flush));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;
    use crate::pipeline::backend::BackendEvent;
    use crate::pipeline::types::{MediaKind, MediaType, Timestamp};
    use tokio::sync::mpsc;

    fn credentials() -> Credentials {
        Credentials {
            access_key: "AKID".into(),
            secret_key: "SECRET".into(),
            session_token: None,
            expiration: None,
        }
    }

    fn frame(ms: u64) -> OutgoingFrame {
        OutgoingFrame {
            track_id: 1,
            kind: MediaKind::Video,
            pts: Timestamp::from_millis(ms),
            dts: Timestamp::from_millis(ms),
            data: Bytes::from_static(b"frame"),
            is_keyframe: ms == 0,
        }
    }

    #[tokio::test]
    async fn test_scripted_outcomes() {
        let backend = LoopbackBackend::new();
        let definition = StreamDefinition::derive(&SinkConfig::default(), MediaType::VideoOnly, &[], "us-west-2");
        let (tx, mut rx) = mpsc::unbounded_channel();

        backend.fail_next_creates(1);
        let failed = backend
            .create_stream(&definition, &credentials(), CallbackHandle::new(1, tx.clone()))
            .await;
        assert!(matches!(failed, Err(SinkError::BackendUnavailable(_))));

        let mut stream = backend
            .create_stream(&definition, &credentials(), CallbackHandle::new(2, tx))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some((2, BackendEvent::StreamReady)));

        backend.script([PutOutcome::Reject(StatusCode::BUFFER_FULL), PutOutcome::Silent]);
        assert_eq!(stream.put_frame(&frame(0)), Err(StatusCode::BUFFER_FULL));
        assert_eq!(stream.put_frame(&frame(40)), Ok(()));
        assert_eq!(stream.put_frame(&frame(80)), Ok(()));

        // only the last frame is acknowledged
        assert_eq!(
            rx.recv().await,
            Some((
                2,
                BackendEvent::FrameAccepted {
                    track_id: 1,
                    timestamp: Timestamp::from_millis(80)
                }
            ))
        );
        assert_eq!(backend.frames().len(), 2);

        stream.stop(true).await;
        assert_eq!(backend.stops(), vec![(2, true)]);
    }
}
