//! Session-control pipeline for kvsink
//!
//! Upstream tracks feed a [`FrameCollector`], which merges them into one
//! ordered stream with normalized timestamps. The [`SessionController`]
//! hands those frames to a [`StreamBackend`] and keeps the stream healthy:
//! - Tracks: registration and codec private data
//! - Session: per-generation state shared with the collector
//! - Watchdogs: latency and connection staleness
//! - Events: status reporting towards the hosting pipeline
//!
//! Each stream the controller creates is a generation. Restarting retires
//! the current generation, so callbacks from a torn-down stream are ignored.

pub mod backend;
pub mod clock;
pub mod collector;
pub mod controller;
pub mod events;
pub mod health;
pub mod loopback;
pub mod session;
pub mod state;
pub mod tracks;
pub mod types;
pub mod watchdog;

pub use backend::{BackendEvent, BackendStream, CallbackHandle, StreamBackend, StreamDefinition};
pub use clock::SessionClock;
pub use collector::{Collected, FragmentMetadata, FrameCollector, SourceItem, TrackSource};
pub use controller::{SessionController, SubmitOutcome};
pub use events::{EventSink, SessionEvent};
pub use health::{HealthSummary, SessionHealth};
pub use loopback::LoopbackBackend;
pub use session::SessionState;
pub use state::ControllerState;
pub use tracks::TrackRegistry;
pub use types::{MediaFrame, MediaKind, MediaType, OutgoingFrame, Timestamp};
pub use watchdog::{Verdict, Watchdog, WatchdogKind};
