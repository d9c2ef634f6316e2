//! Error and status types shared by every part of the sink

use std::fmt;

use thiserror::Error;

use crate::pipeline::types::Timestamp;

/// How the controller has to react to a non-zero status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// The offending frame is skipped, the stream keeps going
    Recoverable,
    /// The stream generation is lost but a restart may heal it
    Retriable,
    /// Nothing short of operator intervention fixes it
    Fatal,
}

/// Backend / session status code, `0` means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const SUCCESS: StatusCode = StatusCode(0);
    pub const STREAM_NOT_READY: StatusCode = StatusCode(0x5000_0001);
    pub const INVALID_TIMESTAMP: StatusCode = StatusCode(0x5000_0002);
    pub const BUFFER_FULL: StatusCode = StatusCode(0x5200_0001);
    pub const LATENCY_EXCEEDED: StatusCode = StatusCode(0x5200_0002);
    pub const CONNECTION_STALE: StatusCode = StatusCode(0x5200_0003);
    pub const CONNECTION_FAILED: StatusCode = StatusCode(0x5200_0004);
    pub const BACKEND_UNAVAILABLE: StatusCode = StatusCode(0x5200_0005);
    pub const CODEC_MISMATCH: StatusCode = StatusCode(0x5400_0001);
    pub const AUTH_FAILED: StatusCode = StatusCode(0x5400_0002);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }

    /// Classify the code. Unknown codes are treated as fatal.
    pub fn severity(&self) -> Option<Severity> {
        match *self {
            StatusCode::SUCCESS => None,
            StatusCode::STREAM_NOT_READY | StatusCode::INVALID_TIMESTAMP => {
                Some(Severity::Recoverable)
            }
            StatusCode::BUFFER_FULL
            | StatusCode::LATENCY_EXCEEDED
            | StatusCode::CONNECTION_STALE
            | StatusCode::CONNECTION_FAILED
            | StatusCode::BACKEND_UNAVAILABLE => Some(Severity::Retriable),
            _ => Some(Severity::Fatal),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.severity() == Some(Severity::Retriable)
    }

    pub fn is_recoverable(&self) -> bool {
        self.severity() == Some(Severity::Recoverable)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl From<u32> for StatusCode {
    fn from(value: u32) -> Self {
        StatusCode(value)
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("frame rejected on track {track_id} at {timestamp}: status {code}")]
    FrameRejected {
        track_id: u64,
        timestamp: Timestamp,
        code: StatusCode,
    },

    #[error("latency exceeded: {latency_ms} ms over a {max_latency_ms} ms budget")]
    LatencyExceeded { latency_ms: u64, max_latency_ms: u64 },

    #[error("connection stale: no frame accepted for {elapsed_ms} ms")]
    ConnectionStale { elapsed_ms: u64 },

    #[error("connection failed: no frame accepted for {elapsed_ms} ms")]
    ConnectionFailed { elapsed_ms: u64 },

    #[error("codec private data for track {track_id} already set to a different value")]
    DuplicateCodecData { track_id: u64 },

    #[error("unknown track {0}")]
    UnknownTrack(u64),

    #[error("only one {0} track is supported per session")]
    TrackLimit(&'static str),

    #[error("cannot {operation} while {state}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },

    #[error("stream halted: status {0}")]
    Halted(StatusCode),

    #[error("shutdown requested during {0}")]
    Cancelled(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IOError: {0}")]
    Io(#[from] std::io::Error),

    #[error("JsonError: {0}")]
    Json(#[from] serde_json::Error),
}

impl SinkError {
    /// Status code reported on the outbound event channel for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            SinkError::Authentication(_) => StatusCode::AUTH_FAILED,
            SinkError::BackendUnavailable(_) => StatusCode::BACKEND_UNAVAILABLE,
            SinkError::FrameRejected { code, .. } => *code,
            SinkError::LatencyExceeded { .. } => StatusCode::LATENCY_EXCEEDED,
            SinkError::ConnectionStale { .. } => StatusCode::CONNECTION_STALE,
            SinkError::ConnectionFailed { .. } => StatusCode::CONNECTION_FAILED,
            SinkError::DuplicateCodecData { .. } => StatusCode::CODEC_MISMATCH,
            SinkError::Halted(code) => *code,
            _ => StatusCode(u32::MAX),
        }
    }
}

pub type Result<T, E = SinkError> = std::result::Result<T, E>;
