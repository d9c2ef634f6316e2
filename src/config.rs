//! Session configuration
//!
//! `SinkConfig` is built once, either from defaults or from a JSON file,
//! and never mutated after the session starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SinkError};
use crate::pipeline::types::Timestamp;

/// Sentinel meaning "no access key configured"
pub const DEFAULT_ACCESS_KEY: &str = "access_key";
pub const DEFAULT_SECRET_KEY: &str = "secret_key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingType {
    #[default]
    Realtime,
    NearRealtime,
    /// Upload of recorded media, frames may be far in the past
    Offline,
}

/// Backoff between restart attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub initial_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 400,
            multiplier: 2,
            max_delay_ms: 30_000,
        }
    }
}

impl RestartPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Delay following `current`, capped at `max_delay_ms`
    pub fn next_delay(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.multiplier.max(1))
            .min(Duration::from_millis(self.max_delay_ms))
    }
}

/// Where an IoT role-alias credential exchange would get its material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IotCertificate {
    pub endpoint: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    pub role_aliases: String,
}

impl IotCertificate {
    pub fn validate(&self) -> Result<()> {
        let missing = [
            ("endpoint", self.endpoint.is_empty()),
            ("cert_path", self.cert_path.as_os_str().is_empty()),
            ("key_path", self.key_path.as_os_str().is_empty()),
            ("ca_path", self.ca_path.as_os_str().is_empty()),
            ("role_aliases", self.role_aliases.is_empty()),
        ];
        match missing.iter().find(|(_, empty)| *empty) {
            Some((field, _)) => Err(SinkError::Config(format!("iot_certificate.{} is empty", field))),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub stream_name: String,
    pub retention_period_hours: u32,
    pub kms_key_id: Option<String>,
    pub streaming_type: StreamingType,
    pub content_type: String,
    pub max_latency_seconds: u64,
    pub fragment_duration_ms: u64,
    pub timecode_scale_ms: u64,
    pub key_frame_fragmentation: bool,
    pub frame_timecodes: bool,
    pub absolute_fragment_times: bool,
    pub fragment_acks: bool,
    pub restart_on_error: bool,
    pub recalculate_metrics: bool,
    pub framerate: u32,
    pub avg_bandwidth_bps: u32,
    pub buffer_duration_seconds: u64,
    pub replay_duration_seconds: u64,
    pub connection_staleness_seconds: u64,
    pub codec_id: String,
    pub track_name: String,

    // Credentials
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    /// Expiration of explicit credentials, seconds since the Unix epoch
    pub expiration: Option<u64>,
    pub aws_region: String,
    pub rotation_period_seconds: u64,
    pub credential_file_path: PathBuf,
    pub iot_certificate: Option<IotCertificate>,

    pub stream_tags: BTreeMap<String, String>,
    pub storage_size_mb: u32,
    pub log_config_path: Option<PathBuf>,
    /// Offline uploads: start time of the file, seconds since the Unix epoch
    pub file_start_time: u64,

    // Controller tuning
    pub restart_policy: RestartPolicy,
    pub handshake_attempts: u32,
    pub credential_timeout_ms: u64,
    pub ready_timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            stream_name: "DEFAULT_STREAM".into(),
            retention_period_hours: 2,
            kms_key_id: None,
            streaming_type: StreamingType::Realtime,
            content_type: "video/h264".into(),
            max_latency_seconds: 60,
            fragment_duration_ms: 2000,
            timecode_scale_ms: 1,
            key_frame_fragmentation: true,
            frame_timecodes: true,
            absolute_fragment_times: false,
            fragment_acks: true,
            restart_on_error: true,
            recalculate_metrics: true,
            framerate: 25,
            avg_bandwidth_bps: 4 * 1024 * 1024,
            buffer_duration_seconds: 120,
            replay_duration_seconds: 40,
            connection_staleness_seconds: 60,
            codec_id: "V_MPEG4/ISO/AVC".into(),
            track_name: "kinesis_video".into(),
            access_key: DEFAULT_ACCESS_KEY.into(),
            secret_key: DEFAULT_SECRET_KEY.into(),
            session_token: None,
            expiration: None,
            aws_region: "us-west-2".into(),
            rotation_period_seconds: 2400,
            credential_file_path: PathBuf::from(".kvs/credential"),
            iot_certificate: None,
            stream_tags: BTreeMap::new(),
            storage_size_mb: 128,
            log_config_path: None,
            file_start_time: 0,
            restart_policy: RestartPolicy::default(),
            handshake_attempts: 4,
            credential_timeout_ms: 5000,
            ready_timeout_ms: 10_000,
        }
    }
}

impl SinkConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SinkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream_name.trim().is_empty() {
            return Err(SinkError::Config("stream_name must not be empty".into()));
        }
        if self.connection_staleness_seconds == 0 {
            return Err(SinkError::Config("connection_staleness_seconds must be positive".into()));
        }
        if self.max_latency_seconds == 0 {
            return Err(SinkError::Config("max_latency_seconds must be positive".into()));
        }
        if self.handshake_attempts == 0 {
            return Err(SinkError::Config("handshake_attempts must be at least 1".into()));
        }
        if self.restart_policy.initial_delay_ms > self.restart_policy.max_delay_ms {
            return Err(SinkError::Config(
                "restart_policy.initial_delay_ms exceeds max_delay_ms".into(),
            ));
        }
        if let Some(iot) = &self.iot_certificate {
            iot.validate()?;
        }
        Ok(())
    }

    pub fn is_offline(&self) -> bool {
        self.streaming_type == StreamingType::Offline
    }

    /// Offline uploads with a file start time force absolute fragment times
    pub fn uses_absolute_fragment_times(&self) -> bool {
        self.absolute_fragment_times || (self.is_offline() && self.file_start_time != 0)
    }

    /// Offset added to every presentation timestamp
    pub fn pts_offset(&self) -> Option<Timestamp> {
        (self.is_offline() && self.file_start_time != 0)
            .then(|| Timestamp::from_duration(Duration::from_secs(self.file_start_time)))
    }

    pub fn has_explicit_credentials(&self) -> bool {
        self.access_key != DEFAULT_ACCESS_KEY
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_secs(self.max_latency_seconds)
    }

    pub fn connection_staleness(&self) -> Duration {
        Duration::from_secs(self.connection_staleness_seconds)
    }

    pub fn rotation_period(&self) -> Duration {
        Duration::from_secs(self.rotation_period_seconds)
    }

    pub fn credential_timeout(&self) -> Duration {
        Duration::from_millis(self.credential_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SinkConfig::default();
        assert_eq!(config.stream_name, "DEFAULT_STREAM");
        assert_eq!(config.max_latency(), Duration::from_secs(60));
        assert_eq!(config.connection_staleness(), Duration::from_secs(60));
        assert_eq!(config.codec_id, "V_MPEG4/ISO/AVC");
        assert!(config.restart_on_error);
        assert!(!config.has_explicit_credentials());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SinkConfig::from_json_str(
            r#"{
                "stream_name": "front-door",
                "streaming_type": "offline",
                "file_start_time": 1700000000,
                "stream_tags": { "site": "lab" },
                "restart_policy": { "max_delay_ms": 5000 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.stream_name, "front-door");
        assert_eq!(config.retention_period_hours, 2);
        assert!(config.is_offline());
        assert!(config.uses_absolute_fragment_times());
        assert_eq!(config.pts_offset(), Some(Timestamp::from_millis(1_700_000_000_000)));
        assert_eq!(config.stream_tags.get("site").map(String::as_str), Some("lab"));
        assert_eq!(config.restart_policy.initial_delay_ms, 400);
        assert_eq!(config.restart_policy.max_delay_ms, 5000);
    }

    #[test]
    fn test_validation() {
        let err = SinkConfig::from_json_str(r#"{ "connection_staleness_seconds": 0 }"#).unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));

        let err = SinkConfig::from_json_str(r#"{ "stream_name": "  " }"#).unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));

        let err = SinkConfig::from_json_str(r#"{ "max_latency_seconds": "soon" }"#).unwrap_err();
        assert!(matches!(err, SinkError::Json(_)));

        let config = SinkConfig {
            iot_certificate: Some(IotCertificate {
                endpoint: "iot.example".into(),
                cert_path: "cert.pem".into(),
                key_path: PathBuf::new(),
                ca_path: "ca.pem".into(),
                role_aliases: "kvs".into(),
            }),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SinkError::Config(msg)) if msg.contains("key_path")));
    }

    #[test]
    fn test_restart_backoff_is_capped() {
        let policy = RestartPolicy::default();
        let mut delay = policy.initial_delay();
        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(delay.as_millis() as u64);
            delay = policy.next_delay(delay);
        }
        assert_eq!(&seen[..4], &[400, 800, 1600, 3200]);
        assert_eq!(*seen.last().unwrap(), 30_000);
    }

    #[test]
    fn test_from_json_file() {
        let path = std::env::temp_dir().join(format!("kvsink-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "aws_region": "eu-west-1" }"#).unwrap();
        let config = SinkConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.aws_region, "eu-west-1");

        assert!(matches!(
            SinkConfig::from_json_file("/nonexistent/kvsink.json"),
            Err(SinkError::Io(_))
        ));
    }
}
