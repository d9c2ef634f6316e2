//! Credential providers
//!
//! Resolution order when the session starts:
//! explicit keys in the configuration, then the `AWS_*` environment
//! variables, then an IoT certificate exchange, then the credential file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};

use crate::config::SinkConfig;
use crate::error::{Result, SinkError};

pub const ACCESS_KEY_ENV_VAR: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_KEY_ENV_VAR: &str = "AWS_SECRET_ACCESS_KEY";
pub const SESSION_TOKEN_ENV_VAR: &str = "AWS_SESSION_TOKEN";
pub const TOKEN_EXPIRATION_ENV_VAR: &str = "AWS_TOKEN_EXPIRATION";
pub const DEFAULT_REGION_ENV_VAR: &str = "AWS_DEFAULT_REGION";

/// Variable lookup, `std::env::var` outside of tests
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub fn process_env() -> EnvLookup {
    Arc::new(|name| std::env::var(name).ok())
}

/// Lookup over a fixed set of variables
pub fn env_from_map(vars: HashMap<String, String>) -> EnvLookup {
    Arc::new(move |name| vars.get(name).cloned())
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Non-empty keys that have not expired at `now`
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.access_key.is_empty()
            && !self.secret_key.is_empty()
            && self.expiration.is_none_or(|expiration| expiration > now)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Source of backend credentials, queried on every start and restart
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn acquire(&self) -> Result<Credentials>;

    /// Name of this provider for logging
    fn name(&self) -> &'static str;
}

/// Fixed keys, re-stamped with a fresh expiration on every acquisition
pub struct StaticCredentialProvider {
    credentials: Credentials,
    rotation_period: Duration,
}

impl StaticCredentialProvider {
    pub fn new(credentials: Credentials, rotation_period: Duration) -> Self {
        Self {
            credentials,
            rotation_period,
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn acquire(&self) -> Result<Credentials> {
        let mut credentials = self.credentials.clone();
        if credentials.expiration.is_none() {
            let rotation = chrono::Duration::from_std(self.rotation_period)
                .map_err(|e| SinkError::Config(format!("rotation period: {}", e)))?;
            credentials.expiration = Some(Utc::now() + rotation);
        }
        Ok(credentials)
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Reads the `AWS_*` variables on every acquisition so rotated tokens are
/// picked up on restart
pub struct EnvCredentialProvider {
    lookup: EnvLookup,
    rotation_period: Duration,
}

impl EnvCredentialProvider {
    pub fn new(lookup: EnvLookup, rotation_period: Duration) -> Self {
        Self {
            lookup,
            rotation_period,
        }
    }

    /// Whether both keys are present
    pub fn is_available(lookup: &EnvLookup) -> bool {
        lookup(ACCESS_KEY_ENV_VAR).is_some() && lookup(SECRET_KEY_ENV_VAR).is_some()
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn acquire(&self) -> Result<Credentials> {
        let lookup = &self.lookup;
        let (Some(access_key), Some(secret_key)) = (lookup(ACCESS_KEY_ENV_VAR), lookup(SECRET_KEY_ENV_VAR)) else {
            return Err(SinkError::Authentication(format!(
                "{} / {} not set",
                ACCESS_KEY_ENV_VAR, SECRET_KEY_ENV_VAR
            )));
        };
        let expiration = match lookup(TOKEN_EXPIRATION_ENV_VAR) {
            Some(raw) => Some(parse_expiration(&raw).ok_or_else(|| {
                SinkError::Authentication(format!("invalid {}: {}", TOKEN_EXPIRATION_ENV_VAR, raw))
            })?),
            None => None,
        };

        let credentials = Credentials {
            access_key,
            secret_key,
            session_token: lookup(SESSION_TOKEN_ENV_VAR).filter(|t| !t.is_empty()),
            expiration,
        };
        StaticCredentialProvider::new(credentials, self.rotation_period)
            .acquire()
            .await
    }

    fn name(&self) -> &'static str {
        "environment"
    }
}

/// Reads `CREDENTIALS <access> [<expiration>] <secret> [<session-token>]`
pub struct FileCredentialProvider {
    path: PathBuf,
}

impl FileCredentialProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialProvider {
    async fn acquire(&self) -> Result<Credentials> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SinkError::Authentication(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        parse_credential_file(&contents)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

pub fn parse_credential_file(contents: &str) -> Result<Credentials> {
    let malformed = || SinkError::Authentication("malformed credential file".into());

    let tokens: Vec<&str> = contents.split_whitespace().collect();
    let (label, values) = tokens.split_first().ok_or_else(malformed)?;
    if *label != "CREDENTIALS" {
        return Err(malformed());
    }

    let (access, expiration, secret, token) = match *values {
        [access, secret] => (access, None, secret, None),
        [access, middle, secret] => match parse_expiration(middle) {
            Some(expiration) => (access, Some(expiration), secret, None),
            None => (access, None, middle, Some(secret)),
        },
        [access, expiration, secret, token] => {
            (access, Some(parse_expiration(expiration).ok_or_else(malformed)?), secret, Some(token))
        }
        _ => return Err(malformed()),
    };

    Ok(Credentials {
        access_key: access.to_string(),
        secret_key: secret.to_string(),
        session_token: token.map(str::to_string),
        expiration,
    })
}

/// Epoch seconds or RFC 3339
pub fn parse_expiration(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Pick the credential provider for `config`.
///
/// `iot` is the certificate exchange client; it is required when the
/// configuration names an IoT certificate and no keys are available.
pub fn resolve_provider(
    config: &SinkConfig,
    env: &EnvLookup,
    iot: Option<Arc<dyn CredentialProvider>>,
) -> Result<Arc<dyn CredentialProvider>> {
    let rotation = config.rotation_period();

    let provider: Arc<dyn CredentialProvider> = if config.has_explicit_credentials() {
        let expiration = match config.expiration {
            Some(secs) => Some(
                i64::try_from(secs)
                    .ok()
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                    .ok_or_else(|| SinkError::Config(format!("invalid expiration {}", secs)))?,
            ),
            None => None,
        };
        Arc::new(StaticCredentialProvider::new(
            Credentials {
                access_key: config.access_key.clone(),
                secret_key: config.secret_key.clone(),
                session_token: config.session_token.clone(),
                expiration,
            },
            rotation,
        ))
    } else if EnvCredentialProvider::is_available(env) {
        Arc::new(EnvCredentialProvider::new(env.clone(), rotation))
    } else if let Some(certificate) = &config.iot_certificate {
        certificate.validate()?;
        iot.ok_or_else(|| {
            SinkError::Authentication(format!(
                "IoT certificate for {} configured but no certificate exchange is available",
                certificate.endpoint
            ))
        })?
    } else {
        Arc::new(FileCredentialProvider::new(config.credential_file_path.clone()))
    };

    info!("Credentials: using {} provider", provider.name());
    Ok(provider)
}

/// Region from `AWS_DEFAULT_REGION`, falling back to the configuration
pub fn resolve_region(config: &SinkConfig, env: &EnvLookup) -> String {
    match env(DEFAULT_REGION_ENV_VAR).filter(|r| !r.is_empty()) {
        Some(region) => {
            debug!("Credentials: region {} taken from {}", region, DEFAULT_REGION_ENV_VAR);
            region
        }
        None => config.aws_region.clone(),
    }
}

/// Acquire credentials within `timeout` and check that they are usable
pub async fn acquire_credentials(provider: &dyn CredentialProvider, timeout: Duration) -> Result<Credentials> {
    let credentials = tokio::time::timeout(timeout, provider.acquire())
        .await
        .map_err(|_| {
            SinkError::Authentication(format!(
                "{} provider did not answer within {:?}",
                provider.name(),
                timeout
            ))
        })??;

    if !credentials.is_valid(Utc::now()) {
        return Err(SinkError::Authentication(format!(
            "{} provider returned empty or expired credentials",
            provider.name()
        )));
    }
    Ok(credentials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IotCertificate;

    fn env(vars: &[(&str, &str)]) -> EnvLookup {
        env_from_map(vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    struct NeverAnswers;

    #[async_trait]
    impl CredentialProvider for NeverAnswers {
        async fn acquire(&self) -> Result<Credentials> {
            std::future::pending().await
        }

        fn name(&self) -> &'static str {
            "never"
        }
    }

    #[tokio::test]
    async fn test_explicit_keys_win() {
        let config = SinkConfig {
            access_key: "AKID".into(),
            secret_key: "SECRET".into(),
            ..Default::default()
        };
        let provider = resolve_provider(&config, &env(&[(ACCESS_KEY_ENV_VAR, "ENV")]), None).unwrap();
        assert_eq!(provider.name(), "static");

        let credentials = provider.acquire().await.unwrap();
        assert_eq!(credentials.access_key, "AKID");
        // static credentials are stamped with the rotation period
        let expiration = credentials.expiration.unwrap();
        assert!(expiration > Utc::now() + chrono::Duration::seconds(2300));
    }

    #[tokio::test]
    async fn test_environment_credentials() {
        let vars = env(&[
            (ACCESS_KEY_ENV_VAR, "AKID"),
            (SECRET_KEY_ENV_VAR, "SECRET"),
            (SESSION_TOKEN_ENV_VAR, "TOKEN"),
            (TOKEN_EXPIRATION_ENV_VAR, "2999-01-01T00:00:00Z"),
            (DEFAULT_REGION_ENV_VAR, "eu-central-1"),
        ]);
        let config = SinkConfig::default();

        let provider = resolve_provider(&config, &vars, None).unwrap();
        assert_eq!(provider.name(), "environment");
        let credentials = provider.acquire().await.unwrap();
        assert_eq!(credentials.session_token.as_deref(), Some("TOKEN"));
        assert_eq!(credentials.expiration, parse_expiration("2999-01-01T00:00:00Z"));

        assert_eq!(resolve_region(&config, &vars), "eu-central-1");
        assert_eq!(resolve_region(&config, &env(&[])), "us-west-2");
    }

    #[test]
    fn test_iot_requires_exchange() {
        let config = SinkConfig {
            iot_certificate: Some(IotCertificate {
                endpoint: "creds.iot.example".into(),
                cert_path: "cert.pem".into(),
                key_path: "key.pem".into(),
                ca_path: "ca.pem".into(),
                role_aliases: "kvs-role".into(),
            }),
            ..Default::default()
        };

        let result = resolve_provider(&config, &env(&[]), None);
        assert!(matches!(result, Err(SinkError::Authentication(_))));

        let exchange: Arc<dyn CredentialProvider> = Arc::new(NeverAnswers);
        let provider = resolve_provider(&config, &env(&[]), Some(exchange)).unwrap();
        assert_eq!(provider.name(), "never");
    }

    #[test]
    fn test_falls_back_to_credential_file() {
        let provider = resolve_provider(&SinkConfig::default(), &env(&[]), None).unwrap();
        assert_eq!(provider.name(), "file");
    }

    #[test]
    fn test_parse_credential_file() {
        let basic = parse_credential_file("CREDENTIALS AKID SECRET\n").unwrap();
        assert_eq!(basic.secret_key, "SECRET");
        assert_eq!(basic.expiration, None);

        let full = parse_credential_file("CREDENTIALS AKID 4102444800 SECRET TOKEN").unwrap();
        assert_eq!(full.expiration.map(|e| e.timestamp()), Some(4_102_444_800));
        assert_eq!(full.session_token.as_deref(), Some("TOKEN"));

        let with_token = parse_credential_file("CREDENTIALS AKID SECRET TOKEN").unwrap();
        assert_eq!(with_token.secret_key, "SECRET");
        assert_eq!(with_token.session_token.as_deref(), Some("TOKEN"));

        assert!(parse_credential_file("").is_err());
        assert!(parse_credential_file("KEYS AKID SECRET").is_err());
        assert!(parse_credential_file("CREDENTIALS AKID").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquisition_times_out() {
        let result = acquire_credentials(&NeverAnswers, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(SinkError::Authentication(msg)) if msg.contains("did not answer")));
    }

    #[tokio::test]
    async fn test_expired_credentials_are_rejected() {
        let expired = Credentials {
            access_key: "AKID".into(),
            secret_key: "SECRET".into(),
            session_token: None,
            expiration: parse_expiration("1000"),
        };
        let provider = StaticCredentialProvider::new(expired, Duration::from_secs(60));
        let result = acquire_credentials(&provider, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SinkError::Authentication(_))));
    }
}
