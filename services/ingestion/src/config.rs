use std::time::Duration;

use schema::ProjectIdPolicy;
use settings::{InvalidValue, positive, text};

pub const ENV_INGEST_BIND: &str = "LOGPIPE_INGEST_BIND";
pub const ENV_AUTH_TIMEOUT_MS: &str = "LOGPIPE_AUTH_TIMEOUT_MS";
pub const ENV_MAX_BODY_BYTES: &str = "LOGPIPE_MAX_BODY_BYTES";

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

impl From<InvalidValue> for ConfigError {
    fn from(err: InvalidValue) -> Self {
        Self::Invalid {
            key: err.key,
            value: err.value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionConfig {
    pub bind_addr: String,
    /// Upper bound on a single authorization check. Expiry counts as a
    /// rejection.
    pub auth_timeout: Duration,
    pub max_body_bytes: usize,
    /// Identifiers failing this are a 400. Not read from the environment;
    /// the pipeline copies the consumer's policy here so nothing is
    /// accepted that the consumer would discard.
    pub project_id_policy: ProjectIdPolicy,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            project_id_policy: ProjectIdPolicy::NonEmpty,
        }
    }
}

impl IngestionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let auth_timeout = positive::<u64>(&lookup, ENV_AUTH_TIMEOUT_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.auth_timeout);
        let max_body_bytes =
            positive::<usize>(&lookup, ENV_MAX_BODY_BYTES)?.unwrap_or(defaults.max_body_bytes);
        Ok(Self {
            bind_addr: text(&lookup, ENV_INGEST_BIND).unwrap_or(defaults.bind_addr),
            auth_timeout,
            max_body_bytes,
            project_id_policy: defaults.project_id_policy,
        })
    }
}
