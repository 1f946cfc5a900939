use std::time::Duration;

use schema::ProjectIdPolicy;
use settings::{InvalidValue, parse, text};
use store::MAX_ROW_TTL;

use crate::policy::{FailurePolicy, RetryPolicy};

pub const ENV_GROUP_ID: &str = "LOGPIPE_GROUP_ID";
pub const ENV_MEMBER_ID: &str = "LOGPIPE_MEMBER_ID";
pub const ENV_TTL_SECONDS: &str = "LOGPIPE_TTL_SECONDS";
pub const ENV_SINK_TIMEOUT_MS: &str = "LOGPIPE_SINK_TIMEOUT_MS";
pub const ENV_DRAIN_TIMEOUT_MS: &str = "LOGPIPE_DRAIN_TIMEOUT_MS";
pub const ENV_FAILURE_POLICY: &str = "LOGPIPE_FAILURE_POLICY";
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "LOGPIPE_RETRY_MAX_ATTEMPTS";
pub const ENV_RETRY_INITIAL_BACKOFF_MS: &str = "LOGPIPE_RETRY_INITIAL_BACKOFF_MS";
pub const ENV_RETRY_MAX_BACKOFF_MS: &str = "LOGPIPE_RETRY_MAX_BACKOFF_MS";
pub const ENV_PROJECT_ID_POLICY: &str = "LOGPIPE_PROJECT_ID_POLICY";
pub const ENV_PROCESSOR_METRICS_BIND: &str = "LOGPIPE_PROCESSOR_METRICS_BIND";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("dead-letter failure policy requires a dead-letter sink")]
    MissingDeadLetterSink,
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
pub struct ProcessorConfig {
    pub group_id: String,
    pub member_id: String,
    /// Applied to every wide-column write. Zero disables expiry; anything
    /// above [`MAX_ROW_TTL`] is rejected.
    pub ttl: Duration,
    pub sink_timeout: Duration,
    /// How long shutdown waits for the consumer to catch up with records
    /// the gateway already accepted.
    pub drain_timeout: Duration,
    pub failure_policy: FailurePolicy,
    pub project_id_policy: ProjectIdPolicy,
    pub metrics_bind: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            group_id: "log-processor".to_string(),
            member_id: format!("processor-{}", std::process::id()),
            ttl: Duration::from_secs(7 * 24 * 3600),
            sink_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
            failure_policy: FailurePolicy::Skip,
            project_id_policy: ProjectIdPolicy::Uuid,
            metrics_bind: "127.0.0.1:2112".to_string(),
        }
    }
}

impl ProcessorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let ttl = parse::<u64>(&lookup, ENV_TTL_SECONDS)?
            .map(Duration::from_secs)
            .unwrap_or(defaults.ttl);
        let sink_timeout = match parse::<u64>(&lookup, ENV_SINK_TIMEOUT_MS)? {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    key: ENV_SINK_TIMEOUT_MS,
                    value: "0".to_string(),
                });
            }
            Some(ms) => Duration::from_millis(ms),
            None => defaults.sink_timeout,
        };
        let drain_timeout = parse::<u64>(&lookup, ENV_DRAIN_TIMEOUT_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.drain_timeout);

        let mut failure_policy =
            parse::<FailurePolicy>(&lookup, ENV_FAILURE_POLICY)?.unwrap_or(defaults.failure_policy);
        if let FailurePolicy::Retry(retry) = &mut failure_policy {
            apply_retry_overrides(retry, &lookup)?;
        }

        let config = Self {
            group_id: text(&lookup, ENV_GROUP_ID).unwrap_or(defaults.group_id),
            member_id: text(&lookup, ENV_MEMBER_ID).unwrap_or(defaults.member_id),
            ttl,
            sink_timeout,
            drain_timeout,
            failure_policy,
            project_id_policy: parse::<ProjectIdPolicy>(&lookup, ENV_PROJECT_ID_POLICY)?
                .unwrap_or(defaults.project_id_policy),
            metrics_bind: text(&lookup, ENV_PROCESSOR_METRICS_BIND)
                .unwrap_or(defaults.metrics_bind),
        };
        config.check_ttl()?;
        Ok(config)
    }

    pub(crate) fn check_ttl(&self) -> Result<(), ConfigError> {
        if self.ttl > MAX_ROW_TTL {
            return Err(ConfigError::Invalid {
                key: ENV_TTL_SECONDS,
                value: self.ttl.as_secs().to_string(),
            });
        }
        Ok(())
    }
}

fn apply_retry_overrides(
    retry: &mut RetryPolicy,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    // 0 means unbounded.
    if let Some(attempts) = parse::<u32>(lookup, ENV_RETRY_MAX_ATTEMPTS)? {
        retry.max_attempts = (attempts > 0).then_some(attempts);
    }
    if let Some(ms) = parse::<u64>(lookup, ENV_RETRY_INITIAL_BACKOFF_MS)? {
        retry.initial_backoff = Duration::from_millis(ms);
    }
    if let Some(ms) = parse::<u64>(lookup, ENV_RETRY_MAX_BACKOFF_MS)? {
        retry.max_backoff = Duration::from_millis(ms);
    }
    if retry.max_backoff < retry.initial_backoff {
        return Err(ConfigError::Invalid {
            key: ENV_RETRY_MAX_BACKOFF_MS,
            value: retry.max_backoff.as_millis().to_string(),
        });
    }
    Ok(())
}
