use std::{fmt, str::FromStr, time::Duration};

/// What the consumer does with a record it could not fully persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Count, log, commit. The failed sink never sees the record.
    #[default]
    Skip,
    /// Park the raw record on the dead-letter sink, then commit.
    DeadLetter,
    /// Retry failed sink writes with backoff. Poison records are still
    /// skipped since no retry can fix them.
    Retry(RetryPolicy),
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::DeadLetter => "dead-letter",
            Self::Retry(_) => "retry",
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown failure policy '{0}' (expected skip, dead-letter or retry)")]
pub struct UnknownFailurePolicy(pub String);

impl FromStr for FailurePolicy {
    type Err = UnknownFailurePolicy;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "dead-letter" | "dead_letter" | "dlq" => Ok(Self::DeadLetter),
            "retry" => Ok(Self::Retry(RetryPolicy::default())),
            other => Err(UnknownFailurePolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Total attempts per sink including the first. `None` retries until
    /// the write succeeds or the claim is cancelled.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            max_attempts: Some(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), doubling each time.
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_policy_names() {
        assert_eq!("skip".parse::<FailurePolicy>().unwrap(), FailurePolicy::Skip);
        assert_eq!(" DLQ ".parse::<FailurePolicy>().unwrap(), FailurePolicy::DeadLetter);
        assert_eq!(
            "retry".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::Retry(RetryPolicy::default())
        );
        assert!("drop".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            max_attempts: None,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(60), Duration::from_millis(350));
    }

    #[test]
    fn unbounded_policy_is_never_exhausted() {
        let bounded = RetryPolicy::default();
        assert!(!bounded.exhausted(4));
        assert!(bounded.exhausted(5));
        let unbounded = RetryPolicy {
            max_attempts: None,
            ..RetryPolicy::default()
        };
        assert!(!unbounded.exhausted(u32::MAX));
    }
}
