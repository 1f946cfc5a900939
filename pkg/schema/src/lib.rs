pub mod codec;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

pub use codec::{CodecError, MAX_WIRE_RECORD_BYTES, decode_event, encode_event};

// ---------------------------------------------------------------------------
// Ingress request types
// ---------------------------------------------------------------------------

/// Event payload as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogPayload {
    pub name: String,
    /// Event time in nanoseconds since the unix epoch, producer supplied.
    pub timestamp: i64,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

/// Body of `POST /v1/logs`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IngestRequest {
    pub project_id: String,
    pub api_key: String,
    pub payload: LogPayload,
}

// ---------------------------------------------------------------------------
// Core domain types
// ---------------------------------------------------------------------------

/// A single application log event, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub project_id: String,
    /// Kept for audit only; never re-validated after ingress.
    pub api_key: String,
    pub name: String,
    pub timestamp: i64,
    pub data: HashMap<String, String>,
}

impl LogEvent {
    pub fn from_request(request: IngestRequest) -> Result<Self, ValidationError> {
        validate_request(&request)?;
        Ok(Self {
            project_id: request.project_id,
            api_key: request.api_key,
            name: request.payload.name,
            timestamp: request.payload.timestamp,
            data: request.payload.data,
        })
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        event_time(self.timestamp)
    }
}

/// Position assigned by the partitioned log at append time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionPosition {
    pub partition: u32,
    pub offset: u64,
}

impl PartitionPosition {
    pub fn new(partition: u32, offset: u64) -> Self {
        Self { partition, offset }
    }
}

impl std::fmt::Display for PartitionPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.partition, self.offset)
    }
}

/// How strictly the consumer checks embedded project identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProjectIdPolicy {
    #[default]
    Uuid,
    NonEmpty,
}

impl ProjectIdPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uuid => "uuid",
            Self::NonEmpty => "non-empty",
        }
    }
}

impl std::str::FromStr for ProjectIdPolicy {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "uuid" => Ok(Self::Uuid),
            "non-empty" | "nonempty" | "opaque" => Ok(Self::NonEmpty),
            _ => Err(ValidationError::InvalidValue("project_id_policy")),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
    #[error("malformed project identifier '{0}'")]
    MalformedProjectId(String),
}

pub fn validate_request(request: &IngestRequest) -> Result<(), ValidationError> {
    if request.project_id.trim().is_empty() {
        return Err(ValidationError::MissingField("project_id"));
    }
    Ok(())
}

pub fn validate_project_id(project_id: &str, policy: ProjectIdPolicy) -> Result<(), ValidationError> {
    if project_id.trim().is_empty() {
        return Err(ValidationError::MissingField("project_id"));
    }
    match policy {
        ProjectIdPolicy::NonEmpty => Ok(()),
        ProjectIdPolicy::Uuid => uuid::Uuid::parse_str(project_id)
            .map(|_| ())
            .map_err(|_| ValidationError::MalformedProjectId(project_id.to_string())),
    }
}

/// Converts an embedded nanosecond timestamp into a UTC instant.
pub fn event_time(timestamp_nanos: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_nanos(timestamp_nanos)
}

/// Helper to create a `LogEvent` with an empty data map.
pub fn event_builder(project_id: &str, name: &str, timestamp: i64) -> LogEvent {
    LogEvent {
        project_id: project_id.to_string(),
        api_key: "test-key".to_string(),
        name: name.to_string(),
        timestamp,
        data: HashMap::new(),
    }
}
