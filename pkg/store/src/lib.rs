//! Write paths for persisted events.
//!
//! Two independent sinks receive every consumed record: a wide-column store
//! keyed by `(project_id, partition, offset)` with per-row expiry, and an
//! append-only columnar store used for aggregate search. Neither offers
//! cross-call transactions; callers treat each as independently fallible.

mod clock;
mod columnar;
mod dead_letter;
mod wide_column;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schema::PartitionPosition;

pub use clock::{Clock, ManualClock, SystemClock};
pub use columnar::InMemoryColumnarStore;
pub use dead_letter::LogDeadLetterSink;
pub use wide_column::InMemoryWideColumnStore;

/// Longest row TTL the wide-column store accepts.
pub const MAX_ROW_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

/// Wide-column row key. Re-delivering the same log offset overwrites the
/// same row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub project_id: String,
    pub partition: u32,
    pub offset: u64,
}

impl RowKey {
    pub fn new(project_id: &str, position: PartitionPosition) -> Self {
        Self {
            project_id: project_id.to_string(),
            partition: position.partition,
            offset: position.offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFields {
    pub event_time: DateTime<Utc>,
    pub event_name: String,
    pub data: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnarRow {
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_name: String,
    pub data: HashMap<String, String>,
    pub partition: u32,
    pub offset: u64,
}

/// A record the consumer gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub position: PartitionPosition,
    /// Known only when the record decoded far enough to read it.
    pub project_id: Option<String>,
    pub payload: Arc<[u8]>,
    pub reason: String,
}

#[async_trait]
pub trait WideColumnSink: Send + Sync {
    async fn put(&self, key: RowKey, fields: EventFields, ttl: Duration) -> Result<(), SinkError>;
}

#[async_trait]
pub trait ColumnarSink: Send + Sync {
    async fn insert(&self, row: ColumnarRow) -> Result<(), SinkError>;
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: DeadLetter) -> Result<(), SinkError>;
}
