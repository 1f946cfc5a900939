//! In-process partitioned append log with consumer-group semantics.
//!
//! Records are routed to a partition by key, so every record sharing a key
//! is totally ordered. Consumer groups hand out partitions to members via
//! claim/revoke callbacks and keep one committed offset per partition.

mod group;

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use group::{ClaimHandler, ConsumerGroup, PartitionClaim};
pub use schema::PartitionPosition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub topic: String,
    pub partitions: u32,
    /// Appends to a partition holding this many records fail as full.
    pub max_records_per_partition: Option<usize>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            topic: "logs".to_string(),
            partitions: 8,
            max_records_per_partition: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("log is closed")]
    Closed,
    #[error("partition {partition} is full")]
    PartitionFull { partition: u32 },
    #[error("partition key must not be empty")]
    EmptyKey,
    #[error("invalid log configuration: {0}")]
    InvalidConfig(String),
    #[error("consumer '{0}' is already a group member")]
    DuplicateMember(String),
    #[error("consumer '{0}' is not a group member")]
    UnknownMember(String),
}

/// A record handed to a consumer, tagged with where it lives in the log.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub key: String,
    pub payload: Arc<[u8]>,
    pub position: PartitionPosition,
    pub delivered_at: Instant,
}

/// Append side of the log.
#[async_trait]
pub trait LogProducer: Send + Sync {
    async fn append(&self, key: &str, payload: Vec<u8>) -> Result<PartitionPosition, LogError>;
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    payload: Arc<[u8]>,
}

struct Partition {
    records: RwLock<Vec<StoredRecord>>,
    high_watermark: watch::Sender<u64>,
}

pub(crate) struct LogShared {
    topic: String,
    partitions: Vec<Partition>,
    max_records_per_partition: Option<usize>,
    closed: AtomicBool,
    close_token: CancellationToken,
}

impl LogShared {
    fn partition(&self, partition: u32) -> Option<&Partition> {
        self.partitions.get(partition as usize)
    }

    pub(crate) fn partitions_len(&self) -> u32 {
        self.partitions.len() as u32
    }

    pub(crate) fn read(&self, partition: u32, offset: u64) -> Option<(String, Arc<[u8]>)> {
        let records = self.partition(partition)?.records.read().ok()?;
        records
            .get(offset as usize)
            .map(|record| (record.key.clone(), Arc::clone(&record.payload)))
    }

    pub(crate) fn high_watermark(&self, partition: u32) -> Option<u64> {
        self.partition(partition)
            .map(|partition| *partition.high_watermark.borrow())
    }

    pub(crate) fn subscribe(&self, partition: u32) -> Option<watch::Receiver<u64>> {
        self.partition(partition)
            .map(|partition| partition.high_watermark.subscribe())
    }

    pub(crate) fn close_token(&self) -> &CancellationToken {
        &self.close_token
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }
}

pub struct PartitionedLog {
    shared: Arc<LogShared>,
    groups: Mutex<HashMap<String, Arc<ConsumerGroup>>>,
}

impl PartitionedLog {
    pub fn new(config: LogConfig) -> Result<Self, LogError> {
        if config.partitions == 0 {
            return Err(LogError::InvalidConfig(
                "partition count must be positive".to_string(),
            ));
        }
        if config.topic.trim().is_empty() {
            return Err(LogError::InvalidConfig("topic must not be empty".to_string()));
        }
        let partitions = (0..config.partitions)
            .map(|_| Partition {
                records: RwLock::new(Vec::new()),
                high_watermark: watch::Sender::new(0),
            })
            .collect();
        Ok(Self {
            shared: Arc::new(LogShared {
                topic: config.topic,
                partitions,
                max_records_per_partition: config.max_records_per_partition,
                closed: AtomicBool::new(false),
                close_token: CancellationToken::new(),
            }),
            groups: Mutex::new(HashMap::new()),
        })
    }

    pub fn topic(&self) -> &str {
        self.shared.topic()
    }

    pub fn partitions_len(&self) -> u32 {
        self.shared.partitions_len()
    }

    pub fn partition_for_key(&self, key: &str) -> u32 {
        partition_for_key(key, self.partitions_len())
    }

    pub fn append_record(&self, key: &str, payload: Vec<u8>) -> Result<PartitionPosition, LogError> {
        if self.is_closed() {
            return Err(LogError::Closed);
        }
        if key.is_empty() {
            return Err(LogError::EmptyKey);
        }
        let partition_index = self.partition_for_key(key);
        let partition = &self.shared.partitions[partition_index as usize];
        let mut records = partition
            .records
            .write()
            .map_err(|_| LogError::Closed)?;
        if let Some(limit) = self.shared.max_records_per_partition
            && records.len() >= limit
        {
            return Err(LogError::PartitionFull {
                partition: partition_index,
            });
        }
        records.push(StoredRecord {
            key: key.to_string(),
            payload: Arc::from(payload),
        });
        let next_offset = records.len() as u64;
        // Published while the write lock is held so watchers never observe
        // offsets out of order.
        partition.high_watermark.send_replace(next_offset);
        Ok(PartitionPosition::new(partition_index, next_offset - 1))
    }

    /// Number of records ever appended to `partition`.
    pub fn high_watermark(&self, partition: u32) -> Option<u64> {
        self.shared.high_watermark(partition)
    }

    pub fn read(&self, position: PartitionPosition) -> Option<(String, Arc<[u8]>)> {
        self.shared.read(position.partition, position.offset)
    }

    /// Returns the named consumer group, creating it on first use. Committed
    /// offsets live as long as the log, so members may come and go.
    pub fn consumer_group(&self, group_id: &str) -> Arc<ConsumerGroup> {
        let mut groups = match self.groups.lock() {
            Ok(groups) => groups,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            groups
                .entry(group_id.to_string())
                .or_insert_with(|| Arc::new(ConsumerGroup::new(group_id, Arc::clone(&self.shared)))),
        )
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Rejects further appends and ends every outstanding claim.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(topic = %self.shared.topic, "partitioned log closed");
        }
        self.shared.close_token.cancel();
    }
}

#[async_trait]
impl LogProducer for PartitionedLog {
    async fn append(&self, key: &str, payload: Vec<u8>) -> Result<PartitionPosition, LogError> {
        self.append_record(key, payload)
    }
}

/// FNV-1a over the key bytes, reduced modulo the partition count.
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    let partitions = partitions.max(1);
    let mut hash: u64 = 1469598103934665603;
    for byte in key.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    (hash % partitions as u64) as u32
}
