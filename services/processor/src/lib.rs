//! Dual-write consumer.
//!
//! Claims partitions of the event log through a consumer group and writes
//! every record to a wide-column store (with TTL) and a columnar store.
//! Failures are counted and logged; what happens to the failed record is
//! decided by the configured [`FailurePolicy`].

pub mod config;
pub mod consumer;
pub mod metrics;
pub mod policy;
pub mod processor;

pub use config::{ConfigError, ProcessorConfig};
pub use consumer::{ClaimState, DualWriteConsumer};
pub use metrics::Metrics;
pub use policy::{FailurePolicy, RetryPolicy};
pub use processor::{DualWriteProcessor, ProcessorSinks, RecordOutcome};
