//! Prometheus metrics for the dual-write consumer.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum SinkKind {
    WideColumn,
    Columnar,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SinkLabels {
    pub sink: SinkKind,
}

pub struct Metrics {
    registry: Registry,

    /// Records written to both sinks.
    pub messages_processed: Counter,
    /// Records with any decode, validation or sink error. One per record.
    pub messages_failed: Counter,
    /// Delivery to commit, successful records only.
    pub write_latency_seconds: Histogram,
    pub sink_failures: Family<SinkLabels, Counter>,
    pub sink_retries: Family<SinkLabels, Counter>,
    pub poison_messages: Counter,
    pub dead_letters: Counter,
    pub claimed_partitions: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let messages_processed = Counter::default();
        registry.register(
            "processor_messages_processed",
            "Total number of messages successfully processed",
            messages_processed.clone(),
        );

        let messages_failed = Counter::default();
        registry.register(
            "processor_messages_failed",
            "Total number of messages that failed processing",
            messages_failed.clone(),
        );

        // 1ms to ~16s
        let write_latency_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 15));
        registry.register(
            "processor_write_latency_seconds",
            "Seconds from delivery to offset commit for persisted messages",
            write_latency_seconds.clone(),
        );

        let sink_failures = Family::<SinkLabels, Counter>::default();
        registry.register(
            "processor_sink_failures",
            "Failed sink calls, including ones later retried",
            sink_failures.clone(),
        );

        let sink_retries = Family::<SinkLabels, Counter>::default();
        registry.register(
            "processor_sink_retries",
            "Sink calls reissued under the retry policy",
            sink_retries.clone(),
        );

        let poison_messages = Counter::default();
        registry.register(
            "processor_poison_messages",
            "Messages that could not be decoded or carried a malformed identifier",
            poison_messages.clone(),
        );

        let dead_letters = Counter::default();
        registry.register(
            "processor_dead_letters",
            "Messages parked on the dead-letter log",
            dead_letters.clone(),
        );

        let claimed_partitions = Gauge::default();
        registry.register(
            "processor_claimed_partitions",
            "Partitions currently owned by this consumer",
            claimed_partitions.clone(),
        );

        Self {
            registry,
            messages_processed,
            messages_failed,
            write_latency_seconds,
            sink_failures,
            sink_retries,
            poison_messages,
            dead_letters,
            claimed_partitions,
        }
    }

    pub fn sink_failure_count(&self, sink: SinkKind) -> u64 {
        self.sink_failures.get_or_create(&SinkLabels { sink }).get()
    }

    pub fn sink_retry_count(&self, sink: SinkKind) -> u64 {
        self.sink_retries.get_or_create(&SinkLabels { sink }).get()
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}
