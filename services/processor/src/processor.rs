use std::{future::Future, sync::Arc, time::Duration};

use eventlog::ConsumerRecord;
use schema::{LogEvent, decode_event, validate_project_id};
use store::{
    ColumnarRow, ColumnarSink, DeadLetter, DeadLetterSink, EventFields, RowKey, SinkError,
    WideColumnSink,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ConfigError, ProcessorConfig},
    metrics::{Metrics, SinkKind, SinkLabels},
    policy::{FailurePolicy, RetryPolicy},
};

/// Handles to the stores every record is written to.
#[derive(Clone)]
pub struct ProcessorSinks {
    pub wide_column: Arc<dyn WideColumnSink>,
    pub columnar: Arc<dyn ColumnarSink>,
    pub dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

/// What happened to one record. Everything except `Abandoned` is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Persisted,
    Poison {
        reason: String,
    },
    SinkFailed {
        wide_column: Option<SinkError>,
        columnar: Option<SinkError>,
    },
    /// Cancelled while waiting to retry. Left for the next claimant.
    Abandoned,
}

impl RecordOutcome {
    pub fn should_commit(&self) -> bool {
        !matches!(self, Self::Abandoned)
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted)
    }
}

/// Decodes a wire record and writes it to both stores.
///
/// The two writes are independent upserts with no transaction between
/// them. A record can be visible in one store and missing from the other.
pub struct DualWriteProcessor {
    sinks: ProcessorSinks,
    config: ProcessorConfig,
    metrics: Arc<Metrics>,
}

impl DualWriteProcessor {
    pub fn new(
        sinks: ProcessorSinks,
        config: ProcessorConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ConfigError> {
        config.check_ttl()?;
        if config.failure_policy == FailurePolicy::DeadLetter && sinks.dead_letters.is_none() {
            return Err(ConfigError::MissingDeadLetterSink);
        }
        Ok(Self {
            sinks,
            config,
            metrics,
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn process(&self, record: &ConsumerRecord, cancel: &CancellationToken) -> RecordOutcome {
        let event = match decode_event(&record.payload) {
            Ok(event) => event,
            Err(err) => {
                let project_id = Some(record.key.clone()).filter(|key| !key.is_empty());
                return self.poison(record, project_id, err.to_string()).await;
            }
        };
        if let Err(err) = validate_project_id(&event.project_id, self.config.project_id_policy) {
            let project_id = Some(event.project_id.clone());
            return self.poison(record, project_id, err.to_string()).await;
        }

        let key = RowKey::new(&event.project_id, record.position);
        let fields = EventFields {
            event_time: event.event_time(),
            event_name: event.name.clone(),
            data: event.data.clone(),
        };
        let row = columnar_row(&event, record);

        let mut wide_column = self.put_wide_column(&key, &fields).await;
        let mut columnar = self.insert_columnar(&row).await;

        if let FailurePolicy::Retry(retry) = self.config.failure_policy {
            let mut attempts = 1;
            while (wide_column.is_err() || columnar.is_err()) && !retry.exhausted(attempts) {
                if !wait_for_retry(&retry, attempts, cancel).await {
                    tracing::info!(
                        position = %record.position,
                        attempts,
                        "claim cancelled while retrying; record left uncommitted"
                    );
                    return RecordOutcome::Abandoned;
                }
                attempts += 1;
                if wide_column.is_err() {
                    self.observe_retry(SinkKind::WideColumn);
                    wide_column = self.put_wide_column(&key, &fields).await;
                }
                if columnar.is_err() {
                    self.observe_retry(SinkKind::Columnar);
                    columnar = self.insert_columnar(&row).await;
                }
            }
        }

        match (wide_column, columnar) {
            (Ok(()), Ok(())) => {
                self.metrics.messages_processed.inc();
                tracing::debug!(position = %record.position, project_id = %event.project_id, "record persisted");
                RecordOutcome::Persisted
            }
            (wide_column, columnar) => {
                self.metrics.messages_failed.inc();
                let outcome = RecordOutcome::SinkFailed {
                    wide_column: wide_column.err(),
                    columnar: columnar.err(),
                };
                if self.config.failure_policy == FailurePolicy::DeadLetter {
                    self.dead_letter(record, Some(event.project_id), describe_sink_failure(&outcome))
                        .await;
                }
                outcome
            }
        }
    }

    async fn put_wide_column(&self, key: &RowKey, fields: &EventFields) -> Result<(), SinkError> {
        let write = self
            .sinks
            .wide_column
            .put(key.clone(), fields.clone(), self.config.ttl);
        let result = bounded(self.config.sink_timeout, write).await;
        if let Err(err) = &result {
            self.observe_sink_failure(SinkKind::WideColumn, key, err);
        }
        result
    }

    async fn insert_columnar(&self, row: &ColumnarRow) -> Result<(), SinkError> {
        let write = self.sinks.columnar.insert(row.clone());
        let result = bounded(self.config.sink_timeout, write).await;
        if let Err(err) = &result {
            let key = RowKey {
                project_id: row.project_id.clone(),
                partition: row.partition,
                offset: row.offset,
            };
            self.observe_sink_failure(SinkKind::Columnar, &key, err);
        }
        result
    }

    fn observe_sink_failure(&self, sink: SinkKind, key: &RowKey, err: &SinkError) {
        self.metrics
            .sink_failures
            .get_or_create(&SinkLabels { sink })
            .inc();
        tracing::warn!(
            sink = ?sink,
            project_id = %key.project_id,
            partition = key.partition,
            offset = key.offset,
            error = %err,
            "sink write failed"
        );
    }

    fn observe_retry(&self, sink: SinkKind) {
        self.metrics
            .sink_retries
            .get_or_create(&SinkLabels { sink })
            .inc();
    }

    async fn poison(
        &self,
        record: &ConsumerRecord,
        project_id: Option<String>,
        reason: String,
    ) -> RecordOutcome {
        self.metrics.messages_failed.inc();
        self.metrics.poison_messages.inc();
        tracing::warn!(position = %record.position, error = %reason, "skipping poison message");
        if self.config.failure_policy == FailurePolicy::DeadLetter {
            self.dead_letter(record, project_id, reason.clone()).await;
        }
        RecordOutcome::Poison { reason }
    }

    async fn dead_letter(&self, record: &ConsumerRecord, project_id: Option<String>, reason: String) {
        let Some(sink) = self.sinks.dead_letters.as_ref() else {
            return;
        };
        let letter = DeadLetter {
            position: record.position,
            project_id,
            payload: Arc::clone(&record.payload),
            reason,
        };
        match bounded(self.config.sink_timeout, sink.send(letter)).await {
            Ok(()) => {
                self.metrics.dead_letters.inc();
            }
            Err(err) => tracing::error!(
                position = %record.position,
                error = %err,
                "dead-letter write failed; record dropped"
            ),
        }
    }
}

fn columnar_row(event: &LogEvent, record: &ConsumerRecord) -> ColumnarRow {
    ColumnarRow {
        project_id: event.project_id.clone(),
        timestamp: event.event_time(),
        event_name: event.name.clone(),
        data: event.data.clone(),
        partition: record.position.partition,
        offset: record.position.offset,
    }
}

fn describe_sink_failure(outcome: &RecordOutcome) -> String {
    match outcome {
        RecordOutcome::SinkFailed {
            wide_column,
            columnar,
        } => [("wide_column", wide_column), ("columnar", columnar)]
            .into_iter()
            .filter_map(|(sink, err)| err.as_ref().map(|err| format!("{sink}: {err}")))
            .collect::<Vec<_>>()
            .join("; "),
        _ => String::new(),
    }
}

async fn bounded<F>(limit: Duration, write: F) -> Result<(), SinkError>
where
    F: Future<Output = Result<(), SinkError>>,
{
    tokio::time::timeout(limit, write)
        .await
        .unwrap_or(Err(SinkError::Timeout(limit)))
}

/// Sleeps out the backoff for the next retry. Returns `false` if the claim
/// was cancelled first.
async fn wait_for_retry(retry: &RetryPolicy, attempts: u32, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(retry.backoff(attempts)) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Instant,
    };

    use async_trait::async_trait;
    use eventlog::{LogConfig, PartitionedLog};
    use schema::{PartitionPosition, ProjectIdPolicy, encode_event, event_builder};
    use store::{
        InMemoryColumnarStore, InMemoryWideColumnStore, LogDeadLetterSink, MAX_ROW_TTL,
        ManualClock,
    };

    use super::*;

    const PROJECT: &str = "3f2b6a9e-8c1d-4e5f-9a0b-1c2d3e4f5a6b";

    struct Fixture {
        wide_column: Arc<InMemoryWideColumnStore>,
        columnar: Arc<InMemoryColumnarStore>,
        dead_letter_log: Arc<PartitionedLog>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                wide_column: Arc::new(InMemoryWideColumnStore::new()),
                columnar: Arc::new(InMemoryColumnarStore::new()),
                dead_letter_log: Arc::new(
                    PartitionedLog::new(LogConfig {
                        topic: "logs.dead-letter".to_string(),
                        partitions: 1,
                        max_records_per_partition: None,
                    })
                    .unwrap(),
                ),
            }
        }

        fn processor(&self, failure_policy: FailurePolicy) -> DualWriteProcessor {
            self.processor_with_columnar(failure_policy, self.columnar.clone())
        }

        fn processor_with_columnar(
            &self,
            failure_policy: FailurePolicy,
            columnar: Arc<dyn ColumnarSink>,
        ) -> DualWriteProcessor {
            let sinks = ProcessorSinks {
                wide_column: self.wide_column.clone(),
                columnar,
                dead_letters: Some(Arc::new(LogDeadLetterSink::new(
                    self.dead_letter_log.clone(),
                ))),
            };
            let config = ProcessorConfig {
                failure_policy,
                sink_timeout: Duration::from_millis(200),
                ..ProcessorConfig::default()
            };
            DualWriteProcessor::new(sinks, config, Arc::new(Metrics::new())).unwrap()
        }

        fn dead_letters(&self) -> u64 {
            self.dead_letter_log.high_watermark(0).unwrap_or(0)
        }
    }

    fn record(payload: Vec<u8>, offset: u64) -> ConsumerRecord {
        ConsumerRecord {
            key: PROJECT.to_string(),
            payload: Arc::from(payload),
            position: PartitionPosition::new(2, offset),
            delivered_at: Instant::now(),
        }
    }

    fn click(offset: u64) -> ConsumerRecord {
        let mut event = event_builder(PROJECT, "click", 1_700_000_000_000_000_000);
        event.data.insert("x".to_string(), "1".to_string());
        record(encode_event(&event).unwrap(), offset)
    }

    /// Columnar sink that fails a fixed number of times before succeeding.
    struct FlakyColumnar {
        inner: InMemoryColumnarStore,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl ColumnarSink for FlakyColumnar {
        async fn insert(&self, row: ColumnarRow) -> Result<(), SinkError> {
            let left = self.failures_left.load(Ordering::Acquire);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::Release);
                return Err(SinkError::Unavailable("flaky".to_string()));
            }
            self.inner.insert(row).await
        }
    }

    struct HangingColumnar;

    #[async_trait]
    impl ColumnarSink for HangingColumnar {
        async fn insert(&self, _row: ColumnarRow) -> Result<(), SinkError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn writes_both_sinks_keyed_by_log_position() {
        let fixture = Fixture::new();
        let processor = fixture.processor(FailurePolicy::Skip);

        let outcome = processor.process(&click(7), &CancellationToken::new()).await;
        assert_eq!(outcome, RecordOutcome::Persisted);

        let key = RowKey::new(PROJECT, PartitionPosition::new(2, 7));
        let fields = fixture.wide_column.get(&key).unwrap();
        assert_eq!(fields.event_name, "click");
        assert_eq!(fields.event_time.timestamp(), 1_700_000_000);
        let rows = fixture.columnar.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].partition, rows[0].offset), (2, 7));
        assert_eq!(rows[0].data.get("x").map(String::as_str), Some("1"));
        assert_eq!(processor.metrics().messages_processed.get(), 1);
    }

    #[tokio::test]
    async fn columnar_failure_leaves_wide_column_write_intact() {
        let fixture = Fixture::new();
        let processor = fixture.processor(FailurePolicy::Skip);
        fixture.columnar.set_available(false);

        let outcome = processor.process(&click(0), &CancellationToken::new()).await;
        assert!(matches!(
            outcome,
            RecordOutcome::SinkFailed {
                wide_column: None,
                columnar: Some(SinkError::Unavailable(_)),
            }
        ));
        assert!(outcome.should_commit());
        assert_eq!(fixture.wide_column.live_len(), 1);
        assert_eq!(processor.metrics().messages_failed.get(), 1);
        assert_eq!(processor.metrics().sink_failure_count(SinkKind::Columnar), 1);
    }

    #[tokio::test]
    async fn wide_column_failure_leaves_columnar_write_intact() {
        let fixture = Fixture::new();
        let processor = fixture.processor(FailurePolicy::Skip);
        fixture.wide_column.set_available(false);

        let outcome = processor.process(&click(0), &CancellationToken::new()).await;
        assert!(matches!(
            outcome,
            RecordOutcome::SinkFailed {
                wide_column: Some(_),
                columnar: None,
            }
        ));
        assert_eq!(fixture.columnar.len(), 1);
    }

    #[tokio::test]
    async fn undecodable_payload_is_poison_and_committed() {
        let fixture = Fixture::new();
        let processor = fixture.processor(FailurePolicy::Skip);

        let outcome = processor
            .process(&record(b"garbage".to_vec(), 0), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, RecordOutcome::Poison { .. }));
        assert!(outcome.should_commit());
        assert_eq!(processor.metrics().messages_failed.get(), 1);
        assert_eq!(processor.metrics().poison_messages.get(), 1);
        assert!(fixture.columnar.is_empty());
        assert_eq!(fixture.dead_letters(), 0);
    }

    #[tokio::test]
    async fn non_uuid_project_is_poison_under_uuid_policy() {
        let fixture = Fixture::new();
        let processor = fixture.processor(FailurePolicy::Skip);
        assert_eq!(processor.config().project_id_policy, ProjectIdPolicy::Uuid);

        let event = event_builder("p1", "click", 1);
        let outcome = processor
            .process(&record(encode_event(&event).unwrap(), 0), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, RecordOutcome::Poison { .. }));
        assert_eq!(fixture.wide_column.live_len(), 0);
    }

    #[tokio::test]
    async fn dead_letter_policy_parks_poison_and_sink_failures() {
        let fixture = Fixture::new();
        let processor = fixture.processor(FailurePolicy::DeadLetter);

        processor
            .process(&record(b"garbage".to_vec(), 0), &CancellationToken::new())
            .await;
        fixture.columnar.set_available(false);
        processor.process(&click(1), &CancellationToken::new()).await;

        assert_eq!(fixture.dead_letters(), 2);
        assert_eq!(processor.metrics().dead_letters.get(), 2);
        let (key, payload) = fixture
            .dead_letter_log
            .read(PartitionPosition::new(0, 0))
            .unwrap();
        assert_eq!(key, PROJECT);
        assert_eq!(&payload[..], b"garbage");
    }

    #[tokio::test]
    async fn dead_letter_policy_requires_a_sink() {
        let sinks = ProcessorSinks {
            wide_column: Arc::new(InMemoryWideColumnStore::new()),
            columnar: Arc::new(InMemoryColumnarStore::new()),
            dead_letters: None,
        };
        let config = ProcessorConfig {
            failure_policy: FailurePolicy::DeadLetter,
            ..ProcessorConfig::default()
        };
        assert_eq!(
            DualWriteProcessor::new(sinks, config, Arc::new(Metrics::new())).err(),
            Some(ConfigError::MissingDeadLetterSink)
        );
    }

    #[tokio::test]
    async fn wide_column_rows_carry_the_configured_ttl() {
        let clock = Arc::new(ManualClock::default());
        let wide_column = Arc::new(InMemoryWideColumnStore::with_clock(clock.clone()));
        let sinks = ProcessorSinks {
            wide_column: wide_column.clone(),
            columnar: Arc::new(InMemoryColumnarStore::new()),
            dead_letters: None,
        };
        let config = ProcessorConfig {
            ttl: Duration::from_secs(60),
            ..ProcessorConfig::default()
        };
        let processor = DualWriteProcessor::new(sinks, config, Arc::new(Metrics::new())).unwrap();

        let outcome = processor.process(&click(0), &CancellationToken::new()).await;
        assert_eq!(outcome, RecordOutcome::Persisted);
        let key = RowKey::new(PROJECT, PartitionPosition::new(2, 0));

        clock.advance(Duration::from_secs(59));
        assert!(wide_column.get(&key).is_some());
        clock.advance(Duration::from_secs(1));
        assert_eq!(wide_column.get(&key), None);
    }

    #[tokio::test]
    async fn ttl_beyond_row_store_range_is_refused_up_front() {
        let sinks = ProcessorSinks {
            wide_column: Arc::new(InMemoryWideColumnStore::new()),
            columnar: Arc::new(InMemoryColumnarStore::new()),
            dead_letters: None,
        };
        let config = ProcessorConfig {
            ttl: MAX_ROW_TTL + Duration::from_secs(1),
            ..ProcessorConfig::default()
        };
        assert!(matches!(
            DualWriteProcessor::new(sinks, config, Arc::new(Metrics::new())),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_retries_only_the_failed_sink() {
        let fixture = Fixture::new();
        let flaky = Arc::new(FlakyColumnar {
            inner: InMemoryColumnarStore::new(),
            failures_left: AtomicU32::new(2),
        });
        let processor = fixture.processor_with_columnar(
            FailurePolicy::Retry(RetryPolicy {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
                max_attempts: Some(5),
            }),
            flaky.clone(),
        );

        let outcome = processor.process(&click(0), &CancellationToken::new()).await;
        assert_eq!(outcome, RecordOutcome::Persisted);
        assert_eq!(flaky.inner.len(), 1);
        assert_eq!(processor.metrics().sink_retry_count(SinkKind::Columnar), 2);
        assert_eq!(processor.metrics().sink_retry_count(SinkKind::WideColumn), 0);
        assert_eq!(processor.metrics().messages_failed.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retry_gives_up_and_commits() {
        let fixture = Fixture::new();
        let processor = fixture.processor(FailurePolicy::Retry(RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
            max_attempts: Some(3),
        }));
        fixture.columnar.set_available(false);

        let outcome = processor.process(&click(0), &CancellationToken::new()).await;
        assert!(matches!(outcome, RecordOutcome::SinkFailed { .. }));
        assert!(outcome.should_commit());
        assert_eq!(processor.metrics().sink_failure_count(SinkKind::Columnar), 3);
        assert_eq!(processor.metrics().messages_failed.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_retry_abandons_record() {
        let fixture = Fixture::new();
        let processor = fixture.processor(FailurePolicy::Retry(RetryPolicy {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(1),
            max_attempts: None,
        }));
        fixture.columnar.set_available(false);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            trigger.cancel();
        });

        let outcome = processor.process(&click(0), &cancel).await;
        assert_eq!(outcome, RecordOutcome::Abandoned);
        assert!(!outcome.should_commit());
        assert_eq!(processor.metrics().messages_failed.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poison_is_never_retried() {
        let fixture = Fixture::new();
        let processor = fixture.processor(FailurePolicy::Retry(RetryPolicy::default()));
        let outcome = processor
            .process(&record(Vec::new(), 0), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, RecordOutcome::Poison { .. }));
        assert_eq!(processor.metrics().sink_retry_count(SinkKind::WideColumn), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_sink_times_out_without_blocking_the_other() {
        let fixture = Fixture::new();
        let processor =
            fixture.processor_with_columnar(FailurePolicy::Skip, Arc::new(HangingColumnar));

        let outcome = processor.process(&click(0), &CancellationToken::new()).await;
        assert!(matches!(
            outcome,
            RecordOutcome::SinkFailed {
                wide_column: None,
                columnar: Some(SinkError::Timeout(_)),
            }
        ));
        assert_eq!(fixture.wide_column.live_len(), 1);
    }
}
