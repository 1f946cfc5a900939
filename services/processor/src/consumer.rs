use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use eventlog::{ClaimHandler, ConsumerGroup, LogError, PartitionClaim};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::processor::DualWriteProcessor;

/// Lifecycle of one partition claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Idle,
    Claimed,
    Draining,
    Released,
}

type ClaimStates = Arc<Mutex<HashMap<u32, ClaimState>>>;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct PartitionLoop {
    handle: JoinHandle<ClaimState>,
    cancel: CancellationToken,
}

/// Group member that runs one sequential processing loop per claimed
/// partition. Loops share the processor and its sink handles, nothing else.
pub struct DualWriteConsumer {
    processor: Arc<DualWriteProcessor>,
    loops: Mutex<HashMap<u32, PartitionLoop>>,
    states: ClaimStates,
}

impl DualWriteConsumer {
    pub fn new(processor: Arc<DualWriteProcessor>) -> Self {
        Self {
            processor,
            loops: Mutex::new(HashMap::new()),
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn processor(&self) -> &Arc<DualWriteProcessor> {
        &self.processor
    }

    pub fn claim_state(&self, partition: u32) -> ClaimState {
        lock(&self.states)
            .get(&partition)
            .copied()
            .unwrap_or(ClaimState::Idle)
    }

    /// Partitions with a running loop.
    pub fn active_partitions(&self) -> Vec<u32> {
        let mut partitions: Vec<u32> = lock(&self.loops).keys().copied().collect();
        partitions.sort_unstable();
        partitions
    }

    /// Joins `group`, processes claimed partitions until `shutdown` fires,
    /// then leaves. Leaving revokes every claim and waits for in-flight
    /// writes to finish. Records still uncommitted at that point stay in the
    /// log; call [`drain`](Self::drain) first to catch up.
    pub async fn run(
        self: Arc<Self>,
        group: Arc<ConsumerGroup>,
        member_id: &str,
        shutdown: CancellationToken,
    ) -> Result<(), LogError> {
        group.join(member_id, self.clone()).await?;
        tracing::info!(
            group = group.group_id(),
            member = member_id,
            policy = %self.processor.config().failure_policy,
            "dual-write consumer running"
        );
        shutdown.cancelled().await;

        match group.leave(member_id).await {
            Ok(()) | Err(LogError::UnknownMember(_)) => {}
            Err(err) => return Err(err),
        }
        // Loops that ended on their own (log closed) were never revoked.
        let leftover: Vec<(u32, PartitionLoop)> = lock(&self.loops).drain().collect();
        for (partition, partition_loop) in leftover {
            self.finish_loop(partition, partition_loop.handle).await;
        }
        tracing::info!(group = group.group_id(), member = member_id, "dual-write consumer stopped");
        Ok(())
    }

    /// Waits until `group` has committed every record appended so far, or
    /// until `timeout` passes. Producers must already be stopped. Returns
    /// whether the backlog reached zero.
    pub async fn drain(&self, group: &ConsumerGroup, timeout: Duration) -> bool {
        let backlog = group.lag();
        if backlog > 0 {
            tracing::info!(group = group.group_id(), backlog, "draining accepted records");
        }
        let drained = tokio::time::timeout(timeout, async {
            while group.lag() > 0 {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok();
        if !drained {
            tracing::warn!(
                group = group.group_id(),
                backlog = group.lag(),
                timeout_ms = timeout.as_millis() as u64,
                "drain timed out; uncommitted records left in the log"
            );
        }
        drained
    }

    async fn finish_loop(&self, partition: u32, handle: JoinHandle<ClaimState>) {
        let state = match handle.await {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(partition, error = %err, "partition loop panicked");
                ClaimState::Released
            }
        };
        lock(&self.states).insert(partition, state);
        self.processor.metrics().claimed_partitions.dec();
    }
}

#[async_trait]
impl ClaimHandler for DualWriteConsumer {
    async fn on_claim(&self, claim: PartitionClaim) {
        let partition = claim.partition();
        // A loop still running for this partition stops at its next record
        // boundary before the new one starts.
        let stale = lock(&self.loops).remove(&partition);
        if let Some(stale) = stale {
            tracing::warn!(partition, "partition claimed again; retiring previous loop");
            stale.cancel.cancel();
            self.finish_loop(partition, stale.handle).await;
        }

        lock(&self.states).insert(partition, ClaimState::Claimed);
        self.processor.metrics().claimed_partitions.inc();

        let cancel = claim.cancellation();
        let span = tracing::info_span!("partition", group = claim.group_id(), partition);
        let handle = tokio::spawn(
            drain_partition(claim, Arc::clone(&self.processor), Arc::clone(&self.states))
                .instrument(span),
        );
        lock(&self.loops).insert(partition, PartitionLoop { handle, cancel });
    }

    async fn on_revoke(&self, partition: u32) {
        let partition_loop = lock(&self.loops).remove(&partition);
        if let Some(partition_loop) = partition_loop {
            self.finish_loop(partition, partition_loop.handle).await;
        }
    }
}

/// Pull, process, commit, in offset order, until the claim is revoked.
async fn drain_partition(
    mut claim: PartitionClaim,
    processor: Arc<DualWriteProcessor>,
    states: ClaimStates,
) -> ClaimState {
    let cancel = claim.cancellation();
    tracing::info!(start_offset = claim.start_offset(), "partition loop started");
    let mut draining = false;

    while let Some(record) = claim.next_record().await {
        if !draining {
            draining = true;
            lock(&states).insert(claim.partition(), ClaimState::Draining);
        }
        let outcome = processor.process(&record, &cancel).await;
        if !outcome.should_commit() {
            break;
        }
        claim.commit(&record);
        if outcome.is_persisted() {
            processor
                .metrics()
                .write_latency_seconds
                .observe(record.delivered_at.elapsed().as_secs_f64());
        }
    }

    tracing::info!("partition loop released");
    lock(&states).insert(claim.partition(), ClaimState::Released);
    ClaimState::Released
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use eventlog::{LogConfig, PartitionedLog, partition_for_key};
    use schema::{PartitionPosition, ProjectIdPolicy, encode_event, event_builder};
    use store::{
        ColumnarRow, ColumnarSink, InMemoryColumnarStore, InMemoryWideColumnStore, SinkError,
    };

    use super::*;
    use crate::{
        config::ProcessorConfig,
        metrics::Metrics,
        policy::{FailurePolicy, RetryPolicy},
        processor::ProcessorSinks,
    };

    struct Pipeline {
        log: Arc<PartitionedLog>,
        wide_column: Arc<InMemoryWideColumnStore>,
        columnar: Arc<InMemoryColumnarStore>,
        consumer: Arc<DualWriteConsumer>,
    }

    impl Pipeline {
        fn new(partitions: u32, failure_policy: FailurePolicy) -> Self {
            Self::with_columnar(partitions, failure_policy, |store| {
                store as Arc<dyn ColumnarSink>
            })
        }

        /// `wrap` puts a test sink in front of the columnar store the
        /// fixture inspects.
        fn with_columnar(
            partitions: u32,
            failure_policy: FailurePolicy,
            wrap: impl FnOnce(Arc<InMemoryColumnarStore>) -> Arc<dyn ColumnarSink>,
        ) -> Self {
            let log = Arc::new(
                PartitionedLog::new(LogConfig {
                    topic: "logs".to_string(),
                    partitions,
                    max_records_per_partition: None,
                })
                .unwrap(),
            );
            let wide_column = Arc::new(InMemoryWideColumnStore::new());
            let columnar = Arc::new(InMemoryColumnarStore::new());
            let config = ProcessorConfig {
                failure_policy,
                project_id_policy: ProjectIdPolicy::NonEmpty,
                ..ProcessorConfig::default()
            };
            let sinks = ProcessorSinks {
                wide_column: wide_column.clone(),
                columnar: wrap(columnar.clone()),
                dead_letters: None,
            };
            let processor =
                DualWriteProcessor::new(sinks, config, Arc::new(Metrics::new())).unwrap();
            Self {
                log,
                wide_column,
                columnar,
                consumer: Arc::new(DualWriteConsumer::new(Arc::new(processor))),
            }
        }

        fn append(&self, project_id: &str, name: &str) -> PartitionPosition {
            let event = event_builder(project_id, name, 1_700_000_000_000_000_000);
            self.log
                .append_record(project_id, encode_event(&event).unwrap())
                .unwrap()
        }

        fn metrics(&self) -> &Metrics {
            self.consumer.processor().metrics()
        }
    }

    struct SlowColumnar {
        inner: Arc<InMemoryColumnarStore>,
        delay: Duration,
    }

    #[async_trait]
    impl ColumnarSink for SlowColumnar {
        async fn insert(&self, row: ColumnarRow) -> Result<(), SinkError> {
            tokio::time::sleep(self.delay).await;
            self.inner.insert(row).await
        }
    }

    /// Holds inserts for one project until `gate` is cancelled.
    struct GatedColumnar {
        inner: Arc<InMemoryColumnarStore>,
        held_project: String,
        gate: CancellationToken,
    }

    #[async_trait]
    impl ColumnarSink for GatedColumnar {
        async fn insert(&self, row: ColumnarRow) -> Result<(), SinkError> {
            if row.project_id == self.held_project {
                self.gate.cancelled().await;
            }
            self.inner.insert(row).await
        }
    }

    fn project_on(partition: u32, partitions: u32) -> String {
        (0..)
            .map(|i| format!("project-{i}"))
            .find(|project| partition_for_key(project, partitions) == partition)
            .unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn claim_moves_through_states_and_releases_on_revoke() {
        let pipeline = Pipeline::new(1, FailurePolicy::Skip);
        let group = pipeline.log.consumer_group("g");
        assert_eq!(pipeline.consumer.claim_state(0), ClaimState::Idle);

        group.join("m1", pipeline.consumer.clone()).await.unwrap();
        assert_eq!(pipeline.consumer.claim_state(0), ClaimState::Claimed);
        assert_eq!(pipeline.consumer.active_partitions(), vec![0]);

        pipeline.append("p1", "click");
        wait_until(|| pipeline.consumer.claim_state(0) == ClaimState::Draining).await;

        group.leave("m1").await.unwrap();
        assert_eq!(pipeline.consumer.claim_state(0), ClaimState::Released);
        assert!(pipeline.consumer.active_partitions().is_empty());
        assert_eq!(pipeline.metrics().claimed_partitions.get(), 0);
    }

    #[tokio::test]
    async fn poison_record_does_not_stall_the_partition() {
        let pipeline = Pipeline::new(1, FailurePolicy::Skip);
        let group = pipeline.log.consumer_group("g");
        group.join("m1", pipeline.consumer.clone()).await.unwrap();

        pipeline.log.append_record("p1", b"not a wire record".to_vec()).unwrap();
        let valid = pipeline.append("p1", "click");

        wait_until(|| group.committed_offset(0) == Some(2)).await;
        assert_eq!(pipeline.metrics().messages_failed.get(), 1);
        assert_eq!(pipeline.metrics().messages_processed.get(), 1);
        let rows = pipeline.columnar.rows_for_project("p1");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].offset, valid.offset);
        group.shutdown().await;
    }

    #[tokio::test]
    async fn double_sink_failure_still_commits_and_moves_on() {
        let pipeline = Pipeline::new(1, FailurePolicy::Skip);
        let group = pipeline.log.consumer_group("g");
        group.join("m1", pipeline.consumer.clone()).await.unwrap();

        pipeline.wide_column.set_available(false);
        pipeline.columnar.set_available(false);
        pipeline.append("p1", "lost");
        wait_until(|| group.committed_offset(0) == Some(1)).await;

        pipeline.wide_column.set_available(true);
        pipeline.columnar.set_available(true);
        pipeline.append("p1", "kept");
        wait_until(|| group.committed_offset(0) == Some(2)).await;

        assert_eq!(pipeline.metrics().messages_failed.get(), 1);
        assert_eq!(pipeline.columnar.count_by_event_name("p1").get("kept"), Some(&1));
        assert_eq!(pipeline.columnar.count_by_event_name("p1").get("lost"), None);
        group.shutdown().await;
    }

    #[tokio::test]
    async fn latency_is_recorded_for_persisted_records_only() {
        let pipeline = Pipeline::new(1, FailurePolicy::Skip);
        let group = pipeline.log.consumer_group("g");
        group.join("m1", pipeline.consumer.clone()).await.unwrap();

        pipeline.log.append_record("p1", Vec::new()).unwrap();
        pipeline.append("p1", "click");
        wait_until(|| group.committed_offset(0) == Some(2)).await;
        group.shutdown().await;

        let encoded = pipeline.metrics().encode().unwrap();
        assert!(encoded.contains("processor_write_latency_seconds_count 1"));
    }

    #[tokio::test]
    async fn per_project_order_is_preserved() {
        let pipeline = Pipeline::new(4, FailurePolicy::Skip);
        let group = pipeline.log.consumer_group("g");
        group.join("m1", pipeline.consumer.clone()).await.unwrap();

        for i in 0..20 {
            pipeline.append("p1", &format!("e{i}"));
            pipeline.append("p2", &format!("e{i}"));
        }
        wait_until(|| pipeline.columnar.len() == 40).await;
        group.shutdown().await;

        for project in ["p1", "p2"] {
            let names: Vec<String> = pipeline
                .columnar
                .rows_for_project(project)
                .into_iter()
                .map(|row| row.event_name)
                .collect();
            let expected: Vec<String> = (0..20).map(|i| format!("e{i}")).collect();
            assert_eq!(names, expected, "project {project}");
        }
    }

    #[tokio::test]
    async fn abandoned_record_is_redelivered_to_next_claimant() {
        let pipeline = Pipeline::new(
            1,
            FailurePolicy::Retry(RetryPolicy {
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                max_attempts: None,
            }),
        );
        let group = pipeline.log.consumer_group("g");
        group.join("m1", pipeline.consumer.clone()).await.unwrap();

        pipeline.columnar.set_available(false);
        pipeline.append("p1", "click");
        wait_until(|| pipeline.metrics().sink_retry_count(crate::metrics::SinkKind::Columnar) > 0)
            .await;
        group.leave("m1").await.unwrap();
        assert_eq!(group.committed_offset(0), Some(0));

        pipeline.columnar.set_available(true);
        group.join("m1", pipeline.consumer.clone()).await.unwrap();
        wait_until(|| group.committed_offset(0) == Some(1)).await;
        assert_eq!(pipeline.columnar.len(), 1);
        group.shutdown().await;
    }

    #[tokio::test]
    async fn run_leaves_group_on_shutdown() {
        let pipeline = Pipeline::new(2, FailurePolicy::Skip);
        let group = pipeline.log.consumer_group("g");
        let shutdown = CancellationToken::new();
        let consumer = pipeline.consumer.clone();
        let task = tokio::spawn({
            let group = group.clone();
            let shutdown = shutdown.clone();
            async move { consumer.run(group, "m1", shutdown).await }
        });

        wait_until(|| pipeline.consumer.active_partitions().len() == 2).await;
        pipeline.append("p1", "click");
        wait_until(|| pipeline.columnar.len() == 1).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(group.members_len().await, 0);
        assert!(pipeline.consumer.active_partitions().is_empty());
        assert_eq!(pipeline.consumer.claim_state(0), ClaimState::Released);
    }

    #[tokio::test]
    async fn drain_commits_accepted_backlog_before_shutdown() {
        let pipeline = Pipeline::with_columnar(1, FailurePolicy::Skip, |store| {
            Arc::new(SlowColumnar {
                inner: store,
                delay: Duration::from_millis(50),
            }) as Arc<dyn ColumnarSink>
        });
        let group = pipeline.log.consumer_group("g");
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let consumer = pipeline.consumer.clone();
            let group = group.clone();
            let shutdown = shutdown.clone();
            async move { consumer.run(group, "m1", shutdown).await }
        });
        wait_until(|| pipeline.consumer.active_partitions() == vec![0]).await;

        for i in 0..10 {
            pipeline.append("p1", &format!("e{i}"));
        }
        assert!(group.lag() > 0);
        assert!(pipeline.consumer.drain(&group, Duration::from_secs(5)).await);
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(group.committed_offset(0), Some(10));
        assert_eq!(group.lag(), 0);
        assert_eq!(pipeline.columnar.len(), 10);
    }

    #[tokio::test]
    async fn drain_gives_up_after_timeout() {
        let gate = CancellationToken::new();
        let pipeline = Pipeline::with_columnar(1, FailurePolicy::Skip, |store| {
            Arc::new(GatedColumnar {
                inner: store,
                held_project: "p1".to_string(),
                gate: gate.clone(),
            }) as Arc<dyn ColumnarSink>
        });
        let group = pipeline.log.consumer_group("g");
        group.join("m1", pipeline.consumer.clone()).await.unwrap();
        pipeline.append("p1", "held");

        assert!(!pipeline.consumer.drain(&group, Duration::from_millis(50)).await);
        assert_eq!(group.lag(), 1);
        gate.cancel();
        group.shutdown().await;
    }

    #[tokio::test]
    async fn held_partition_does_not_stall_the_other() {
        let held = project_on(0, 2);
        let flowing = project_on(1, 2);
        let gate = CancellationToken::new();
        let pipeline = Pipeline::with_columnar(2, FailurePolicy::Skip, |store| {
            Arc::new(GatedColumnar {
                inner: store,
                held_project: held.clone(),
                gate: gate.clone(),
            }) as Arc<dyn ColumnarSink>
        });
        let group = pipeline.log.consumer_group("g");
        group.join("m1", pipeline.consumer.clone()).await.unwrap();

        pipeline.append(&held, "stuck");
        for i in 0..5 {
            pipeline.append(&flowing, &format!("e{i}"));
        }
        wait_until(|| pipeline.consumer.claim_state(0) == ClaimState::Draining).await;
        wait_until(|| group.committed_offset(1) == Some(5)).await;
        assert_eq!(group.committed_offset(0), Some(0));
        assert_eq!(pipeline.columnar.rows_for_project(&flowing).len(), 5);

        gate.cancel();
        wait_until(|| group.committed_offset(0) == Some(1)).await;
        assert_eq!(pipeline.columnar.len(), 6);
        group.shutdown().await;
    }

    #[tokio::test]
    async fn reclaiming_a_partition_retires_the_previous_loop() {
        let pipeline = Pipeline::new(1, FailurePolicy::Skip);
        let first = pipeline.log.consumer_group("g1");
        let second = pipeline.log.consumer_group("g2");
        first.join("m1", pipeline.consumer.clone()).await.unwrap();
        assert_eq!(pipeline.metrics().claimed_partitions.get(), 1);

        // Same handler, same partition, no revoke in between.
        second.join("m1", pipeline.consumer.clone()).await.unwrap();
        assert_eq!(pipeline.metrics().claimed_partitions.get(), 1);
        assert_eq!(pipeline.consumer.active_partitions(), vec![0]);
        assert_eq!(pipeline.consumer.claim_state(0), ClaimState::Claimed);

        pipeline.append("p1", "click");
        wait_until(|| second.committed_offset(0) == Some(1)).await;
        assert_eq!(first.committed_offset(0), Some(0));

        second.shutdown().await;
        first.shutdown().await;
        assert_eq!(pipeline.metrics().claimed_partitions.get(), 0);
        assert!(pipeline.consumer.active_partitions().is_empty());
    }
}
