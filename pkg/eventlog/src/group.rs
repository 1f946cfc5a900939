use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use crate::{ConsumerRecord, LogError, LogShared, PartitionPosition};

/// Receives partition ownership changes for one group member.
///
/// `on_revoke` must not return until the member has stopped reading the
/// partition; the group only hands the partition to its next owner after
/// that.
#[async_trait]
pub trait ClaimHandler: Send + Sync {
    async fn on_claim(&self, claim: PartitionClaim);
    async fn on_revoke(&self, partition: u32);
}

struct ActiveClaim {
    member_id: String,
    handler: Arc<dyn ClaimHandler>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct GroupState {
    members: BTreeMap<String, Arc<dyn ClaimHandler>>,
    owners: HashMap<u32, ActiveClaim>,
}

pub struct ConsumerGroup {
    group_id: String,
    log: Arc<LogShared>,
    committed: Arc<Vec<AtomicU64>>,
    state: Mutex<GroupState>,
}

impl ConsumerGroup {
    pub(crate) fn new(group_id: &str, log: Arc<LogShared>) -> Self {
        let committed = (0..log.partitions_len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            group_id: group_id.to_string(),
            log,
            committed: Arc::new(committed),
            state: Mutex::new(GroupState::default()),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Next offset this group will read from `partition`.
    pub fn committed_offset(&self, partition: u32) -> Option<u64> {
        self.committed
            .get(partition as usize)
            .map(|offset| offset.load(Ordering::Acquire))
    }

    /// Records appended but not yet committed by this group, summed over
    /// every partition.
    pub fn lag(&self) -> u64 {
        (0..self.log.partitions_len())
            .map(|partition| {
                let high = self.log.high_watermark(partition).unwrap_or(0);
                high.saturating_sub(self.committed_offset(partition).unwrap_or(0))
            })
            .sum()
    }

    pub async fn members_len(&self) -> usize {
        self.state.lock().await.members.len()
    }

    /// Current partition owners, keyed by partition.
    pub async fn assignment(&self) -> BTreeMap<u32, String> {
        self.state
            .lock()
            .await
            .owners
            .iter()
            .map(|(partition, claim)| (*partition, claim.member_id.clone()))
            .collect()
    }

    pub async fn join(
        &self,
        member_id: &str,
        handler: Arc<dyn ClaimHandler>,
    ) -> Result<(), LogError> {
        if self.log.close_token().is_cancelled() {
            return Err(LogError::Closed);
        }
        let mut state = self.state.lock().await;
        if state.members.contains_key(member_id) {
            return Err(LogError::DuplicateMember(member_id.to_string()));
        }
        state.members.insert(member_id.to_string(), handler);
        tracing::info!(group = %self.group_id, member = member_id, "consumer joined group");
        self.rebalance(&mut state).await;
        Ok(())
    }

    pub async fn leave(&self, member_id: &str) -> Result<(), LogError> {
        let mut state = self.state.lock().await;
        if state.members.remove(member_id).is_none() {
            return Err(LogError::UnknownMember(member_id.to_string()));
        }
        tracing::info!(group = %self.group_id, member = member_id, "consumer left group");
        self.rebalance(&mut state).await;
        Ok(())
    }

    /// Revokes every claim and drops all members.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.members.clear();
        let mut partitions: Vec<u32> = state.owners.keys().copied().collect();
        partitions.sort_unstable();
        for partition in partitions {
            if let Some(claim) = state.owners.remove(&partition) {
                revoke(&self.group_id, partition, claim).await;
            }
        }
    }

    async fn rebalance(&self, state: &mut GroupState) {
        let member_ids: Vec<&String> = state.members.keys().collect();
        let mut target: HashMap<u32, String> = HashMap::new();
        if !member_ids.is_empty() {
            for partition in 0..self.log.partitions_len() {
                let owner = member_ids[partition as usize % member_ids.len()];
                target.insert(partition, owner.clone());
            }
        }

        let mut moved: Vec<u32> = state
            .owners
            .iter()
            .filter(|(partition, claim)| target.get(partition) != Some(&claim.member_id))
            .map(|(partition, _)| *partition)
            .collect();
        moved.sort_unstable();
        for partition in moved {
            if let Some(claim) = state.owners.remove(&partition) {
                revoke(&self.group_id, partition, claim).await;
            }
        }

        let mut unowned: Vec<(u32, String)> = target
            .into_iter()
            .filter(|(partition, _)| !state.owners.contains_key(partition))
            .collect();
        unowned.sort_unstable();
        for (partition, member_id) in unowned {
            let Some(handler) = state.members.get(&member_id).cloned() else {
                continue;
            };
            let Some(claim) = self.open_claim(partition) else {
                continue;
            };
            let cancel = claim.cancel.clone();
            tracing::info!(
                group = %self.group_id,
                member = %member_id,
                partition,
                start_offset = claim.start_offset,
                "partition claimed"
            );
            state.owners.insert(
                partition,
                ActiveClaim {
                    member_id,
                    handler: Arc::clone(&handler),
                    cancel,
                },
            );
            handler.on_claim(claim).await;
        }
    }

    fn open_claim(&self, partition: u32) -> Option<PartitionClaim> {
        let watermark = self.log.subscribe(partition)?;
        let start_offset = self.committed_offset(partition)?;
        Some(PartitionClaim {
            group_id: self.group_id.clone(),
            partition,
            start_offset,
            next_offset: start_offset,
            log: Arc::clone(&self.log),
            committed: Arc::clone(&self.committed),
            watermark,
            cancel: self.log.close_token().child_token(),
        })
    }
}

async fn revoke(group_id: &str, partition: u32, claim: ActiveClaim) {
    claim.cancel.cancel();
    claim.handler.on_revoke(partition).await;
    tracing::info!(
        group = group_id,
        member = %claim.member_id,
        partition,
        "partition revoked"
    );
}

/// Exclusive read access to one partition for one group member.
pub struct PartitionClaim {
    group_id: String,
    partition: u32,
    start_offset: u64,
    next_offset: u64,
    log: Arc<LogShared>,
    committed: Arc<Vec<AtomicU64>>,
    watermark: watch::Receiver<u64>,
    cancel: CancellationToken,
}

impl PartitionClaim {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn topic(&self) -> &str {
        self.log.topic()
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Committed offset at the moment the claim was granted.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Fires when the claim is revoked or the log is closed.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_revoked(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for the next record in offset order. Returns `None` once the
    /// claim is revoked; no record is handed out after that point.
    pub async fn next_record(&mut self) -> Option<ConsumerRecord> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some((key, payload)) = self.log.read(self.partition, self.next_offset) {
                let position = PartitionPosition::new(self.partition, self.next_offset);
                self.next_offset += 1;
                return Some(ConsumerRecord {
                    key,
                    payload,
                    position,
                    delivered_at: Instant::now(),
                });
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                changed = self.watermark.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Marks `record` and everything before it as consumed by the group.
    pub fn commit(&self, record: &ConsumerRecord) {
        debug_assert_eq!(record.position.partition, self.partition);
        if let Some(offset) = self.committed.get(self.partition as usize) {
            offset.fetch_max(record.position.offset + 1, Ordering::AcqRel);
        }
    }

    /// Re-reads from the last committed offset on the next pull.
    pub fn rewind_to_committed(&mut self) {
        if let Some(offset) = self.committed.get(self.partition as usize) {
            self.next_offset = offset.load(Ordering::Acquire);
        }
    }
}
