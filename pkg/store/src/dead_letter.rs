use std::sync::Arc;

use async_trait::async_trait;
use eventlog::{LogError, PartitionedLog};

use crate::{DeadLetter, DeadLetterSink, SinkError};

/// Parks abandoned records on a separate partitioned log, byte for byte.
pub struct LogDeadLetterSink {
    log: Arc<PartitionedLog>,
}

impl LogDeadLetterSink {
    pub fn new(log: Arc<PartitionedLog>) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &Arc<PartitionedLog> {
        &self.log
    }
}

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> Result<(), SinkError> {
        let key = match letter.project_id.as_deref() {
            Some(project_id) if !project_id.is_empty() => project_id.to_string(),
            _ => letter.position.to_string(),
        };
        let parked = self
            .log
            .append_record(&key, letter.payload.to_vec())
            .map_err(|err| match err {
                LogError::Closed | LogError::PartitionFull { .. } => {
                    SinkError::Unavailable(err.to_string())
                }
                other => SinkError::Rejected(other.to_string()),
            })?;
        tracing::warn!(
            source = %letter.position,
            dead_letter = %parked,
            topic = self.log.topic(),
            reason = %letter.reason,
            "record parked on dead-letter log"
        );
        Ok(())
    }
}
