use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::{Clock, EventFields, MAX_ROW_TTL, RowKey, SinkError, SystemClock, WideColumnSink};

#[derive(Debug, Clone)]
struct StoredRow {
    fields: EventFields,
    /// `None` when written with a zero TTL.
    expires_at: Option<DateTime<Utc>>,
}

impl StoredRow {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| now < expires_at)
    }
}

/// Row store with per-row expiry, standing in for a wide-column cluster.
pub struct InMemoryWideColumnStore {
    rows: RwLock<HashMap<RowKey, StoredRow>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl Default for InMemoryWideColumnStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWideColumnStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// While unavailable every write fails, simulating a cluster outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn get(&self, key: &RowKey) -> Option<EventFields> {
        let now = self.clock.now();
        let rows = self.rows.read().ok()?;
        rows.get(key)
            .filter(|row| row.is_live(now))
            .map(|row| row.fields.clone())
    }

    /// Live rows for one project ordered by partition then offset.
    pub fn rows_for_project(&self, project_id: &str) -> Vec<(RowKey, EventFields)> {
        let now = self.clock.now();
        let Ok(rows) = self.rows.read() else {
            return Vec::new();
        };
        let mut out: Vec<(RowKey, EventFields)> = rows
            .iter()
            .filter(|(key, row)| key.project_id == project_id && row.is_live(now))
            .map(|(key, row)| (key.clone(), row.fields.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn live_len(&self) -> usize {
        let now = self.clock.now();
        self.rows
            .read()
            .map(|rows| rows.values().filter(|row| row.is_live(now)).count())
            .unwrap_or(0)
    }

    /// Drops expired rows and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let Ok(mut rows) = self.rows.write() else {
            return 0;
        };
        let before = rows.len();
        rows.retain(|_, row| row.is_live(now));
        before - rows.len()
    }
}

#[async_trait]
impl WideColumnSink for InMemoryWideColumnStore {
    async fn put(&self, key: RowKey, fields: EventFields, ttl: Duration) -> Result<(), SinkError> {
        if !self.available.load(Ordering::Acquire) {
            return Err(SinkError::Unavailable("wide-column store offline".to_string()));
        }
        let expires_at = if ttl.is_zero() {
            None
        } else {
            let expires_at = TimeDelta::from_std(ttl)
                .ok()
                .filter(|_| ttl <= MAX_ROW_TTL)
                .and_then(|ttl| self.clock.now().checked_add_signed(ttl))
                .ok_or_else(|| SinkError::Rejected(format!("ttl {ttl:?} out of range")))?;
            Some(expires_at)
        };
        let mut rows = self
            .rows
            .write()
            .map_err(|_| SinkError::Rejected("row table lock poisoned".to_string()))?;
        rows.insert(key, StoredRow { fields, expires_at });
        Ok(())
    }
}
