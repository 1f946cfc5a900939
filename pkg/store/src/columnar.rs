use std::{
    collections::BTreeMap,
    sync::{
        RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;

use crate::{ColumnarRow, ColumnarSink, SinkError};

/// Append-only analytical table. Rows are never updated or expired.
#[derive(Debug)]
pub struct InMemoryColumnarStore {
    rows: RwLock<Vec<ColumnarRow>>,
    available: AtomicBool,
}

impl Default for InMemoryColumnarStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryColumnarStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every row in insertion order.
    pub fn rows(&self) -> Vec<ColumnarRow> {
        self.rows.read().map(|rows| rows.clone()).unwrap_or_default()
    }

    pub fn rows_for_project(&self, project_id: &str) -> Vec<ColumnarRow> {
        self.rows
            .read()
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.project_id == project_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Event counts per name for one project.
    pub fn count_by_event_name(&self, project_id: &str) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        if let Ok(rows) = self.rows.read() {
            for row in rows.iter().filter(|row| row.project_id == project_id) {
                *counts.entry(row.event_name.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

#[async_trait]
impl ColumnarSink for InMemoryColumnarStore {
    async fn insert(&self, row: ColumnarRow) -> Result<(), SinkError> {
        if !self.available.load(Ordering::Acquire) {
            return Err(SinkError::Unavailable("columnar store offline".to_string()));
        }
        let mut rows = self
            .rows
            .write()
            .map_err(|_| SinkError::Rejected("row table lock poisoned".to_string()))?;
        rows.push(row);
        Ok(())
    }
}
