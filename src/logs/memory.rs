use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{CronError, Result};
use crate::logs::{LogEntry, LogStore};

/// In-memory log store. Keeps each `insert_many` call as its own batch so
/// the batching behaviour of the sink can be observed.
#[derive(Debug, Clone, Default)]
pub struct MemLogStore {
    batches: Arc<Mutex<Vec<Vec<LogEntry>>>>,
    failing: Arc<AtomicBool>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent inserts fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every successful insert call, in order.
    pub async fn batches(&self) -> Vec<Vec<LogEntry>> {
        self.batches.lock().await.clone()
    }

    pub async fn entry_count(&self) -> usize {
        self.batches.lock().await.iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl LogStore for MemLogStore {
    async fn insert_many(&self, entries: &[LogEntry]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CronError::LogStore("insert rejected".to_string()));
        }
        self.batches.lock().await.push(entries.to_vec());
        Ok(())
    }

    async fn list(&self, job_name: &str, skip: usize, limit: usize) -> Result<Vec<LogEntry>> {
        let batches = self.batches.lock().await;
        let mut entries: Vec<LogEntry> = batches
            .iter()
            .flatten()
            .filter(|entry| entry.job_name == job_name)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(entries.into_iter().skip(skip).take(limit).collect())
    }
}
