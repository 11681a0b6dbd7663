//! Execution logs.
//!
//! Every finished execution (except lock-contention skips) becomes a
//! [`LogEntry`]. The scheduler hands entries to the [`LogSink`], which
//! batches them and writes each batch to a [`LogStore`] with a single
//! `insert_many` call.

pub mod memory;
pub mod sink;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LogStoreConfig;
use crate::error::Result;
use crate::scheduler::ExecutionResult;

pub use memory::MemLogStore;
pub use sink::{LogSink, LogSinkHandle};
pub use sqlite::SqliteLogStore;

/// One persisted execution record. Times are serialized as Unix millis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub job_name: String,
    pub command: String,
    /// Empty on success.
    pub err: String,
    pub output: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub plan_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub schedule_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub end_time: DateTime<Utc>,
}

impl LogEntry {
    /// Build the log entry for `result`, or `None` when this node lost the
    /// lock race and never ran the command.
    pub fn from_result(result: &ExecutionResult) -> Option<Self> {
        if result.lost_lock() {
            return None;
        }

        Some(Self {
            job_name: result.record.job.name.clone(),
            command: result.record.job.command.clone(),
            err: result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default(),
            output: String::from_utf8_lossy(&result.output).into_owned(),
            plan_time: result.record.plan_time,
            schedule_time: result.record.dispatch_time,
            start_time: result.start_time,
            end_time: result.end_time,
        })
    }
}

/// Durable home of execution logs.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Persist a whole batch in one call.
    async fn insert_many(&self, entries: &[LogEntry]) -> Result<()>;

    /// Entries for `job_name`, newest `start_time` first.
    async fn list(&self, job_name: &str, skip: usize, limit: usize) -> Result<Vec<LogEntry>>;
}

pub type SharedLogStore = Arc<dyn LogStore>;

/// Open the configured log store: SQLite when a path is set, memory otherwise.
pub fn open(config: &LogStoreConfig) -> Result<SharedLogStore> {
    match &config.sqlite_path {
        Some(path) => {
            let store = SqliteLogStore::open(path)?;
            tracing::info!(path = %path.display(), "Opened SQLite log store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("No log store path configured; execution logs are kept in memory");
            Ok(Arc::new(MemLogStore::new()))
        }
    }
}
