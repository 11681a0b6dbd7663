use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LogSinkConfig;
use crate::logs::{LogEntry, SharedLogStore};

/// Cloneable, non-blocking entry point into the [`LogSink`].
#[derive(Debug, Clone)]
pub struct LogSinkHandle {
    tx: mpsc::Sender<LogEntry>,
}

impl LogSinkHandle {
    /// Queue `entry` for persistence. Drops it (returning false) when the
    /// sink is full or gone; the caller never waits.
    pub fn append(&self, entry: LogEntry) -> bool {
        match self.tx.try_send(entry) {
            Ok(()) => true,
            Err(TrySendError::Full(entry)) => {
                tracing::warn!(job = %entry.job_name, "Log sink full, dropping log entry");
                false
            }
            Err(TrySendError::Closed(entry)) => {
                tracing::debug!(job = %entry.job_name, "Log sink stopped, dropping log entry");
                false
            }
        }
    }
}

/// The batch being filled. `id` distinguishes it from every batch before
/// it, so a commit timer can only ever flush the batch that armed it.
struct LogBatch {
    id: u64,
    entries: Vec<LogEntry>,
    timer: JoinHandle<()>,
}

/// Batches log entries and writes each batch with one store call.
///
/// A batch is flushed when it reaches `batch_size`, or `commit_timeout`
/// after its first entry arrived, whichever comes first.
pub struct LogSink {
    store: SharedLogStore,
    rx: mpsc::Receiver<LogEntry>,
    commit_tx: mpsc::Sender<u64>,
    commit_rx: mpsc::Receiver<u64>,
    batch_size: usize,
    commit_timeout: Duration,
    current: Option<LogBatch>,
    next_batch_id: u64,
}

impl LogSink {
    pub fn new(store: SharedLogStore, config: &LogSinkConfig) -> (Self, LogSinkHandle) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (commit_tx, commit_rx) = mpsc::channel(16);

        let sink = Self {
            store,
            rx,
            commit_tx,
            commit_rx,
            batch_size: config.batch_size.max(1),
            commit_timeout: Duration::from_millis(config.commit_timeout_ms),
            current: None,
            next_batch_id: 1,
        };

        (sink, LogSinkHandle { tx })
    }

    /// Run until `shutdown` fires or every handle is dropped, then flush
    /// whatever is still pending.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(
            batch_size = self.batch_size,
            commit_timeout_ms = self.commit_timeout.as_millis() as u64,
            "Log sink started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    while let Ok(entry) = self.rx.try_recv() {
                        self.on_entry(entry).await;
                    }
                    self.flush("shutdown").await;
                    tracing::info!("Log sink stopped");
                    return;
                }
                entry = self.rx.recv() => match entry {
                    Some(entry) => self.on_entry(entry).await,
                    None => {
                        self.flush("closed").await;
                        tracing::info!("Log sink stopped");
                        return;
                    }
                },
                Some(batch_id) = self.commit_rx.recv() => {
                    self.on_commit_timeout(batch_id).await;
                }
            }
        }
    }

    async fn on_entry(&mut self, entry: LogEntry) {
        if self.current.is_none() {
            let batch = self.start_batch();
            self.current = Some(batch);
        }

        let full = match self.current.as_mut() {
            Some(batch) => {
                batch.entries.push(entry);
                batch.entries.len() >= self.batch_size
            }
            None => false,
        };

        if full {
            self.flush("size").await;
        }
    }

    /// Honour a timer signal only if it belongs to the live batch. A batch
    /// already flushed by size may still have its timer signal in flight.
    async fn on_commit_timeout(&mut self, batch_id: u64) {
        let live = self
            .current
            .as_ref()
            .is_some_and(|batch| batch.id == batch_id);

        if live {
            self.flush("timeout").await;
        } else {
            tracing::debug!(batch_id, "Ignoring commit timer for already flushed batch");
        }
    }

    fn start_batch(&mut self) -> LogBatch {
        let id = self.next_batch_id;
        self.next_batch_id += 1;

        let commit_tx = self.commit_tx.clone();
        let timeout = self.commit_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = commit_tx.send(id).await;
        });

        LogBatch {
            id,
            entries: Vec::with_capacity(self.batch_size),
            timer,
        }
    }

    async fn flush(&mut self, reason: &'static str) {
        let Some(batch) = self.current.take() else {
            return;
        };
        batch.timer.abort();

        if batch.entries.is_empty() {
            return;
        }

        match self.store.insert_many(&batch.entries).await {
            Ok(()) => tracing::debug!(
                batch_id = batch.id,
                entries = batch.entries.len(),
                reason,
                "Flushed log batch"
            ),
            Err(e) => tracing::error!(
                batch_id = batch.id,
                entries = batch.entries.len(),
                error = %e,
                "Failed to persist log batch, dropping it"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::MemLogStore;
    use chrono::Utc;
    use std::sync::Arc;

    fn entry(n: usize) -> LogEntry {
        let now = Utc::now();
        LogEntry {
            job_name: format!("job{}", n),
            command: "true".to_string(),
            err: String::new(),
            output: String::new(),
            plan_time: now,
            schedule_time: now,
            start_time: now,
            end_time: now,
        }
    }

    fn sink(store: &MemLogStore, batch_size: usize) -> LogSink {
        let config = LogSinkConfig {
            batch_size,
            commit_timeout_ms: 1000,
            channel_capacity: 8,
        };
        LogSink::new(Arc::new(store.clone()), &config).0
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_does_not_flush_next_batch() {
        let store = MemLogStore::new();
        let mut sink = sink(&store, 2);

        // Batch 1 fills up and is flushed by size.
        sink.on_entry(entry(1)).await;
        sink.on_entry(entry(2)).await;
        assert_eq!(store.batches().await.len(), 1);

        // Batch 2 starts; batch 1's timer signal arrives late.
        sink.on_entry(entry(3)).await;
        sink.on_commit_timeout(1).await;

        assert_eq!(store.batches().await.len(), 1);
        assert_eq!(sink.current.as_ref().map(|b| b.entries.len()), Some(1));

        // Batch 2's own signal flushes it.
        sink.on_commit_timeout(2).await;
        let batches = store.batches().await;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1][0].job_name, "job3");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_insert_drops_batch_and_continues() {
        let store = MemLogStore::new();
        let mut sink = sink(&store, 1);

        store.set_failing(true);
        sink.on_entry(entry(1)).await;
        store.set_failing(false);
        sink.on_entry(entry(2)).await;

        let batches = store.batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].job_name, "job2");
    }

    #[tokio::test(start_paused = true)]
    async fn batch_ids_increase() {
        let store = MemLogStore::new();
        let mut sink = sink(&store, 1);

        sink.on_entry(entry(1)).await;
        sink.on_entry(entry(2)).await;
        assert_eq!(sink.next_batch_id, 3);
        assert!(sink.current.is_none());
    }
}
