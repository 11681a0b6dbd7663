use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{CronError, Result};
use crate::retry::jittered;
use crate::scheduler::{Job, JobEvent, JobEventKind};
use crate::store::{
    extract_name, SharedStore, WatchEvent, WatchEventKind, WatchStream, JOB_KILLER_DIR,
    JOB_SAVE_DIR,
};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Turns changes under the jobs and killer namespaces into [`JobEvent`]s for
/// the scheduler.
pub struct JobWatcher {
    store: SharedStore,
    event_tx: mpsc::Sender<JobEvent>,
    retry_delay: Duration,
    /// Names this node has announced as upserted, used to synthesize deletes
    /// after a re-list.
    known_jobs: HashSet<String>,
}

impl JobWatcher {
    pub fn new(store: SharedStore, event_tx: mpsc::Sender<JobEvent>) -> Self {
        Self {
            store,
            event_tx,
            retry_delay: DEFAULT_RETRY_DELAY,
            known_jobs: HashSet::new(),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// List the current jobs, subscribe to both namespaces, and spawn the
    /// translation loop.
    ///
    /// # Errors
    ///
    /// Fails if the initial listing or either initial watch cannot be
    /// established. Later failures are retried in the background.
    pub async fn start(mut self, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let revision = self.relist().await?;

        let jobs = self.store.watch(JOB_SAVE_DIR, revision + 1).await?;
        let kills = self.store.watch(JOB_KILLER_DIR, revision + 1).await?;

        tracing::info!(
            revision,
            jobs = self.known_jobs.len(),
            "Watching job and killer namespaces"
        );

        Ok(tokio::spawn(self.run(jobs, kills, revision, shutdown)))
    }

    async fn run(
        mut self,
        mut jobs: WatchStream,
        mut kills: WatchStream,
        revision: i64,
        shutdown: CancellationToken,
    ) {
        let mut job_revision = revision;
        let mut kill_revision = revision;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Job watcher stopping");
                    return;
                }
                event = jobs.next() => match event {
                    Some(Ok(event)) => {
                        job_revision = event.kv.mod_revision;
                        if let Some(job_event) = translate_job_event(&event) {
                            if self.emit(job_event).await.is_err() {
                                return;
                            }
                        }
                    }
                    failure => {
                        let reason = watch_failure(failure);
                        let compacted = matches!(reason, CronError::Compacted { .. });
                        tracing::warn!(error = %reason, revision = job_revision, "Job watch failed, resubscribing");
                        match self.resubscribe(JOB_SAVE_DIR, job_revision, compacted, &shutdown).await {
                            Some((stream, revision)) => {
                                jobs = stream;
                                job_revision = revision;
                            }
                            None => return,
                        }
                    }
                },
                event = kills.next() => match event {
                    Some(Ok(event)) => {
                        kill_revision = event.kv.mod_revision;
                        if let Some(job_event) = translate_kill_event(&event) {
                            if self.emit(job_event).await.is_err() {
                                return;
                            }
                        }
                    }
                    failure => {
                        let reason = watch_failure(failure);
                        let compacted = matches!(reason, CronError::Compacted { .. });
                        tracing::warn!(error = %reason, revision = kill_revision, "Killer watch failed, resubscribing");
                        match self.resubscribe(JOB_KILLER_DIR, kill_revision, compacted, &shutdown).await {
                            Some((stream, revision)) => {
                                kills = stream;
                                kill_revision = revision;
                            }
                            None => return,
                        }
                    }
                },
            }
        }
    }

    /// Re-establish a watch on `prefix` after `last_revision`.
    ///
    /// `compacted` is set when the failed watch reported that its history
    /// was compacted; stores may report that either from `watch` or inside
    /// the stream, and both lead here. Compacted job history is recovered by
    /// re-listing and watching from the listing's revision. Kill markers are
    /// short-lived, so the killer namespace simply resumes from now.
    /// Returns `None` on shutdown or when the scheduler is gone.
    async fn resubscribe(
        &mut self,
        prefix: &str,
        mut last_revision: i64,
        mut compacted: bool,
        shutdown: &CancellationToken,
    ) -> Option<(WatchStream, i64)> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(jittered(self.retry_delay)) => {}
            }
            if self.event_tx.is_closed() {
                return None;
            }

            if compacted && prefix == JOB_SAVE_DIR {
                tracing::warn!(revision = last_revision, "Missed job changes were compacted, re-listing");
                match self.relist().await {
                    Ok(revision) => {
                        last_revision = revision;
                        compacted = false;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Re-list failed");
                        continue;
                    }
                }
            }

            let start_revision = if compacted { 0 } else { last_revision + 1 };
            match self.store.watch(prefix, start_revision).await {
                Ok(stream) => {
                    tracing::info!(prefix, revision = start_revision, "Watch resubscribed");
                    return Some((stream, last_revision));
                }
                Err(CronError::Compacted { requested, oldest }) => {
                    tracing::warn!(prefix, requested, oldest, "Watch history compacted");
                    compacted = true;
                }
                Err(e) => tracing::warn!(prefix, error = %e, "Resubscribe failed"),
            }
        }
    }

    /// Full listing of the jobs namespace. Emits `Upserted` for every
    /// decodable job and `Deleted` for known jobs that are no longer present.
    /// Returns the revision the listing was served at.
    async fn relist(&mut self) -> Result<i64> {
        let response = self.store.get_prefix(JOB_SAVE_DIR).await?;

        let mut listed = HashSet::new();
        let mut upserts = Vec::new();
        for kv in &response.kvs {
            let name = extract_name(&kv.key, JOB_SAVE_DIR);
            listed.insert(name.to_string());
            match Job::decode(&kv.value) {
                Ok(job) => upserts.push(JobEvent::upserted(job)),
                Err(e) => tracing::warn!(key = %kv.key, error = %e, "Skipping malformed job"),
            }
        }

        let vanished: Vec<String> = self
            .known_jobs
            .iter()
            .filter(|name| !listed.contains(*name))
            .cloned()
            .collect();

        for event in upserts {
            self.emit(event).await?;
        }
        for name in vanished {
            self.emit(JobEvent::deleted(name)).await?;
        }

        Ok(response.revision)
    }

    async fn emit(&mut self, event: JobEvent) -> Result<()> {
        match event.kind {
            JobEventKind::Upserted => {
                self.known_jobs.insert(event.job.name.clone());
            }
            JobEventKind::Deleted => {
                self.known_jobs.remove(&event.job.name);
            }
            JobEventKind::KillRequested => {}
        }

        tracing::debug!(job = %event.job.name, kind = %event.kind, "Job event");
        self.event_tx
            .send(event)
            .await
            .map_err(|_| CronError::Internal("scheduler event channel closed".to_string()))
    }
}

fn watch_failure(failure: Option<Result<WatchEvent>>) -> CronError {
    match failure {
        Some(Err(e)) => e,
        _ => CronError::WatchClosed("stream ended".to_string()),
    }
}

/// Map a change under `/cron/jobs/`. Malformed puts yield `None`.
pub fn translate_job_event(event: &WatchEvent) -> Option<JobEvent> {
    match event.kind {
        WatchEventKind::Put => match Job::decode(&event.kv.value) {
            Ok(job) => Some(JobEvent::upserted(job)),
            Err(e) => {
                tracing::warn!(key = %event.kv.key, error = %e, "Skipping malformed job");
                None
            }
        },
        WatchEventKind::Delete => Some(JobEvent::deleted(extract_name(
            &event.kv.key,
            JOB_SAVE_DIR,
        ))),
    }
}

/// Map a change under `/cron/killer/`. Only puts mean anything; the marker
/// expiring is not an event.
pub fn translate_kill_event(event: &WatchEvent) -> Option<JobEvent> {
    match event.kind {
        WatchEventKind::Put => Some(JobEvent::kill_requested(extract_name(
            &event.kv.key,
            JOB_KILLER_DIR,
        ))),
        WatchEventKind::Delete => None,
    }
}
