use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cron_lite::scheduler::{Job, JobEvent, JobEventKind};
use cron_lite::store::{
    CoordinationStore, KeepAliveStream, KeyValue, LeaseId, MemStore, RangeResponse, WatchStream,
    JOB_KILLER_DIR, JOB_SAVE_DIR,
};
use cron_lite::{CronError, Result};
use cron_lite::worker::JobWatcher;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Store that accepts every watch and reports compaction as the first item
/// of the stream instead, the way etcd does.
#[derive(Clone)]
struct LateCompactionStore {
    inner: MemStore,
}

#[async_trait]
impl CoordinationStore for LateCompactionStore {
    async fn get_prefix(&self, prefix: &str) -> Result<RangeResponse> {
        self.inner.get_prefix(prefix).await
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Option<KeyValue>> {
        self.inner.put(key, value, lease).await
    }

    async fn delete(&self, key: &str) -> Result<Option<KeyValue>> {
        self.inner.delete(key).await
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<bool> {
        self.inner.put_if_absent(key, value, lease).await
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        self.inner.grant_lease(ttl_secs).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        self.inner.keep_alive(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.inner.revoke_lease(lease).await
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        match self.inner.watch(prefix, start_revision).await {
            Err(e @ CronError::Compacted { .. }) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = tx.send(Err(e));
                Ok(WatchStream::new(rx))
            }
            other => other,
        }
    }
}

async fn save(store: &MemStore, job: &Job) {
    let key = format!("{}{}", JOB_SAVE_DIR, job.name);
    store.put(&key, job.encode().unwrap(), None).await.unwrap();
}

async fn start_watcher(
    store: &MemStore,
    retry_delay: Duration,
) -> (mpsc::Receiver<JobEvent>, JoinHandle<()>, CancellationToken) {
    let (tx, rx) = mpsc::channel(100);
    let shutdown = CancellationToken::new();
    let handle = JobWatcher::new(Arc::new(store.clone()), tx)
        .with_retry_delay(retry_delay)
        .start(shutdown.clone())
        .await
        .unwrap();
    (rx, handle, shutdown)
}

async fn next_event(rx: &mut mpsc::Receiver<JobEvent>) -> JobEvent {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for job event")
        .expect("event channel closed")
}

async fn assert_quiet(rx: &mut mpsc::Receiver<JobEvent>) {
    let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(extra.is_err(), "unexpected event: {:?}", extra);
}

#[tokio::test]
async fn test_initial_listing_emits_upserts() {
    let store = MemStore::new();
    let a = Job::new("a", "echo a", "* * * * * *");
    let b = Job::new("b", "echo b", "*/5 * * * *");
    save(&store, &a).await;
    save(&store, &b).await;
    store
        .put("/cron/jobs/garbage", b"{not json".to_vec(), None)
        .await
        .unwrap();

    let (mut rx, _handle, shutdown) = start_watcher(&store, Duration::from_millis(50)).await;

    assert_eq!(next_event(&mut rx).await, JobEvent::upserted(a));
    assert_eq!(next_event(&mut rx).await, JobEvent::upserted(b));
    assert_quiet(&mut rx).await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_put_and_delete_round_trip() {
    let store = MemStore::new();
    let (mut rx, _handle, shutdown) = start_watcher(&store, Duration::from_millis(50)).await;

    let job = Job::new("job10", "echo hello", "*/5 * * * * *");
    save(&store, &job).await;
    assert_eq!(next_event(&mut rx).await, JobEvent::upserted(job.clone()));

    store.delete("/cron/jobs/job10").await.unwrap();
    let deleted = next_event(&mut rx).await;
    assert_eq!(deleted.kind, JobEventKind::Deleted);
    assert_eq!(deleted.job, Job::named("job10"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_malformed_update_is_skipped() {
    let store = MemStore::new();
    let (mut rx, _handle, shutdown) = start_watcher(&store, Duration::from_millis(50)).await;

    store
        .put("/cron/jobs/bad", b"\x00\x01".to_vec(), None)
        .await
        .unwrap();
    let good = Job::new("good", "true", "* * * * * *");
    save(&store, &good).await;

    assert_eq!(next_event(&mut rx).await, JobEvent::upserted(good));
    shutdown.cancel();
}

#[tokio::test]
async fn test_kill_marker_requests_kill_once() {
    let store = MemStore::new();
    let (mut rx, _handle, shutdown) = start_watcher(&store, Duration::from_millis(50)).await;

    let lease = store.grant_lease(1).await.unwrap();
    let key = format!("{}victim", JOB_KILLER_DIR);
    store.put(&key, Vec::new(), Some(lease)).await.unwrap();

    assert_eq!(next_event(&mut rx).await, JobEvent::kill_requested("victim"));

    // Marker expiry is not an event.
    store.revoke_lease(lease).await.unwrap();
    assert_quiet(&mut rx).await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_resubscribes_after_watch_closes() {
    let store = MemStore::new();
    let (mut rx, _handle, shutdown) = start_watcher(&store, Duration::from_millis(50)).await;

    store.close_watches().await;
    // Written while no watch is open; replayed from the last seen revision.
    let job = Job::new("late", "true", "* * * * * *");
    save(&store, &job).await;

    assert_eq!(next_event(&mut rx).await, JobEvent::upserted(job));

    let after = Job::new("after", "true", "* * * * * *");
    save(&store, &after).await;
    assert_eq!(next_event(&mut rx).await, JobEvent::upserted(after));
    shutdown.cancel();
}

#[tokio::test]
async fn test_relists_when_missed_history_is_compacted() {
    let store = MemStore::new();
    let keep = Job::new("keep", "true", "* * * * * *");
    let gone = Job::new("gone", "true", "* * * * * *");
    save(&store, &keep).await;
    save(&store, &gone).await;

    let (mut rx, _handle, shutdown) = start_watcher(&store, Duration::from_millis(500)).await;
    // Listing order follows key order.
    assert_eq!(next_event(&mut rx).await.job.name, "gone");
    assert_eq!(next_event(&mut rx).await.job.name, "keep");

    // Connection drops; changes land and history is compacted before the
    // watcher comes back.
    store.close_watches().await;
    store.delete("/cron/jobs/gone").await.unwrap();
    let fresh = Job::new("fresh", "true", "* * * * * *");
    save(&store, &fresh).await;
    store.compact(store.revision().await).await;

    let mut events = Vec::new();
    for _ in 0..3 {
        events.push(next_event(&mut rx).await);
    }

    assert!(events.contains(&JobEvent::upserted(keep)));
    assert!(events.contains(&JobEvent::upserted(fresh)));
    assert!(events.contains(&JobEvent::deleted("gone")));
    assert_quiet(&mut rx).await;

    // Live updates resume after the re-list.
    let next = Job::new("next", "true", "* * * * * *");
    save(&store, &next).await;
    assert_eq!(next_event(&mut rx).await, JobEvent::upserted(next));
    shutdown.cancel();
}

#[tokio::test]
async fn test_stops_on_shutdown() {
    let store = MemStore::new();
    let (_rx, handle, shutdown) = start_watcher(&store, Duration::from_millis(50)).await;

    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("watcher should stop")
        .unwrap();
}

#[tokio::test]
async fn test_relists_when_compaction_is_reported_in_stream() {
    let store = MemStore::new();
    let keep = Job::new("keep", "true", "* * * * * *");
    let gone = Job::new("gone", "true", "* * * * * *");
    save(&store, &keep).await;
    save(&store, &gone).await;

    let (tx, mut rx) = mpsc::channel(100);
    let shutdown = CancellationToken::new();
    let late = LateCompactionStore {
        inner: store.clone(),
    };
    let _handle = JobWatcher::new(Arc::new(late), tx)
        .with_retry_delay(Duration::from_millis(50))
        .start(shutdown.clone())
        .await
        .unwrap();
    assert_eq!(next_event(&mut rx).await.job.name, "gone");
    assert_eq!(next_event(&mut rx).await.job.name, "keep");

    store.close_watches().await;
    store.delete("/cron/jobs/gone").await.unwrap();
    store.compact(store.revision().await).await;

    let mut events = Vec::new();
    for _ in 0..2 {
        events.push(next_event(&mut rx).await);
    }
    assert!(events.contains(&JobEvent::upserted(keep)));
    assert!(events.contains(&JobEvent::deleted("gone")));

    let fresh = Job::new("fresh", "true", "* * * * * *");
    save(&store, &fresh).await;
    loop {
        let event = next_event(&mut rx).await;
        if event == JobEvent::upserted(fresh.clone()) {
            break;
        }
        // A repeated re-list may re-announce "keep"; anything else is wrong.
        assert_eq!(event, JobEvent::upserted(Job::new("keep", "true", "* * * * * *")));
    }
    shutdown.cancel();
}
