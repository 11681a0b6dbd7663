use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::time::Instant;

use crate::error::{CronError, Result};
use crate::store::{
    CoordinationStore, KeepAliveStream, KeyValue, LeaseId, RangeResponse, WatchEvent,
    WatchEventKind, WatchStream,
};

/// Number of events retained for watch-from-revision replay.
const HISTORY_LIMIT: usize = 10_000;

/// How often expired leases are swept when nobody touches the store.
const REAPER_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Result<WatchEvent>>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: i64,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, Lease>,
    next_lease_id: LeaseId,
    history: VecDeque<WatchEvent>,
    /// Highest revision no longer available in `history`.
    compacted: i64,
    watchers: Vec<Watcher>,
    reaper_started: bool,
}

impl Inner {
    fn put(&mut self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<Option<KeyValue>> {
        if lease != 0 && !self.leases.contains_key(&lease) {
            return Err(CronError::LeaseNotFound(lease));
        }

        self.revision += 1;
        let revision = self.revision;
        let prev = self.kvs.get(key).cloned();

        if let Some(prev) = &prev {
            if prev.lease != 0 && prev.lease != lease {
                if let Some(old) = self.leases.get_mut(&prev.lease) {
                    old.keys.remove(key);
                }
            }
        }
        if let Some(attached) = self.leases.get_mut(&lease) {
            attached.keys.insert(key.to_string());
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
            mod_revision: revision,
            lease,
        };
        self.kvs.insert(key.to_string(), kv.clone());
        self.publish(WatchEvent {
            kind: WatchEventKind::Put,
            kv,
        });

        Ok(prev)
    }

    fn delete(&mut self, key: &str) -> Option<KeyValue> {
        let prev = self.kvs.remove(key)?;
        if let Some(lease) = self.leases.get_mut(&prev.lease) {
            lease.keys.remove(key);
        }

        self.revision += 1;
        self.publish(WatchEvent {
            kind: WatchEventKind::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: Vec::new(),
                create_revision: 0,
                mod_revision: self.revision,
                lease: 0,
            },
        });

        Some(prev)
    }

    fn revoke(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        let mut keys: Vec<String> = lease.keys.into_iter().collect();
        keys.sort();
        for key in keys {
            self.delete(&key);
        }
        true
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            tracing::debug!(lease_id = id, "Lease expired");
            self.revoke(id);
        }
    }

    fn publish(&mut self, event: WatchEvent) {
        self.watchers.retain(|w| !w.tx.is_closed());
        for watcher in &self.watchers {
            if event.kv.key.starts_with(&watcher.prefix) {
                let _ = watcher.tx.send(Ok(event.clone()));
            }
        }

        self.history.push_back(event);
        while self.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.kv.mod_revision;
            }
        }
    }
}

/// In-process coordination store with etcd-like semantics: a global revision,
/// per-key create/mod revisions, TTL leases owning keys, and watches that can
/// replay history from a revision.
///
/// Clones share the same state. Must be used from within a Tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the state, expiring overdue leases first.
    async fn state(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().await;
        inner.expire_leases(Instant::now());
        inner
    }

    fn spawn_reaper(&self) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAPER_INTERVAL);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.lock().await.expire_leases(Instant::now());
            }
        });
    }

    /// Current store revision.
    pub async fn revision(&self) -> i64 {
        self.state().await.revision
    }

    /// Number of live (granted, not yet revoked or expired) leases.
    pub async fn lease_count(&self) -> usize {
        self.state().await.leases.len()
    }

    /// Terminate every open watch, as a dropped connection would.
    pub async fn close_watches(&self) {
        self.inner.lock().await.watchers.clear();
    }

    /// Discard history up to and including `revision`.
    pub async fn compact(&self, revision: i64) {
        let mut inner = self.inner.lock().await;
        while inner
            .history
            .front()
            .is_some_and(|event| event.kv.mod_revision <= revision)
        {
            inner.history.pop_front();
        }
        inner.compacted = inner.compacted.max(revision);
    }
}

#[async_trait]
impl CoordinationStore for MemStore {
    async fn get_prefix(&self, prefix: &str) -> Result<RangeResponse> {
        let inner = self.state().await;
        let kvs = inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();

        Ok(RangeResponse {
            kvs,
            revision: inner.revision,
        })
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Option<KeyValue>> {
        self.state().await.put(key, value, lease.unwrap_or(0))
    }

    async fn delete(&self, key: &str) -> Result<Option<KeyValue>> {
        Ok(self.state().await.delete(key))
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<bool> {
        let mut inner = self.state().await;
        if inner.kvs.contains_key(key) {
            return Ok(false);
        }
        inner.put(key, value, lease)?;
        Ok(true)
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        if ttl_secs <= 0 {
            return Err(CronError::Store(format!("invalid lease TTL: {}", ttl_secs)));
        }

        let mut inner = self.state().await;
        inner.next_lease_id += 1;
        let id = inner.next_lease_id;
        let ttl = Duration::from_secs(ttl_secs as u64);
        inner.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );

        if !inner.reaper_started {
            inner.reaper_started = true;
            self.spawn_reaper();
        }

        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let ttl = self
            .state()
            .await
            .leases
            .get(&lease)
            .map(|l| l.ttl)
            .ok_or(CronError::LeaseNotFound(lease))?;

        let (tx, rx) = mpsc::channel(16);
        let weak = Arc::downgrade(&self.inner);
        let interval = (ttl / 3).max(Duration::from_millis(100));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let renewed = {
                    let mut inner = inner.lock().await;
                    let now = Instant::now();
                    inner.expire_leases(now);
                    inner.leases.get_mut(&lease).map(|l| {
                        l.deadline = now + l.ttl;
                        l.ttl.as_secs() as i64
                    })
                };

                match renewed {
                    Some(remaining) => {
                        if tx.send(Ok(remaining)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = tx.send(Err(CronError::LeaseNotFound(lease))).await;
                        break;
                    }
                }
            }
        });

        Ok(KeepAliveStream::new(rx))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        if self.state().await.revoke(lease) {
            Ok(())
        } else {
            Err(CronError::LeaseNotFound(lease))
        }
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let mut inner = self.state().await;
        let (tx, rx) = mpsc::unbounded_channel();

        if start_revision > 0 {
            if start_revision <= inner.compacted {
                return Err(CronError::Compacted {
                    requested: start_revision,
                    oldest: inner.compacted + 1,
                });
            }
            for event in inner
                .history
                .iter()
                .filter(|e| e.kv.mod_revision >= start_revision && e.kv.key.starts_with(prefix))
            {
                let _ = tx.send(Ok(event.clone()));
            }
        }

        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        Ok(WatchStream::new(rx))
    }
}
