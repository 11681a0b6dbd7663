//! Coordination store abstraction.
//!
//! Everything the workers and the control plane share lives in a strongly
//! consistent, watchable key-value store:
//!
//! - `/cron/jobs/<name>`: JSON job definitions
//! - `/cron/killer/<name>`: short-lived kill markers
//! - `/cron/lock/<name>`: per-job execution locks, bound to a lease
//! - `/cron/workers/<addr>`: worker liveness keys, bound to a lease
//!
//! # Backends
//!
//! - [`MemStore`]: in-process MVCC store (tests, `standalone` mode)
//! - `EtcdStore`: etcd cluster (requires the `etcd` feature)

pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_stream::Stream;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{CronError, Result};

pub use memory::MemStore;

pub const JOB_SAVE_DIR: &str = "/cron/jobs/";
pub const JOB_KILLER_DIR: &str = "/cron/killer/";
pub const JOB_LOCK_DIR: &str = "/cron/lock/";
pub const JOB_WORKER_DIR: &str = "/cron/workers/";

pub type LeaseId = i64;

/// Shared handle to the coordination store; safe for concurrent calls.
pub type SharedStore = Arc<dyn CoordinationStore>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    /// Attached lease, 0 when none.
    pub lease: LeaseId,
}

/// Result of a prefix read, with the store revision the read was served at.
#[derive(Debug, Clone)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A single mutation observed by a watch. For deletes only `kv.key` and
/// `kv.mod_revision` are meaningful.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub kv: KeyValue,
}

/// Stream of watch events. Ending means the watch terminated, which callers
/// must treat as a failure rather than the end of the namespace.
#[derive(Debug)]
pub struct WatchStream {
    inner: UnboundedReceiverStream<Result<WatchEvent>>,
}

impl WatchStream {
    pub fn new(rx: mpsc::UnboundedReceiver<Result<WatchEvent>>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }
}

impl Stream for WatchStream {
    type Item = Result<WatchEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Stream of lease renewal acknowledgements (remaining TTL in seconds).
/// Dropping it stops the renewals.
#[derive(Debug)]
pub struct KeepAliveStream {
    inner: ReceiverStream<Result<i64>>,
}

impl KeepAliveStream {
    pub fn new(rx: mpsc::Receiver<Result<i64>>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
        }
    }
}

impl Stream for KeepAliveStream {
    type Item = Result<i64>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Read every key under `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<RangeResponse>;

    /// Write `key`, optionally attached to a lease. Returns the previous value.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>)
        -> Result<Option<KeyValue>>;

    /// Delete `key`. Returns the deleted value.
    async fn delete(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Atomically create `key` attached to `lease` if and only if it does not
    /// exist (create revision == 0). Returns whether the write happened.
    async fn put_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<bool>;

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Start renewing `lease` until the returned stream is dropped.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// Revoke `lease`, deleting every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Watch `prefix` starting at `start_revision` (inclusive); 0 watches from now.
    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream>;
}

/// Open the configured coordination store backend.
pub async fn connect(config: &StoreConfig) -> Result<SharedStore> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-process coordination store; state is not shared across processes");
            Ok(Arc::new(MemStore::new()))
        }
        StoreBackend::Etcd => connect_etcd(config).await,
    }
}

#[cfg(feature = "etcd")]
async fn connect_etcd(config: &StoreConfig) -> Result<SharedStore> {
    let store = etcd::EtcdStore::connect(
        &config.endpoints,
        std::time::Duration::from_millis(config.dial_timeout_ms),
    )
    .await?;
    tracing::info!(endpoints = ?config.endpoints, "Connected to etcd");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "etcd"))]
async fn connect_etcd(_config: &StoreConfig) -> Result<SharedStore> {
    Err(CronError::Config(
        "etcd backend requested but cron-lite was built without the `etcd` feature".to_string(),
    ))
}

/// Strip a namespace prefix from a key: `/cron/jobs/job10` -> `job10`.
pub fn extract_name<'a>(key: &'a str, prefix: &str) -> &'a str {
    key.strip_prefix(prefix).unwrap_or(key)
}
