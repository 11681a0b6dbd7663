use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CronError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, only useful when master and worker share a process
    Memory,
    /// etcd v3 cluster
    Etcd,
}

/// Coordination store connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    pub backend: StoreBackend,
    #[serde(alias = "etcdEndPoints")]
    pub endpoints: Vec<String>,
    #[serde(alias = "etcdDialTimeout")]
    pub dial_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Etcd,
            endpoints: vec!["127.0.0.1:2379".to_string()],
            dial_timeout_ms: 5000,
        }
    }
}

/// Batching parameters for the execution log sink.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogSinkConfig {
    /// Flush as soon as a batch holds this many entries
    #[serde(alias = "jobLogBatchSize")]
    pub batch_size: usize,
    /// Flush a non-empty batch this long after its first entry arrived
    #[serde(alias = "jobLogCommitTimeout")]
    pub commit_timeout_ms: u64,
    /// Entries buffered between the scheduler and the sink; overflow is dropped
    pub channel_capacity: usize,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            commit_timeout_ms: 1000,
            channel_capacity: 1000,
        }
    }
}

/// Where execution logs are persisted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogStoreConfig {
    /// SQLite database file. Logs are kept in memory when unset.
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    pub store: StoreConfig,
    /// TTL of the lease backing each per-job execution lock
    pub lock_ttl_secs: i64,
    pub log_sink: LogSinkConfig,
    pub log_store: LogStoreConfig,
    /// Shell used to run job commands as `<shell> -c <command>`
    pub shell: String,
    /// Address published under the workers namespace. Detected when unset.
    pub advertise_addr: Option<String>,
    /// TTL of the lease backing the worker registration key
    pub register_ttl_secs: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            lock_ttl_secs: 5,
            log_sink: LogSinkConfig::default(),
            log_store: LogStoreConfig::default(),
            shell: "/bin/sh".to_string(),
            advertise_addr: None,
            register_ttl_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MasterConfig {
    pub store: StoreConfig,
    pub log_store: LogStoreConfig,
    pub listen_addr: SocketAddr,
    /// TTL of kill markers; their expiry signals the request was consumed
    pub kill_ttl_secs: i64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            log_store: LogStoreConfig::default(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8070)),
            kill_ttl_secs: 1,
        }
    }
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| CronError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| CronError::Config(format!("failed to parse {}: {}", path.display(), e)))
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

impl MasterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}
