use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Coordination store error: {0}")]
    Store(String),

    #[error("Lease not found: {0}")]
    LeaseNotFound(i64),

    #[error("Revision {requested} has been compacted (oldest available: {oldest})")]
    Compacted { requested: i64, oldest: i64 },

    #[error("Watch closed: {0}")]
    WatchClosed(String),

    /// Another node holds the execution lock for this job. Not a failure.
    #[error("lock already acquired by another worker")]
    LockAlreadyAcquired,

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("Malformed job payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("job killed by request")]
    Cancelled,

    #[error("job interrupted by worker shutdown")]
    Interrupted,

    #[error("Log store error: {0}")]
    LogStore(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CronError {
    /// True for the contention outcome of the lock protocol.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, CronError::LockAlreadyAcquired)
    }
}

pub type Result<T> = std::result::Result<T, CronError>;
