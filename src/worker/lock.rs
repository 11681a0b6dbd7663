use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{CronError, Result};
use crate::store::{LeaseId, SharedStore, JOB_LOCK_DIR};

/// Per-job distributed execution lock.
///
/// The lock is a key under `/cron/lock/<name>` bound to a lease that is kept
/// alive while the holder runs the job. If the holder dies, the lease lapses
/// and the key disappears on its own.
pub struct JobLock {
    store: SharedStore,
    job_name: String,
    ttl_secs: i64,
}

impl JobLock {
    pub fn new(store: SharedStore, job_name: impl Into<String>, ttl_secs: i64) -> Self {
        Self {
            store,
            job_name: job_name.into(),
            ttl_secs,
        }
    }

    pub fn key(&self) -> String {
        format!("{}{}", JOB_LOCK_DIR, self.job_name)
    }

    /// Try once to take the lock.
    ///
    /// # Errors
    ///
    /// [`CronError::LockAlreadyAcquired`] when another node holds it, or the
    /// store error if the lease could not be set up. No lease is left behind
    /// in either case.
    pub async fn try_lock(self) -> Result<LockGuard> {
        let lease_id = self.store.grant_lease(self.ttl_secs).await?;

        let keep_alive = CancellationToken::new();
        let mut stream = match self.store.keep_alive(lease_id).await {
            Ok(stream) => stream,
            Err(e) => {
                self.revoke_quietly(lease_id).await;
                return Err(e);
            }
        };

        let job_name = self.job_name.clone();
        let stop = keep_alive.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    ack = stream.next() => match ack {
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(job = %job_name, lease_id, error = %e, "Lock lease renewal failed");
                            break;
                        }
                        None => {
                            tracing::debug!(job = %job_name, lease_id, "Lock lease keep-alive ended");
                            break;
                        }
                    },
                }
            }
        });

        let acquired = self
            .store
            .put_if_absent(&self.key(), Vec::new(), lease_id)
            .await;

        match acquired {
            Ok(true) => {
                tracing::debug!(job = %self.job_name, lease_id, "Lock acquired");
                Ok(LockGuard {
                    store: self.store,
                    job_name: self.job_name,
                    lease_id,
                    keep_alive,
                    released: false,
                })
            }
            Ok(false) => {
                keep_alive.cancel();
                self.revoke_quietly(lease_id).await;
                Err(CronError::LockAlreadyAcquired)
            }
            Err(e) => {
                keep_alive.cancel();
                self.revoke_quietly(lease_id).await;
                Err(e)
            }
        }
    }

    async fn revoke_quietly(&self, lease_id: LeaseId) {
        if let Err(e) = self.store.revoke_lease(lease_id).await {
            tracing::warn!(job = %self.job_name, lease_id, error = %e, "Failed to revoke lock lease");
        }
    }
}

/// Held execution lock. Release with [`LockGuard::release`]; dropping the
/// guard releases in the background.
pub struct LockGuard {
    store: SharedStore,
    job_name: String,
    lease_id: LeaseId,
    keep_alive: CancellationToken,
    released: bool,
}

impl LockGuard {
    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Stop renewing and revoke the lease, deleting the lock key.
    /// Revocation failures are logged; the lease then expires by TTL.
    pub async fn release(mut self) {
        self.released = true;
        self.keep_alive.cancel();
        if let Err(e) = self.store.revoke_lease(self.lease_id).await {
            tracing::warn!(job = %self.job_name, lease_id = self.lease_id, error = %e, "Failed to revoke lock lease");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.keep_alive.cancel();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let lease_id = self.lease_id;
        let job_name = std::mem::take(&mut self.job_name);
        handle.spawn(async move {
            if let Err(e) = store.revoke_lease(lease_id).await {
                tracing::warn!(job = %job_name, lease_id, error = %e, "Failed to revoke lock lease");
            }
        });
    }
}
