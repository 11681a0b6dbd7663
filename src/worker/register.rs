use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{CronError, Result};
use crate::retry::jittered;
use crate::store::{LeaseId, SharedStore, JOB_WORKER_DIR};

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Keeps `/cron/workers/<addr>` alive for as long as this worker runs.
pub struct Register {
    store: SharedStore,
    addr: String,
    ttl_secs: i64,
}

impl Register {
    pub fn new(store: SharedStore, addr: impl Into<String>, ttl_secs: i64) -> Self {
        Self {
            store,
            addr: addr.into(),
            ttl_secs,
        }
    }

    pub fn key(&self) -> String {
        format!("{}{}", JOB_WORKER_DIR, self.addr)
    }

    /// Register and keep the registration alive until `shutdown` fires,
    /// starting over after any failure. The lease is revoked on the way out.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(addr = %self.addr, "Worker registration started");

        loop {
            if let Some(lease_id) = self.register_once(&shutdown).await {
                if let Err(e) = self.store.revoke_lease(lease_id).await {
                    tracing::debug!(addr = %self.addr, error = %e, "Failed to revoke registration lease");
                }
            }

            if shutdown.is_cancelled() {
                tracing::info!(addr = %self.addr, "Worker deregistered");
                return;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(jittered(RETRY_DELAY)) => {}
            }
        }
    }

    /// One registration attempt. Returns the lease it was holding, if any,
    /// once the keep-alive stream ends or a step fails or shutdown fires.
    async fn register_once(&self, shutdown: &CancellationToken) -> Option<LeaseId> {
        let lease_id = match self.store.grant_lease(self.ttl_secs).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(addr = %self.addr, error = %e, "Registration lease grant failed");
                return None;
            }
        };

        let mut stream = match self.store.keep_alive(lease_id).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(addr = %self.addr, error = %e, "Registration keep-alive failed");
                return Some(lease_id);
            }
        };

        if let Err(e) = self
            .store
            .put(&self.key(), Vec::new(), Some(lease_id))
            .await
        {
            tracing::warn!(addr = %self.addr, error = %e, "Failed to publish worker key");
            return Some(lease_id);
        }
        tracing::debug!(addr = %self.addr, lease_id, "Worker key published");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Some(lease_id),
                ack = stream.next() => match ack {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(addr = %self.addr, error = %e, "Registration lease lost");
                        return Some(lease_id);
                    }
                    None => {
                        tracing::warn!(addr = %self.addr, "Registration keep-alive ended");
                        return Some(lease_id);
                    }
                },
            }
        }
    }
}

/// First non-loopback IPv4 address of this host, found by asking the kernel
/// which interface would route to a public address. No packet is sent.
pub fn local_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
    let ip = socket.local_addr()?.ip();

    if ip.is_loopback() || ip.is_unspecified() {
        return Err(CronError::Config(
            "no non-loopback IPv4 address found; set advertiseAddr".to_string(),
        ));
    }
    Ok(ip)
}
