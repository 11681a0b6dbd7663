use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions,
    PutOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;

use crate::error::{CronError, Result};
use crate::store::{
    CoordinationStore, KeepAliveStream, KeyValue, LeaseId, RangeResponse, WatchEvent,
    WatchEventKind, WatchStream,
};

/// Interval between lease renewals sent on a keep-alive stream.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Coordination store backed by an etcd v3 cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

fn store_err(e: etcd_client::Error) -> CronError {
    CronError::Store(e.to_string())
}

fn convert(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        lease: kv.lease(),
    }
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> Result<Self> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(store_err)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> Result<RangeResponse> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(store_err)?;

        Ok(RangeResponse {
            kvs: resp.kvs().iter().map(convert).collect(),
            revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
        })
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Option<KeyValue>> {
        let mut options = PutOptions::new().with_prev_key();
        if let Some(lease) = lease {
            options = options.with_lease(lease);
        }

        let mut kv = self.client.kv_client();
        let resp = kv.put(key, value, Some(options)).await.map_err(store_err)?;
        Ok(resp.prev_key().map(convert))
    }

    async fn delete(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .delete(key, Some(DeleteOptions::new().with_prev_key()))
            .await
            .map_err(store_err)?;
        Ok(resp.prev_kvs().first().map(convert))
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<bool> {
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease)),
            )])
            .or_else(vec![TxnOp::get(key, None)]);

        let mut kv = self.client.kv_client();
        let resp = kv.txn(txn).await.map_err(store_err)?;
        Ok(resp.succeeded())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut lease = self.client.lease_client();
        let resp = lease.grant(ttl_secs, None).await.map_err(store_err)?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let mut client = self.client.lease_client();
        let (mut keeper, mut responses) = client.keep_alive(lease).await.map_err(store_err)?;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(KEEP_ALIVE_INTERVAL) => {}
                }

                if let Err(e) = keeper.keep_alive().await {
                    let _ = tx.send(Err(store_err(e))).await;
                    break;
                }

                let ack = match responses.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => Ok(resp.ttl()),
                    Ok(Some(_)) => Err(CronError::LeaseNotFound(lease)),
                    Ok(None) => break,
                    Err(e) => Err(store_err(e)),
                };
                let failed = ack.is_err();
                if tx.send(ack).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(KeepAliveStream::new(rx))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.lease_client();
        client.revoke(lease).await.map_err(store_err)?;
        Ok(())
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let mut options = WatchOptions::new().with_prefix();
        if start_revision > 0 {
            options = options.with_start_revision(start_revision);
        }

        let mut client = self.client.watch_client();
        let (mut watcher, mut stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(store_err)?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        let _ = watcher.cancel().await;
                        break;
                    }
                    message = stream.message() => match message {
                        Ok(Some(resp)) => {
                            if resp.compact_revision() > 0 {
                                let _ = tx.send(Err(CronError::Compacted {
                                    requested: start_revision,
                                    oldest: resp.compact_revision() + 1,
                                }));
                                break;
                            }
                            if resp.canceled() {
                                let reason = resp.cancel_reason().to_string();
                                let _ = tx.send(Err(CronError::WatchClosed(reason)));
                                break;
                            }
                            for event in resp.events() {
                                let Some(kv) = event.kv() else {
                                    continue;
                                };
                                let kind = match event.event_type() {
                                    EventType::Put => WatchEventKind::Put,
                                    EventType::Delete => WatchEventKind::Delete,
                                };
                                let _ = tx.send(Ok(WatchEvent { kind, kv: convert(kv) }));
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Err(store_err(e)));
                            break;
                        }
                    }
                }
            }
        });

        Ok(WatchStream::new(rx))
    }
}
