use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use aeth_core::CoreError;
use aeth_core::model::Worker;
use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::query::WorkerQuery;
use crate::traits::{RegistryEvent, RegistryStream, ServiceRegistry};

fn etcd_err(e: etcd_client::Error) -> CoreError {
    CoreError::with_source(aeth_core::ErrorKind::Unavailable, "etcd request failed", e.into())
}

/// `ServiceRegistry` backed by etcd (§4.7): each worker is a lease-backed
/// key under `<key_prefix><id>`, so a worker that stops heartbeating has
/// its record expire on its own rather than needing a reaper.
pub struct EtcdRegistry {
    client: Client,
    key_prefix: String,
    leases: Mutex<HashMap<String, i64>>,
}

impl EtcdRegistry {
    pub async fn connect(endpoints: &[String], key_prefix: impl Into<String>) -> Result<Self, CoreError> {
        let client = Client::connect(endpoints, None).await.map_err(etcd_err)?;
        Ok(Self { client, key_prefix: key_prefix.into(), leases: Mutex::new(HashMap::new()) })
    }

    fn key(&self, worker_id: &str) -> String {
        format!("{}{}", self.key_prefix, worker_id)
    }

    fn lease_for(&self, worker_id: &str) -> Result<i64, CoreError> {
        self.leases
            .lock()
            .unwrap()
            .get(worker_id)
            .copied()
            .ok_or_else(|| CoreError::not_found(format!("worker '{worker_id}' has no active lease")))
    }

    fn decode(value: &[u8]) -> Option<Worker> {
        match serde_json::from_slice(value) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(error = %e, "dropping unparseable registry record");
                None
            }
        }
    }
}

#[async_trait]
impl ServiceRegistry for EtcdRegistry {
    async fn register(&self, worker: &Worker, ttl: Duration) -> Result<(), CoreError> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(ttl.as_secs().max(1) as i64, None).await.map_err(etcd_err)?;
        let value = serde_json::to_vec(worker).map_err(|e| CoreError::internal(e.to_string()))?;
        client
            .put(self.key(&worker.id), value, Some(PutOptions::new().with_lease(lease.id())))
            .await
            .map_err(etcd_err)?;
        self.leases.lock().unwrap().insert(worker.id.clone(), lease.id());
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<(), CoreError> {
        let lease_id = self.lease_for(worker_id)?;
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await.map_err(etcd_err)?;
        keeper.keep_alive().await.map_err(etcd_err)?;
        let resp = stream
            .message()
            .await
            .map_err(etcd_err)?
            .ok_or_else(|| CoreError::unavailable("etcd closed the keep-alive stream"))?;
        if resp.ttl() <= 0 {
            return Err(CoreError::not_found(format!("worker '{worker_id}' lease expired")));
        }
        Ok(())
    }

    async fn deregister(&self, worker_id: &str) -> Result<(), CoreError> {
        let mut client = self.client.clone();
        client.delete(self.key(worker_id), None).await.map_err(etcd_err)?;
        self.leases.lock().unwrap().remove(worker_id);
        Ok(())
    }

    async fn get(&self, worker_id: &str) -> Result<Option<Worker>, CoreError> {
        let mut client = self.client.clone();
        let resp = client.get(self.key(worker_id), None).await.map_err(etcd_err)?;
        Ok(resp.kvs().first().and_then(|kv| Self::decode(kv.value())))
    }

    async fn list(&self, query: &WorkerQuery) -> Result<Vec<Worker>, CoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(self.key_prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(etcd_err)?;
        Ok(resp
            .kvs()
            .iter()
            .filter_map(|kv| Self::decode(kv.value()))
            .filter(|w| query.matches(w))
            .collect())
    }

    async fn watch(&self) -> Result<RegistryStream, CoreError> {
        let mut client = self.client.clone();
        let (_watcher, mut stream) = client
            .watch(self.key_prefix.as_str(), Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(etcd_err)?;

        let (tx, rx) = mpsc::channel(256);
        let key_prefix = self.key_prefix.clone();
        tokio::spawn(async move {
            // Keeps the watcher alive for as long as the receiving side cares;
            // dropping it ends the etcd watch on the server side too.
            let _watcher = _watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            let forwarded = match event.event_type() {
                                EventType::Put => event.kv().and_then(|kv| Self::decode(kv.value())).map(RegistryEvent::Put),
                                EventType::Delete => event
                                    .kv()
                                    .map(|kv| String::from_utf8_lossy(kv.key()).into_owned())
                                    .map(|key| key.trim_start_matches(&key_prefix).to_string())
                                    .map(RegistryEvent::Delete),
                            };
                            if let Some(event) = forwarded {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        warn!(error = %e, "registry watch stream errored, stopping");
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
