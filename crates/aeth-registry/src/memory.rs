use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use aeth_core::CoreError;
use aeth_core::model::Worker;
use aeth_core::time::now_iso;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::query::WorkerQuery;
use crate::traits::{RegistryEvent, RegistryStream, ServiceRegistry};

/// In-memory fake used by worker/runtime tests in place of etcd (§3 "a fake
/// in-memory implementation of each [boundary] is required for tests").
/// TTLs are tracked but never expire records on their own; a consumer that
/// wants staleness detection reads `Worker::is_stale` instead.
pub struct MemoryRegistry {
    records: Mutex<HashMap<String, Worker>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { records: Mutex::new(HashMap::new()), events: tx }
    }
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn register(&self, worker: &Worker, _ttl: Duration) -> Result<(), CoreError> {
        self.records.lock().unwrap().insert(worker.id.clone(), worker.clone());
        let _ = self.events.send(RegistryEvent::Put(worker.clone()));
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<(), CoreError> {
        let mut records = self.records.lock().unwrap();
        let worker = records
            .get_mut(worker_id)
            .ok_or_else(|| CoreError::not_found(format!("worker '{worker_id}' is not registered")))?;
        worker.last_heartbeat_at = now_iso();
        let _ = self.events.send(RegistryEvent::Put(worker.clone()));
        Ok(())
    }

    async fn deregister(&self, worker_id: &str) -> Result<(), CoreError> {
        self.records.lock().unwrap().remove(worker_id);
        let _ = self.events.send(RegistryEvent::Delete(worker_id.to_string()));
        Ok(())
    }

    async fn get(&self, worker_id: &str) -> Result<Option<Worker>, CoreError> {
        Ok(self.records.lock().unwrap().get(worker_id).cloned())
    }

    async fn list(&self, query: &WorkerQuery) -> Result<Vec<Worker>, CoreError> {
        Ok(self.records.lock().unwrap().values().filter(|w| query.matches(w)).cloned().collect())
    }

    async fn watch(&self) -> Result<RegistryStream, CoreError> {
        let rx = self.events.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|r| r.ok());
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use aeth_core::model::WorkerStatus;
    use futures::StreamExt as _;

    fn worker(id: &str) -> Worker {
        Worker {
            id: id.to_string(),
            hostname: "node-1".to_string(),
            address: "10.0.0.1:7000".to_string(),
            zone: "eu-west-1".to_string(),
            labels: Map::new(),
            capabilities: Vec::new(),
            status: WorkerStatus::Active,
            total_cpu_cores: 8,
            used_cpu_cores: 0,
            total_mem_mib: 16384,
            used_mem_mib: 0,
            total_disk_mib: 102_400,
            used_disk_mib: 0,
            vm_count: 0,
            max_vms: 64,
            started_at: now_iso(),
            last_heartbeat_at: now_iso(),
        }
    }

    #[tokio::test]
    async fn register_then_get_roundtrips() {
        let reg = MemoryRegistry::new();
        reg.register(&worker("worker-1"), Duration::from_secs(30)).await.unwrap();
        let got = reg.get("worker-1").await.unwrap().unwrap();
        assert_eq!(got.id, "worker-1");
    }

    #[tokio::test]
    async fn heartbeat_updates_last_heartbeat_and_requires_registration() {
        let reg = MemoryRegistry::new();
        let err = reg.heartbeat("worker-1").await.unwrap_err();
        assert_eq!(err.kind, aeth_core::ErrorKind::NotFound);

        reg.register(&worker("worker-1"), Duration::from_secs(30)).await.unwrap();
        let before = reg.get("worker-1").await.unwrap().unwrap().last_heartbeat_at;
        tokio::time::sleep(Duration::from_millis(5)).await;
        reg.heartbeat("worker-1").await.unwrap();
        let after = reg.get("worker-1").await.unwrap().unwrap().last_heartbeat_at;
        assert!(after >= before);
    }

    #[tokio::test]
    async fn deregister_removes_but_watch_observes_the_delete() {
        let reg = MemoryRegistry::new();
        let mut events = reg.watch().await.unwrap();
        reg.register(&worker("worker-1"), Duration::from_secs(30)).await.unwrap();
        reg.deregister("worker-1").await.unwrap();

        assert!(matches!(events.next().await.unwrap(), RegistryEvent::Put(_)));
        assert!(matches!(events.next().await.unwrap(), RegistryEvent::Delete(id) if id == "worker-1"));
        assert!(reg.get("worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_applies_query_filter() {
        let reg = MemoryRegistry::new();
        reg.register(&worker("worker-1"), Duration::from_secs(30)).await.unwrap();
        let mut other = worker("worker-2");
        other.zone = "us-east-1".to_string();
        reg.register(&other, Duration::from_secs(30)).await.unwrap();

        let query = WorkerQuery { zone: Some("eu-west-1".to_string()), ..Default::default() };
        let found = reg.list(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "worker-1");
    }
}
