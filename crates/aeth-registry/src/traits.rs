use std::pin::Pin;
use std::time::Duration;

use aeth_core::CoreError;
use aeth_core::model::Worker;
use async_trait::async_trait;
use futures::Stream;

use crate::query::WorkerQuery;

/// A change observed on the registry's watch stream (§4.7).
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Put(Worker),
    Delete(String),
}

pub type RegistryStream = Pin<Box<dyn Stream<Item = RegistryEvent> + Send>>;

/// Worker liveness directory (C7, §4.7). The registry is the source of
/// truth for *liveness*; the persistent store remains the source of truth
/// for historical resource usage (§4.7) — this trait never touches that.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Publish a worker's record with the given TTL. Calling this again
    /// for an already-registered worker overwrites the record and renews
    /// the lease (idempotent registration).
    async fn register(&self, worker: &Worker, ttl: Duration) -> Result<(), CoreError>;

    /// Refresh the TTL on an already-registered worker's lease.
    async fn heartbeat(&self, worker_id: &str) -> Result<(), CoreError>;

    /// Remove a worker's record. Does not touch its VM records (§4.7).
    async fn deregister(&self, worker_id: &str) -> Result<(), CoreError>;

    async fn get(&self, worker_id: &str) -> Result<Option<Worker>, CoreError>;

    async fn list(&self, query: &WorkerQuery) -> Result<Vec<Worker>, CoreError>;

    /// Subscribe to the change stream (§4.7: "subscribe to a change stream").
    async fn watch(&self) -> Result<RegistryStream, CoreError>;
}
