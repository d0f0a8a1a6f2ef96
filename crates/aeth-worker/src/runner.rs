use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aeth_core::audit::{AuditAction, AuditEntry, AuditSink, TracingAuditSink};
use aeth_core::config::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_IDLE_TIMEOUT, DEFAULT_METRICS_SAMPLE_INTERVAL, DEFAULT_REGISTRY_TTL, IDLE_WATCHER_INTERVAL,
    WORKER_REAPER_INTERVAL,
};
use aeth_core::model::{Worker, WorkerMetrics, WorkerStatus};
use aeth_core::naming::generate_worker_metrics_id;
use aeth_core::time::now_iso;
use aeth_core::CoreError;
use aeth_queue::TaskQueue;
use aeth_registry::ServiceRegistry;
use aeth_runtime::Orchestrator;
use aeth_store::{Store, WorkerFilter, WorkerMetricsRepository, WorkerRepository};
use tokio::sync::watch;
use tracing::{info, warn};

/// How often the main loop polls the queue for a claimable task when it has
/// no work in flight.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A running worker (C6, §4.6): owns the registry registration, the
/// heartbeat, the idle-shutdown watcher, and the task-dispatch loop.
pub struct WorkerRunner {
    store: Arc<dyn Store>,
    queue: TaskQueue,
    registry: Arc<dyn ServiceRegistry>,
    orchestrator: Arc<Orchestrator>,
    worker_id: String,
    grace_period: Duration,
    draining: Arc<AtomicBool>,
    audit: Arc<dyn AuditSink>,
}

impl WorkerRunner {
    pub fn new(
        store: Arc<dyn Store>,
        queue: TaskQueue,
        registry: Arc<dyn ServiceRegistry>,
        orchestrator: Arc<Orchestrator>,
        worker_id: impl Into<String>,
        grace_period: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            orchestrator,
            worker_id: worker_id.into(),
            grace_period,
            draining: Arc::new(AtomicBool::new(false)),
            audit: Arc::new(TracingAuditSink),
        }
    }

    /// Run until `shutdown` fires. Registers, heartbeats, dispatches tasks,
    /// and on shutdown drains in-flight work before deregistering (§4.6).
    pub async fn run(&self, initial: Worker, mut shutdown: watch::Receiver<bool>) -> Result<(), CoreError> {
        self.registry.register(&initial, DEFAULT_REGISTRY_TTL).await?;
        // Both store backends upsert on id, so re-registering the same
        // worker across a restart is idempotent.
        self.store.create_worker(&initial).await?;
        self.audit.record(AuditEntry::new(AuditAction::WorkerRegistered).with_worker(&self.worker_id));

        let heartbeat_handle = self.spawn_heartbeat(shutdown.clone());
        let sampler_handle = self.spawn_resource_sampler(shutdown.clone());
        let reaper_handle = self.spawn_worker_reaper(shutdown.clone());
        let idle_handle = {
            let orchestrator = self.orchestrator.clone();
            let store = self.store.clone();
            let worker_id = self.worker_id.clone();
            tokio::spawn(async move {
                aeth_runtime::run_idle_watcher(orchestrator, store, worker_id, DEFAULT_IDLE_TIMEOUT, IDLE_WATCHER_INTERVAL).await;
            })
        };

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.draining.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Some(task) = self.queue.claim_next(&self.worker_id).await? {
                        self.run_task(task).await;
                    }
                }
                _ = shutdown.changed() => {
                    info!(worker_id = %self.worker_id, "shutdown requested, draining");
                    self.draining.store(true, Ordering::SeqCst);
                    self.mark_draining().await;
                    self.audit.record(AuditEntry::new(AuditAction::WorkerDrained).with_worker(&self.worker_id));
                    break;
                }
            }
        }

        self.drain().await;
        heartbeat_handle.abort();
        sampler_handle.abort();
        reaper_handle.abort();
        idle_handle.abort();
        self.registry.deregister(&self.worker_id).await?;
        self.audit.record(AuditEntry::new(AuditAction::WorkerDeregistered).with_worker(&self.worker_id));
        info!(worker_id = %self.worker_id, "deregistered, shutdown complete");
        Ok(())
    }

    /// Persist `draining` on the worker's own store row so `dispatch`'s
    /// guard (which reads the row fresh per task, not this process's local
    /// flag) refuses `vm:create`/`workspace:create` for the rest of the
    /// grace period while still servicing existing VMs.
    async fn mark_draining(&self) {
        match self.store.get_worker(&self.worker_id).await {
            Ok(Some(mut w)) => {
                w.status = WorkerStatus::Draining;
                if let Err(e) = self.store.update_worker(&w).await {
                    warn!(worker_id = %self.worker_id, error = %e, "failed to persist draining status");
                }
            }
            Ok(None) => warn!(worker_id = %self.worker_id, "draining worker has no store row"),
            Err(e) => warn!(worker_id = %self.worker_id, error = %e, "failed to load worker for draining"),
        }
    }

    /// Finish any task claimed right before shutdown, then refuse further
    /// claims until the grace period elapses (§4.6: existing VMs are left
    /// running, not destroyed, on worker shutdown).
    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + self.grace_period;
        while tokio::time::Instant::now() < deadline {
            match self.queue.claim_next(&self.worker_id).await {
                Ok(Some(task)) => self.run_task(task).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "drain: failed to check for in-flight work");
                    break;
                }
            }
        }
    }

    async fn run_task(&self, task: aeth_core::model::Task) {
        let worker = match self.store.get_worker(&self.worker_id).await {
            Ok(Some(w)) => w,
            _ => Worker { status: WorkerStatus::Draining, ..self.placeholder_worker() },
        };

        let task_id = task.id.clone();
        self.audit.record(AuditEntry::new(AuditAction::TaskDispatched).with_task(&task_id).with_worker(&self.worker_id));
        match crate::dispatch::dispatch(&task, &self.orchestrator, &self.store, &worker).await {
            Ok(result) => {
                if let Err(e) = self.queue.complete(&task_id, result).await {
                    warn!(task_id, error = %e, "failed to record task completion");
                }
            }
            Err(e) => {
                warn!(task_id, error = %e, "task failed");
                if let Err(e) = self.queue.fail(&task_id, e.message.clone()).await {
                    warn!(task_id, error = %e, "failed to record task failure");
                }
            }
        }
    }

    fn placeholder_worker(&self) -> Worker {
        Worker {
            id: self.worker_id.clone(),
            hostname: String::new(),
            address: String::new(),
            zone: String::new(),
            labels: Default::default(),
            capabilities: Vec::new(),
            status: WorkerStatus::Draining,
            total_cpu_cores: 0,
            used_cpu_cores: 0,
            total_mem_mib: 0,
            used_mem_mib: 0,
            total_disk_mib: 0,
            used_disk_mib: 0,
            vm_count: 0,
            max_vms: 0,
            started_at: now_iso(),
            last_heartbeat_at: now_iso(),
        }
    }

    fn spawn_heartbeat(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let store = self.store.clone();
        let worker_id = self.worker_id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEFAULT_HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = registry.heartbeat(&worker_id).await {
                            warn!(worker_id, error = %e, "heartbeat failed");
                            continue;
                        }
                        if let Ok(Some(mut w)) = store.get_worker(&worker_id).await {
                            w.last_heartbeat_at = now_iso();
                            let _ = store.update_worker(&w).await;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Periodically snapshot this worker's current usage counters into a
    /// `WorkerMetrics` sample (§4.8). The worker's own store row already
    /// tracks live `used_*`/`vm_count` totals as VMs are created and deleted;
    /// this just appends a point-in-time copy of it, rather than collecting
    /// any new host telemetry.
    fn spawn_resource_sampler(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let worker_id = self.worker_id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEFAULT_METRICS_SAMPLE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.get_worker(&worker_id).await {
                            Ok(Some(w)) => {
                                let sample = WorkerMetrics {
                                    id: generate_worker_metrics_id(),
                                    worker_id: worker_id.clone(),
                                    recorded_at: now_iso(),
                                    used_cpu_cores: w.used_cpu_cores,
                                    used_mem_mib: w.used_mem_mib,
                                    used_disk_mib: w.used_disk_mib,
                                    vm_count: w.vm_count,
                                };
                                if let Err(e) = store.create_worker_metrics(&sample).await {
                                    warn!(worker_id, error = %e, "failed to record resource sample");
                                }
                            }
                            Ok(None) => warn!(worker_id, "resource sampler found no store row for worker"),
                            Err(e) => warn!(worker_id, error = %e, "failed to load worker for resource sampling"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Periodically scan every registered worker and transition any whose
    /// last heartbeat is older than `WORKER_OFFLINE_AFTER` to `Offline`
    /// (§3). `EtcdRegistry`'s lease TTL only expires that peer's registry
    /// key; nothing else updates the persisted `Worker.status`, so every
    /// running worker also carries this reaper to keep the store's view of
    /// the fleet converging on reality.
    fn spawn_worker_reaper(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WORKER_REAPER_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.list_workers(&WorkerFilter::default()).await {
                            Ok(workers) => {
                                for mut w in workers {
                                    if w.status != WorkerStatus::Offline && w.is_stale() {
                                        let worker_id = w.id.clone();
                                        w.status = WorkerStatus::Offline;
                                        if let Err(e) = store.update_worker(&w).await {
                                            warn!(worker_id, error = %e, "failed to mark stale worker offline");
                                        }
                                    }
                                }
                            }
                            Err(e) => warn!(error = %e, "worker reaper failed to list workers"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aeth_net::Fabric;
    use aeth_registry::MemoryRegistry;
    use aeth_runtime::SecretsHandoff;
    use aeth_store::MemoryStore;
    use std::collections::HashMap;

    fn worker(id: &str, status: WorkerStatus) -> Worker {
        Worker {
            id: id.to_string(),
            hostname: "node-1".to_string(),
            address: "10.0.0.1:7000".to_string(),
            zone: "eu-west-1".to_string(),
            labels: HashMap::new(),
            capabilities: Vec::new(),
            status,
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

    fn runner() -> WorkerRunner {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let queue = TaskQueue::new(store.clone());
        let registry: Arc<dyn ServiceRegistry> = Arc::new(MemoryRegistry::new());
        let fabric = Arc::new(Fabric::new("aetherium-test9", "172.34.0"));
        let secrets = Arc::new(SecretsHandoff::new());
        let orchestrator = Arc::new(Orchestrator::new(store.clone(), fabric, secrets, "firecracker", std::env::temp_dir()));
        WorkerRunner::new(store, queue, registry, orchestrator, "worker-1", Duration::from_millis(50))
    }

    #[tokio::test]
    async fn run_registers_and_deregisters_cleanly_with_no_work() {
        let runner = runner();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let w = worker("worker-1", WorkerStatus::Active);
        let registry = runner.registry.clone();
        let run = tokio::spawn(async move { runner.run(w, shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.get("worker-1").await.unwrap().is_some());

        shutdown_tx.send(true).unwrap();
        run.await.unwrap().unwrap();
        assert!(registry.get("worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn shutdown_persists_draining_status_before_deregistering() {
        let runner = runner();
        let store = runner.store.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let w = worker("worker-1", WorkerStatus::Active);
        let run = tokio::spawn(async move { runner.run(w, shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        shutdown_tx.send(true).unwrap();
        run.await.unwrap().unwrap();

        let stored = store.get_worker("worker-1").await.unwrap().unwrap();
        assert_eq!(stored.status, WorkerStatus::Draining);
    }

    #[tokio::test(start_paused = true)]
    async fn resource_sampler_records_a_usage_snapshot() {
        let runner = runner();
        let store = runner.store.clone();
        let mut w = worker("worker-1", WorkerStatus::Active);
        w.used_cpu_cores = 2;
        w.vm_count = 1;
        store.create_worker(&w).await.unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = runner.spawn_resource_sampler(shutdown_rx);

        tokio::time::advance(DEFAULT_METRICS_SAMPLE_INTERVAL).await;
        tokio::task::yield_now().await;
        handle.abort();

        let samples = store.list_worker_metrics(&aeth_store::WorkerMetricsFilter { worker_id: Some("worker-1".to_string()) }).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].worker_id, "worker-1");
        assert_eq!(samples[0].used_cpu_cores, 2);
        assert_eq!(samples[0].vm_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_reaper_marks_stale_workers_offline() {
        let runner = runner();
        let store = runner.store.clone();

        // `is_stale` compares against the real wall clock (chrono), which
        // `tokio::time::pause` doesn't affect, so staleness is set up with
        // an already-old timestamp rather than by advancing tokio's timer.
        let mut stale = worker("worker-stale", WorkerStatus::Active);
        stale.last_heartbeat_at = (aeth_core::time::now() - chrono::Duration::from_std(aeth_core::config::WORKER_OFFLINE_AFTER).unwrap() - chrono::Duration::seconds(1)).to_rfc3339();
        store.create_worker(&stale).await.unwrap();

        let fresh = worker("worker-fresh", WorkerStatus::Active);
        store.create_worker(&fresh).await.unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = runner.spawn_worker_reaper(shutdown_rx);
        tokio::time::advance(WORKER_REAPER_INTERVAL).await;
        tokio::task::yield_now().await;
        handle.abort();

        let stale = store.get_worker("worker-stale").await.unwrap().unwrap();
        assert_eq!(stale.status, WorkerStatus::Offline);
        let fresh = store.get_worker("worker-fresh").await.unwrap().unwrap();
        assert_eq!(fresh.status, WorkerStatus::Active);
    }
}
