//! End-to-end scenarios exercised against in-memory fakes (§8). These cover
//! the properties that don't require a real hypervisor or guest agent:
//! idle shutdown, drain, and at-least-once task redelivery. The streaming,
//! TCP-fallback, and trivial-roundtrip scenarios need a real guest-agent
//! process and are covered at the unit level inside their owning crates
//! instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aetheriumd::core::model::{Task, TaskState, TaskType, Worker, WorkerStatus, VmStatus};
use aetheriumd::core::naming::generate_task_id;
use aetheriumd::core::time::now_iso;
use aetheriumd::net::Fabric;
use aetheriumd::queue::TaskQueue;
use aetheriumd::registry::MemoryRegistry;
use aetheriumd::runtime::{run_idle_watcher, CreateVmArgs, Orchestrator, SecretsHandoff};
use aetheriumd::store::{MemoryStore, Store, TaskRepository, VmRepository, WorkerRepository};
use aetheriumd::worker::WorkerRunner;
use tokio::sync::watch;

fn worker(id: &str) -> Worker {
    Worker {
        id: id.to_string(),
        hostname: "node-1".to_string(),
        address: "10.0.0.1:7000".to_string(),
        zone: "eu-west-1".to_string(),
        labels: HashMap::new(),
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

/// Scenario 4: a `Running` VM past its idle timeout is stopped by the idle
/// watcher without anyone issuing a `vm:delete`.
#[tokio::test]
async fn idle_vm_is_stopped_once_past_its_timeout() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store.create_worker(&worker("worker-1")).await.unwrap();

    let fabric = Arc::new(Fabric::new("aetherium-scn4", "172.40.0"));
    let secrets = Arc::new(SecretsHandoff::new());
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), fabric, secrets, "firecracker", std::env::temp_dir()));

    let vm = orchestrator
        .create_vm(CreateVmArgs {
            name: "builder".to_string(),
            workspace_id: "ws-1".to_string(),
            worker_id: "worker-1".to_string(),
            vcpu_count: 1,
            mem_mib: 512,
            kernel_path: "/vmlinux".to_string(),
            rootfs_path: "/rootfs.ext4".to_string(),
            single_task_id: None,
            idle_timeout_secs: Some(60),
            idempotency_key: None,
        })
        .await
        .unwrap();

    // Force the VM to `Running` with an activity timestamp well past its
    // 60s timeout, bypassing the hypervisor boot the real transition needs.
    let mut stored = store.get_vm(&vm.id).await.unwrap().unwrap();
    stored.status = VmStatus::Running;
    stored.last_activity_at = Some((aetheriumd::core::time::now() - chrono::Duration::seconds(120)).to_rfc3339());
    store.update_vm(&stored).await.unwrap();

    let watcher = {
        let orchestrator = orchestrator.clone();
        let store = store.clone();
        tokio::spawn(async move {
            run_idle_watcher(orchestrator, store, "worker-1".to_string(), Duration::from_secs(30 * 60), Duration::from_millis(10)).await;
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    watcher.abort();

    let stopped = store.get_vm(&vm.id).await.unwrap().unwrap();
    assert_eq!(stopped.status, VmStatus::Stopped);
}

/// Scenario 5: a worker shutting down refuses `vm:create` for the rest of
/// its grace period instead of silently accepting more state-creating work.
#[tokio::test]
async fn draining_worker_refuses_queued_vm_create_until_it_exits() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store.create_worker(&worker("worker-1")).await.unwrap();

    let fabric = Arc::new(Fabric::new("aetherium-scn5", "172.41.0"));
    let secrets = Arc::new(SecretsHandoff::new());
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), fabric, secrets, "firecracker", std::env::temp_dir()));
    let queue = TaskQueue::new(store.clone());
    let registry: Arc<dyn aetheriumd::registry::ServiceRegistry> = Arc::new(MemoryRegistry::new());

    let runner = WorkerRunner::new(store.clone(), queue.clone(), registry, orchestrator, "worker-1", Duration::from_millis(80));

    // Enqueued before the runner ever polls, so it's still `pending` when
    // shutdown is signalled.
    let task = queue
        .enqueue(
            TaskType::VmCreate,
            serde_json::json!({
                "name": "builder", "workspace_id": "ws-1", "vcpu_count": 1, "mem_mib": 512,
                "kernel_path": "/vmlinux", "rootfs_path": "/rootfs.ext4"
            }),
            0,
            None,
        )
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move { runner.run(worker("worker-1"), shutdown_rx).await });

    // Signal shutdown before the 200ms poll ticker ever fires, so the task
    // is only ever seen during `drain()`, not the normal dispatch path.
    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    let stored = store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Retry);
    assert!(stored.error.as_deref().unwrap_or_default().contains("draining"));
    assert!(store.list_vms(&Default::default()).await.unwrap().is_empty());
}

/// Scenario 6: redelivering a `vm:create` task under the same task id
/// (a worker crashing between `create_vm` and `queue.complete`) converges
/// on exactly one VM record rather than minting a second.
#[tokio::test]
async fn replaying_a_vm_create_task_id_produces_one_vm() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store.create_worker(&worker("worker-1")).await.unwrap();

    let fabric = Arc::new(Fabric::new("aetherium-scn6", "172.42.0"));
    let secrets = Arc::new(SecretsHandoff::new());
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), fabric, secrets, "firecracker", std::env::temp_dir()));

    // `TaskQueue::enqueue` always mints a fresh id, so the redelivery this
    // scenario describes is modelled directly against the store: the same
    // task row gets claimed twice, as it would if the first claimant
    // crashed before acknowledging completion.
    let task = Task {
        id: generate_task_id(),
        task_type: TaskType::VmCreate,
        payload: serde_json::json!({
            "name": "builder", "workspace_id": "ws-1", "vcpu_count": 1, "mem_mib": 512,
            "kernel_path": "/vmlinux", "rootfs_path": "/rootfs.ext4"
        }),
        retry_count: 0,
        max_retries: 3,
        priority: 0,
        deadline: None,
        state: TaskState::Pending,
        result: None,
        error: None,
        worker_id: None,
        available_at: now_iso(),
        created_at: now_iso(),
        updated_at: now_iso(),
    };
    store.create_task(&task).await.unwrap();

    let queue = TaskQueue::new(store.clone());
    let w = worker("worker-1");

    // Both dispatches may themselves fail past VM creation (there's no real
    // hypervisor to boot in this environment); what matters here is that
    // neither delivery of the same task id produces a second VM row.
    let first_claim = queue.claim_next("worker-1").await.unwrap().unwrap();
    let _ = aetheriumd::worker::dispatch::dispatch(&first_claim, &orchestrator, &store, &w).await;

    // The crash happens here, before `queue.complete` runs: a second
    // claimant (or the same worker after restart) sees the task as
    // still-claimable because nothing ever marked it `completed`.
    let mut replay = store.get_task(&task.id).await.unwrap().unwrap();
    replay.state = TaskState::Pending;
    replay.worker_id = None;
    store.update_task(&replay).await.unwrap();

    let second_claim = queue.claim_next("worker-1").await.unwrap().unwrap();
    let _ = aetheriumd::worker::dispatch::dispatch(&second_claim, &orchestrator, &store, &w).await;

    let vms = store.list_vms(&Default::default()).await.unwrap();
    assert_eq!(vms.len(), 1);
    assert_eq!(vms[0].id, aetheriumd::core::naming::vm_id_for_task(&task.id));
}
