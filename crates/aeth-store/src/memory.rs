use std::collections::HashMap;
use std::sync::Mutex;

use aeth_core::CoreError;
use aeth_core::model::{Execution, Secret, Task, Vm, Worker, WorkerMetrics, Workspace};
use async_trait::async_trait;

use crate::filters::{ExecutionFilter, SecretFilter, TaskFilter, VmFilter, WorkerFilter, WorkerMetricsFilter, WorkspaceFilter};
use crate::traits::{ExecutionRepository, ResourceReservation, SecretRepository, Store, TaskRepository, VmRepository, WorkerMetricsRepository, WorkerRepository, WorkspaceRepository};

#[derive(Default)]
struct Tables {
    vms: HashMap<String, Vm>,
    executions: HashMap<String, Execution>,
    workers: HashMap<String, Worker>,
    worker_metrics: Vec<WorkerMetrics>,
    workspaces: HashMap<String, Workspace>,
    secrets: HashMap<String, Secret>,
    tasks: HashMap<String, Task>,
}

/// An in-process fake of the persistent store, for tests that don't want a
/// real SQLite file. Enforces the same invariants as [`crate::sqlite::SqliteStore`]
/// so tests exercising invariant violations behave identically against either.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn last_execution_start(tables: &Tables, vm_id: &str) -> Option<String> {
        tables
            .executions
            .values()
            .filter(|e| e.vm_id == vm_id)
            .map(|e| e.started_at.clone())
            .max()
    }
}

#[async_trait]
impl VmRepository for MemoryStore {
    async fn create_vm(&self, vm: &Vm) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.workers.contains_key(&vm.worker_id) {
            return Err(CoreError::precondition_failed(format!(
                "vm '{}' references unknown worker '{}'",
                vm.id, vm.worker_id
            )));
        }
        if tables.vms.values().any(|v| v.id != vm.id && v.net.tap_name == vm.net.tap_name) {
            return Err(CoreError::precondition_failed(format!(
                "tap name '{}' already in use",
                vm.net.tap_name
            )));
        }
        tables.vms.insert(vm.id.clone(), vm.clone());
        Ok(())
    }

    async fn update_vm(&self, vm: &Vm) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.vms.contains_key(&vm.id) {
            return Err(CoreError::not_found(format!("vm '{}' not found", vm.id)));
        }
        tables.vms.insert(vm.id.clone(), vm.clone());
        Ok(())
    }

    async fn get_vm(&self, id: &str) -> Result<Option<Vm>, CoreError> {
        Ok(self.tables.lock().unwrap().vms.get(id).cloned())
    }

    async fn list_vms(&self, filter: &VmFilter) -> Result<Vec<Vm>, CoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .vms
            .values()
            .filter(|v| filter.worker_id.as_deref().is_none_or(|w| v.worker_id == w))
            .filter(|v| filter.workspace_id.as_deref().is_none_or(|w| v.workspace_id == w))
            .filter(|v| filter.status.is_none_or(|s| v.status == s))
            .cloned()
            .collect())
    }

    async fn delete_vm(&self, id: &str) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().unwrap();
        tables.vms.remove(id);
        Ok(())
    }
}

#[async_trait]
impl ExecutionRepository for MemoryStore {
    async fn create_execution(&self, execution: &Execution) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(last) = Self::last_execution_start(&tables, &execution.vm_id) {
            if execution.started_at < last {
                return Err(CoreError::precondition_failed(format!(
                    "execution start-time {} precedes the last recorded start {} for vm '{}'",
                    execution.started_at, last, execution.vm_id
                )));
            }
        }
        tables.executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.executions.contains_key(&execution.id) {
            return Err(CoreError::not_found(format!("execution '{}' not found", execution.id)));
        }
        tables.executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, CoreError> {
        Ok(self.tables.lock().unwrap().executions.get(id).cloned())
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, CoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .executions
            .values()
            .filter(|e| filter.vm_id.as_deref().is_none_or(|id| e.vm_id == id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WorkerRepository for MemoryStore {
    async fn create_worker(&self, worker: &Worker) -> Result<(), CoreError> {
        self.tables.lock().unwrap().workers.insert(worker.id.clone(), worker.clone());
        Ok(())
    }

    async fn update_worker(&self, worker: &Worker) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.workers.contains_key(&worker.id) {
            return Err(CoreError::not_found(format!("worker '{}' not found", worker.id)));
        }
        tables.workers.insert(worker.id.clone(), worker.clone());
        Ok(())
    }

    async fn get_worker(&self, id: &str) -> Result<Option<Worker>, CoreError> {
        Ok(self.tables.lock().unwrap().workers.get(id).cloned())
    }

    async fn list_workers(&self, filter: &WorkerFilter) -> Result<Vec<Worker>, CoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .workers
            .values()
            .filter(|w| filter.status.is_none_or(|s| w.status == s))
            .filter(|w| filter.zone.as_deref().is_none_or(|z| w.zone == z))
            .cloned()
            .collect())
    }

    async fn delete_worker(&self, id: &str) -> Result<(), CoreError> {
        self.tables.lock().unwrap().workers.remove(id);
        Ok(())
    }
}

#[async_trait]
impl WorkerMetricsRepository for MemoryStore {
    async fn create_worker_metrics(&self, sample: &WorkerMetrics) -> Result<(), CoreError> {
        self.tables.lock().unwrap().worker_metrics.push(sample.clone());
        Ok(())
    }

    async fn list_worker_metrics(&self, filter: &WorkerMetricsFilter) -> Result<Vec<WorkerMetrics>, CoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .worker_metrics
            .iter()
            .filter(|m| filter.worker_id.as_deref().is_none_or(|w| m.worker_id == w))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WorkspaceRepository for MemoryStore {
    async fn create_workspace(&self, workspace: &Workspace) -> Result<(), CoreError> {
        self.tables.lock().unwrap().workspaces.insert(workspace.id.clone(), workspace.clone());
        Ok(())
    }

    async fn update_workspace(&self, workspace: &Workspace) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.workspaces.contains_key(&workspace.id) {
            return Err(CoreError::not_found(format!("workspace '{}' not found", workspace.id)));
        }
        tables.workspaces.insert(workspace.id.clone(), workspace.clone());
        Ok(())
    }

    async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>, CoreError> {
        Ok(self.tables.lock().unwrap().workspaces.get(id).cloned())
    }

    async fn list_workspaces(&self, filter: &WorkspaceFilter) -> Result<Vec<Workspace>, CoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .workspaces
            .values()
            .filter(|w| filter.owner_label.as_deref().is_none_or(|o| w.owner_label == o))
            .cloned()
            .collect())
    }

    async fn delete_workspace(&self, id: &str) -> Result<(), CoreError> {
        self.tables.lock().unwrap().workspaces.remove(id);
        Ok(())
    }
}

#[async_trait]
impl SecretRepository for MemoryStore {
    async fn create_secret(&self, secret: &Secret) -> Result<(), CoreError> {
        self.tables.lock().unwrap().secrets.insert(secret.id.clone(), secret.clone());
        Ok(())
    }

    async fn get_secret(&self, id: &str) -> Result<Option<Secret>, CoreError> {
        Ok(self.tables.lock().unwrap().secrets.get(id).cloned())
    }

    async fn list_secrets(&self, filter: &SecretFilter) -> Result<Vec<Secret>, CoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .secrets
            .values()
            .filter(|s| filter.workspace_id.as_deref().is_none_or(|w| s.workspace_id == w))
            .cloned()
            .collect())
    }

    async fn delete_secret(&self, id: &str) -> Result<(), CoreError> {
        self.tables.lock().unwrap().secrets.remove(id);
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn create_task(&self, task: &Task) -> Result<(), CoreError> {
        self.tables.lock().unwrap().tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.tasks.contains_key(&task.id) {
            return Err(CoreError::not_found(format!("task '{}' not found", task.id)));
        }
        tables.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, CoreError> {
        Ok(self.tables.lock().unwrap().tasks.get(id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, CoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .tasks
            .values()
            .filter(|t| filter.state.is_none_or(|s| t.state == s))
            .filter(|t| filter.task_type.is_none_or(|ty| t.task_type == ty))
            .filter(|t| filter.worker_id.as_deref().is_none_or(|w| t.worker_id.as_deref() == Some(w)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_vm_reserving_resources(&self, vm: &Vm, reservation: ResourceReservation) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().unwrap();
        let worker = tables
            .workers
            .get(&vm.worker_id)
            .ok_or_else(|| CoreError::precondition_failed(format!("worker '{}' not found", vm.worker_id)))?
            .clone();
        if tables.vms.values().any(|v| v.id != vm.id && v.net.tap_name == vm.net.tap_name) {
            return Err(CoreError::precondition_failed(format!("tap name '{}' already in use", vm.net.tap_name)));
        }

        let mut worker = worker;
        worker.used_cpu_cores += reservation.cpu_cores;
        worker.used_mem_mib += reservation.mem_mib;
        worker.used_disk_mib += reservation.disk_mib;
        worker.vm_count += 1;
        if !worker.resources_consistent() {
            return Err(CoreError::resource_exhausted(format!("worker '{}' has no capacity for this vm", worker.id)));
        }

        tables.vms.insert(vm.id.clone(), vm.clone());
        tables.workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    async fn delete_vm_releasing_resources(&self, vm_id: &str, reservation: ResourceReservation) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().unwrap();
        let Some(vm) = tables.vms.remove(vm_id) else {
            return Err(CoreError::not_found(format!("vm '{vm_id}' not found")));
        };
        if let Some(worker) = tables.workers.get_mut(&vm.worker_id) {
            worker.used_cpu_cores = worker.used_cpu_cores.saturating_sub(reservation.cpu_cores);
            worker.used_mem_mib = worker.used_mem_mib.saturating_sub(reservation.mem_mib);
            worker.used_disk_mib = worker.used_disk_mib.saturating_sub(reservation.disk_mib);
            worker.vm_count = worker.vm_count.saturating_sub(1);
        }
        Ok(())
    }

    async fn claim_next_task(&self, worker_id: &str, now: &str) -> Result<Option<Task>, CoreError> {
        let mut tables = self.tables.lock().unwrap();
        let candidate_id = tables
            .tasks
            .values()
            .filter(|t| matches!(t.state, aeth_core::model::TaskState::Pending | aeth_core::model::TaskState::Retry))
            .filter(|t| t.available_at.as_str() <= now)
            .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.created_at.cmp(&b.created_at)))
            .map(|t| t.id.clone());

        let Some(id) = candidate_id else {
            return Ok(None);
        };
        let task = tables.tasks.get_mut(&id).unwrap();
        task.state = aeth_core::model::TaskState::Active;
        task.worker_id = Some(worker_id.to_string());
        task.updated_at = now.to_string();
        Ok(Some(task.clone()))
    }
}

#[cfg(test)]
mod tests {
    use aeth_core::model::{VmNet, VmStatus, WorkerStatus};
    use aeth_core::time::now_iso;

    use super::*;

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

    fn vm(id: &str, worker_id: &str, tap: &str) -> Vm {
        Vm {
            id: id.to_string(),
            name: "builder".to_string(),
            workspace_id: "ws-1".to_string(),
            worker_id: worker_id.to_string(),
            status: VmStatus::Created,
            vcpu_count: 2,
            mem_mib: 1024,
            kernel_path: "/vmlinux".to_string(),
            rootfs_path: "/rootfs.ext4".to_string(),
            control_socket_path: format!("/run/aetherium/{id}.sock"),
            net: VmNet { tap_name: tap.to_string(), mac: "02:aa:bb:cc:dd:ee".to_string(), ipv4: "172.16.0.5".to_string() },
            created_at: now_iso(),
            started_at: None,
            stopped_at: None,
            last_activity_at: None,
            single_task_id: None,
            idle_timeout_secs: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn create_vm_rejects_unknown_worker() {
        let store = MemoryStore::new();
        let err = store.create_vm(&vm("vm-1", "ghost", "aether-1")).await.unwrap_err();
        assert_eq!(err.kind, aeth_core::ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn create_vm_rejects_duplicate_tap_name() {
        let store = MemoryStore::new();
        store.create_worker(&worker("worker-1")).await.unwrap();
        store.create_vm(&vm("vm-1", "worker-1", "aether-dup")).await.unwrap();
        let err = store.create_vm(&vm("vm-2", "worker-1", "aether-dup")).await.unwrap_err();
        assert_eq!(err.kind, aeth_core::ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn execution_start_time_must_be_non_decreasing() {
        let store = MemoryStore::new();
        let first = Execution {
            id: "exec-1".to_string(),
            vm_id: "vm-1".to_string(),
            cmd: "echo".to_string(),
            args: vec![],
            env: HashMap::new(),
            exit_code: Some(0),
            stdout: vec![],
            stderr: vec![],
            started_at: "2026-01-01T00:00:10Z".to_string(),
            ended_at: None,
            duration_ms: None,
        };
        store.create_execution(&first).await.unwrap();

        let mut earlier = first.clone();
        earlier.id = "exec-2".to_string();
        earlier.started_at = "2026-01-01T00:00:05Z".to_string();
        let err = store.create_execution(&earlier).await.unwrap_err();
        assert_eq!(err.kind, aeth_core::ErrorKind::PreconditionFailed);

        let mut later = first;
        later.id = "exec-3".to_string();
        later.started_at = "2026-01-01T00:00:15Z".to_string();
        store.create_execution(&later).await.unwrap();
    }

    #[tokio::test]
    async fn create_vm_reserving_resources_increments_worker_counters() {
        let store = MemoryStore::new();
        store.create_worker(&worker("worker-1")).await.unwrap();
        let reservation = ResourceReservation { cpu_cores: 2, mem_mib: 1024, disk_mib: 4096 };
        store.create_vm_reserving_resources(&vm("vm-1", "worker-1", "aether-1"), reservation).await.unwrap();

        let w = store.get_worker("worker-1").await.unwrap().unwrap();
        assert_eq!(w.used_cpu_cores, 2);
        assert_eq!(w.used_mem_mib, 1024);
        assert_eq!(w.vm_count, 1);

        store.delete_vm_releasing_resources("vm-1", reservation).await.unwrap();
        let w = store.get_worker("worker-1").await.unwrap().unwrap();
        assert_eq!(w.used_cpu_cores, 0);
        assert_eq!(w.vm_count, 0);
    }

    #[tokio::test]
    async fn create_vm_reserving_resources_rejects_overcommit() {
        let store = MemoryStore::new();
        let mut w = worker("worker-1");
        w.total_cpu_cores = 1;
        store.create_worker(&w).await.unwrap();

        let reservation = ResourceReservation { cpu_cores: 2, mem_mib: 0, disk_mib: 0 };
        let err = store.create_vm_reserving_resources(&vm("vm-1", "worker-1", "aether-1"), reservation).await.unwrap_err();
        assert_eq!(err.kind, aeth_core::ErrorKind::ResourceExhausted);
        assert!(store.get_vm("vm-1").await.unwrap().is_none());
    }

    fn task(id: &str, priority: i32, available_at: &str) -> Task {
        use aeth_core::model::{TaskState, TaskType};
        Task {
            id: id.to_string(),
            task_type: TaskType::VmExecute,
            payload: serde_json::Value::Null,
            retry_count: 0,
            max_retries: 2,
            priority,
            deadline: None,
            state: TaskState::Pending,
            result: None,
            error: None,
            worker_id: None,
            available_at: available_at.to_string(),
            created_at: available_at.to_string(),
            updated_at: available_at.to_string(),
        }
    }

    #[tokio::test]
    async fn claim_next_task_picks_lowest_priority_first() {
        let store = MemoryStore::new();
        store.create_task(&task("task-low", 5, "2026-01-01T00:00:00Z")).await.unwrap();
        store.create_task(&task("task-high", 1, "2026-01-01T00:00:00Z")).await.unwrap();

        let claimed = store.claim_next_task("worker-1", "2026-01-01T00:01:00Z").await.unwrap().unwrap();
        assert_eq!(claimed.id, "task-high");
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(claimed.state, aeth_core::model::TaskState::Active);
    }

    #[tokio::test]
    async fn claim_next_task_respects_available_at() {
        let store = MemoryStore::new();
        store.create_task(&task("task-future", 1, "2099-01-01T00:00:00Z")).await.unwrap();

        let claimed = store.claim_next_task("worker-1", "2026-01-01T00:00:00Z").await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn claim_next_task_returns_none_when_empty() {
        let store = MemoryStore::new();
        assert!(store.claim_next_task("worker-1", "2026-01-01T00:00:00Z").await.unwrap().is_none());
    }
}
