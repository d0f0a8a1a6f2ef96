use aeth_core::CoreError;
use aeth_core::model::{Execution, Secret, Task, Vm, Worker, WorkerMetrics, Workspace};
use async_trait::async_trait;

use crate::filters::{ExecutionFilter, SecretFilter, TaskFilter, VmFilter, WorkerFilter, WorkerMetricsFilter, WorkspaceFilter};

/// How much of a worker's resource budget a VM consumes, reserved atomically
/// alongside the VM row it backs (§4.8: "vm:create writes the VM and
/// increments the worker's used-resources counters").
#[derive(Debug, Clone, Copy)]
pub struct ResourceReservation {
    pub cpu_cores: u32,
    pub mem_mib: u64,
    pub disk_mib: u64,
}

#[async_trait]
pub trait VmRepository {
    async fn create_vm(&self, vm: &Vm) -> Result<(), CoreError>;
    async fn update_vm(&self, vm: &Vm) -> Result<(), CoreError>;
    async fn get_vm(&self, id: &str) -> Result<Option<Vm>, CoreError>;
    async fn list_vms(&self, filter: &VmFilter) -> Result<Vec<Vm>, CoreError>;
    async fn delete_vm(&self, id: &str) -> Result<(), CoreError>;
}

#[async_trait]
pub trait ExecutionRepository {
    async fn create_execution(&self, execution: &Execution) -> Result<(), CoreError>;
    async fn update_execution(&self, execution: &Execution) -> Result<(), CoreError>;
    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, CoreError>;
    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, CoreError>;
}

#[async_trait]
pub trait WorkerRepository {
    async fn create_worker(&self, worker: &Worker) -> Result<(), CoreError>;
    async fn update_worker(&self, worker: &Worker) -> Result<(), CoreError>;
    async fn get_worker(&self, id: &str) -> Result<Option<Worker>, CoreError>;
    async fn list_workers(&self, filter: &WorkerFilter) -> Result<Vec<Worker>, CoreError>;
    async fn delete_worker(&self, id: &str) -> Result<(), CoreError>;
}

#[async_trait]
pub trait WorkerMetricsRepository {
    async fn create_worker_metrics(&self, sample: &WorkerMetrics) -> Result<(), CoreError>;
    async fn list_worker_metrics(&self, filter: &WorkerMetricsFilter) -> Result<Vec<WorkerMetrics>, CoreError>;
}

#[async_trait]
pub trait WorkspaceRepository {
    async fn create_workspace(&self, workspace: &Workspace) -> Result<(), CoreError>;
    async fn update_workspace(&self, workspace: &Workspace) -> Result<(), CoreError>;
    async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>, CoreError>;
    async fn list_workspaces(&self, filter: &WorkspaceFilter) -> Result<Vec<Workspace>, CoreError>;
    async fn delete_workspace(&self, id: &str) -> Result<(), CoreError>;
}

#[async_trait]
pub trait SecretRepository {
    async fn create_secret(&self, secret: &Secret) -> Result<(), CoreError>;
    async fn get_secret(&self, id: &str) -> Result<Option<Secret>, CoreError>;
    async fn list_secrets(&self, filter: &SecretFilter) -> Result<Vec<Secret>, CoreError>;
    async fn delete_secret(&self, id: &str) -> Result<(), CoreError>;
}

#[async_trait]
pub trait TaskRepository {
    async fn create_task(&self, task: &Task) -> Result<(), CoreError>;
    async fn update_task(&self, task: &Task) -> Result<(), CoreError>;
    async fn get_task(&self, id: &str) -> Result<Option<Task>, CoreError>;
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, CoreError>;
}

/// The full persistent-store interface (C8, §4.8): one repository per
/// aggregate plus the transactional operations that span more than one.
#[async_trait]
pub trait Store:
    VmRepository
    + ExecutionRepository
    + WorkerRepository
    + WorkerMetricsRepository
    + WorkspaceRepository
    + SecretRepository
    + TaskRepository
    + Send
    + Sync
{
    /// Writes the VM row and reserves the owning worker's resources in one
    /// transaction, so a crash between the two never leaves counters
    /// inconsistent with the VMs that actually exist.
    async fn create_vm_reserving_resources(&self, vm: &Vm, reservation: ResourceReservation) -> Result<(), CoreError>;

    /// Removes the VM row and releases the reservation it held, in one
    /// transaction (the counterpart write to `create_vm_reserving_resources`).
    async fn delete_vm_releasing_resources(&self, vm_id: &str, reservation: ResourceReservation) -> Result<(), CoreError>;

    /// Atomically claims the highest-priority task that is `pending` or
    /// `retry` and whose `available_at` has passed, assigning it to
    /// `worker_id` and transitioning it to `active`. Two callers racing on
    /// this never observe the same task (§4.5 at-least-once delivery relies
    /// on a single claimant per attempt).
    async fn claim_next_task(&self, worker_id: &str, now: &str) -> Result<Option<Task>, CoreError>;
}
