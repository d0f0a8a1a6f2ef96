use aeth_core::model::{TaskState, TaskType, VmStatus, WorkerStatus};

/// Filters accepted by `VmRepository::list`. `None` fields are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct VmFilter {
    pub worker_id: Option<String>,
    pub workspace_id: Option<String>,
    pub status: Option<VmStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub vm_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    pub status: Option<WorkerStatus>,
    pub zone: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerMetricsFilter {
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceFilter {
    pub owner_label: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SecretFilter {
    pub workspace_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub task_type: Option<TaskType>,
    pub worker_id: Option<String>,
}
