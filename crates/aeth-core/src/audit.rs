use serde::{Deserialize, Serialize};

use crate::time::now_iso;

/// Audit event types spanning VM lifecycle, task dispatch, and worker
/// membership changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    VmCreated,
    VmStarted,
    VmStopped,
    VmDestroyed,
    VmFailed,
    VmIdleShutdown,
    ExecutionStarted,
    ExecutionCompleted,
    WorkspaceCreated,
    WorkspaceDeleted,
    TaskEnqueued,
    TaskDispatched,
    TaskRetried,
    TaskDeadLettered,
    TaskCompleted,
    WorkerRegistered,
    WorkerDrained,
    WorkerDeregistered,
    SecretsProvisioned,
}

/// A single append-only audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub worker_id: Option<String>,
    pub vm_id: Option<String>,
    pub task_id: Option<String>,
    pub action: AuditAction,
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(action: AuditAction) -> Self {
        Self {
            timestamp: now_iso(),
            worker_id: None,
            vm_id: None,
            task_id: None,
            action,
            detail: None,
        }
    }

    pub fn with_vm(mut self, vm_id: impl Into<String>) -> Self {
        self.vm_id = Some(vm_id.into());
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Sink for audit entries. The default implementation emits a structured
/// `tracing` event; a store-backed sink can be layered on top for durable
/// audit trails.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Emits every entry as a `tracing::info!` event under the `audit` target.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        tracing::info!(
            target: "audit",
            action = ?entry.action,
            worker_id = entry.worker_id.as_deref(),
            vm_id = entry.vm_id.as_deref(),
            task_id = entry.task_id.as_deref(),
            detail = entry.detail.as_deref(),
            "{:?}",
            entry.action,
        );
    }
}
