use std::collections::HashMap;
use std::sync::Arc;

use aeth_core::audit::{AuditAction, AuditEntry, AuditSink, TracingAuditSink};
use aeth_core::model::{Task, TaskType, Worker, WorkerStatus, Workspace};
use aeth_core::naming::generate_workspace_id;
use aeth_core::time::now_iso;
use aeth_core::CoreError;
use aeth_runtime::{CreateVmArgs, Orchestrator};
use aeth_store::{Store, WorkspaceRepository};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct VmCreatePayload {
    name: String,
    workspace_id: String,
    vcpu_count: u32,
    mem_mib: u64,
    kernel_path: String,
    rootfs_path: String,
    #[serde(default)]
    single_task_id: Option<String>,
    #[serde(default)]
    idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct VmExecutePayload {
    vm_id: String,
    cmd: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct VmDeletePayload {
    vm_id: String,
}

#[derive(Debug, Deserialize)]
struct WorkspaceCreatePayload {
    name: String,
    owner_label: String,
}

#[derive(Debug, Deserialize)]
struct WorkspaceDeletePayload {
    workspace_id: String,
}

fn parse<T: for<'de> Deserialize<'de>>(task: &Task, payload: &Value) -> Result<T, CoreError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| CoreError::invalid_arg(format!("task '{}' has a malformed payload: {e}", task.id)))
}

/// Run a claimed task to completion against the worker's orchestrator and
/// store, refusing state-creating task types while the worker is draining
/// (§4.6, §8 scenario 5).
///
/// `prompt:execute` carries no distinct contract in the operations table
/// beyond sharing `vm:execute`'s retry defaults, so it is dispatched
/// identically to `vm:execute`.
pub async fn dispatch(task: &Task, orchestrator: &Orchestrator, store: &Arc<dyn Store>, worker: &Worker) -> Result<Value, CoreError> {
    let creates_new_state = matches!(task.task_type, TaskType::VmCreate | TaskType::WorkspaceCreate);
    if worker.status == WorkerStatus::Draining && creates_new_state {
        return Err(CoreError::precondition_failed(format!(
            "worker '{}' is draining and refuses {:?}",
            worker.id, task.task_type
        )));
    }

    match task.task_type {
        TaskType::VmCreate => {
            let p: VmCreatePayload = parse(task, &task.payload)?;
            let vm = orchestrator
                .create_vm(CreateVmArgs {
                    name: p.name,
                    workspace_id: p.workspace_id,
                    worker_id: worker.id.clone(),
                    vcpu_count: p.vcpu_count,
                    mem_mib: p.mem_mib,
                    kernel_path: p.kernel_path,
                    rootfs_path: p.rootfs_path,
                    single_task_id: p.single_task_id,
                    idle_timeout_secs: p.idle_timeout_secs,
                    idempotency_key: Some(task.id.clone()),
                })
                .await?;
            let vm = orchestrator.start_vm(&vm.id).await?;
            serde_json::to_value(&vm).map_err(|e| CoreError::internal(e.to_string()))
        }
        TaskType::VmExecute | TaskType::PromptExecute => {
            let p: VmExecutePayload = parse(task, &task.payload)?;
            let result = orchestrator.execute_command(&p.vm_id, &p.cmd, &p.args, p.env, p.timeout_ms, Some(&task.id)).await?;
            serde_json::to_value(&result).map_err(|e| CoreError::internal(e.to_string()))
        }
        TaskType::VmDelete => {
            let p: VmDeletePayload = parse(task, &task.payload)?;
            orchestrator.delete_vm(&p.vm_id).await?;
            Ok(Value::Null)
        }
        TaskType::WorkspaceCreate => {
            let p: WorkspaceCreatePayload = parse(task, &task.payload)?;
            let workspace = Workspace { id: generate_workspace_id(), name: p.name, owner_label: p.owner_label, created_at: now_iso() };
            store.create_workspace(&workspace).await?;
            TracingAuditSink.record(AuditEntry::new(AuditAction::WorkspaceCreated).with_detail(workspace.id.clone()));
            serde_json::to_value(&workspace).map_err(|e| CoreError::internal(e.to_string()))
        }
        TaskType::WorkspaceDelete => {
            let p: WorkspaceDeletePayload = parse(task, &task.payload)?;
            store.delete_workspace(&p.workspace_id).await?;
            TracingAuditSink.record(AuditEntry::new(AuditAction::WorkspaceDeleted).with_detail(p.workspace_id));
            Ok(Value::Null)
        }
    }
}
