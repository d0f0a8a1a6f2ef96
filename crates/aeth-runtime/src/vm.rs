use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aeth_channel::client::{ChannelClient, StreamChunk};
use aeth_channel::protocol::ExecResultPayload;
use aeth_core::audit::{AuditAction, AuditEntry, AuditSink, TracingAuditSink};
use aeth_core::config::{GRACEFUL_SHUTDOWN_TIMEOUT, GUEST_AGENT_PORT};
use aeth_core::model::{validate_transition, Execution, Secret, Vm, VmNet, VmStatus};
use aeth_core::naming::{generate_execution_id, generate_vm_id, guest_cid, vm_id_for_task};
use aeth_core::time::now_iso;
use aeth_core::CoreError;
use aeth_net::Fabric;
use aeth_store::{
    ExecutionRepository, ResourceReservation, SecretFilter, SecretRepository, Store, VmRepository,
};
use tokio::process::Child;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{info, warn};

use crate::hypervisor::HypervisorClient;
use crate::secrets_handoff::SecretsHandoff;

/// A live VM's process handle and control-socket client, held behind the
/// read-write map lock described in §5.
struct VmHandle {
    process: Child,
    control: HypervisorClient,
}

/// Arguments accepted by [`Orchestrator::create_vm`] (§4.3 `CreateVM`).
pub struct CreateVmArgs {
    pub name: String,
    pub workspace_id: String,
    pub worker_id: String,
    pub vcpu_count: u32,
    pub mem_mib: u64,
    pub kernel_path: String,
    pub rootfs_path: String,
    pub single_task_id: Option<String>,
    pub idle_timeout_secs: Option<u64>,
    /// The id of the `vm:create` task that requested this VM, if any. When
    /// set, the VM's id is derived from it instead of generated at random,
    /// so a redelivered task converges on the same record.
    pub idempotency_key: Option<String>,
}

/// The VM lifecycle orchestrator (C3, §4.3): the single place that drives a
/// VM through `created -> starting -> running -> stopping -> stopped`,
/// talking to the hypervisor control socket, the network fabric, the
/// command channel, and the store.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    fabric: Arc<Fabric>,
    secrets: Arc<SecretsHandoff>,
    hypervisor_bin: String,
    run_dir: PathBuf,
    handles: RwLock<HashMap<String, AsyncMutex<VmHandle>>>,
    audit: Arc<dyn AuditSink>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, fabric: Arc<Fabric>, secrets: Arc<SecretsHandoff>, hypervisor_bin: impl Into<String>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            fabric,
            secrets,
            hypervisor_bin: hypervisor_bin.into(),
            run_dir: run_dir.into(),
            handles: RwLock::new(HashMap::new()),
            audit: Arc::new(TracingAuditSink),
        }
    }

    fn control_socket_path(&self, vm_id: &str) -> PathBuf {
        self.run_dir.join(format!("{vm_id}.sock"))
    }

    /// `CreateVM` (§4.3): allocates network identity and reserves the
    /// owning worker's resources in the same transaction as the VM row.
    pub async fn create_vm(&self, args: CreateVmArgs) -> Result<Vm, CoreError> {
        if args.vcpu_count == 0 || args.mem_mib == 0 {
            return Err(CoreError::invalid_arg("vcpu_count and mem_mib must be non-zero"));
        }

        let vm_id = match &args.idempotency_key {
            Some(key) => vm_id_for_task(key),
            None => generate_vm_id(),
        };

        if args.idempotency_key.is_some() {
            if let Some(existing) = self.store.get_vm(&vm_id).await? {
                info!(vm_id = %existing.id, "vm:create replay observed, returning the existing record");
                return Ok(existing);
            }
        }

        let net_assignment = self.fabric.allocate(&vm_id)?;

        let vm = Vm {
            id: vm_id.clone(),
            name: args.name,
            workspace_id: args.workspace_id,
            worker_id: args.worker_id,
            status: VmStatus::Created,
            vcpu_count: args.vcpu_count,
            mem_mib: args.mem_mib,
            kernel_path: args.kernel_path,
            rootfs_path: args.rootfs_path,
            control_socket_path: self.control_socket_path(&vm_id).display().to_string(),
            net: VmNet { tap_name: net_assignment.tap_name, mac: net_assignment.mac, ipv4: net_assignment.ipv4.clone() },
            created_at: now_iso(),
            started_at: None,
            stopped_at: None,
            last_activity_at: None,
            single_task_id: args.single_task_id,
            idle_timeout_secs: args.idle_timeout_secs,
            metadata: HashMap::new(),
        };

        let reservation = ResourceReservation { cpu_cores: vm.vcpu_count, mem_mib: vm.mem_mib, disk_mib: 0 };
        if let Err(e) = self.store.create_vm_reserving_resources(&vm, reservation).await {
            self.fabric.release(&vm_id, &net_assignment.ipv4);
            return Err(e);
        }

        info!(vm_id = %vm.id, "created VM record");
        self.audit.record(AuditEntry::new(AuditAction::VmCreated).with_vm(&vm.id).with_worker(&vm.worker_id));
        Ok(vm)
    }

    async fn load_vm(&self, vm_id: &str) -> Result<Vm, CoreError> {
        self.store.get_vm(vm_id).await?.ok_or_else(|| CoreError::not_found(format!("vm '{vm_id}' not found")))
    }

    async fn transition(&self, mut vm: Vm, to: VmStatus) -> Result<Vm, CoreError> {
        validate_transition(vm.status, to)?;
        vm.status = to;
        self.store.update_vm(&vm).await?;
        Ok(vm)
    }

    /// `StartVM` (§4.3): runs the full boot sequence. A no-op success if
    /// the VM is already running.
    pub async fn start_vm(&self, vm_id: &str) -> Result<Vm, CoreError> {
        let vm = self.load_vm(vm_id).await?;
        if vm.status == VmStatus::Running {
            return Ok(vm);
        }

        let mut vm = self.transition(vm, VmStatus::Starting).await?;

        match self.boot(&vm).await {
            Ok(()) => {
                vm.started_at = Some(now_iso());
                let vm = self.transition(vm, VmStatus::Running).await?;
                self.audit.record(AuditEntry::new(AuditAction::VmStarted).with_vm(&vm.id));
                Ok(vm)
            }
            Err(e) => {
                warn!(vm_id, error = %e, "boot sequence failed");
                let _ = self.transition(vm, VmStatus::Failed).await;
                // The failed VM's row is left in place (§7 "preserved for
                // post-mortem"), the only record of why it's there.
                self.audit.record(AuditEntry::new(AuditAction::VmFailed).with_vm(vm_id).with_detail(e.message.clone()));
                Err(e)
            }
        }
    }

    async fn boot(&self, vm: &Vm) -> Result<(), CoreError> {
        let socket_path = self.control_socket_path(&vm.id);
        let _ = tokio::fs::remove_file(&socket_path).await;

        let process = tokio::process::Command::new(&self.hypervisor_bin)
            .arg("--api-sock")
            .arg(&socket_path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::with_source(aeth_core::ErrorKind::Unavailable, "failed to spawn hypervisor process", e.into()))?;

        let control = HypervisorClient::new(&socket_path);
        control.wait_for_socket().await?;

        control.machine_config(vm.vcpu_count, vm.mem_mib).await?;
        control
            .boot_source(std::path::Path::new(&vm.kernel_path), &vm.net.ipv4, &self.fabric_gateway(), &self.fabric_gateway())
            .await?;
        control.drive("rootfs", std::path::Path::new(&vm.rootfs_path), false).await?;
        control.network_interface("eth0", &vm.net.tap_name, &vm.net.mac).await?;

        let cid = guest_cid(&vm.id);
        let vsock_uds = self.run_dir.join(format!("{}.vsock", vm.id));
        control.vsock("vsock0", cid, &vsock_uds).await?;

        let secrets = self.load_workspace_secrets(&vm.workspace_id).await?;
        let handoff_rx = self.secrets.stage(cid, secrets);

        control.start_instance().await?;
        self.secrets.wait_for_collection(cid, handoff_rx).await?;
        self.audit.record(AuditEntry::new(AuditAction::SecretsProvisioned).with_vm(&vm.id));

        self.handles.write().await.insert(vm.id.clone(), AsyncMutex::new(VmHandle { process, control }));
        Ok(())
    }

    fn fabric_gateway(&self) -> String {
        // Derived once per VM; the gateway is worker-global so this is a
        // thin accessor kept here to avoid threading it through every call.
        self.fabric.gateway().to_string()
    }

    /// Secrets are decrypted only in memory for the duration of the boot
    /// handoff (§4.2, §4.3). Secret-at-rest encryption itself is outside
    /// this engine's scope, so ciphertext is already the plaintext payload
    /// an external key-management step produced.
    async fn load_workspace_secrets(&self, workspace_id: &str) -> Result<HashMap<String, String>, CoreError> {
        let filter = SecretFilter { workspace_id: Some(workspace_id.to_string()) };
        let secrets: Vec<Secret> = self.store.list_secrets(&filter).await?;
        Ok(secrets
            .into_iter()
            .map(|s| (s.name, String::from_utf8_lossy(&s.ciphertext).into_owned()))
            .collect())
    }

    /// `StopVM(id, force)` (§4.3): a no-op success if already stopped.
    pub async fn stop_vm(&self, vm_id: &str, force: bool) -> Result<Vm, CoreError> {
        let vm = self.load_vm(vm_id).await?;
        if vm.status == VmStatus::Stopped {
            return Ok(vm);
        }

        let mut vm = self.transition(vm, VmStatus::Stopping).await?;
        self.shutdown_process(&vm.id, force).await;
        self.fabric.release(&vm.id, &vm.net.ipv4);
        let _ = tokio::fs::remove_file(self.control_socket_path(&vm.id)).await;

        vm.stopped_at = Some(now_iso());
        let vm = self.transition(vm, VmStatus::Stopped).await?;
        self.audit.record(AuditEntry::new(AuditAction::VmStopped).with_vm(&vm.id));
        Ok(vm)
    }

    async fn shutdown_process(&self, vm_id: &str, force: bool) {
        let handle = self.handles.write().await.remove(vm_id);
        let Some(handle) = handle else { return };
        let mut handle = handle.into_inner();

        if force {
            let _ = handle.process.kill().await;
            return;
        }

        if handle.control.send_ctrl_alt_del().await.is_err() {
            let _ = handle.process.kill().await;
            return;
        }

        let waited = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, handle.process.wait()).await;
        if waited.is_err() {
            warn!(vm_id, "graceful shutdown timed out, sending SIGKILL");
            let _ = handle.process.kill().await;
        }
    }

    /// `DeleteVM` (§4.3): stops the VM if still running, then removes the
    /// record and releases its resource reservation.
    pub async fn delete_vm(&self, vm_id: &str) -> Result<(), CoreError> {
        let vm = self.load_vm(vm_id).await?;
        if !matches!(vm.status, VmStatus::Stopped | VmStatus::Failed) {
            self.stop_vm(vm_id, true).await?;
        } else {
            self.fabric.release(vm_id, &vm.net.ipv4);
        }

        let reservation = ResourceReservation { cpu_cores: vm.vcpu_count, mem_mib: vm.mem_mib, disk_mib: 0 };
        self.store.delete_vm_releasing_resources(vm_id, reservation).await?;
        self.audit.record(AuditEntry::new(AuditAction::VmDestroyed).with_vm(vm_id));
        Ok(())
    }

    /// `ExecuteCommand` (§4.3). `task_id` identifies the task driving this
    /// command; when it matches the VM's own `single_task_id`, this is that
    /// VM's final command and it is stopped once the result is recorded
    /// (§4.3 "a VM created for a single task terminates after that task's
    /// final command").
    pub async fn execute_command(
        &self,
        vm_id: &str,
        cmd: &str,
        args: &[String],
        env: HashMap<String, String>,
        timeout_ms: Option<u64>,
        task_id: Option<&str>,
    ) -> Result<ExecResultPayload, CoreError> {
        let vm = self.load_vm(vm_id).await?;
        if vm.status != VmStatus::Running {
            return Err(CoreError::precondition_failed(format!("vm '{vm_id}' is not running")));
        }

        let cid = guest_cid(&vm.id);
        let mut client = ChannelClient::connect(cid, GUEST_AGENT_PORT, &vm.net.ipv4).await?;
        let started_at = now_iso();
        let result = client.execute(cmd, args, env.clone(), timeout_ms).await;

        self.record_execution(&vm, cmd, args, env, started_at, &result).await;
        self.touch_activity(vm_id).await;

        if vm.is_final_command_for(task_id) {
            if let Err(e) = self.stop_vm(vm_id, false).await {
                warn!(vm_id, error = %e, "failed to stop single-task VM after its final command");
            }
        }

        result
    }

    /// `ExecuteCommandStream` (§4.3): `on_chunk` is invoked for every
    /// `stdout`/`stderr` fragment and exactly one terminal exit chunk.
    pub async fn execute_command_stream(
        &self,
        vm_id: &str,
        cmd: &str,
        args: &[String],
        env: HashMap<String, String>,
        on_chunk: impl FnMut(StreamChunk),
    ) -> Result<i32, CoreError> {
        let vm = self.load_vm(vm_id).await?;
        if vm.status != VmStatus::Running {
            return Err(CoreError::precondition_failed(format!("vm '{vm_id}' is not running")));
        }

        let cid = guest_cid(&vm.id);
        let mut client = ChannelClient::connect(cid, GUEST_AGENT_PORT, &vm.net.ipv4).await?;
        let exit_code = client.execute_stream(cmd, args, env, on_chunk).await;
        self.touch_activity(vm_id).await;
        exit_code
    }

    async fn record_execution(
        &self,
        vm: &Vm,
        cmd: &str,
        args: &[String],
        env: HashMap<String, String>,
        started_at: String,
        result: &Result<ExecResultPayload, CoreError>,
    ) {
        let ended_at = now_iso();
        let execution = Execution {
            id: generate_execution_id(),
            vm_id: vm.id.clone(),
            cmd: cmd.to_string(),
            args: args.to_vec(),
            env,
            exit_code: result.as_ref().ok().map(|r| r.exit_code),
            stdout: result.as_ref().map(|r| r.stdout.clone().into_bytes()).unwrap_or_default(),
            stderr: result.as_ref().map(|r| r.stderr.clone().into_bytes()).unwrap_or_default(),
            started_at,
            ended_at: Some(ended_at),
            duration_ms: None,
        };
        if let Err(e) = self.store.create_execution(&execution).await {
            warn!(vm_id = %vm.id, error = %e, "failed to record execution");
        }
        self.audit.record(AuditEntry::new(AuditAction::ExecutionCompleted).with_vm(&vm.id).with_detail(cmd.to_string()));
    }

    async fn touch_activity(&self, vm_id: &str) {
        if let Ok(Some(mut vm)) = self.store.get_vm(vm_id).await {
            vm.last_activity_at = Some(now_iso());
            let _ = self.store.update_vm(&vm).await;
        }
    }

    /// `ProvideSecretsOnBoot` (§4.3): used directly by callers that already
    /// know the guest CID (tests, or a caller reconnecting mid-boot); the
    /// normal boot path calls `load_workspace_secrets`/`secrets.provide`
    /// itself.
    pub async fn provide_secrets(&self, vm_id: &str, secrets: HashMap<String, String>) -> Result<(), CoreError> {
        self.secrets.provide(guest_cid(vm_id), secrets).await
    }
}

/// Idle/completion watcher (§4.3, distinct from the guest-side one in
/// `aeth_guest::idle`): scans every VM assigned to this worker and asks any
/// VM idle beyond its configured timeout to power off, or whose single
/// task has finished its final command.
pub async fn run_idle_watcher(orchestrator: Arc<Orchestrator>, store: Arc<dyn Store>, worker_id: String, default_idle_timeout: Duration, tick: Duration) {
    let mut ticker = tokio::time::interval(tick);
    loop {
        ticker.tick().await;
        let filter = aeth_store::VmFilter { worker_id: Some(worker_id.clone()), workspace_id: None, status: Some(VmStatus::Running) };
        let vms = match store.list_vms(&filter).await {
            Ok(vms) => vms,
            Err(e) => {
                warn!(error = %e, "idle watcher failed to list VMs");
                continue;
            }
        };

        for vm in vms {
            let timeout = vm.idle_timeout_secs.map(Duration::from_secs).unwrap_or(default_idle_timeout);
            let idle_for = vm
                .last_activity_at
                .as_deref()
                .and_then(aeth_core::time::elapsed_secs_since)
                .map(|secs| Duration::from_secs(secs.max(0) as u64));

            if idle_for.map(|d| d >= timeout).unwrap_or(false) {
                info!(vm_id = %vm.id, "idle timeout exceeded, stopping VM");
                match orchestrator.stop_vm(&vm.id, false).await {
                    Ok(_) => orchestrator.audit.record(AuditEntry::new(AuditAction::VmIdleShutdown).with_vm(&vm.id)),
                    Err(e) => warn!(vm_id = %vm.id, error = %e, "failed to stop idle VM"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aeth_core::model::{Worker, WorkerStatus};
    use aeth_store::{MemoryStore, WorkerRepository};

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

    fn orchestrator() -> (Orchestrator, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let fabric = Arc::new(Fabric::new("aetherium-test0", "172.30.0"));
        let secrets = Arc::new(SecretsHandoff::new());
        let orch = Orchestrator::new(store.clone(), fabric, secrets, "firecracker", std::env::temp_dir());
        (orch, store)
    }

    #[tokio::test]
    async fn create_vm_rejects_zero_resources() {
        let (orch, store) = orchestrator();
        store.create_worker(&worker("worker-1")).await.unwrap();

        let args = CreateVmArgs {
            name: "builder".to_string(),
            workspace_id: "ws-1".to_string(),
            worker_id: "worker-1".to_string(),
            vcpu_count: 0,
            mem_mib: 1024,
            kernel_path: "/vmlinux".to_string(),
            rootfs_path: "/rootfs.ext4".to_string(),
            single_task_id: None,
            idle_timeout_secs: None,
            idempotency_key: None,
        };
        let err = orch.create_vm(args).await.unwrap_err();
        assert_eq!(err.kind, aeth_core::ErrorKind::InvalidArg);
    }

    #[tokio::test]
    async fn create_vm_reserves_worker_resources() {
        let (orch, store) = orchestrator();
        store.create_worker(&worker("worker-1")).await.unwrap();

        let args = CreateVmArgs {
            name: "builder".to_string(),
            workspace_id: "ws-1".to_string(),
            worker_id: "worker-1".to_string(),
            vcpu_count: 2,
            mem_mib: 1024,
            kernel_path: "/vmlinux".to_string(),
            rootfs_path: "/rootfs.ext4".to_string(),
            single_task_id: None,
            idle_timeout_secs: None,
            idempotency_key: None,
        };
        let vm = orch.create_vm(args).await.unwrap();
        assert_eq!(vm.status, VmStatus::Created);

        let w = store.get_worker("worker-1").await.unwrap().unwrap();
        assert_eq!(w.used_cpu_cores, 2);
    }

    #[tokio::test]
    async fn execute_command_rejects_when_not_running() {
        let (orch, store) = orchestrator();
        store.create_worker(&worker("worker-1")).await.unwrap();
        let args = CreateVmArgs {
            name: "builder".to_string(),
            workspace_id: "ws-1".to_string(),
            worker_id: "worker-1".to_string(),
            vcpu_count: 1,
            mem_mib: 512,
            kernel_path: "/vmlinux".to_string(),
            rootfs_path: "/rootfs.ext4".to_string(),
            single_task_id: None,
            idle_timeout_secs: None,
            idempotency_key: None,
        };
        let vm = orch.create_vm(args).await.unwrap();

        let err = orch.execute_command(&vm.id, "echo", &["hi".to_string()], HashMap::new(), None, None).await.unwrap_err();
        assert_eq!(err.kind, aeth_core::ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn stop_vm_on_already_stopped_vm_is_a_noop() {
        let (orch, store) = orchestrator();
        store.create_worker(&worker("worker-1")).await.unwrap();
        let args = CreateVmArgs {
            name: "builder".to_string(),
            workspace_id: "ws-1".to_string(),
            worker_id: "worker-1".to_string(),
            vcpu_count: 1,
            mem_mib: 512,
            kernel_path: "/vmlinux".to_string(),
            rootfs_path: "/rootfs.ext4".to_string(),
            single_task_id: None,
            idle_timeout_secs: None,
            idempotency_key: None,
        };
        let vm = orch.create_vm(args).await.unwrap();
        let mut stored = store.get_vm(&vm.id).await.unwrap().unwrap();
        stored.status = VmStatus::Stopped;
        store.update_vm(&stored).await.unwrap();

        let result = orch.stop_vm(&vm.id, false).await.unwrap();
        assert_eq!(result.status, VmStatus::Stopped);
    }

    #[tokio::test]
    async fn create_vm_with_same_idempotency_key_yields_one_record() {
        let (orch, store) = orchestrator();
        store.create_worker(&worker("worker-1")).await.unwrap();

        let args = || CreateVmArgs {
            name: "builder".to_string(),
            workspace_id: "ws-1".to_string(),
            worker_id: "worker-1".to_string(),
            vcpu_count: 1,
            mem_mib: 512,
            kernel_path: "/vmlinux".to_string(),
            rootfs_path: "/rootfs.ext4".to_string(),
            single_task_id: None,
            idle_timeout_secs: None,
            idempotency_key: Some("task-replayed".to_string()),
        };

        let first = orch.create_vm(args()).await.unwrap();
        let second = orch.create_vm(args()).await.unwrap();
        assert_eq!(first.id, second.id);

        let w = store.get_worker("worker-1").await.unwrap().unwrap();
        assert_eq!(w.vm_count, 1, "the replayed create must not double-reserve resources");
    }
}
