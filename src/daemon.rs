//! Process wiring for the two roles the facade binary can start as (§10).
//!
//! There is no separate host<->worker RPC transport crate in this
//! workspace, so `hostd` and `workerd` construct the identical engine —
//! store, fabric, orchestrator, registry, queue, worker loop — and differ
//! only in which node class they're expected to run on (the one holding
//! `CAP_NET_ADMIN` and `/dev/kvm`, vs. a pure dispatch node behind it).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use aeth_core::config::EngineConfig;
use aeth_core::model::{Worker, WorkerStatus};
use aeth_core::naming::generate_worker_id;
use aeth_core::time::now_iso;
use aeth_core::CoreError;
use aeth_net::Fabric;
use aeth_queue::TaskQueue;
use aeth_registry::{EtcdRegistry, MemoryRegistry, ServiceRegistry};
use aeth_runtime::{Orchestrator, SecretsHandoff};
use aeth_store::{MemoryStore, SqliteStore, Store};
use aeth_worker::WorkerRunner;
use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Hostd,
    Workerd,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::Hostd => "hostd",
            Role::Workerd => "workerd",
        })
    }
}

/// Options the CLI layer collects from flags/env before calling [`run`].
pub struct RunArgs {
    pub worker_id: Option<String>,
    pub hypervisor_bin: String,
    pub run_dir: PathBuf,
}

/// Confirm the prerequisites §6 requires before a worker process is allowed
/// to start, naming exactly which one is missing rather than failing later
/// mid-boot.
fn preflight() -> Result<(), CoreError> {
    for (path, hint) in [
        ("/dev/kvm", "KVM is required; check the host exposes /dev/kvm to this process"),
        ("/dev/vhost-vsock", "vhost-vsock is required for the guest command channel"),
    ] {
        if !Path::new(path).exists() {
            return Err(CoreError::permission_denied(format!("{path} is not present: {hint}")));
        }
    }
    Ok(())
}

pub async fn run(role: Role, cfg: EngineConfig, args: RunArgs) -> Result<()> {
    preflight().context("environment prerequisites not met")?;

    let store: Arc<dyn Store> = if cfg.store.database_url.contains(":memory:") {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(SqliteStore::new(&cfg.store.database_url).await.context("connecting to store")?)
    };

    let fabric = Arc::new(Fabric::new(cfg.network.bridge_name.clone(), subnet_prefix(&cfg.network.bridge_subnet)));
    fabric.ensure_bridge().context("setting up network fabric")?;

    let secrets = Arc::new(SecretsHandoff::new());
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), fabric, secrets, args.hypervisor_bin, args.run_dir));

    let registry: Arc<dyn ServiceRegistry> = if cfg.registry.endpoints.is_empty() {
        Arc::new(MemoryRegistry::new())
    } else {
        match EtcdRegistry::connect(&cfg.registry.endpoints, cfg.registry.key_prefix.clone()).await {
            Ok(r) => Arc::new(r),
            Err(e) => {
                warn!(error = %e, "could not reach etcd, falling back to the in-memory registry");
                Arc::new(MemoryRegistry::new())
            }
        }
    };

    let queue = TaskQueue::new(store.clone());
    let worker_id = args.worker_id.unwrap_or_else(generate_worker_id);
    let grace_period = Duration::from_secs(cfg.worker.grace_period_secs);
    let runner = WorkerRunner::new(store, queue, registry, orchestrator, worker_id.clone(), grace_period);
    let initial = initial_worker(&worker_id, &cfg);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    info!(%role, worker_id = %worker_id, zone = %cfg.worker.zone, "aetheriumd starting");

    let run_handle = tokio::spawn(async move { runner.run(initial, shutdown_rx).await });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!(%role, "shutdown signal received, draining in-flight work");
    let _ = shutdown_tx.send(true);

    run_handle.await.context("worker loop panicked")?.context("worker loop exited with an error")?;
    info!(%role, "shutdown complete");
    Ok(())
}

fn initial_worker(worker_id: &str, cfg: &EngineConfig) -> Worker {
    Worker {
        id: worker_id.to_string(),
        hostname: cfg.worker.hostname.clone(),
        address: format!("{}:7000", cfg.worker.hostname),
        zone: cfg.worker.zone.clone(),
        labels: Default::default(),
        capabilities: Vec::new(),
        status: WorkerStatus::Active,
        total_cpu_cores: cfg.worker.total_vcpus,
        used_cpu_cores: 0,
        total_mem_mib: cfg.worker.total_mem_mib,
        used_mem_mib: 0,
        total_disk_mib: cfg.worker.total_disk_mib,
        used_disk_mib: 0,
        vm_count: 0,
        max_vms: cfg.worker.max_vms,
        started_at: now_iso(),
        last_heartbeat_at: now_iso(),
    }
}

/// `aeth_net::IpAllocator` wants the bare `a.b.c` prefix; config stores the
/// full `a.b.c.0/24` CIDR an operator would actually write.
fn subnet_prefix(cidr: &str) -> String {
    cidr.split('/')
        .next()
        .and_then(|net| net.rsplit_once('.'))
        .map(|(prefix, _)| prefix.to_string())
        .unwrap_or_else(|| cidr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_prefix_strips_host_octet_and_mask() {
        assert_eq!(subnet_prefix("172.16.0.0/24"), "172.16.0");
        assert_eq!(subnet_prefix("10.0.0.0/24"), "10.0.0");
    }
}
