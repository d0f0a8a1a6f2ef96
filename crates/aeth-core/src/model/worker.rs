use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::WORKER_OFFLINE_AFTER;
use crate::time::elapsed_secs_since;

/// Worker liveness state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Draining,
    Offline,
}

impl TryFrom<String> for WorkerStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        serde_json::from_value(serde_json::Value::String(value)).map_err(|e| e.to_string())
    }
}

/// A registered worker's published registry record (§3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub hostname: String,
    pub address: String,
    pub zone: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: WorkerStatus,
    pub total_cpu_cores: u32,
    pub used_cpu_cores: u32,
    pub total_mem_mib: u64,
    pub used_mem_mib: u64,
    pub total_disk_mib: u64,
    pub used_disk_mib: u64,
    pub vm_count: u32,
    pub max_vms: u32,
    pub started_at: String,
    pub last_heartbeat_at: String,
}

impl Worker {
    /// Whether this worker's resource accounting is internally consistent
    /// (used must never exceed total for any dimension — §3 invariant).
    pub fn resources_consistent(&self) -> bool {
        self.used_cpu_cores <= self.total_cpu_cores
            && self.used_mem_mib <= self.total_mem_mib
            && self.used_disk_mib <= self.total_disk_mib
            && self.vm_count <= self.max_vms
    }

    /// A worker is offline once its last heartbeat is older than 60s (§3).
    pub fn is_stale(&self) -> bool {
        match elapsed_secs_since(&self.last_heartbeat_at) {
            Some(secs) => secs as u64 >= WORKER_OFFLINE_AFTER.as_secs(),
            None => true,
        }
    }

    /// A draining worker must refuse `vm:create`/`workspace:create` but keep
    /// servicing existing VMs (§3, §4.6).
    pub fn accepts_new_vms(&self) -> bool {
        matches!(self.status, WorkerStatus::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::now_iso;

    fn worker(status: WorkerStatus, last_heartbeat_at: String) -> Worker {
        Worker {
            id: "worker-1".to_string(),
            hostname: "node-1".to_string(),
            address: "10.0.0.1:7000".to_string(),
            zone: "eu-west-1".to_string(),
            labels: HashMap::new(),
            capabilities: Vec::new(),
            status,
            total_cpu_cores: 8,
            used_cpu_cores: 2,
            total_mem_mib: 16384,
            used_mem_mib: 4096,
            total_disk_mib: 102400,
            used_disk_mib: 1024,
            vm_count: 3,
            max_vms: 64,
            started_at: now_iso(),
            last_heartbeat_at,
        }
    }

    #[test]
    fn consistent_resources_pass() {
        assert!(worker(WorkerStatus::Active, now_iso()).resources_consistent());
    }

    #[test]
    fn inconsistent_resources_fail() {
        let mut w = worker(WorkerStatus::Active, now_iso());
        w.used_cpu_cores = w.total_cpu_cores + 1;
        assert!(!w.resources_consistent());
    }

    #[test]
    fn fresh_heartbeat_is_not_stale() {
        assert!(!worker(WorkerStatus::Active, now_iso()).is_stale());
    }

    #[test]
    fn old_heartbeat_is_stale() {
        let old = (chrono::Utc::now() - chrono::Duration::seconds(120)).to_rfc3339();
        assert!(worker(WorkerStatus::Active, old).is_stale());
    }

    #[test]
    fn only_active_workers_accept_new_vms() {
        assert!(worker(WorkerStatus::Active, now_iso()).accepts_new_vms());
        assert!(!worker(WorkerStatus::Draining, now_iso()).accepts_new_vms());
        assert!(!worker(WorkerStatus::Offline, now_iso()).accepts_new_vms());
    }
}
