use serde::{Deserialize, Serialize};

/// A point-in-time resource-usage sample for a worker (§4.8), distinct from
/// the live `Worker` registry record: this is an append-only history used
/// for capacity reporting, not the value consulted for scheduling decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub id: String,
    pub worker_id: String,
    pub recorded_at: String,
    pub used_cpu_cores: u32,
    pub used_mem_mib: u64,
    pub used_disk_mib: u64,
    pub vm_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_metrics_roundtrips() {
        let sample = WorkerMetrics {
            id: "wm-1".to_string(),
            worker_id: "worker-1".to_string(),
            recorded_at: "2026-01-01T00:00:00Z".to_string(),
            used_cpu_cores: 4,
            used_mem_mib: 8192,
            used_disk_mib: 2048,
            vm_count: 5,
        };
        let json = serde_json::to_string(&sample).unwrap();
        let parsed: WorkerMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.worker_id, "worker-1");
        assert_eq!(parsed.vm_count, 5);
    }
}
