use aeth_core::model::{Worker, WorkerStatus};

/// Client-side filter applied to a registry listing (§4.7: "Consumers read
/// the full set, possibly filtered by zone, label, capability, status").
#[derive(Debug, Clone, Default)]
pub struct WorkerQuery {
    pub status: Option<WorkerStatus>,
    pub zone: Option<String>,
    pub label: Option<(String, String)>,
    pub capability: Option<String>,
}

impl WorkerQuery {
    pub fn matches(&self, worker: &Worker) -> bool {
        if let Some(status) = self.status {
            if worker.status != status {
                return false;
            }
        }
        if let Some(zone) = &self.zone {
            if &worker.zone != zone {
                return false;
            }
        }
        if let Some((k, v)) = &self.label {
            if worker.labels.get(k) != Some(v) {
                return false;
            }
        }
        if let Some(cap) = &self.capability {
            if !worker.capabilities.iter().any(|c| c == cap) {
                return false;
            }
        }
        true
    }
}
