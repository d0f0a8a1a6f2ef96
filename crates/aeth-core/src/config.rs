use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-worker bridge name (§4.1).
pub const DEFAULT_BRIDGE_NAME: &str = "aetherium0";
/// Default bridge subnet (§4.1).
pub const DEFAULT_BRIDGE_SUBNET: &str = "172.16.0.0/24";
/// Default bridge gateway address (§4.1).
pub const DEFAULT_BRIDGE_GATEWAY: &str = "172.16.0.1";

/// Guest agent well-known vsock/TCP port (§4.2).
pub const GUEST_AGENT_PORT: u32 = 9999;
/// Host-side reverse-secrets listener port (§4.2).
pub const GUEST_SECRETS_PORT: u32 = 9998;

/// Maximum command-channel frame size: 16 MiB (§4.4).
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Default `execute` deadline: 30s, unless overridden by the caller (§4.4).
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);
/// Virtio-socket connect timeout (§4.4).
pub const VSOCK_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// TCP fallback connect timeout (§4.4).
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout waiting for the reverse secrets connection during boot (§4.3).
pub const SECRETS_HANDOFF_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout waiting for the hypervisor control socket to appear (§4.3).
pub const CONTROL_SOCKET_APPEAR_TIMEOUT: Duration = Duration::from_secs(5);
/// Graceful-shutdown wait before SIGKILL (§4.3).
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle-shutdown watcher tick interval (§4.2, §4.3).
pub const IDLE_WATCHER_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default idle timeout before a VM is asked to power off (§4.2).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Worker heartbeat defaults (§4.7).
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_REGISTRY_TTL: Duration = Duration::from_secs(30);
/// A worker with no heartbeat for this long is considered offline (§3).
pub const WORKER_OFFLINE_AFTER: Duration = Duration::from_secs(60);
/// How often the stale-worker reaper scans the registered fleet for missed
/// heartbeats (§3).
pub const WORKER_REAPER_INTERVAL: Duration = Duration::from_secs(20);

/// How often a worker appends a `WorkerMetrics` usage sample (§4.8).
pub const DEFAULT_METRICS_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

/// Task queue backoff schedule (§4.5): base 1s, doubling, capped at 5 minutes.
pub const TASK_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
pub const TASK_RETRY_FACTOR: u32 = 2;
pub const TASK_RETRY_CAP: Duration = Duration::from_secs(5 * 60);

/// Top-level engine configuration, deserialized from TOML with environment
/// overrides (`AETHERIUM_*`), following this lineage's config layering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub worker: WorkerConfig,
    pub network: NetworkConfig,
    pub store: StoreConfig,
    pub registry: RegistryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            network: NetworkConfig::default(),
            store: StoreConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub hostname: String,
    pub zone: String,
    pub max_vms: u32,
    pub total_vcpus: u32,
    pub total_mem_mib: u64,
    pub total_disk_mib: u64,
    pub grace_period_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            hostname: "unknown".to_string(),
            zone: "default".to_string(),
            max_vms: 64,
            total_vcpus: 8,
            total_mem_mib: 16 * 1024,
            total_disk_mib: 100 * 1024,
            grace_period_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bridge_name: String,
    pub bridge_subnet: String,
    pub bridge_gateway: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_name: DEFAULT_BRIDGE_NAME.to_string(),
            bridge_subnet: DEFAULT_BRIDGE_SUBNET.to_string(),
            bridge_gateway: DEFAULT_BRIDGE_GATEWAY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `sqlite://path/to/db.sqlite3` or `sqlite::memory:`.
    pub database_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://var/lib/aetherium/aetherium.sqlite3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// etcd endpoints, e.g. `["http://127.0.0.1:2379"]`.
    pub endpoints: Vec<String>,
    pub key_prefix: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            key_prefix: "workers/".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file, falling back to defaults if absent, then apply
    /// `AETHERIUM_*` environment overrides for the handful of fields an
    /// operator most commonly needs to override at deploy time.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw)?
            }
            _ => Self::default(),
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AETHERIUM_DATABASE_URL") {
            self.store.database_url = v;
        }
        if let Ok(v) = std::env::var("AETHERIUM_ETCD_ENDPOINTS") {
            self.registry.endpoints = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("AETHERIUM_ZONE") {
            self.worker.zone = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.network.bridge_name, "aetherium0");
        assert!(cfg.worker.max_vms > 0);
    }

    #[test]
    fn load_missing_path_falls_back_to_defaults() {
        let cfg = EngineConfig::load(Some(std::path::Path::new("/nonexistent/path.toml"))).unwrap();
        assert_eq!(cfg.network.bridge_gateway, DEFAULT_BRIDGE_GATEWAY);
    }

    #[test]
    fn load_parses_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aetherium.toml");
        std::fs::write(
            &path,
            r#"
            [worker]
            hostname = "node-1"
            max_vms = 8

            [network]
            bridge_name = "customBr0"
            "#,
        )
        .unwrap();

        let cfg = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.worker.hostname, "node-1");
        assert_eq!(cfg.worker.max_vms, 8);
        assert_eq!(cfg.network.bridge_name, "customBr0");
        // Unset sections still take their defaults.
        assert_eq!(cfg.store.database_url, StoreConfig::default().database_url);
    }

    #[test]
    fn env_override_wins_over_file_and_default() {
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe {
            std::env::set_var("AETHERIUM_ZONE", "eu-west-1");
        }
        let cfg = EngineConfig::load(None).unwrap();
        assert_eq!(cfg.worker.zone, "eu-west-1");
        unsafe {
            std::env::remove_var("AETHERIUM_ZONE");
        }
    }
}
