use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// VM lifecycle state (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl TryFrom<String> for VmStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        serde_json::from_value(serde_json::Value::String(value)).map_err(|e| e.to_string())
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Validate a VM state transition against the machine in §4.3.
///
/// `created -> starting -> running -> stopping -> stopped`, with `failed`
/// reachable from `starting`/`running`/`stopping`. From `failed`, only
/// deletion (handled outside this state machine) is legal — no further
/// transition through here succeeds.
pub fn validate_transition(from: VmStatus, to: VmStatus) -> Result<(), CoreError> {
    use VmStatus::*;

    // StartVM on running and StopVM on stopped are no-op successes (§4.3).
    if (from, to) == (Running, Running) || (from, to) == (Stopped, Stopped) {
        return Ok(());
    }

    let valid = matches!(
        (from, to),
        (Created, Starting)
            | (Starting, Running)
            | (Running, Stopping)
            | (Stopping, Stopped)
            | (Starting, Failed)
            | (Running, Failed)
            | (Stopping, Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::precondition_failed(format!(
            "invalid VM state transition: {from} -> {to}"
        )))
    }
}

/// Per-VM network assignment, derived deterministically from the VM id by
/// the network fabric (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmNet {
    pub tap_name: String,
    pub mac: String,
    pub ipv4: String,
}

/// A microVM record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    pub id: String,
    /// Unique within the owning workspace, not globally.
    pub name: String,
    pub workspace_id: String,
    pub worker_id: String,
    pub status: VmStatus,
    pub vcpu_count: u32,
    pub mem_mib: u64,
    pub kernel_path: String,
    pub rootfs_path: String,
    pub control_socket_path: String,
    pub net: VmNet,
    pub created_at: String,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
    /// Updated on each accepted command; drives the idle-shutdown watcher (§4.3).
    pub last_activity_at: Option<String>,
    /// If set, the VM is destroyed after this task's final command completes.
    pub single_task_id: Option<String>,
    /// Idle timeout override, in seconds; falls back to the worker default.
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Vm {
    /// Whether `task_id` is the single task this VM was created for, making
    /// the command it just ran that task's final command (§4.3: "a VM
    /// created for a single task terminates after that task's final
    /// command").
    pub fn is_final_command_for(&self, task_id: Option<&str>) -> bool {
        task_id.is_some() && self.single_task_id.as_deref() == task_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VmStatus::*;

    #[test]
    fn happy_path_transitions() {
        assert!(validate_transition(Created, Starting).is_ok());
        assert!(validate_transition(Starting, Running).is_ok());
        assert!(validate_transition(Running, Stopping).is_ok());
        assert!(validate_transition(Stopping, Stopped).is_ok());
    }

    #[test]
    fn failed_reachable_from_transitional_states() {
        assert!(validate_transition(Starting, Failed).is_ok());
        assert!(validate_transition(Running, Failed).is_ok());
        assert!(validate_transition(Stopping, Failed).is_ok());
        assert!(validate_transition(Created, Failed).is_err());
    }

    #[test]
    fn start_on_running_and_stop_on_stopped_are_noops() {
        assert!(validate_transition(Running, Running).is_ok());
        assert!(validate_transition(Stopped, Stopped).is_ok());
    }

    #[test]
    fn failed_has_no_outgoing_transition_here() {
        for to in [Created, Starting, Running, Stopping, Stopped] {
            assert!(validate_transition(Failed, to).is_err());
        }
    }

    #[test]
    fn skipping_states_is_invalid() {
        assert!(validate_transition(Created, Running).is_err());
        assert!(validate_transition(Stopped, Running).is_err());
    }

    #[test]
    fn vm_record_roundtrips() {
        let vm = Vm {
            id: "vm-abc123".to_string(),
            name: "builder".to_string(),
            workspace_id: "ws-1".to_string(),
            worker_id: "worker-1".to_string(),
            status: Running,
            vcpu_count: 2,
            mem_mib: 1024,
            kernel_path: "/var/lib/aetherium/vmlinux".to_string(),
            rootfs_path: "/var/lib/aetherium/rootfs.ext4".to_string(),
            control_socket_path: "/run/aetherium/vm-abc123.sock".to_string(),
            net: VmNet {
                tap_name: "aether-abcd1234".to_string(),
                mac: "02:aa:bb:cc:dd:ee".to_string(),
                ipv4: "172.16.0.5".to_string(),
            },
            created_at: "2026-01-01T00:00:00Z".to_string(),
            started_at: None,
            stopped_at: None,
            last_activity_at: None,
            single_task_id: None,
            idle_timeout_secs: None,
            metadata: HashMap::new(),
        };

        let json = serde_json::to_string(&vm).unwrap();
        let parsed: Vm = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "vm-abc123");
        assert_eq!(parsed.status, Running);
    }

    fn vm_with_single_task(single_task_id: Option<&str>) -> Vm {
        Vm {
            id: "vm-abc123".to_string(),
            name: "builder".to_string(),
            workspace_id: "ws-1".to_string(),
            worker_id: "worker-1".to_string(),
            status: Running,
            vcpu_count: 1,
            mem_mib: 512,
            kernel_path: "/vmlinux".to_string(),
            rootfs_path: "/rootfs.ext4".to_string(),
            control_socket_path: "/run/aetherium/vm-abc123.sock".to_string(),
            net: VmNet { tap_name: "aether-abcd1234".to_string(), mac: "02:aa:bb:cc:dd:ee".to_string(), ipv4: "172.16.0.5".to_string() },
            created_at: "2026-01-01T00:00:00Z".to_string(),
            started_at: None,
            stopped_at: None,
            last_activity_at: None,
            single_task_id: single_task_id.map(str::to_string),
            idle_timeout_secs: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn is_final_command_for_matches_single_task_id() {
        let vm = vm_with_single_task(Some("task-1"));
        assert!(vm.is_final_command_for(Some("task-1")));
        assert!(!vm.is_final_command_for(Some("task-2")));
        assert!(!vm.is_final_command_for(None));
    }

    #[test]
    fn is_final_command_for_is_false_without_a_single_task_id() {
        let vm = vm_with_single_task(None);
        assert!(!vm.is_final_command_for(Some("task-1")));
        assert!(!vm.is_final_command_for(None));
    }
}
