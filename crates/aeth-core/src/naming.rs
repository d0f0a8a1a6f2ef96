use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::CoreError;

/// Generate a globally-unique opaque VM identifier, e.g. `vm-a3f7b2c19e4d`.
pub fn generate_vm_id() -> String {
    format!("vm-{}", short_hex(&Uuid::new_v4()))
}

/// Derive a VM id deterministically from the `vm:create` task id that
/// requested it, so redelivering the same task never produces a second VM
/// record (§8 at-least-once: "replaying the same vm:create payload with the
/// identical task identifier results in exactly one VM record").
pub fn vm_id_for_task(task_id: &str) -> String {
    let digest = Sha256::digest(task_id.as_bytes());
    format!("vm-{}", hex_prefix(&digest, 12))
}

/// Generate a globally-unique task identifier, e.g. `task-0c9e1a4f7b23`.
pub fn generate_task_id() -> String {
    format!("task-{}", short_hex(&Uuid::new_v4()))
}

/// Generate a globally-unique execution identifier.
pub fn generate_execution_id() -> String {
    format!("exec-{}", short_hex(&Uuid::new_v4()))
}

/// Generate a globally-unique worker identifier.
pub fn generate_worker_id() -> String {
    format!("worker-{}", short_hex(&Uuid::new_v4()))
}

/// Generate a globally-unique workspace identifier.
pub fn generate_workspace_id() -> String {
    format!("ws-{}", short_hex(&Uuid::new_v4()))
}

/// Generate a globally-unique secret identifier.
pub fn generate_secret_id() -> String {
    format!("secret-{}", short_hex(&Uuid::new_v4()))
}

/// Generate a globally-unique worker-metrics sample identifier.
pub fn generate_worker_metrics_id() -> String {
    format!("wm-{}", short_hex(&Uuid::new_v4()))
}

fn short_hex(id: &Uuid) -> String {
    id.simple().to_string()[..12].to_string()
}

/// Validate an identifier used as a path/resource-name component: lowercase
/// alphanumerics, `-` and `_`, 1-63 bytes. Rejects anything that could
/// escape a derived filesystem path or shell fragment.
pub fn validate_id(id: &str, label: &str) -> Result<(), CoreError> {
    if id.is_empty() || id.len() > 63 {
        return Err(CoreError::invalid_arg(format!(
            "{label} id must be 1-63 bytes, got {} bytes",
            id.len()
        )));
    }
    let ok = id
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
    if !ok {
        return Err(CoreError::invalid_arg(format!(
            "{label} id '{id}' contains invalid characters (allowed: a-z 0-9 - _)"
        )));
    }
    Ok(())
}

/// Maximum Linux interface name length, including the NUL terminator's
/// budget (IFNAMSIZ is 16, so 15 usable bytes).
const MAX_TAP_NAME_BYTES: usize = 15;
const TAP_PREFIX: &str = "aether-";

/// Derive the TAP device name for a VM: `aether-<8 hex chars>`, always
/// within the 15-byte Linux interface name limit (§4.1).
pub fn tap_name(vm_id: &str) -> String {
    let digest = Sha256::digest(vm_id.as_bytes());
    let hex = hex_prefix(&digest, MAX_TAP_NAME_BYTES - TAP_PREFIX.len());
    format!("{TAP_PREFIX}{hex}")
}

/// Reserved vsock context IDs: 0 is the hypervisor, 1 is "any local", 2 is
/// always the host. Guest CIDs start at 3.
const MIN_GUEST_CID: u32 = 3;

/// Derive a deterministic vsock guest context ID from a VM id (§4.3/§4.4):
/// each VM's vsock device is configured with this CID, and the host dials
/// it by CID rather than tracking a separate allocator table.
pub fn guest_cid(vm_id: &str) -> u32 {
    let digest = Sha256::digest(vm_id.as_bytes());
    let raw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    MIN_GUEST_CID + (raw % (u32::MAX - MIN_GUEST_CID))
}

/// Derive a deterministic locally-administered MAC address from a VM id:
/// `02:XX:XX:XX:XX:XX`, where the trailing five bytes are a hash of the id
/// (§3 invariant iii — MAC is a deterministic function of the VM id, so
/// re-binding the same VM is idempotent).
pub fn deterministic_mac(vm_id: &str) -> String {
    let digest = Sha256::digest(vm_id.as_bytes());
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        digest[0], digest[1], digest[2], digest[3], digest[4]
    )
}

fn hex_prefix(bytes: &[u8], max_hex_chars: usize) -> String {
    let mut s = String::new();
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
        if s.len() >= max_hex_chars {
            s.truncate(max_hex_chars);
            break;
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_ids_are_unique_and_prefixed() {
        let a = generate_vm_id();
        let b = generate_vm_id();
        assert_ne!(a, b);
        assert!(a.starts_with("vm-"));
    }

    #[test]
    fn workspace_and_secret_ids_are_prefixed() {
        assert!(generate_workspace_id().starts_with("ws-"));
        assert!(generate_secret_id().starts_with("secret-"));
    }

    #[test]
    fn tap_name_is_deterministic_and_short() {
        let a = tap_name("vm-abc123");
        let b = tap_name("vm-abc123");
        let c = tap_name("vm-other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.len() <= MAX_TAP_NAME_BYTES);
        assert!(a.starts_with("aether-"));
    }

    #[test]
    fn mac_is_deterministic_and_locally_administered() {
        let a = deterministic_mac("vm-abc123");
        let b = deterministic_mac("vm-abc123");
        assert_eq!(a, b);
        assert!(a.starts_with("02:"));
        assert_eq!(a.split(':').count(), 6);
    }

    #[test]
    fn guest_cid_is_deterministic_and_above_reserved_range() {
        let a = guest_cid("vm-abc123");
        let b = guest_cid("vm-abc123");
        let c = guest_cid("vm-other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a >= 3);
    }

    #[test]
    fn mac_differs_across_vms() {
        assert_ne!(deterministic_mac("vm-a"), deterministic_mac("vm-b"));
    }

    #[test]
    fn validate_id_accepts_normal_ids() {
        assert!(validate_id("acme-workspace_1", "Workspace").is_ok());
    }

    #[test]
    fn vm_id_for_task_is_deterministic_and_prefixed() {
        let a = vm_id_for_task("task-abc123");
        let b = vm_id_for_task("task-abc123");
        let c = vm_id_for_task("task-other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("vm-"));
    }

    #[test]
    fn validate_id_rejects_empty_and_uppercase() {
        assert!(validate_id("", "VM").is_err());
        assert!(validate_id("ACME", "VM").is_err());
        assert!(validate_id("has space", "VM").is_err());
        assert!(validate_id("../etc", "VM").is_err());
    }

    #[test]
    fn validate_id_rejects_too_long() {
        let long = "a".repeat(64);
        assert!(validate_id(&long, "VM").is_err());
    }
}
