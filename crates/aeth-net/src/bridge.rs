use std::sync::Mutex;

use aeth_core::naming::{deterministic_mac, tap_name};
use aeth_core::CoreError;
use tracing::{info, warn};

use crate::ip_alloc::IpAllocator;
use crate::shell;

/// Per-VM network assignment handed back by [`Fabric::allocate`].
#[derive(Debug, Clone)]
pub struct VmNetAssignment {
    pub tap_name: String,
    pub ipv4: String,
    pub mac: String,
}

/// One worker's network fabric: a single Linux bridge plus NAT/forwarding
/// rules, and the TAP/IP bookkeeping for the VMs attached to it (§4.1).
pub struct Fabric {
    bridge_name: String,
    gateway_cidr: String,
    gateway: String,
    subnet: String,
    allocator: IpAllocator,
    attached: Mutex<Vec<String>>,
}

impl Fabric {
    pub fn new(bridge_name: impl Into<String>, subnet_prefix: impl Into<String>) -> Self {
        let subnet_prefix = subnet_prefix.into();
        let allocator = IpAllocator::new(subnet_prefix.clone());
        let gateway = allocator.gateway();
        let gateway_cidr = format!("{gateway}/24");
        Self {
            bridge_name: bridge_name.into(),
            gateway_cidr,
            gateway,
            subnet: format!("{subnet_prefix}.0/24"),
            allocator,
            attached: Mutex::new(Vec::new()),
        }
    }

    /// The bridge's gateway IPv4 address, handed to guests as their default
    /// route and DNS resolver (§4.1, §4.3 boot args).
    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    /// Create the bridge, NAT masquerade, and forwarding rules if absent.
    /// Idempotent (§4.1).
    pub fn ensure_bridge(&self) -> Result<(), CoreError> {
        let bridge = &self.bridge_name;

        let exists = shell::run("ip", &["link", "show", bridge])
            .map(|o| o.status.success())
            .unwrap_or(false);

        if !exists {
            shell::run_checked("ip", &["link", "add", bridge, "type", "bridge"])?;
            shell::run_checked("ip", &["addr", "add", &self.gateway_cidr, "dev", bridge])?;
            shell::run_checked("ip", &["link", "set", bridge, "up"])?;
            info!(bridge, subnet = %self.subnet, "created bridge");
        }

        self.ensure_nat_rule(bridge)?;
        self.ensure_forward_rules(bridge)?;
        Ok(())
    }

    fn ensure_nat_rule(&self, bridge: &str) -> Result<(), CoreError> {
        let check = shell::run(
            "iptables",
            &[
                "-t", "nat", "-C", "POSTROUTING", "-s", &self.subnet, "!", "-o", bridge, "-j",
                "MASQUERADE",
            ],
        )?;
        if !check.status.success() {
            shell::run_checked(
                "iptables",
                &[
                    "-t", "nat", "-A", "POSTROUTING", "-s", &self.subnet, "!", "-o", bridge, "-j",
                    "MASQUERADE",
                ],
            )?;
        }
        Ok(())
    }

    fn ensure_forward_rules(&self, bridge: &str) -> Result<(), CoreError> {
        let outbound = shell::run(
            "iptables",
            &["-C", "FORWARD", "-i", bridge, "!", "-o", bridge, "-j", "ACCEPT"],
        )?;
        if !outbound.status.success() {
            shell::run_checked(
                "iptables",
                &["-A", "FORWARD", "-i", bridge, "!", "-o", bridge, "-j", "ACCEPT"],
            )?;
        }

        let established = shell::run(
            "iptables",
            &[
                "-C", "FORWARD", "!", "-i", bridge, "-o", bridge, "-m", "state", "--state",
                "RELATED,ESTABLISHED", "-j", "ACCEPT",
            ],
        )?;
        if !established.status.success() {
            shell::run_checked(
                "iptables",
                &[
                    "-A", "FORWARD", "!", "-i", bridge, "-o", bridge, "-m", "state", "--state",
                    "RELATED,ESTABLISHED", "-j", "ACCEPT",
                ],
            )?;
        }
        Ok(())
    }

    /// Allocate a TAP device, deterministic MAC, and free IPv4 for `vm_id`,
    /// attaching the TAP to the bridge (§4.1).
    pub fn allocate(&self, vm_id: &str) -> Result<VmNetAssignment, CoreError> {
        let tap = tap_name(vm_id);
        let mac = deterministic_mac(vm_id);

        if self.tap_exists(&tap)? {
            self.reclaim_stale_tap(&tap)?;
        }

        let ipv4 = self.allocator.allocate()?;

        shell::run_checked("ip", &["tuntap", "add", "dev", &tap, "mode", "tap"])?;
        shell::run_checked("ip", &["link", "set", &tap, "master", &self.bridge_name])?;
        shell::run_checked("ip", &["link", "set", &tap, "up"])?;

        self.attached.lock().expect("attached list mutex poisoned").push(tap.clone());

        Ok(VmNetAssignment { tap_name: tap, ipv4, mac })
    }

    /// Tear down the TAP and release the IP. Idempotent (§4.1).
    pub fn release(&self, vm_id: &str, ipv4: &str) {
        let tap = tap_name(vm_id);
        shell::run_best_effort("ip", &["link", "del", &tap]);
        self.allocator.release(ipv4);
        self.attached
            .lock()
            .expect("attached list mutex poisoned")
            .retain(|t| t != &tap);
    }

    fn tap_exists(&self, tap: &str) -> Result<bool, CoreError> {
        Ok(shell::run("ip", &["link", "show", tap])?.status.success())
    }

    /// A name collision on a deterministically-derived TAP means a previous
    /// incarnation of this VM left it behind without a carrier; reclaim it
    /// rather than failing the new allocation (§4.1).
    fn reclaim_stale_tap(&self, tap: &str) -> Result<(), CoreError> {
        let carrier = shell::run("cat", &[&format!("/sys/class/net/{tap}/carrier")])
            .ok()
            .map(|o| shell::stdout_of(&o))
            .unwrap_or_default();
        if carrier == "1" {
            warn!(tap, "TAP name collision with a live carrier, refusing to reclaim");
            return Err(CoreError::precondition_failed(format!(
                "TAP device {tap} already exists and is carrying traffic"
            )));
        }
        warn!(tap, "reclaiming stale TAP device");
        shell::run_best_effort("ip", &["link", "del", tap]);
        Ok(())
    }
}
