use std::path::Path;
use std::time::Duration;

use aeth_core::config::CONTROL_SOCKET_APPEAR_TIMEOUT;
use aeth_core::CoreError;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use serde::Serialize;
use tracing::debug;

/// REST client for the hypervisor's per-VM control socket (§4.3): a
/// Firecracker-shaped HTTP API reached over a Unix domain socket, one
/// client per VM.
#[derive(Clone)]
pub struct HypervisorClient {
    socket_path: std::path::PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl HypervisorClient {
    pub fn new(socket_path: impl Into<std::path::PathBuf>) -> Self {
        Self { socket_path: socket_path.into(), client: Client::builder(TokioExecutor::new()).build(UnixConnector) }
    }

    /// Wait up to [`CONTROL_SOCKET_APPEAR_TIMEOUT`] for the hypervisor's
    /// control socket file to appear after the process is spawned (§4.3).
    pub async fn wait_for_socket(&self) -> Result<(), CoreError> {
        let deadline = tokio::time::Instant::now() + CONTROL_SOCKET_APPEAR_TIMEOUT;
        while !self.socket_path.exists() {
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::deadline_exceeded(format!(
                    "control socket {} did not appear within {CONTROL_SOCKET_APPEAR_TIMEOUT:?}",
                    self.socket_path.display()
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    fn uri(&self, endpoint: &str) -> hyper::Uri {
        UnixUri::new(&self.socket_path, endpoint).into()
    }

    async fn put(&self, endpoint: &str, body: &impl Serialize) -> Result<(), CoreError> {
        let payload = serde_json::to_vec(body).map_err(|e| CoreError::internal(e.to_string()))?;
        let req = Request::builder()
            .method(Method::PUT)
            .uri(self.uri(endpoint))
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| CoreError::internal(e.to_string()))?;

        self.send(req, endpoint).await
    }

    async fn send(&self, req: Request<Full<Bytes>>, endpoint: &str) -> Result<(), CoreError> {
        let resp = self.client.request(req).await.map_err(|e| {
            CoreError::with_source(aeth_core::ErrorKind::Unavailable, format!("control socket request to {endpoint} failed"), e.into())
        })?;

        let status = resp.status();
        if status == StatusCode::NO_CONTENT || status.is_success() {
            debug!(endpoint, %status, "control socket request succeeded");
            return Ok(());
        }

        let body = resp.into_body().collect().await.map(|c| c.to_bytes()).unwrap_or_default();
        Err(CoreError::unavailable(format!(
            "control socket {endpoint} returned {status}: {}",
            String::from_utf8_lossy(&body)
        )))
    }

    /// `PUT /machine-config` (§4.3).
    pub async fn machine_config(&self, vcpu_count: u32, mem_mib: u64) -> Result<(), CoreError> {
        #[derive(Serialize)]
        struct MachineConfig {
            vcpu_count: u32,
            mem_size_mib: u64,
        }
        self.put("/machine-config", &MachineConfig { vcpu_count, mem_size_mib: mem_mib }).await
    }

    /// `PUT /boot-source` (§4.3): kernel image plus boot args carrying the
    /// static IP configuration and DNS the guest's kernel parses at boot.
    pub async fn boot_source(&self, kernel_path: &Path, ipv4: &str, gateway: &str, dns: &str) -> Result<(), CoreError> {
        #[derive(Serialize)]
        struct BootSource {
            kernel_image_path: String,
            boot_args: String,
        }
        let boot_args = format!(
            "console=ttyS0 reboot=k panic=1 pci=off ip={ipv4}::{gateway}:255.255.255.0::eth0:off nameserver={dns}"
        );
        self.put("/boot-source", &BootSource { kernel_image_path: kernel_path.display().to_string(), boot_args }).await
    }

    /// `PUT /drives/{id}` (§4.3).
    pub async fn drive(&self, drive_id: &str, path: &Path, read_only: bool) -> Result<(), CoreError> {
        #[derive(Serialize)]
        struct Drive {
            drive_id: String,
            path_on_host: String,
            is_root_device: bool,
            is_read_only: bool,
        }
        let endpoint = format!("/drives/{drive_id}");
        self.put(
            &endpoint,
            &Drive { drive_id: drive_id.to_string(), path_on_host: path.display().to_string(), is_root_device: true, is_read_only: read_only },
        )
        .await
    }

    /// `PUT /network-interfaces/{id}` (§4.3): binds the VM's TAP device and
    /// deterministic MAC to a virtio-net interface.
    pub async fn network_interface(&self, iface_id: &str, tap_name: &str, mac: &str) -> Result<(), CoreError> {
        #[derive(Serialize)]
        struct NetIface {
            iface_id: String,
            guest_mac: String,
            host_dev_name: String,
        }
        let endpoint = format!("/network-interfaces/{iface_id}");
        self.put(&endpoint, &NetIface { iface_id: iface_id.to_string(), guest_mac: mac.to_string(), host_dev_name: tap_name.to_string() }).await
    }

    /// `PUT /vsock` (§4.3): wires the command channel's vsock leg with the
    /// VM's deterministic guest CID.
    pub async fn vsock(&self, vsock_id: &str, guest_cid: u32, uds_path: &Path) -> Result<(), CoreError> {
        #[derive(Serialize)]
        struct Vsock {
            vsock_id: String,
            guest_cid: u32,
            uds_path: String,
        }
        self.put("/vsock", &Vsock { vsock_id: vsock_id.to_string(), guest_cid, uds_path: uds_path.display().to_string() }).await
    }

    /// `PUT /actions` with `InstanceStart` (§4.3).
    pub async fn start_instance(&self) -> Result<(), CoreError> {
        #[derive(Serialize)]
        struct Action {
            action_type: &'static str,
        }
        self.put("/actions", &Action { action_type: "InstanceStart" }).await
    }

    /// `PUT /actions` with `SendCtrlAltDel`, the graceful-shutdown trigger
    /// (§4.3).
    pub async fn send_ctrl_alt_del(&self) -> Result<(), CoreError> {
        #[derive(Serialize)]
        struct Action {
            action_type: &'static str,
        }
        self.put("/actions", &Action { action_type: "SendCtrlAltDel" }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_args_carry_static_ip_and_dns() {
        // Exercise the pure string-building path without a live socket.
        let args = format!(
            "console=ttyS0 reboot=k panic=1 pci=off ip={ipv4}::{gw}:255.255.255.0::eth0:off nameserver={dns}",
            ipv4 = "172.16.0.5",
            gw = "172.16.0.1",
            dns = "172.16.0.1",
        );
        assert!(args.contains("ip=172.16.0.5::172.16.0.1"));
        assert!(args.contains("nameserver=172.16.0.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_socket_times_out_when_absent() {
        let client = HypervisorClient::new("/nonexistent/path/to.sock");
        let err = client.wait_for_socket().await.unwrap_err();
        assert_eq!(err.kind, aeth_core::ErrorKind::DeadlineExceeded);
    }
}
