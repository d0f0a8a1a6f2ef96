use aeth_core::CoreError;
use tokio::net::{TcpListener, TcpStream};
use tokio_vsock::{VsockAddr, VsockListener, VMADDR_CID_ANY};
use tracing::{info, warn};

use crate::transport::Transport;

/// Either leg of the guest agent's listener (§4.2): vsock is tried first;
/// TCP bound to the TAP-assigned address is the fallback if vsock
/// initialization fails (no vhost-vsock device present, e.g. under a
/// hypervisor that hasn't wired one up).
pub enum Listener {
    Vsock(VsockListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Bind on `port`; `guest_ipv4` is used only for the TCP fallback.
    pub async fn bind(port: u32, guest_ipv4: &str) -> Result<Self, CoreError> {
        match VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, port)) {
            Ok(listener) => {
                info!(port, "guest agent listening on vsock");
                Ok(Self::Vsock(listener))
            }
            Err(e) => {
                warn!(port, error = %e, "vsock unavailable, falling back to TCP");
                let addr = format!("{guest_ipv4}:{port}");
                let listener = TcpListener::bind(&addr).await.map_err(|e| {
                    CoreError::with_source(aeth_core::ErrorKind::Unavailable, format!("failed to bind TCP {addr}"), e.into())
                })?;
                info!(addr, "guest agent listening on TCP");
                Ok(Self::Tcp(listener))
            }
        }
    }

    pub async fn accept(&self) -> Result<Transport, CoreError> {
        match self {
            Self::Vsock(l) => l
                .accept()
                .await
                .map(|(stream, _addr)| Transport::Vsock(stream))
                .map_err(|e| CoreError::with_source(aeth_core::ErrorKind::Unavailable, "vsock accept failed", e.into())),
            Self::Tcp(l) => l
                .accept()
                .await
                .map(|(stream, _addr): (TcpStream, _)| Transport::Tcp(stream))
                .map_err(|e| CoreError::with_source(aeth_core::ErrorKind::Unavailable, "TCP accept failed", e.into())),
        }
    }
}
