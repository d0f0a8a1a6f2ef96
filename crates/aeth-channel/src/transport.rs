use std::pin::Pin;
use std::task::{Context, Poll};

use aeth_core::config::{TCP_CONNECT_TIMEOUT, VSOCK_CONNECT_TIMEOUT};
use aeth_core::CoreError;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_vsock::{VsockAddr, VsockStream};
use tracing::{debug, warn};

/// Either leg of the command channel's dual transport (§4.4): the agent
/// listens on whichever one it managed to initialize at boot, and both
/// speak the same newline-delimited framing.
pub enum Transport {
    Vsock(VsockStream),
    Tcp(TcpStream),
}

impl AsyncRead for Transport {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Vsock(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Vsock(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Vsock(s) => Pin::new(s).poll_flush(cx),
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Vsock(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Dial the guest agent: virtio-socket first, falling back to TCP against
/// the VM's assigned IPv4 on failure (§4.4).
pub async fn connect(guest_cid: u32, port: u32, guest_ipv4: &str) -> Result<Transport, CoreError> {
    match connect_vsock(guest_cid, port).await {
        Ok(stream) => {
            debug!(guest_cid, port, "connected over vsock");
            Ok(Transport::Vsock(stream))
        }
        Err(e) => {
            warn!(guest_cid, port, error = %e, "vsock connect failed, falling back to TCP");
            connect_tcp(guest_ipv4, port).await.map(Transport::Tcp)
        }
    }
}

async fn connect_vsock(cid: u32, port: u32) -> Result<VsockStream, CoreError> {
    let addr = VsockAddr::new(cid, port);
    tokio::time::timeout(VSOCK_CONNECT_TIMEOUT, VsockStream::connect(addr))
        .await
        .map_err(|_| CoreError::deadline_exceeded("vsock connect timed out"))?
        .map_err(|e| CoreError::with_source(aeth_core::ErrorKind::Unavailable, "vsock connect failed", e.into()))
}

async fn connect_tcp(ipv4: &str, port: u32) -> Result<TcpStream, CoreError> {
    let addr = format!("{ipv4}:{port}");
    tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| CoreError::deadline_exceeded(format!("TCP connect to {addr} timed out")))?
        .map_err(|e| CoreError::with_source(aeth_core::ErrorKind::Unavailable, format!("TCP connect to {addr} failed"), e.into()))
}
