use std::collections::HashMap;
use std::sync::Mutex;

use aeth_channel::framing::{read_message, write_message};
use aeth_channel::protocol::Request;
use aeth_core::config::{GUEST_SECRETS_PORT, SECRETS_HANDOFF_TIMEOUT};
use aeth_core::CoreError;
use tokio::io::BufReader;
use tokio::sync::oneshot;
use tokio_vsock::{VsockAddr, VsockListener, VMADDR_CID_ANY};
use tracing::{info, warn};

/// Host-side counterpart to `aeth_guest::secrets::fetch_from_host`: one
/// shared listener serves every VM's reverse secrets connection, matching
/// each incoming dial by its guest CID against a table of secrets staged
/// for delivery (§4.3 boot sequence, §4.2).
pub struct SecretsHandoff {
    pending: Mutex<HashMap<u32, (HashMap<String, String>, oneshot::Sender<()>)>>,
}

impl Default for SecretsHandoff {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretsHandoff {
    pub fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()) }
    }

    /// Start the shared accept loop. Runs until the socket errors.
    pub async fn serve(self: std::sync::Arc<Self>) -> Result<(), CoreError> {
        let listener = VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, GUEST_SECRETS_PORT)).map_err(|e| {
            CoreError::with_source(aeth_core::ErrorKind::Unavailable, "failed to bind secrets handoff listener", e.into())
        })?;
        info!(port = GUEST_SECRETS_PORT, "secrets handoff listener bound");

        loop {
            let (stream, addr) = listener.accept().await.map_err(|e| {
                CoreError::with_source(aeth_core::ErrorKind::Unavailable, "secrets handoff accept failed", e.into())
            })?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle(stream, addr.cid()).await {
                    warn!(error = %e, "secrets handoff connection failed");
                }
            });
        }
    }

    async fn handle(&self, stream: tokio_vsock::VsockStream, guest_cid: u32) -> Result<(), CoreError> {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        match read_message::<_, Request>(&mut reader).await? {
            Some(Request::GetSecrets) => {}
            _ => return Err(CoreError::internal("expected get_secrets as the first handoff message")),
        }

        let (secrets, done) = {
            let mut pending = self.pending.lock().expect("secrets handoff mutex poisoned");
            pending.remove(&guest_cid).ok_or_else(|| {
                CoreError::not_found(format!("no secrets staged for guest cid {guest_cid}"))
            })?
        };

        write_message(&mut writer, &secrets).await?;
        let _ = done.send(());
        Ok(())
    }

    /// Stage `secrets` for `guest_cid` so a subsequent `get_secrets` dial
    /// can collect them. Synchronous and runs to completion as soon as it's
    /// called, unlike the `oneshot::Receiver` it hands back — callers must
    /// stage before telling the hypervisor to start the instance (§4.3:
    /// "accept the reverse secret connection ... before `InstanceStart`"),
    /// or the guest's one-shot connection can race ahead of this insert
    /// and be rejected with `not_found`.
    pub fn stage(&self, guest_cid: u32, secrets: HashMap<String, String>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("secrets handoff mutex poisoned").insert(guest_cid, (secrets, tx));
        rx
    }

    /// Wait up to [`SECRETS_HANDOFF_TIMEOUT`] for the guest to collect the
    /// secrets staged under `guest_cid` via [`Self::stage`].
    pub async fn wait_for_collection(&self, guest_cid: u32, rx: oneshot::Receiver<()>) -> Result<(), CoreError> {
        tokio::time::timeout(SECRETS_HANDOFF_TIMEOUT, rx).await.map_err(|_| {
            self.pending.lock().expect("secrets handoff mutex poisoned").remove(&guest_cid);
            CoreError::deadline_exceeded(format!("guest cid {guest_cid} did not collect its secrets in time"))
        })?
        .map_err(|_| CoreError::internal("secrets handoff completion signal dropped"))
    }

    /// Stage and wait in one call (§4.3). Kept for callers that don't need
    /// to start the hypervisor instance in between — the normal boot path
    /// uses `stage`/`wait_for_collection` directly so it can call
    /// `start_instance` after staging but before waiting.
    pub async fn provide(&self, guest_cid: u32, secrets: HashMap<String, String>) -> Result<(), CoreError> {
        let rx = self.stage(guest_cid, secrets);
        self.wait_for_collection(guest_cid, rx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn provide_times_out_when_never_collected() {
        let handoff = SecretsHandoff::new();
        let err = handoff.provide(99, HashMap::new()).await.unwrap_err();
        assert_eq!(err.kind, aeth_core::ErrorKind::DeadlineExceeded);
    }
}
