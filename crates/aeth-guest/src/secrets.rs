use std::collections::HashMap;
use std::sync::Mutex;

use aeth_channel::framing::{read_message, write_message};
use aeth_channel::protocol::Request;
use aeth_core::config::{GUEST_SECRETS_PORT, SECRETS_HANDOFF_TIMEOUT};
use aeth_core::CoreError;
use tokio::io::BufReader;
use tokio_vsock::{VsockAddr, VsockStream};
use tracing::{info, warn};

/// Well-known vsock CID of the host, from the Firecracker/cloud-hypervisor
/// vsock convention (guest CIDs start at 3; CID 2 always addresses the host).
const HOST_CID: u32 = 2;

/// Mutex-guarded in-memory secrets map. Never written to disk, shell
/// profile, or environment file (§4.2).
pub struct SecretStore {
    inner: Mutex<HashMap<String, String>>,
}

impl SecretStore {
    pub fn empty() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    pub fn set_all(&self, secrets: HashMap<String, String>) {
        *self.inner.lock().expect("secret store mutex poisoned") = secrets;
    }

    /// The effective command environment is (process environment) ∪
    /// (in-memory secrets), with secrets taking precedence (§4.2).
    pub fn overlay_onto(&self, mut env: HashMap<String, String>) -> HashMap<String, String> {
        let secrets = self.inner.lock().expect("secret store mutex poisoned");
        for (k, v) in secrets.iter() {
            env.insert(k.clone(), v.clone());
        }
        env
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::empty()
    }
}

/// Open the one-shot reverse connection to the host and request secrets
/// (§4.2). Called once at boot, with a 30s handoff timeout.
pub async fn fetch_from_host() -> Result<HashMap<String, String>, CoreError> {
    let addr = VsockAddr::new(HOST_CID, GUEST_SECRETS_PORT);
    let stream = tokio::time::timeout(SECRETS_HANDOFF_TIMEOUT, VsockStream::connect(addr))
        .await
        .map_err(|_| CoreError::deadline_exceeded("secrets handoff connect timed out"))?
        .map_err(|e| {
            CoreError::with_source(aeth_core::ErrorKind::Unavailable, "failed to open reverse secrets connection", e.into())
        })?;

    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    write_message(&mut write_half, &Request::GetSecrets).await?;

    let secrets: HashMap<String, String> =
        tokio::time::timeout(SECRETS_HANDOFF_TIMEOUT, read_message(&mut reader))
            .await
            .map_err(|_| CoreError::deadline_exceeded("secrets handoff response timed out"))??
            .unwrap_or_default();

    info!(count = secrets.len(), "received secrets from host");
    if secrets.is_empty() {
        warn!("host returned no secrets; proceeding with process environment only");
    }
    Ok(secrets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_secrets_over_process_env() {
        let store = SecretStore::empty();
        store.set_all(HashMap::from([("API_KEY".to_string(), "secret".to_string())]));

        let base_env = HashMap::from([("API_KEY".to_string(), "placeholder".to_string())]);
        let merged = store.overlay_onto(base_env);
        assert_eq!(merged.get("API_KEY"), Some(&"secret".to_string()));
    }

    #[test]
    fn overlay_preserves_unrelated_process_env() {
        let store = SecretStore::empty();
        store.set_all(HashMap::from([("TOKEN".to_string(), "x".to_string())]));

        let base_env = HashMap::from([("PATH".to_string(), "/usr/bin".to_string())]);
        let merged = store.overlay_onto(base_env);
        assert_eq!(merged.get("PATH"), Some(&"/usr/bin".to_string()));
        assert_eq!(merged.get("TOKEN"), Some(&"x".to_string()));
    }
}
