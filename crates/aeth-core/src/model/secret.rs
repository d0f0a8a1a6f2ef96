use serde::{Deserialize, Serialize};

/// Classifies how a secret's ciphertext is meant to be consumed; purely
/// descriptive, carries no behavior of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretType {
    Env,
    ApiKey,
    SshKey,
    Opaque,
}

impl TryFrom<String> for SecretType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        serde_json::from_value(serde_json::Value::String(value)).map_err(|e| e.to_string())
    }
}

/// A workspace-scoped secret (§3). Decryption happens only in memory at the
/// guest agent; the ciphertext is all that is ever persisted or transmitted
/// over the command channel's `get_secrets` handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub ciphertext: Vec<u8>,
    pub secret_type: SecretType,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_roundtrips_without_exposing_plaintext_fields() {
        let secret = Secret {
            id: "secret-1".to_string(),
            workspace_id: "ws-1".to_string(),
            name: "GITHUB_TOKEN".to_string(),
            ciphertext: vec![1, 2, 3, 4],
            secret_type: SecretType::ApiKey,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        };
        let json = serde_json::to_string(&secret).unwrap();
        assert!(!json.contains("plaintext"));
        let parsed: Secret = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.ciphertext, vec![1, 2, 3, 4]);
    }
}
