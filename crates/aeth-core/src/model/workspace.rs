use serde::{Deserialize, Serialize};

/// A tenant-scoped grouping that owns VMs and secrets. Implicit in the data
/// model ("Secret belongs-to Workspace, which owns a VM" — §3) and made
/// first-class here so `workspace:create`/`workspace:delete` (§4.5) have
/// something concrete to operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub owner_label: String,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_roundtrips() {
        let ws = Workspace {
            id: "ws-1".to_string(),
            name: "acme-prod".to_string(),
            owner_label: "acme".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        };
        let json = serde_json::to_string(&ws).unwrap();
        let parsed: Workspace = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "ws-1");
        assert_eq!(parsed.name, "acme-prod");
    }
}
