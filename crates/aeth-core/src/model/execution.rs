use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single command execution against a VM (§3). Immutable once completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub vm_id: String,
    pub cmd: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// `None` until the process exits.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub duration_ms: Option<u64>,
}

impl Execution {
    pub fn is_complete(&self) -> bool {
        self.exit_code.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_execution_has_no_exit_code() {
        let exec = Execution {
            id: "exec-1".to_string(),
            vm_id: "vm-1".to_string(),
            cmd: "echo".to_string(),
            args: vec!["hi".to_string()],
            env: HashMap::new(),
            exit_code: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            started_at: "2026-01-01T00:00:00Z".to_string(),
            ended_at: None,
            duration_ms: None,
        };
        assert!(!exec.is_complete());
    }

    #[test]
    fn completed_execution_roundtrips() {
        let exec = Execution {
            id: "exec-1".to_string(),
            vm_id: "vm-1".to_string(),
            cmd: "echo".to_string(),
            args: vec!["hi".to_string()],
            env: HashMap::new(),
            exit_code: Some(0),
            stdout: b"hi\n".to_vec(),
            stderr: Vec::new(),
            started_at: "2026-01-01T00:00:00Z".to_string(),
            ended_at: Some("2026-01-01T00:00:01Z".to_string()),
            duration_ms: Some(1000),
        };
        assert!(exec.is_complete());
        let json = serde_json::to_string(&exec).unwrap();
        let parsed: Execution = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.exit_code, Some(0));
        assert_eq!(parsed.stdout, b"hi\n");
    }
}
