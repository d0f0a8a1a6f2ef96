use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Request sent on the command channel (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Request {
    Execute(ExecutePayload),
    ExecuteStream(StreamPayload),
    /// Agent-to-host only, sent on the reverse connection during boot.
    GetSecrets,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutePayload {
    pub cmd: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPayload {
    pub cmd: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Response sent on the command channel (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    ExecResult {
        payload: ExecResultPayload,
    },
    /// Zero or more per request, carrying one PTY read's worth of bytes.
    StreamData {
        payload: StreamDataPayload,
    },
    /// Exactly one per request, terminating the stream.
    StreamExit {
        payload: StreamExitPayload,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResultPayload {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamDataPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamExitPayload {
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Secrets handed over on the reverse boot connection: a flat name->value
/// map, held in memory only by the receiving guest agent (§4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsPayload(pub HashMap<String, String>);
