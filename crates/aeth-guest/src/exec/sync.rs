use std::collections::HashMap;

use aeth_channel::protocol::ExecResultPayload;
use aeth_core::CoreError;
use tokio::process::Command;

/// Run `cmd` to completion, buffering stdout/stderr (§4.2, non-streaming
/// `execute`). The caller is responsible for enforcing the deadline.
pub async fn run(cmd: &str, args: &[String], env: HashMap<String, String>) -> Result<ExecResultPayload, CoreError> {
    let output = Command::new(cmd)
        .args(args)
        .envs(env)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            CoreError::with_source(aeth_core::ErrorKind::PreconditionFailed, format!("failed to spawn '{cmd}'"), e.into())
        })?;

    Ok(ExecResultPayload {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
