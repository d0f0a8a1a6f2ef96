use std::process::{Command, Output};

use aeth_core::CoreError;

/// Run a command on the host, capturing output. Missing `CAP_NET_ADMIN` and
/// similar permission failures surface as `permission-denied` with a
/// remediation hint (§4.1); anything else is `internal`.
pub fn run(cmd: &str, args: &[&str]) -> Result<Output, CoreError> {
    Command::new(cmd).args(args).output().map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            CoreError::permission_denied(format!(
                "'{cmd} {}' was denied; the worker process needs CAP_NET_ADMIN",
                args.join(" ")
            ))
        } else {
            CoreError::with_source(
                aeth_core::ErrorKind::Internal,
                format!("failed to run '{cmd} {}'", args.join(" ")),
                e.into(),
            )
        }
    })
}

/// Run a command, ignoring a non-zero exit (used for idempotent teardown
/// steps where "already gone" is a success, not a failure).
pub fn run_best_effort(cmd: &str, args: &[&str]) {
    let _ = run(cmd, args);
}

/// Run a command and require success, surfacing stderr on failure.
pub fn run_checked(cmd: &str, args: &[&str]) -> Result<Output, CoreError> {
    let output = run(cmd, args)?;
    if !output.status.success() {
        return Err(CoreError::internal(format!(
            "'{cmd} {}' exited {}: {}",
            args.join(" "),
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim(),
        )));
    }
    Ok(output)
}

pub fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}
