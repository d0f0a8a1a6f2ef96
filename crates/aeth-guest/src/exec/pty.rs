use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::unistd::dup;

/// Handle to a process spawned attached to a PTY (§4.2 `execute_stream`).
pub struct PtyHandle {
    pub pid: i32,
    /// Child's stdout+stderr merged into a single PTY stream.
    pub master_read: tokio::fs::File,
    _master_fd: OwnedFd,
}

const DEFAULT_WINSIZE: Winsize = Winsize { ws_row: 24, ws_col: 80, ws_xpixel: 0, ws_ypixel: 0 };

/// Spawn `cmd` attached to a fresh PTY. The child gets a new session
/// (`setsid`) with the PTY slave as its controlling terminal (`TIOCSCTTY`),
/// so ANSI escape sequences and job-control signals behave as they would
/// in an interactive shell.
pub fn spawn(cmd: &str, args: &[String], env: HashMap<String, String>) -> io::Result<PtyHandle> {
    let OpenptyResult { master, slave } =
        openpty(Some(&DEFAULT_WINSIZE), None).map_err(|e| io::Error::other(format!("openpty: {e}")))?;

    let slave_raw_fd = slave.as_raw_fd();

    let slave_stdin = dup_fd(&slave, "stdin")?;
    let slave_stdout = dup_fd(&slave, "stdout")?;
    let slave_stderr = dup_fd(&slave, "stderr")?;

    let mut command = Command::new(cmd);
    command.args(args);
    command.envs(env);

    unsafe {
        command.stdin(Stdio::from_raw_fd(slave_stdin.into_raw_fd()));
        command.stdout(Stdio::from_raw_fd(slave_stdout.into_raw_fd()));
        command.stderr(Stdio::from_raw_fd(slave_stderr.into_raw_fd()));
    }

    unsafe {
        command.pre_exec(move || {
            nix::unistd::setsid().map_err(io::Error::other)?;
            if libc::ioctl(slave_raw_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    #[allow(clippy::cast_possible_wrap)]
    let pid = child.id() as i32;

    // The child has its own copies of the slave fds after fork; drop ours.
    drop(slave);

    let read_fd = dup_fd(&master, "master_read")?;
    let master_read = tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(read_fd.into_raw_fd()) });

    Ok(PtyHandle { pid, master_read, _master_fd: master })
}

/// Terminate the process group rooted at `pid` (§4.4 cancellation:
/// "child processes spawned via C4 are terminated (process group SIGKILL)").
pub fn kill_process_group(pid: i32) {
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

fn dup_fd(fd: &OwnedFd, label: &str) -> io::Result<OwnedFd> {
    dup(fd).map_err(|e| io::Error::other(format!("dup {label}: {e}")))
}
