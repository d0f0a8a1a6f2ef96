use std::collections::HashMap;

use aeth_channel::framing::write_message;
use aeth_channel::protocol::{Response, StreamDataPayload, StreamExitPayload};
use aeth_core::CoreError;
use tokio::io::{AsyncReadExt, AsyncWrite};

use super::pty;

const CHUNK_SIZE: usize = 4 * 1024;

/// Run `cmd` attached to a PTY, writing one `stream_data` message per chunk
/// read (≤4 KiB, preserving bytes verbatim) and exactly one terminal
/// `stream_exit` (§4.2, §4.4). `cancelled` resolves when the caller's
/// connection closes, at which point the process group is killed and the
/// exit carries `error: "cancelled"`.
pub async fn run<W>(
    writer: &mut W,
    cmd: &str,
    args: &[String],
    env: HashMap<String, String>,
    cancelled: impl std::future::Future<Output = ()>,
) -> Result<(), CoreError>
where
    W: AsyncWrite + Unpin,
{
    let mut handle = pty::spawn(cmd, args, env).map_err(|e| {
        CoreError::with_source(aeth_core::ErrorKind::PreconditionFailed, format!("failed to spawn '{cmd}' under a PTY"), e.into())
    })?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut pending = Vec::new();
    tokio::pin!(cancelled);

    loop {
        tokio::select! {
            biased;
            _ = &mut cancelled => {
                pty::kill_process_group(handle.pid);
                flush_pending(writer, &mut pending).await?;
                let exit = Response::StreamExit {
                    payload: StreamExitPayload { exit_code: -1, error: Some("cancelled".to_string()) },
                };
                write_message(writer, &exit).await?;
                return Ok(());
            }
            read = handle.master_read.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        flush_pending(writer, &mut pending).await?;
                        let exit = Response::StreamExit {
                            payload: StreamExitPayload { exit_code: reap_exit_code(handle.pid), error: None },
                        };
                        write_message(writer, &exit).await?;
                        return Ok(());
                    }
                    Ok(n) => {
                        let text = decode_chunk(&mut pending, &buf[..n]);
                        if !text.is_empty() {
                            let chunk = Response::StreamData {
                                payload: StreamDataPayload { stdout: Some(text), stderr: None },
                            };
                            write_message(writer, &chunk).await?;
                        }
                    }
                    Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                        // PTY master read returns EIO once the slave side is fully closed.
                        flush_pending(writer, &mut pending).await?;
                        let exit = Response::StreamExit {
                            payload: StreamExitPayload { exit_code: reap_exit_code(handle.pid), error: None },
                        };
                        write_message(writer, &exit).await?;
                        return Ok(());
                    }
                    Err(e) => {
                        return Err(CoreError::with_source(aeth_core::ErrorKind::Internal, "PTY read failed", e.into()));
                    }
                }
            }
        }
    }
}

/// Decode as much of `pending ++ new_bytes` as is valid UTF-8, carrying any
/// trailing incomplete multi-byte sequence in `pending` for the next read
/// instead of corrupting it with a per-chunk `from_utf8_lossy` (a multi-byte
/// character can straddle the 4 KiB PTY-read boundary). Genuinely invalid
/// byte sequences (not just truncated ones) are replaced with U+FFFD so a
/// read never stalls on them.
fn decode_chunk(pending: &mut Vec<u8>, new_bytes: &[u8]) -> String {
    pending.extend_from_slice(new_bytes);
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending.as_slice()) {
            Ok(s) => {
                out.push_str(s);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                out.push_str(std::str::from_utf8(&pending[..valid_up_to]).expect("prefix already validated"));
                match e.error_len() {
                    Some(len) => {
                        out.push('\u{FFFD}');
                        pending.drain(..valid_up_to + len);
                    }
                    None => {
                        pending.drain(..valid_up_to);
                        return out;
                    }
                }
            }
        }
    }
}

/// Flush whatever incomplete sequence is still sitting in `pending` when the
/// stream ends, rather than silently dropping it.
async fn flush_pending<W: AsyncWrite + Unpin>(writer: &mut W, pending: &mut Vec<u8>) -> Result<(), CoreError> {
    if pending.is_empty() {
        return Ok(());
    }
    let stdout = String::from_utf8_lossy(pending).into_owned();
    pending.clear();
    let chunk = Response::StreamData { payload: StreamDataPayload { stdout: Some(stdout), stderr: None } };
    write_message(writer, &chunk).await
}

fn reap_exit_code(pid: i32) -> i32 {
    let mut status: i32 = 0;
    unsafe {
        if libc::waitpid(pid, &raw mut status, 0) < 0 {
            return -1;
        }
    }
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        -1
    }
}
