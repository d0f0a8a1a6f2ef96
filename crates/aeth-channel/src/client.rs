use std::collections::HashMap;

use aeth_core::config::DEFAULT_EXEC_TIMEOUT;
use aeth_core::CoreError;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadHalf, WriteHalf};

use crate::framing::{read_message, write_message};
use crate::protocol::{ExecResultPayload, ExecutePayload, Request, Response, StreamPayload};
use crate::transport::{self, Transport};

/// One chunk of a streaming execution, emitted in PTY read order (§4.4).
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Stdout(String),
    Stderr(String),
    Exit { exit_code: i32, error: Option<String> },
}

/// Host-side handle to one command-channel connection to a guest agent.
pub struct ChannelClient {
    reader: BufReader<ReadHalf<Transport>>,
    writer: WriteHalf<Transport>,
}

impl ChannelClient {
    pub async fn connect(guest_cid: u32, port: u32, guest_ipv4: &str) -> Result<Self, CoreError> {
        let transport = transport::connect(guest_cid, port, guest_ipv4).await?;
        let (read_half, writer) = tokio::io::split(transport);
        Ok(Self { reader: BufReader::new(read_half), writer })
    }

    /// Run a command to completion and return its captured output (§4.4).
    /// Defaults to the 30s deadline unless `timeout_ms` is set.
    pub async fn execute(
        &mut self,
        cmd: &str,
        args: &[String],
        env: HashMap<String, String>,
        timeout_ms: Option<u64>,
    ) -> Result<ExecResultPayload, CoreError> {
        let req = Request::Execute(ExecutePayload {
            cmd: cmd.to_string(),
            args: args.to_vec(),
            env,
            timeout_ms,
        });
        write_message(&mut self.writer, &req).await?;

        let deadline = timeout_ms.map(std::time::Duration::from_millis).unwrap_or(DEFAULT_EXEC_TIMEOUT);
        let resp = tokio::time::timeout(deadline, read_message::<_, Response>(&mut self.reader))
            .await
            .map_err(|_| CoreError::deadline_exceeded(format!("execute '{cmd}' did not complete within {deadline:?}")))??;

        match resp {
            Some(Response::ExecResult { payload }) => Ok(payload),
            Some(Response::Error { error }) => Err(CoreError::unavailable(error)),
            Some(_) => Err(CoreError::internal("unexpected response to execute")),
            None => Err(CoreError::unavailable("channel closed before exec_result")),
        }
    }

    /// Run a command attached to a guest PTY, invoking `on_chunk` for every
    /// `stream_data`/`stream_exit` message until the stream terminates
    /// (§4.4). Returns the final exit code.
    pub async fn execute_stream<F>(
        &mut self,
        cmd: &str,
        args: &[String],
        env: HashMap<String, String>,
        mut on_chunk: F,
    ) -> Result<i32, CoreError>
    where
        F: FnMut(StreamChunk),
    {
        let req = Request::ExecuteStream(StreamPayload {
            cmd: cmd.to_string(),
            args: args.to_vec(),
            env,
        });
        write_message(&mut self.writer, &req).await?;

        loop {
            // A transport error or a clean EOF both mean the guest agent is
            // gone mid-stream; either way the caller needs a deterministic
            // stream_exit rather than a bare error to complete cleanup (§7).
            match read_message::<_, Response>(&mut self.reader).await {
                Ok(Some(Response::StreamData { payload })) => {
                    if let Some(out) = payload.stdout {
                        on_chunk(StreamChunk::Stdout(out));
                    }
                    if let Some(err) = payload.stderr {
                        on_chunk(StreamChunk::Stderr(err));
                    }
                }
                Ok(Some(Response::StreamExit { payload })) => {
                    on_chunk(StreamChunk::Exit {
                        exit_code: payload.exit_code,
                        error: payload.error.clone(),
                    });
                    return Ok(payload.exit_code);
                }
                Ok(Some(Response::Error { error })) => return Err(CoreError::unavailable(error)),
                Ok(Some(Response::ExecResult { .. })) => {
                    return Err(CoreError::internal("unexpected exec_result on a streaming request"))
                }
                Ok(None) | Err(_) => {
                    on_chunk(StreamChunk::Exit { exit_code: -1, error: Some("agent-disconnected".to_string()) });
                    return Ok(-1);
                }
            }
        }
    }

    /// Request graceful shutdown of the guest agent's idle loop.
    pub async fn shutdown(&mut self) -> Result<(), CoreError> {
        write_message(&mut self.writer, &Request::Shutdown).await
    }

    pub fn into_halves(self) -> (BufReader<ReadHalf<Transport>>, WriteHalf<Transport>) {
        (self.reader, self.writer)
    }
}

// Compile-time assertion that Transport's halves stay Send + AsyncRead/Write,
// which the client's `tokio::io::split` usage depends on.
const _: fn() = || {
    fn assert_impls<T: AsyncRead + AsyncWrite + Send>() {}
    assert_impls::<Transport>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_chunk_exit_carries_error() {
        let chunk = StreamChunk::Exit { exit_code: 1, error: Some("cancelled".to_string()) };
        match chunk {
            StreamChunk::Exit { exit_code, error } => {
                assert_eq!(exit_code, 1);
                assert_eq!(error.as_deref(), Some("cancelled"));
            }
            _ => panic!("wrong variant"),
        }
    }
}
