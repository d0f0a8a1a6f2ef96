use aeth_core::config::MAX_FRAME_BYTES;
use aeth_core::CoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Read one newline-terminated JSON message (§4.4). Returns `Ok(None)` on a
/// clean EOF with nothing buffered (the peer closed the connection).
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, CoreError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = Vec::new();
    let n = reader
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| CoreError::with_source(aeth_core::ErrorKind::Unavailable, "channel read failed", e.into()))?;

    if n == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.len() > MAX_FRAME_BYTES {
        return Err(CoreError::resource_exhausted(format!(
            "message of {} bytes exceeds the {}-byte limit",
            line.len(),
            MAX_FRAME_BYTES
        )));
    }

    serde_json::from_slice(&line)
        .map(Some)
        .map_err(|e| CoreError::with_source(aeth_core::ErrorKind::InvalidArg, "malformed channel message", e.into()))
}

/// Serialize and write one newline-terminated JSON message (§4.4).
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), CoreError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut data = serde_json::to_vec(msg)
        .map_err(|e| CoreError::with_source(aeth_core::ErrorKind::Internal, "failed to serialize message", e.into()))?;
    if data.len() > MAX_FRAME_BYTES {
        return Err(CoreError::resource_exhausted(format!(
            "message of {} bytes exceeds the {}-byte limit",
            data.len(),
            MAX_FRAME_BYTES
        )));
    }
    data.push(b'\n');
    writer
        .write_all(&data)
        .await
        .map_err(|e| CoreError::with_source(aeth_core::ErrorKind::Unavailable, "channel write failed", e.into()))?;
    writer
        .flush()
        .await
        .map_err(|e| CoreError::with_source(aeth_core::ErrorKind::Unavailable, "channel flush failed", e.into()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Response};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn writes_then_reads_newline_terminated_message() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Request::Shutdown).await.unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));

        let mut reader = BufReader::new(&buf[..]);
        let msg: Request = read_message(&mut reader).await.unwrap().unwrap();
        assert!(matches!(msg, Request::Shutdown));
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let mut reader = BufReader::new(&b""[..]);
        let msg: Option<Request> = read_message(&mut reader).await.unwrap();
        assert!(msg.is_none());
    }

    #[tokio::test]
    async fn oversized_message_is_rejected_on_write() {
        let huge = Response::ExecResult {
            payload: crate::protocol::ExecResultPayload {
                exit_code: 0,
                stdout: "x".repeat(MAX_FRAME_BYTES + 1),
                stderr: String::new(),
            },
        };
        let mut buf = Vec::new();
        let err = write_message(&mut buf, &huge).await.unwrap_err();
        assert_eq!(err.kind, aeth_core::ErrorKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn two_messages_read_in_order() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Request::GetSecrets).await.unwrap();
        write_message(&mut buf, &Request::Shutdown).await.unwrap();

        let mut reader = BufReader::new(&buf[..]);
        let first: Request = read_message(&mut reader).await.unwrap().unwrap();
        let second: Request = read_message(&mut reader).await.unwrap().unwrap();
        assert!(matches!(first, Request::GetSecrets));
        assert!(matches!(second, Request::Shutdown));
    }
}
