use std::sync::Arc;

use aeth_channel::framing::{read_message, write_message};
use aeth_channel::protocol::{ExecResultPayload, Request, Response};
use aeth_channel::{Listener, Transport};
use aeth_core::config::DEFAULT_EXEC_TIMEOUT;
use tokio::io::{AsyncReadExt, BufReader};
use tracing::{error, info, warn};

use crate::exec;
use crate::idle::ActivityClock;
use crate::secrets::SecretStore;

/// Accept loop: one task per connection (§4.2).
pub async fn serve(listener: Listener, secrets: Arc<SecretStore>, clock: Arc<ActivityClock>) {
    loop {
        match listener.accept().await {
            Ok(transport) => {
                let secrets = secrets.clone();
                let clock = clock.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(transport, secrets, clock).await {
                        warn!(error = %e, "connection ended with an error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "accept failed");
                return;
            }
        }
    }
}

async fn handle_connection(
    transport: Transport,
    secrets: Arc<SecretStore>,
    clock: Arc<ActivityClock>,
) -> Result<(), aeth_core::CoreError> {
    let (read_half, mut writer) = tokio::io::split(transport);
    let mut reader = BufReader::new(read_half);

    loop {
        match read_message::<_, Request>(&mut reader).await? {
            Some(Request::Execute(payload)) => {
                clock.touch();
                let env = secrets.overlay_onto(payload.env);
                let deadline = payload.timeout_ms.map(std::time::Duration::from_millis).unwrap_or(DEFAULT_EXEC_TIMEOUT);

                let resp = match tokio::time::timeout(deadline, exec::sync::run(&payload.cmd, &payload.args, env)).await {
                    Ok(Ok(result)) => Response::ExecResult { payload: result },
                    Ok(Err(e)) => Response::Error { error: e.to_string() },
                    Err(_) => Response::ExecResult {
                        payload: ExecResultPayload { exit_code: -1, stdout: String::new(), stderr: format!("deadline of {deadline:?} exceeded") },
                    },
                };
                write_message(&mut writer, &resp).await?;
            }
            Some(Request::ExecuteStream(payload)) => {
                clock.touch();
                let env = secrets.overlay_onto(payload.env);

                // The connection closing mid-stream is the caller's cancellation
                // signal (§4.4): poll the same reader for EOF concurrently with
                // streaming output out the writer half.
                let cancelled = async {
                    let mut probe = [0u8; 1];
                    loop {
                        match reader.read(&mut probe).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => continue,
                        }
                    }
                };

                exec::stream::run(&mut writer, &payload.cmd, &payload.args, env, cancelled).await?;
                return Ok(());
            }
            Some(Request::GetSecrets) => {
                write_message(&mut writer, &Response::Error { error: "get_secrets is only valid on the reverse boot connection".to_string() }).await?;
            }
            Some(Request::Shutdown) => {
                info!("shutdown requested over command channel");
                return Ok(());
            }
            None => return Ok(()),
        }
    }
}
