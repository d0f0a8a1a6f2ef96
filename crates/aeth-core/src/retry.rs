use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{CoreError, ErrorKind};

/// Retry an async fallible operation with exponential backoff.
///
/// Generalizes the synchronous retry helper this lineage uses elsewhere to
/// the async suspension points the engine's components operate under
/// (hypervisor control socket, command channel, registry, broker, store).
///
/// - `max_attempts`: total attempts including the first.
/// - `base_delay`: delay after the first failure, doubled on each subsequent one.
/// - `label`: description used in retry log lines.
pub async fn retry<F, Fut, T>(
    max_attempts: u32,
    base_delay: Duration,
    label: &str,
    mut f: F,
) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let mut delay = base_delay;
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.kind.is_retryable() {
                    return Err(e);
                }
                if attempt < max_attempts {
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{} failed, retrying",
                        label,
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| CoreError::new(ErrorKind::Internal, "retry exhausted with no recorded error")))
}

/// Exponential backoff schedule for the task queue's retry policy (§4.5):
/// base 1s, factor 2, capped at `cap`.
pub fn backoff_delay(retry_count: u32, base: Duration, factor: u32, cap: Duration) -> Duration {
    let mut delay = base;
    for _ in 0..retry_count {
        delay = delay.saturating_mul(factor);
        if delay >= cap {
            return cap;
        }
    }
    delay.min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn succeeds_first_try() {
        let result = retry(3, Duration::from_millis(1), "test", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let count = Cell::new(0);
        let result = retry(3, Duration::from_millis(1), "test", || {
            let c = count.get() + 1;
            count.set(c);
            async move {
                if c < 3 {
                    Err(CoreError::unavailable("not yet"))
                } else {
                    Ok(c)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn non_retryable_kind_stops_immediately() {
        let count = Cell::new(0);
        let result: Result<i32, CoreError> = retry(5, Duration::from_millis(1), "test", || {
            count.set(count.get() + 1);
            async { Err(CoreError::precondition_failed("nope")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn backoff_schedule_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(300);
        assert_eq!(backoff_delay(0, base, 2, cap), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, base, 2, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, base, 2, cap), Duration::from_secs(4));
        assert_eq!(backoff_delay(20, base, 2, cap), cap);
    }
}
