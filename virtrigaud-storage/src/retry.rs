//! Network-error retry schedule shared by the HTTP-based drivers.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

/// Default retry budget for network errors.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay per attempt (delay = base * attempt).
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(2);

/// Run `attempt` until it succeeds, fails with a non-retryable error, or
/// the retry budget is exhausted. Only network errors are retried; the
/// delay grows linearly with the attempt number.
pub async fn with_retries<F, Fut, T>(max_retries: u32, base: Duration, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut tries = 0;
    loop {
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && tries < max_retries => {
                tries += 1;
                let delay = base * tries;
                warn!(
                    error = %e,
                    attempt = tries,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after network error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_network_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retries(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StorageError::Network("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_not_found() {
        let calls = AtomicU32::new(0);
        let err = with_retries(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(StorageError::NotFound("gone".into())) }
        })
        .await
        .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_propagates() {
        let err = with_retries(2, Duration::from_millis(1), || async {
            Err::<(), _>(StorageError::Network("down".into()))
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
    }
}
