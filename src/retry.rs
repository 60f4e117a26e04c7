//! Retry with exponential backoff for transient Google API failures.
//!
//! The caller decides which errors are transient and may surface a
//! server-requested delay (`Retry-After`) that raises the computed backoff.

use std::{future::Future, time::Duration};

use tracing::{debug, warn};

use crate::config::RetryConfig;

/// Execute an async operation with retry logic.
///
/// The `operation` closure is called once per attempt. Errors for which
/// `is_retryable` returns true are retried until `max_retries` is exhausted;
/// any other error is returned immediately. `retry_after` may extract a
/// server-requested minimum delay from an error.
///
/// # Example
///
/// ```ignore
/// let written = with_retry_hinted(
///     &config.sheets.retry,
///     "sheets.replace_contents",
///     SyncError::is_retryable,
///     SyncError::retry_after,
///     || writer.replace_contents(&target, &table),
/// ).await?;
/// ```
pub async fn with_retry_hinted<F, Fut, T, E, P, H>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: P,
    retry_after: H,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
    H: Fn(&E) -> Option<Duration>,
{
    if !config.enabled {
        return operation().await;
    }

    let max_attempts = config.max_retries + 1; // +1 for initial attempt
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(error) => {
                if is_retryable(&error) && attempt + 1 < max_attempts {
                    let delay = config.delay_with_hint(attempt, retry_after(&error));
                    warn!(
                        operation = operation_name,
                        error = %error,
                        attempt = attempt + 1,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retryable error, will retry after delay"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                if attempt > 0 {
                    warn!(
                        operation = operation_name,
                        error = %error,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts"
                    );
                }

                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            enabled: true,
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 10,
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt() {
        let attempt_count = AtomicU32::new(0);

        let result: Result<i32, String> = with_retry_hinted(
            &fast_config(3),
            "test_op",
            |_| true,
            |_| None,
            || {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_retry() {
        let attempt_count = AtomicU32::new(0);

        let result: Result<i32, String> = with_retry_hinted(
            &fast_config(3),
            "test_op",
            |_| true,
            |_| None,
            || {
                let count = attempt_count.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count < 2 {
                        Err("transient error".to_string())
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempt_count = AtomicU32::new(0);

        let result: Result<i32, String> = with_retry_hinted(
            &fast_config(2),
            "test_op",
            |_| true,
            |_| None,
            || {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent error".to_string()) }
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), "permanent error");
        // max_retries=2 means 3 total attempts (initial + 2 retries)
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_non_retryable_error() {
        let attempt_count = AtomicU32::new(0);

        let result: Result<i32, String> = with_retry_hinted(
            &fast_config(3),
            "test_op",
            |e: &String| !e.contains("permanent"),
            |_| None,
            || {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent failure".to_string()) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_disabled() {
        let attempt_count = AtomicU32::new(0);
        let config = RetryConfig {
            enabled: false,
            ..fast_config(3)
        };

        let result: Result<i32, String> = with_retry_hinted(
            &config,
            "test_op",
            |_| true,
            |_| None,
            || {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                async { Err("transient".to_string()) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_honoured() {
        let config = RetryConfig {
            max_delay_ms: 5_000,
            ..fast_config(1)
        };
        let attempt_count = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<i32, String> = with_retry_hinted(
            &config,
            "test_op",
            |_| true,
            |_| Some(Duration::from_secs(2)),
            || {
                let count = attempt_count.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count == 0 {
                        Err("rate limited".to_string())
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
