//! Capped exponential backoff for calls to third-party APIs
//!
//! A step is attempted up to `max_attempts` times. Errors the caller
//! classifies as permanent stop the loop at once; transient errors back off
//! `base_delay * 2^(attempt-1)`, capped at `max_delay`. Shutdown interrupts
//! the wait.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry budget for one pipeline step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Why a retried step gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// Error classified as permanent; not retried
    Permanent { error: E, attempts: u32 },
    /// Every attempt failed with a transient error
    Exhausted { error: E, attempts: u32 },
    /// Shutdown requested while waiting to retry
    Cancelled { attempts: u32 },
}

impl<E: std::fmt::Display> RetryError<E> {
    /// Message suitable for `last_error`
    pub fn describe(&self) -> String {
        match self {
            RetryError::Permanent { error, .. } => error.to_string(),
            RetryError::Exhausted { error, attempts } => {
                format!("{} (gave up after {} attempts)", error, attempts)
            }
            RetryError::Cancelled { attempts } => {
                format!("cancelled after {} attempts", attempts)
            }
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, for a 1-based `attempt`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Run `operation` under this policy
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn run<F, Fut, T, E, C>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        is_transient: C,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        C: Fn(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(operation = operation_name, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if !is_transient(&error) => {
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        error = %error,
                        "Permanent failure, not retrying"
                    );
                    return Err(RetryError::Permanent { error, attempts: attempt });
                }
                Err(error) if attempt >= max_attempts => {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        error = %error,
                        "Retry budget exhausted"
                    );
                    return Err(RetryError::Exhausted { error, attempts: attempt });
                }
                Err(error) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, will retry"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(RetryError::Cancelled { attempts: attempt });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(350));
        assert_eq!(policy.delay_after(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_transient_errors_retried_until_success() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result = fast_policy(5)
            .run("op", &token, |_: &String| true, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err("busy".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result: Result<(), _> = fast_policy(5)
            .run("op", &token, |_: &String| false, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("bad request".to_string()) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Permanent { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let token = CancellationToken::new();

        let result: Result<(), _> = fast_policy(3)
            .run("op", &token, |_: &String| true, |_| async { Err("timeout".to_string()) })
            .await;

        match result {
            Err(err @ RetryError::Exhausted { attempts: 3, .. }) => {
                assert!(err.describe().contains("gave up after 3 attempts"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        token.cancel();

        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        };
        let result: Result<(), _> = policy
            .run("op", &token, |_: &String| true, |_| async { Err("down".to_string()) })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
    }
}
