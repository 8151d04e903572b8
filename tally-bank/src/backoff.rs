//! Exponential backoff for aggregator calls.
//!
//! The only retry policy in the system: a rate-limit error is retried after
//! `base_delay * 2^attempt`, anything else propagates immediately. The bound
//! is an attempt count, not wall-clock time.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Errors that can tell the executor they were caused by rate limiting
pub trait Retryable {
    fn is_rate_limited(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before retrying after zero-based `attempt` failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` attempts have been made. Returns the last error.
pub async fn execute<T, E, F, Fut>(policy: &BackoffPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_rate_limited() && attempt + 1 < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "aggregator rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        TooMany,
        Broken,
    }

    impl Retryable for TestError {
        fn is_rate_limited(&self) -> bool {
            matches!(self, TestError::TooMany)
        }
    }

    fn instant(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(max_attempts, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_always_rate_limited_makes_exactly_max_attempts() {
        let calls = AtomicU32::new(0);
        let out: Result<(), TestError> = execute(&instant(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::TooMany) }
        })
        .await;
        assert_eq!(out, Err(TestError::TooMany));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), TestError> = execute(&instant(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Broken) }
        })
        .await;
        assert_eq!(out, Err(TestError::Broken));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_rate_limit() {
        let calls = AtomicU32::new(0);
        let out = execute(&instant(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(TestError::TooMany)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_calls_once() {
        let calls = AtomicU32::new(0);
        let _: Result<(), TestError> = execute(&instant(0), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::TooMany) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_doubles() {
        let p = BackoffPolicy::new(4, Duration::from_millis(250));
        assert_eq!(p.delay_for(0), Duration::from_millis(250));
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_secs(1));
        assert_eq!(p.delay_for(40), Duration::from_millis(250).saturating_mul(u32::MAX));
    }
}
