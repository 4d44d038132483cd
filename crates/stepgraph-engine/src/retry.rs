use std::future::Future;
use std::time::Duration;

use tracing::warn;

use stepgraph_core::config::RetryConfig;
use stepgraph_core::error::{Result, StepgraphError};

/// Bounded retry with quadratic backoff.
///
/// Every failure is retried, whatever its cause. The wait after failed
/// attempt `n` (1-based) is `base_delay * (n + 1)^2`, so the default policy
/// sleeps 4s, then 9s, before giving up after the third attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000))
    }
}

impl RetryPolicy {
    /// `max_attempts` of zero is treated as one.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = (attempt as u64 + 1).pow(2);
        self.base_delay
            .saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX))
    }

    /// Run `operation` until it succeeds or the attempts are used up.
    pub async fn retry<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry_notify(operation, |_, _, _| {}).await
    }

    /// Like [`retry`](Self::retry), calling `on_retry(attempt, backoff, error)`
    /// before each wait.
    pub async fn retry_notify<T, F, Fut, N>(&self, mut operation: F, mut on_retry: N) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        N: FnMut(u32, Duration, &StepgraphError),
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(StepgraphError::RetryExhausted {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    let backoff = self.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying after failure"
                    );
                    on_retry(attempt, backoff, &e);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(2))
    }

    /// Operation that fails `failures` times, then returns the attempt count.
    async fn flaky(counter: &AtomicU32, failures: u32) -> Result<u32> {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= failures {
            Err(StepgraphError::node("flaky", format!("failure {}", n)))
        } else {
            Ok(n)
        }
    }

    #[test]
    fn test_default_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.backoff(1), Duration::from_millis(4000));
        assert_eq!(policy.backoff(2), Duration::from_millis(9000));
        assert_eq!(policy.backoff(3), Duration::from_millis(16000));
    }

    #[test]
    fn test_zero_attempts_normalized() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts(), 1);
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 5,
            base_delay_ms: 10,
        });
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.backoff(1), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let counter = AtomicU32::new(0);
        let result = fast_policy(3).retry(|| flaky(&counter, 0)).await.unwrap();
        assert_eq!(result, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_before_limit() {
        for failures in 0..3 {
            let counter = AtomicU32::new(0);
            let result = fast_policy(3).retry(|| flaky(&counter, failures)).await;
            assert_eq!(result.unwrap(), failures + 1);
            assert_eq!(counter.load(Ordering::SeqCst), failures + 1);
        }
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_error() {
        let policy = fast_policy(3);
        let counter = AtomicU32::new(0);
        let start = Instant::now();

        let err = policy.retry(|| flaky(&counter, 10)).await.unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        match err {
            StepgraphError::RetryExhausted { attempts, message } => {
                assert_eq!(attempts, 3);
                assert!(message.contains("failure 3"), "got {message}");
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        // Waits after attempts 1 and 2 only
        assert!(start.elapsed() >= policy.backoff(1) + policy.backoff(2));
    }

    #[tokio::test]
    async fn test_failing_exactly_max_times_is_exhausted() {
        let counter = AtomicU32::new(0);
        let result = fast_policy(2).retry(|| flaky(&counter, 2)).await;
        assert!(matches!(
            result,
            Err(StepgraphError::RetryExhausted { attempts: 2, .. })
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_notify_called_per_retry() {
        let counter = AtomicU32::new(0);
        let mut notified = Vec::new();
        let _ = fast_policy(3)
            .retry_notify(
                || flaky(&counter, 10),
                |attempt, backoff, _| notified.push((attempt, backoff)),
            )
            .await;
        assert_eq!(
            notified,
            vec![
                (1, Duration::from_millis(8)),
                (2, Duration::from_millis(18)),
            ]
        );
    }
}
