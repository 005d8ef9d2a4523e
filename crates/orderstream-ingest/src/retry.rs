//! Bounded exponential backoff for insert calls
//!
//! The delay before retry `k` (0-based) is `min(base * 2^k, max)`, so a call
//! never sleeps longer than `max_retries * max_delay` in total. Whether an
//! error is worth retrying is decided by the caller's predicate; everything
//! else is returned after the first attempt.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

/// Why a retried operation gave up
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Attempts made, including the first
    pub attempts: u32,
    /// True when the error was retryable but the retry budget ran out
    pub exhausted: bool,
    /// Total time spent sleeping between attempts
    pub slept: Duration,
    pub error: E,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Sleep before retry number `retry`
    pub fn delay_for(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Upper bound of the total sleep of one call
    pub fn max_total_delay(&self) -> Duration {
        self.max_delay.saturating_mul(self.max_retries)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the budget runs out
    pub async fn run<T, E, F, Fut, P>(
        &self,
        operation: &str,
        is_retryable: P,
        mut op: F,
    ) -> Result<T, RetryFailure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut retry = 0u32;
        let mut slept = Duration::ZERO;

        loop {
            let attempt = retry + 1;
            match op().await {
                Ok(value) => {
                    if retry > 0 {
                        info!(operation, attempt, "Succeeded after backpressure");
                    }
                    return Ok(value);
                },
                Err(e) if !is_retryable(&e) => {
                    return Err(RetryFailure {
                        attempts: attempt,
                        exhausted: false,
                        slept,
                        error: e,
                    });
                },
                Err(e) if retry >= self.max_retries => {
                    error!(
                        operation,
                        attempts = attempt,
                        error = %e,
                        "Giving up after exhausting retries"
                    );
                    return Err(RetryFailure {
                        attempts: attempt,
                        exhausted: true,
                        slept,
                        error: e,
                    });
                },
                Err(e) => {
                    let delay = self.delay_for(retry);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Backpressure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    slept += delay;
                    retry += 1;
                },
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Busy,
        Fatal,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn is_busy(e: &TestError) -> bool {
        *e == TestError::Busy
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = RetryPolicy::new(6, Duration::from_millis(100), Duration::from_millis(1_000));
        let delays: Vec<u64> = (0..6).map(|k| policy.delay_for(k).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(policy.delay_for(40), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_backpressure() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(50));

        let result = policy
            .run("insert", is_busy, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Busy)
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let failure = policy
            .run("insert", is_busy, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::Fatal)
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.attempts, 1);
        assert!(!failure.exhausted);
        assert_eq!(failure.slept, Duration::ZERO);
        assert_eq!(failure.error, TestError::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_bounds_attempts_and_sleep() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(2));
        let started = tokio::time::Instant::now();

        let failure = policy
            .run("insert", is_busy, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::Busy)
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(failure.attempts, 4);
        assert!(failure.exhausted);
        // 1s + 2s + 2s
        assert_eq!(failure.slept, Duration::from_secs(5));
        assert!(started.elapsed() <= policy.max_total_delay());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_means_single_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(0, Duration::from_secs(1), Duration::from_secs(1));

        let failure = policy
            .run("insert", is_busy, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::Busy)
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(failure.exhausted);
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_cap(
            base_ms in 1u64..5_000,
            extra_ms in 0u64..60_000,
            retry in 0u32..64,
        ) {
            let policy = RetryPolicy::new(
                10,
                Duration::from_millis(base_ms),
                Duration::from_millis(base_ms + extra_ms),
            );
            let delay = policy.delay_for(retry);
            prop_assert!(delay <= policy.max_delay());
            prop_assert!(delay >= policy.base_delay());
        }
    }
}
