//! Bounded exponential-backoff retries for fallible async operations.

use std::future::Future;
use std::time::Duration;

use crate::transport::TransportError;

/// Classification consulted by [`with_retry`].
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        TransportError::is_retryable(self)
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `0` behaves like `1`.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_multiplier,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to wait before attempt `attempt` (1-indexed).
    ///
    /// Attempt 1 runs immediately; attempt `n >= 2` waits
    /// `base_delay * backoff_multiplier^(n - 2)`, capped at `max_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        // A multiplier below 1 would shrink delays; clamp so they never decrease.
        let multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            1.0
        };
        let exp = multiplier.powi((attempt - 2).min(i32::MAX as u32) as i32);
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (base_ms * exp).min(max_ms);
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// Diagnostics for one upcoming retry. Lives only for the observer call.
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// The attempt that just failed (1-indexed).
    pub attempt_number: u32,
    pub last_error: &'a E,
    /// How long the retry loop will sleep before the next attempt.
    pub next_delay: Duration,
}

/// Run `operation` under `policy`.
///
/// `operation` receives the 1-indexed attempt number. Non-retryable errors
/// return immediately; when attempts run out the last error is returned as
/// is. `observer` is called before every retry and cannot influence it.
pub async fn with_retry<T, E, F, Fut, O>(
    policy: &RetryPolicy,
    mut observer: O,
    mut operation: F,
) -> Result<T, E>
where
    E: Retryable,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    O: FnMut(&RetryAttempt<'_, E>),
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !error.is_retryable() || !policy.should_retry(attempt) {
                    return Err(error);
                }
                let next_delay = policy.delay_before(attempt + 1);
                observer(&RetryAttempt {
                    attempt_number: attempt,
                    last_error: &error,
                    next_delay,
                });
                tokio::time::sleep(next_delay).await;
                attempt += 1;
            }
        }
    }
}

/// [`with_retry`] with an observer that logs each retry at `warn`.
pub async fn with_retry_logged<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    operation: F,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts;
    with_retry(
        policy,
        |retry: &RetryAttempt<'_, E>| {
            tracing::warn!(
                operation = label,
                attempt = retry.attempt_number,
                max_attempts,
                delay_ms = retry.next_delay.as_millis() as u64,
                error = %retry.last_error,
                "retrying after failure"
            );
        },
        operation,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Flaky,
        Fatal,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Flaky)
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_attempts, Duration::from_millis(100), 2.0)
    }

    #[test]
    fn delays_grow_from_the_base() {
        let p = policy(5);
        assert_eq!(p.delay_before(1), Duration::ZERO);
        assert_eq!(p.delay_before(2), Duration::from_millis(100));
        assert_eq!(p.delay_before(3), Duration::from_millis(200));
        assert_eq!(p.delay_before(4), Duration::from_millis(400));
    }

    #[test]
    fn delays_are_capped() {
        let p = policy(20).with_max_delay(Duration::from_millis(250));
        assert_eq!(p.delay_before(10), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&policy(5), |_: &RetryAttempt<'_, TestError>| {}, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Fatal) }
        })
        .await;

        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_error_is_returned_unchanged() {
        let result: Result<(), TransportError> =
            with_retry_logged(&policy(2), "test", |attempt| async move {
                Err(TransportError::Server {
                    status: 500 + attempt as u16,
                    message: format!("attempt {attempt}"),
                })
            })
            .await;

        assert_eq!(
            result,
            Err(TransportError::Server { status: 502, message: "attempt 2".into() })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_every_retry() {
        let mut seen = Vec::new();
        let result = with_retry(
            &policy(3),
            |retry: &RetryAttempt<'_, TestError>| seen.push((retry.attempt_number, retry.next_delay)),
            |attempt| async move {
                if attempt < 3 { Err(TestError::Flaky) } else { Ok(attempt) }
            },
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(
            seen,
            vec![(1, Duration::from_millis(100)), (2, Duration::from_millis(200))]
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]

        #[test]
        fn attempts_match_failures_and_delays_never_shrink(
            max_attempts in 1u32..8,
            failures in 0u32..10,
            base_ms in 1u64..500,
            multiplier in 1.0f64..3.0,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let policy = RetryPolicy::exponential(max_attempts, Duration::from_millis(base_ms), multiplier);
            let calls = AtomicU32::new(0);
            let mut delays = Vec::new();

            let _ = runtime.block_on(with_retry(
                &policy,
                |retry: &RetryAttempt<'_, TestError>| delays.push(retry.next_delay),
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt <= failures { Err(TestError::Flaky) } else { Ok(()) }
                    }
                },
            ));

            prop_assert_eq!(calls.load(Ordering::SeqCst), (failures + 1).min(max_attempts));
            prop_assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
