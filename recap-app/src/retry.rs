//! Bounded retry with capped exponential backoff.

use futures_util::future::BoxFuture;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// The error that ended a retried operation and how many attempts were made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<E> {
    pub error: E,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Delay before the attempt after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 1_u32 << attempt.saturating_sub(1).min(10);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// Attempts are boxed so the retry loop stays `Send` whatever the op borrows.
    pub async fn run<'a, T, E, F>(
        &self,
        operation: &'static str,
        mut op: F,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<T, Attempted<E>>
    where
        F: FnMut(u32) -> BoxFuture<'a, Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_attempts && is_transient(&error) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        %error,
                        attempt,
                        max_attempts = self.max_attempts,
                        ?delay,
                        "transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(Attempted {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy::new(retries, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(500), Duration::from_millis(8000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(6), Duration::from_millis(8000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(8000));
    }

    #[tokio::test]
    async fn transient_errors_retry_until_success() {
        let calls = &AtomicU32::new(0);
        let value = policy(2)
            .run(
                "test",
                move |_| {
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        if n < 3 { Err("flaky") } else { Ok(n) }
                    }
                    .boxed()
                },
                |_| true,
            )
            .await
            .expect("third attempt should succeed");
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempt_count() {
        let err = policy(2)
            .run("test", |_| async { Err::<(), _>("down") }.boxed(), |_| true)
            .await
            .expect_err("always failing op should exhaust");
        assert_eq!(err.attempts, 3);
        assert_eq!(err.error, "down");
    }

    #[tokio::test]
    async fn definitive_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let err = policy(2)
            .run(
                "test",
                move |_| {
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>("rejected")
                    }
                    .boxed()
                },
                |_| false,
            )
            .await
            .expect_err("definitive error should surface");
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retried_borrowing_ops_can_be_spawned() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handle = tokio::spawn(async move {
            let calls = counter.as_ref();
            policy(1)
                .run(
                    "spawned",
                    move |attempt| {
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            if attempt < 2 { Err("flaky") } else { Ok(attempt) }
                        }
                        .boxed()
                    },
                    |_| true,
                )
                .await
        });
        let value = handle
            .await
            .expect("task joins")
            .expect("second attempt succeeds");
        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
