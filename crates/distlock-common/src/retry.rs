//! Bounded exponential backoff for transient store failures
//!
//! Only `StoreError::Unavailable` is retried. Any other error is returned
//! to the caller on the first occurrence.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::warn;

use crate::StoreError;

/// Retry policy for store round-trips
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First backoff step
    pub initial_backoff: Duration,
    /// Upper bound for a single backoff step
    pub max_backoff: Duration,
    /// Total time window in which retries are attempted
    pub budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            budget: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_backoff: Duration, max_backoff: Duration, budget: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            budget,
        }
    }

    /// Same backoff steps with a different retry window
    pub fn with_budget(self, budget: Duration) -> Self {
        Self { budget, ..self }
    }

    /// Backoff delay before retry number `attempt` (0-based)
    pub fn backoff_at(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget elapses.
    pub async fn run<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.run_until(op_name, Instant::now() + self.budget, op)
            .await
    }

    /// Run `op` with retries until `deadline`.
    ///
    /// A retry is only scheduled if its backoff ends before the deadline, so
    /// the call returns no later than `deadline` plus one store round-trip.
    pub async fn run_until<T, F, Fut>(
        &self,
        op_name: &str,
        deadline: Instant,
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    let delay = self.backoff_at(attempt);
                    attempt += 1;
                    if Instant::now() + delay >= deadline {
                        return Err(StoreError::Unavailable(format!(
                            "{} failed after {} attempts: {}",
                            op_name, attempt, e
                        )));
                    }
                    warn!(
                        op = op_name,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store call failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use proptest::prelude::*;

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let p = policy();
        assert_eq!(p.backoff_at(0), Duration::from_millis(100));
        assert_eq!(p.backoff_at(1), Duration::from_millis(200));
        assert_eq!(p.backoff_at(2), Duration::from_millis(400));
        assert_eq!(p.backoff_at(3), Duration::from_millis(800));
        assert_eq!(p.backoff_at(10), Duration::from_millis(800));
        assert_eq!(p.backoff_at(u32::MAX), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = policy()
            .run("lease_renew", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(StoreError::Unavailable("connection refused".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = policy()
            .run("lease_renew", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StoreError::LeaseNotFound(1))
                }
            })
            .await;

        assert_eq!(result, Err(StoreError::LeaseNotFound(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_surfaces_unavailable() {
        let started = Instant::now();
        let result: Result<(), _> = policy()
            .with_budget(Duration::from_secs(2))
            .run("delete", || async {
                Err(StoreError::Unavailable("partitioned".to_string()))
            })
            .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert!(started.elapsed() <= Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn prop_backoff_is_bounded_and_monotonic(
            initial_ms in 1u64..5_000,
            max_ms in 1u64..60_000,
            attempt in 0u32..64,
        ) {
            let p = RetryPolicy::new(
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
                Duration::from_secs(1),
            );
            let current = p.backoff_at(attempt);
            let next = p.backoff_at(attempt + 1);
            prop_assert!(current <= p.max_backoff);
            prop_assert!(current >= p.initial_backoff.min(p.max_backoff));
            prop_assert!(next >= current);
        }
    }
}
