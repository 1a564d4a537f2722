//! Bounded retries with exponential backoff and full jitter.
//!
//! Transient failures from the distributed tier deserve one more chance, but
//! synchronized retries from many tasks produce thundering herds. Every delay
//! is therefore drawn uniformly from `[0, backoff)` (full jitter).
//!
//! # Example
//!
//! ```rust
//! use vigil_runtime::retry::{RetryPolicy, retry_with_backoff};
//!
//! # async fn example() -> Result<(), String> {
//! let result = retry_with_backoff(RetryPolicy::once_with_jitter(), || async {
//!     Ok::<_, String>(42)
//! })
//! .await?;
//! assert_eq!(result, 42);
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy: how many times, and how long to back off between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (0 = no retries).
    pub max_retries: usize,
    /// Backoff before the first retry.
    pub initial_delay: Duration,
    /// Cap on the computed backoff.
    pub max_delay: Duration,
    /// Backoff multiplier per retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// The request-path policy: a single retry with a short jittered delay.
    ///
    /// Transient cache/session-store errors are retried at most once;
    /// persistent failure is surfaced to the caller.
    #[must_use]
    pub const fn once_with_jitter() -> Self {
        Self {
            max_retries: 1,
            initial_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(250),
            multiplier: 2.0,
        }
    }

    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
        }
    }

    /// Upper bound of the backoff for a given retry attempt (0-based).
    ///
    /// The actual sleep is drawn uniformly from `[0, bound)`.
    #[must_use]
    pub fn backoff_bound(&self, attempt: usize) -> Duration {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bound_ms = (self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt as i32)) as u64;
        Duration::from_millis(bound_ms).min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<usize>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Set the maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the backoff before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set the backoff cap.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
        }
    }
}

/// Retry an async operation with exponential backoff and full jitter.
///
/// Returns the first `Ok`, or the last error once retries are exhausted.
///
/// # Errors
///
/// Returns the operation's final error after `max_retries` retries.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let bound = policy.backoff_bound(attempt);
                #[allow(clippy::cast_possible_truncation)]
                let bound_ms = bound.as_millis() as u64;
                let delay_ms = if bound_ms == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..bound_ms)
                };
                let delay = Duration::from_millis(delay_ms);
                tracing::debug!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms,
                    "retrying after transient failure"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let result = retry_with_backoff(RetryPolicy::default(), move || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let result = retry_with_backoff(RetryPolicy::once_with_jitter(), move || {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("transient")
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let result: Result<i32, _> =
            retry_with_backoff(RetryPolicy::once_with_jitter(), move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("persistent")
                }
            })
            .await;
        assert_eq!(result, Err("persistent"));
        // One initial attempt + one retry, never more.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_bound_grows_and_caps() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(350))
            .multiplier(2.0)
            .build();
        assert_eq!(policy.backoff_bound(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_bound(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_bound(2), Duration::from_millis(350));
        assert_eq!(policy.backoff_bound(10), Duration::from_millis(350));
    }
}
