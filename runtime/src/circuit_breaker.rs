//! Circuit breaker for bounding the blast radius of a failing dependency.
//!
//! The breaker fronts every call to the distributed tier. It counts
//! consecutive *unexpected* failures; once the threshold is reached the
//! circuit opens and calls short-circuit without touching the dependency.
//! After `recovery_timeout` a single probe is allowed through (HALF_OPEN);
//! the first success closes the circuit, the first failure re-opens it and
//! resets the timer.
//!
//! # States
//!
//! - **Closed**: normal operation, failures are counted.
//! - **Open**: calls fail immediately with [`BreakerError::Open`].
//! - **HalfOpen**: one probe in flight; its outcome decides the next state.
//!
//! An *expected* error (e.g. key-not-found from a KV store) never counts as
//! a failure; callers classify via [`CircuitBreaker::call_classified`].
//!
//! # Example
//!
//! ```rust
//! use vigil_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::builder()
//!         .failure_threshold(5)
//!         .recovery_timeout(Duration::from_secs(30))
//!         .build(),
//! );
//!
//! let result = breaker.call(|| async { Ok::<_, String>(42) }).await;
//! assert!(result.is_ok());
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive unexpected failures before the circuit opens.
    pub failure_threshold: usize,
    /// Time to wait in Open before allowing a probe (HALF_OPEN).
    pub recovery_timeout: Duration,
    /// Failures older than this no longer count toward the threshold.
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            recovery_timeout: None,
            monitoring_period: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    recovery_timeout: Option<Duration>,
    monitoring_period: Option<Duration>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the number of consecutive failures that opens the circuit.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set how long to stay Open before probing.
    #[must_use]
    pub const fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = Some(timeout);
        self
    }

    /// Set the window within which failures count toward the threshold.
    #[must_use]
    pub const fn monitoring_period(mut self, period: Duration) -> Self {
        self.monitoring_period = Some(period);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            recovery_timeout: self.recovery_timeout.unwrap_or(defaults.recovery_timeout),
            monitoring_period: self.monitoring_period.unwrap_or(defaults.monitoring_period),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Requests pass through; failures are counted.
    Closed,
    /// Requests fail immediately.
    Open,
    /// One probe allowed; its outcome decides the next state.
    HalfOpen,
}

/// Errors from calls made through the breaker.
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// Circuit is open; the dependency was not called.
    #[error("circuit breaker is open")]
    Open,
    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Unwrap to the inner error, if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Open => None,
            Self::Inner(e) => Some(e),
        }
    }
}

/// Mutable breaker record: state + counters + next-attempt instant.
#[derive(Debug)]
struct BreakerRecord {
    state: State,
    consecutive_failures: usize,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    /// A probe is in flight (HALF_OPEN admits exactly one).
    probe_in_flight: bool,
}

/// Three-state circuit breaker with expected-error classification.
///
/// Cloning is cheap; clones share the same state record and metrics.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    record: Arc<RwLock<BreakerRecord>>,
    total_calls: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a new breaker in the Closed state.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            record: Arc::new(RwLock::new(BreakerRecord {
                state: State::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                opened_at: None,
                probe_in_flight: false,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current state of the breaker.
    pub async fn state(&self) -> State {
        self.record.read().await.state
    }

    /// Call an operation through the breaker. Every error counts as a failure.
    ///
    /// # Errors
    ///
    /// [`BreakerError::Open`] if the circuit is open,
    /// [`BreakerError::Inner`] if the operation itself failed.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.call_classified(operation, |_| false).await
    }

    /// Call an operation, classifying errors as expected or not.
    ///
    /// Expected errors (`is_expected` returns `true`) are returned to the
    /// caller but never counted toward the failure threshold.
    ///
    /// # Errors
    ///
    /// [`BreakerError::Open`] if the circuit is open,
    /// [`BreakerError::Inner`] if the operation itself failed.
    pub async fn call_classified<F, Fut, T, E, C>(
        &self,
        operation: F,
        is_expected: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if !self.admit().await {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(BreakerError::Open);
        }

        match operation().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(err) => {
                if is_expected(&err) {
                    // An expected error is a successful round-trip as far as
                    // the dependency's health is concerned.
                    self.on_success().await;
                } else {
                    self.total_failures.fetch_add(1, Ordering::Relaxed);
                    self.on_failure().await;
                }
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Decide whether a call may proceed, transitioning Open → HalfOpen
    /// when the recovery timeout has elapsed.
    async fn admit(&self) -> bool {
        let mut record = self.record.write().await;
        match record.state {
            State::Closed => true,
            State::HalfOpen => {
                // Exactly one probe at a time.
                if record.probe_in_flight {
                    false
                } else {
                    record.probe_in_flight = true;
                    true
                }
            }
            State::Open => {
                let elapsed = record.opened_at.map(|t| t.elapsed());
                if elapsed.is_some_and(|e| e >= self.config.recovery_timeout) {
                    tracing::info!("circuit breaker OPEN -> HALF_OPEN");
                    record.state = State::HalfOpen;
                    record.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut record = self.record.write().await;
        match record.state {
            State::Closed => {
                record.consecutive_failures = 0;
                record.last_failure_at = None;
            }
            State::HalfOpen => {
                // First success closes the circuit.
                tracing::info!("circuit breaker HALF_OPEN -> CLOSED");
                record.state = State::Closed;
                record.consecutive_failures = 0;
                record.last_failure_at = None;
                record.opened_at = None;
                record.probe_in_flight = false;
            }
            State::Open => {}
        }
    }

    async fn on_failure(&self) {
        let mut record = self.record.write().await;
        let now = Instant::now();

        match record.state {
            State::Closed => {
                // Failures outside the monitoring period no longer count.
                let stale = record
                    .last_failure_at
                    .is_some_and(|t| now.duration_since(t) > self.config.monitoring_period);
                if stale {
                    record.consecutive_failures = 0;
                }
                record.consecutive_failures += 1;
                record.last_failure_at = Some(now);

                if record.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = record.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker CLOSED -> OPEN"
                    );
                    record.state = State::Open;
                    record.opened_at = Some(now);
                }
            }
            State::HalfOpen => {
                // First probe failure re-opens and resets the timer.
                tracing::warn!("circuit breaker HALF_OPEN -> OPEN (probe failed)");
                record.state = State::Open;
                record.opened_at = Some(now);
                record.last_failure_at = Some(now);
                record.consecutive_failures = 1;
                record.probe_in_flight = false;
            }
            State::Open => {
                record.last_failure_at = Some(now);
            }
        }
    }

    /// Breaker metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> BreakerMetrics {
        BreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker back to Closed. For tests and operator tooling.
    pub async fn reset(&self) {
        let mut record = self.record.write().await;
        record.state = State::Closed;
        record.consecutive_failures = 0;
        record.last_failure_at = None;
        record.opened_at = None;
        record.probe_in_flight = false;
    }
}

/// Counters for breaker monitoring.
#[derive(Debug, Clone, Copy)]
pub struct BreakerMetrics {
    /// Calls attempted (including rejected ones).
    pub total_calls: u64,
    /// Calls that reached the dependency and failed unexpectedly.
    pub total_failures: u64,
    /// Calls rejected because the circuit was open.
    pub total_rejections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_config(threshold: usize) -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(threshold)
            .recovery_timeout(Duration::from_millis(50))
            .build()
    }

    #[tokio::test]
    async fn stays_closed_on_success() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        let result = breaker.call(|| async { Ok::<_, String>(42) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold() {
        let breaker = CircuitBreaker::new(fast_config(3));
        for _ in 0..3 {
            let _ = breaker.call(|| async { Err::<i32, _>("boom") }).await;
        }
        assert_eq!(breaker.state().await, State::Open);
    }

    #[tokio::test]
    async fn expected_errors_never_count() {
        let breaker = CircuitBreaker::new(fast_config(2));
        for _ in 0..10 {
            let result = breaker
                .call_classified(|| async { Err::<i32, _>("not-found") }, |e| *e == "not-found")
                .await;
            assert!(matches!(result, Err(BreakerError::Inner(_))));
        }
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn zero_calls_reach_dependency_while_open() {
        let breaker = CircuitBreaker::new(fast_config(2));
        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<i32, _>("boom") }).await;
        }
        assert_eq!(breaker.state().await, State::Open);

        let reached = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let reached = Arc::clone(&reached);
            let result = breaker
                .call(move || async move {
                    reached.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                })
                .await;
            assert!(matches!(result, Err(BreakerError::Open)));
        }
        assert_eq!(reached.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.metrics().total_rejections, 20);
    }

    #[tokio::test]
    async fn first_success_in_half_open_closes() {
        let breaker = CircuitBreaker::new(fast_config(2));
        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<i32, _>("boom") }).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = breaker.call(|| async { Ok::<_, String>(1) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn probe_failure_reopens_and_resets_timer() {
        let breaker = CircuitBreaker::new(fast_config(2));
        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<i32, _>("boom") }).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        let _ = breaker.call(|| async { Err::<i32, _>("still down") }).await;
        assert_eq!(breaker.state().await, State::Open);

        // Immediately after the failed probe the circuit rejects again.
        let result = breaker.call(|| async { Ok::<_, String>(1) }).await;
        assert!(matches!(result, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn half_open_admits_single_probe() {
        let breaker = CircuitBreaker::new(fast_config(1));
        let _ = breaker.call(|| async { Err::<i32, _>("boom") }).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Hold a probe open, then check a concurrent call is rejected.
        let slow_breaker = breaker.clone();
        let probe = tokio::spawn(async move {
            slow_breaker
                .call(|| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, String>(1)
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let concurrent = breaker.call(|| async { Ok::<_, String>(2) }).await;
        assert!(matches!(concurrent, Err(BreakerError::Open)));

        let probe_result = probe.await.unwrap();
        assert!(probe_result.is_ok());
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new(fast_config(3));
        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<i32, _>("boom") }).await;
        }
        let _ = breaker.call(|| async { Ok::<_, String>(1) }).await;
        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<i32, _>("boom") }).await;
        }
        // 2 + 2 failures with a success between: still closed.
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn reset_closes_the_circuit() {
        let breaker = CircuitBreaker::new(fast_config(1));
        let _ = breaker.call(|| async { Err::<i32, _>("boom") }).await;
        assert_eq!(breaker.state().await, State::Open);
        breaker.reset().await;
        assert_eq!(breaker.state().await, State::Closed);
    }
}
