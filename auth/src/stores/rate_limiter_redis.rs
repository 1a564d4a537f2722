//! Redis-based sliding-window rate limiter with breaker-guarded degradation.
//!
//! # Algorithm
//!
//! Sliding window over a sorted set, in one atomic pipeline:
//!
//! 1. `ZREMRANGEBYSCORE` drops entries outside the window (an entry exactly
//!    on the boundary is dropped — it belongs to the older window)
//! 2. `ZCARD` counts the remaining entries
//! 3. `ZADD` records this request
//! 4. `ZRANGE … WITHSCORES` reads the oldest surviving entry for `reset_at`
//! 5. `EXPIRE` bounds the counter's life to its window
//!
//! Every Redis round-trip goes through a circuit breaker. While the breaker
//! is open (or a call fails), the limiter degrades to an in-process window
//! with a conservative cap (half the configured maximum) instead of
//! blocking the request path on a dead dependency.

use crate::config::RateLimitRule;
use crate::error::{AuthError, Result};
use crate::providers::rate_limiter::{RateDecision, RateLimiter, RouteClass};
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use vigil_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};

/// Redis-backed [`RateLimiter`] with local conservative degradation.
#[derive(Clone)]
pub struct RedisRateLimiter {
    conn_manager: ConnectionManager,
    breaker: CircuitBreaker,
    /// Fallback windows, keyed like the Redis counters.
    local: Arc<Mutex<HashMap<String, VecDeque<i64>>>>,
}

impl RedisRateLimiter {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::DependencyUnavailable`] if the connection fails.
    pub async fn new(redis_url: &str, breaker: CircuitBreakerConfig) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| AuthError::DependencyUnavailable(format!("redis client: {e}")))?;
        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| AuthError::DependencyUnavailable(format!("redis connection: {e}")))?;
        Ok(Self {
            conn_manager,
            breaker: CircuitBreaker::new(breaker),
            local: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// The breaker guarding the distributed counters.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn counter_key(class: RouteClass, key: &str) -> String {
        format!("auth:rl:{}:{key}", class.as_str())
    }

    /// Conservative in-process window used while Redis is unreachable.
    fn local_decision(
        &self,
        counter_key: &str,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> RateDecision {
        let cap = (rule.max_requests / 2).max(1);
        let window_ms = rule.window.num_milliseconds();
        let now_ms = now.timestamp_millis();
        let window_start = now_ms - window_ms;

        let mut windows = match self.local.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entries = windows.entry(counter_key.to_string()).or_default();
        while entries.front().is_some_and(|ts| *ts <= window_start) {
            entries.pop_front();
        }

        let count = entries.len() as u32;
        entries.push_back(now_ms);

        let oldest = entries.front().copied().unwrap_or(now_ms);
        let reset_at = millis_to_datetime(oldest + window_ms, now);
        RateDecision {
            allowed: count < cap,
            remaining: cap.saturating_sub(count + 1),
            reset_at,
        }
    }
}

impl RateLimiter for RedisRateLimiter {
    async fn check_and_record(
        &self,
        class: RouteClass,
        key: &str,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> Result<RateDecision> {
        let counter_key = Self::counter_key(class, key);
        let window_ms = rule.window.num_milliseconds();
        let now_ms = now.timestamp_millis();
        // Boundary entries score <= window_start and are dropped: a request
        // exactly on the boundary counts in the newer window.
        let window_start = now_ms - window_ms;
        #[allow(clippy::cast_possible_truncation)]
        let expire_seconds = (window_ms / 1000).max(1);

        let conn = self.conn_manager.clone();
        let pipeline_key = counter_key.clone();
        let outcome = self
            .breaker
            .call(move || {
                let mut conn = conn;
                async move {
                    let (count, oldest): (u64, Vec<(String, f64)>) = redis::pipe()
                        .atomic()
                        .zrembyscore(&pipeline_key, i64::MIN, window_start)
                        .ignore()
                        .zcard(&pipeline_key)
                        .zadd(&pipeline_key, format!("{now_ms}-{}", uuid::Uuid::new_v4()), now_ms)
                        .ignore()
                        .zrange_withscores(&pipeline_key, 0, 0)
                        .expire(&pipeline_key, expire_seconds)
                        .ignore()
                        .query_async(&mut conn)
                        .await?;
                    Ok::<_, redis::RedisError>((count, oldest))
                }
            })
            .await;

        match outcome {
            Ok((count, oldest)) => {
                #[allow(clippy::cast_possible_truncation)]
                let count = count as u32;
                #[allow(clippy::cast_possible_truncation)]
                let oldest_ms = oldest
                    .first()
                    .map_or(now_ms, |(_, score)| *score as i64);
                let decision = RateDecision {
                    allowed: count < rule.max_requests,
                    remaining: rule.max_requests.saturating_sub(count + 1),
                    reset_at: millis_to_datetime(oldest_ms + window_ms, now),
                };
                if !decision.allowed {
                    tracing::warn!(
                        class = class.as_str(),
                        count,
                        max = rule.max_requests,
                        "rate limit breached"
                    );
                }
                Ok(decision)
            }
            Err(error) => {
                tracing::warn!(
                    class = class.as_str(),
                    %error,
                    "rate limit store unavailable, degrading to local window"
                );
                Ok(self.local_decision(&counter_key, rule, now))
            }
        }
    }

    async fn forget_last(&self, class: RouteClass, key: &str) -> Result<()> {
        let counter_key = Self::counter_key(class, key);
        let conn = self.conn_manager.clone();
        let result = self
            .breaker
            .call(move || {
                let mut conn = conn;
                let counter_key = counter_key;
                async move {
                    let _: () = conn.zremrangebyrank(&counter_key, -1, -1).await?;
                    Ok::<_, redis::RedisError>(())
                }
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(error) => {
                tracing::debug!(%error, "forget_last skipped, store unavailable");
                Ok(())
            }
        }
    }
}

fn millis_to_datetime(millis: i64, fallback: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or(fallback)
}
