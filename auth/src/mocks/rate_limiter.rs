//! Mock sliding-window rate limiter.

use crate::config::RateLimitRule;
use crate::error::Result;
use crate::providers::rate_limiter::{RateDecision, RateLimiter, RouteClass};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// In-memory [`RateLimiter`] with the same boundary semantics as the Redis
/// implementation: an entry exactly on the window boundary belongs to the
/// older window and no longer counts.
#[derive(Debug, Clone, Default)]
pub struct MockRateLimiter {
    windows: Arc<Mutex<HashMap<String, VecDeque<i64>>>>,
}

impl MockRateLimiter {
    /// Create an empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<i64>>> {
        match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl RateLimiter for MockRateLimiter {
    async fn check_and_record(
        &self,
        class: RouteClass,
        key: &str,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> Result<RateDecision> {
        let counter_key = format!("{}:{key}", class.as_str());
        let window_ms = rule.window.num_milliseconds();
        let now_ms = now.timestamp_millis();
        let window_start = now_ms - window_ms;

        let mut windows = self.lock();
        let entries = windows.entry(counter_key).or_default();
        while entries.front().is_some_and(|ts| *ts <= window_start) {
            entries.pop_front();
        }

        #[allow(clippy::cast_possible_truncation)]
        let count = entries.len() as u32;
        entries.push_back(now_ms);

        let oldest = entries.front().copied().unwrap_or(now_ms);
        let reset_at = Utc
            .timestamp_millis_opt(oldest + window_ms)
            .single()
            .unwrap_or(now);

        Ok(RateDecision {
            allowed: count < rule.max_requests,
            remaining: rule.max_requests.saturating_sub(count + 1),
            reset_at,
        })
    }

    async fn forget_last(&self, class: RouteClass, key: &str) -> Result<()> {
        let counter_key = format!("{}:{key}", class.as_str());
        if let Some(entries) = self.lock().get_mut(&counter_key) {
            entries.pop_back();
        }
        Ok(())
    }
}
