//! # Vigil Runtime
//!
//! Resilience and caching substrate for the Vigil authentication core.
//!
//! This crate has no knowledge of the authentication domain. It provides the
//! building blocks the request path leans on when a downstream dependency is
//! slow, flaky, or down:
//!
//! - [`circuit_breaker`]: a three-state gate (CLOSED / OPEN / HALF_OPEN) that
//!   short-circuits calls to a failing dependency to bound blast radius
//! - [`retry`]: bounded retries with exponential backoff and full jitter
//! - [`single_flight`]: coalescing of concurrent loads for the same key into
//!   a single origin call whose result is shared
//! - [`cache`]: a two-tier cache (in-process LRU with per-entry TTL + a
//!   distributed key-value tier fronted by the circuit breaker)
//!
//! # Example
//!
//! ```rust,ignore
//! use vigil_runtime::cache::{TieredCache, TieredCacheConfig, Loaded};
//!
//! let cache = TieredCache::new(remote_kv, TieredCacheConfig::default());
//! let user = cache
//!     .get_or_load("user:42", Duration::from_secs(30), || async {
//!         Ok(Loaded::Value(load_user().await?))
//!     })
//!     .await?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod cache;
pub mod circuit_breaker;
pub mod retry;
pub mod single_flight;

pub use cache::{DistributedKv, KvError, Loaded, TieredCache, TieredCacheConfig};
pub use circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, State};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use single_flight::SingleFlight;
