//! Store implementations for the three persistence tiers.
//!
//! - Session tier (Redis): [`RedisSessionStore`]
//! - Ephemeral tier (Redis): [`RedisChallengeStore`], [`RedisRateLimiter`],
//!   [`RedisKv`] (the distributed half of the cache substrate)
//! - Durable tier (PostgreSQL, behind the `postgres` feature):
//!   `postgres::PostgresUserRepository` and friends

pub mod challenge_redis;
pub mod kv_redis;
pub mod rate_limiter_redis;
pub mod session_redis;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use challenge_redis::RedisChallengeStore;
pub use kv_redis::RedisKv;
pub use rate_limiter_redis::RedisRateLimiter;
pub use session_redis::RedisSessionStore;
