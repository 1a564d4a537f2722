//! Redis-based challenge store with atomic consumption.
//!
//! # Key layout
//!
//! - `auth:challenge:{id}` → JSON-serialized [`ChallengeRecord`] (JSON, not
//!   bincode, because WebAuthn ceremony state is a `serde_json::Value`)
//! - `auth:challenge:attempts:{id}` → attempt counter
//!
//! Consumption rides on `GETDEL`: exactly one concurrent verification
//! receives the record. Attempt accounting is a guarded `INCR` that only
//! counts while the challenge still exists.

use crate::error::{AuthError, Result};
use crate::providers::challenge_store::{ChallengeRecord, ChallengeStore};
use crate::state::ChallengeId;
use chrono::Duration;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

/// Redis-backed [`ChallengeStore`].
#[derive(Clone)]
pub struct RedisChallengeStore {
    conn_manager: ConnectionManager,
}

impl RedisChallengeStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::DependencyUnavailable`] if the connection fails.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| AuthError::DependencyUnavailable(format!("redis client: {e}")))?;
        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| AuthError::DependencyUnavailable(format!("redis connection: {e}")))?;
        Ok(Self { conn_manager })
    }

    fn challenge_key(challenge_id: ChallengeId) -> String {
        format!("auth:challenge:{}", challenge_id.0)
    }

    fn attempts_key(challenge_id: ChallengeId) -> String {
        format!("auth:challenge:attempts:{}", challenge_id.0)
    }

    fn decode(bytes: &[u8]) -> Result<ChallengeRecord> {
        serde_json::from_slice(bytes).map_err(|e| AuthError::SerializationError(e.to_string()))
    }
}

impl ChallengeStore for RedisChallengeStore {
    async fn put(&self, record: &ChallengeRecord, ttl: Duration) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let bytes =
            serde_json::to_vec(record).map_err(|e| AuthError::SerializationError(e.to_string()))?;
        #[allow(clippy::cast_sign_loss)]
        let ttl_seconds = ttl.num_seconds().max(1) as u64;

        let _: () = conn
            .set_ex(Self::challenge_key(record.challenge_id), bytes, ttl_seconds)
            .await
            .map_err(|e| AuthError::TemporaryFailure(format!("challenge put: {e}")))?;

        tracing::debug!(
            challenge_id = %record.challenge_id.0,
            variant = record.variant.as_str(),
            ttl_seconds,
            "challenge stored"
        );
        Ok(())
    }

    async fn load(&self, challenge_id: ChallengeId) -> Result<Option<ChallengeRecord>> {
        let mut conn = self.conn_manager.clone();
        let bytes: Option<Vec<u8>> = conn
            .get(Self::challenge_key(challenge_id))
            .await
            .map_err(|e| AuthError::TemporaryFailure(format!("challenge get: {e}")))?;
        let Some(bytes) = bytes else { return Ok(None) };

        let mut record = Self::decode(&bytes)?;
        let attempts: Option<u32> = conn
            .get(Self::attempts_key(challenge_id))
            .await
            .map_err(|e| AuthError::TemporaryFailure(format!("attempts get: {e}")))?;
        record.attempts = attempts.unwrap_or(0);
        Ok(Some(record))
    }

    async fn consume(&self, challenge_id: ChallengeId) -> Result<Option<ChallengeRecord>> {
        let mut conn = self.conn_manager.clone();

        // GETDEL: get + delete in one command, so concurrent consumers
        // serialize on the key and exactly one wins.
        let bytes: Option<Vec<u8>> = conn
            .get_del(Self::challenge_key(challenge_id))
            .await
            .map_err(|e| AuthError::TemporaryFailure(format!("challenge consume: {e}")))?;
        let Some(bytes) = bytes else { return Ok(None) };

        let attempts: Option<u32> = conn
            .get_del(Self::attempts_key(challenge_id))
            .await
            .map_err(|e| AuthError::TemporaryFailure(format!("attempts consume: {e}")))?;

        let mut record = Self::decode(&bytes)?;
        record.attempts = attempts.unwrap_or(0);
        tracing::debug!(challenge_id = %challenge_id.0, "challenge consumed");
        Ok(Some(record))
    }

    async fn record_attempt(&self, challenge_id: ChallengeId) -> Result<Option<u32>> {
        let mut conn = self.conn_manager.clone();

        // Guarded INCR: only count while the challenge row still exists,
        // and expire the counter alongside it.
        let script = redis::Script::new(
            r"
            local ttl = redis.call('TTL', KEYS[1])
            if ttl <= 0 then return -1 end
            local attempts = redis.call('INCR', KEYS[2])
            redis.call('EXPIRE', KEYS[2], ttl)
            return attempts
            ",
        );
        let attempts: i64 = script
            .key(Self::challenge_key(challenge_id))
            .key(Self::attempts_key(challenge_id))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AuthError::TemporaryFailure(format!("attempt incr: {e}")))?;

        if attempts < 0 {
            Ok(None)
        } else {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let attempts = attempts as u32;
            Ok(Some(attempts))
        }
    }
}
