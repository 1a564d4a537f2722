//! Redis implementation of the distributed cache tier.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use vigil_runtime::cache::{DistributedKv, KvError};

/// Redis-backed [`DistributedKv`] with connection pooling via
/// `ConnectionManager`.
///
/// Keys are namespaced under `auth:cache:` to avoid collisions on shared
/// Redis instances.
#[derive(Clone)]
pub struct RedisKv {
    conn_manager: ConnectionManager,
}

impl RedisKv {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::Unavailable`] if the connection fails.
    pub async fn new(redis_url: &str) -> Result<Self, KvError> {
        let client = Client::open(redis_url)
            .map_err(|e| KvError::Unavailable(format!("redis client: {e}")))?;
        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| KvError::Unavailable(format!("redis connection: {e}")))?;
        Ok(Self { conn_manager })
    }

    fn cache_key(key: &str) -> String {
        format!("auth:cache:{key}")
    }
}

impl DistributedKv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.conn_manager.clone();
        conn.get(Self::cache_key(key))
            .await
            .map_err(|e| KvError::Unavailable(format!("redis get: {e}")))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn_manager.clone();
        let ttl_seconds = ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(Self::cache_key(key), value, ttl_seconds)
            .await
            .map_err(|e| KvError::Unavailable(format!("redis set: {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(Self::cache_key(key))
            .await
            .map_err(|e| KvError::Unavailable(format!("redis del: {e}")))?;
        Ok(())
    }
}
