//! Two-tier cache: in-process LRU + distributed KV behind a circuit breaker.
//!
//! Reads try the local tier, then the distributed tier, then the origin (a
//! loader closure). Writes populate both tiers. The distributed tier is
//! authoritative for invalidation; peers drop their local entries when they
//! receive a *signed* invalidation broadcast.
//!
//! Resilience:
//!
//! - every distributed call goes through the [`CircuitBreaker`]; while the
//!   circuit is open, reads degrade to local-tier-plus-origin and writes
//!   become local-only (the request proceeds, degraded)
//! - concurrent misses for one key coalesce into a single origin call
//!   ([`SingleFlight`])
//! - a loader failure is never cached; a loader may explicitly return
//!   [`Loaded::Negative`] to cache the absence of a value
//!
//! Values cross the wire as `bincode` bytes with a one-byte tag
//! distinguishing real values from negative-cache markers.

use crate::circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig};
use crate::single_flight::SingleFlight;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Byte tag for a cached value.
const TAG_VALUE: u8 = 0x01;
/// Byte tag for a negative-cache marker.
const TAG_NEGATIVE: u8 = 0x00;

/// Errors from the distributed KV tier.
///
/// A missing key is *not* an error (`get` returns `None`); these variants
/// cover transport and encoding failures only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    /// The distributed tier could not be reached or answered abnormally.
    #[error("distributed tier unavailable: {0}")]
    Unavailable(String),

    /// A stored payload could not be decoded.
    #[error("corrupt cache payload: {0}")]
    Corrupt(String),
}

impl KvError {
    /// Whether this error is expected and must not trip the breaker.
    ///
    /// Corrupt payloads say nothing about the dependency's health.
    #[must_use]
    pub const fn is_expected(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }
}

/// Distributed key-value tier.
///
/// Implementations are expected to honor per-entry TTLs natively (e.g. Redis
/// `SET … EX`). All operations are breaker-guarded by [`TieredCache`]; an
/// implementation should surface transport failures as
/// [`KvError::Unavailable`] and never block past its own deadline.
pub trait DistributedKv: Send + Sync {
    /// Fetch a value. `None` means the key is absent or expired.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Vec<u8>>, KvError>> + Send;

    /// Store a value with a TTL.
    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<(), KvError>> + Send;

    /// Remove a value. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> impl std::future::Future<Output = Result<(), KvError>> + Send;
}

/// Errors surfaced by [`TieredCache`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// A value failed to encode or decode.
    #[error("cache codec error: {0}")]
    Codec(String),

    /// The origin loader failed.
    #[error("origin load failed: {0}")]
    Origin(String),

    /// An invalidation broadcast carried a bad signature.
    #[error("invalidation broadcast signature invalid")]
    BadSignature,
}

/// Result of an origin load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Loaded<T> {
    /// A real value: cached in both tiers with the read TTL.
    Value(T),
    /// Explicit absence: cached as a negative marker with the negative TTL.
    Negative,
}

/// A signed instruction to drop a key from local tiers.
///
/// Peers verify the HMAC before honoring the drop, so an attacker on the
/// broadcast channel cannot evict entries at will.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InvalidationMsg {
    /// Cache key to drop.
    pub key: String,
    /// HMAC-SHA256 over the key.
    pub mac: Vec<u8>,
}

/// Configuration for [`TieredCache`].
#[derive(Debug, Clone)]
pub struct TieredCacheConfig {
    /// Maximum entries in the local tier.
    pub local_capacity: u64,
    /// TTL for negative-cache markers.
    pub negative_ttl: Duration,
    /// Circuit breaker settings for the distributed tier.
    pub breaker: CircuitBreakerConfig,
    /// Key for signing invalidation broadcasts.
    pub invalidation_key: Vec<u8>,
}

impl Default for TieredCacheConfig {
    fn default() -> Self {
        Self {
            local_capacity: 10_000,
            negative_ttl: Duration::from_secs(30),
            breaker: CircuitBreakerConfig::default(),
            invalidation_key: vec![0u8; 32],
        }
    }
}

/// Local entry: payload plus its own TTL, consulted by the moka expiry policy.
#[derive(Debug, Clone)]
struct LocalEntry {
    bytes: Arc<Vec<u8>>,
    ttl: Duration,
}

struct PerEntryTtl;

impl moka::Expiry<String, LocalEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &LocalEntry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Two-tier cache with breaker-guarded distributed reads and single-flight
/// origin fills.
///
/// Cloning is cheap; clones share both tiers and the breaker.
#[derive(Clone)]
pub struct TieredCache<S: DistributedKv + Clone> {
    local: moka::future::Cache<String, LocalEntry>,
    remote: S,
    breaker: CircuitBreaker,
    flights: SingleFlight<String, Result<Option<Arc<Vec<u8>>>, CacheError>>,
    negative_ttl: Duration,
    invalidation_key: Arc<Vec<u8>>,
}

impl<S: DistributedKv + Clone> TieredCache<S> {
    /// Create a cache over the given distributed tier.
    #[must_use]
    pub fn new(remote: S, config: TieredCacheConfig) -> Self {
        let local = moka::future::Cache::builder()
            .max_capacity(config.local_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            local,
            remote,
            breaker: CircuitBreaker::new(config.breaker),
            flights: SingleFlight::new(),
            negative_ttl: config.negative_ttl,
            invalidation_key: Arc::new(config.invalidation_key),
        }
    }

    /// The breaker guarding the distributed tier.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Read through the tiers, filling from `loader` on a full miss.
    ///
    /// Returns `Ok(None)` when the key is negatively cached or the loader
    /// reported [`Loaded::Negative`].
    ///
    /// # Errors
    ///
    /// [`CacheError::Codec`] on an undecodable payload,
    /// [`CacheError::Origin`] when the loader fails (never cached).
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Loaded<T>, CacheError>>,
    {
        if let Some(entry) = self.local.get(key).await {
            return decode(&entry.bytes);
        }

        let cache = self.clone();
        let owned_key = key.to_string();
        let flight_key = owned_key.clone();
        let bytes = self
            .flights
            .run(flight_key, move || async move {
                cache.load_distributed_then_origin(&owned_key, ttl, loader).await
            })
            .await?;

        match bytes {
            Some(bytes) => decode(&bytes),
            None => Ok(None),
        }
    }

    /// Distributed read, then origin fill. Runs under single-flight.
    async fn load_distributed_then_origin<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<Option<Arc<Vec<u8>>>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Loaded<T>, CacheError>>,
    {
        let remote = self.remote.clone();
        let fetched = self
            .breaker
            .call_classified(|| async move { remote.get(key).await }, KvError::is_expected)
            .await;

        match fetched {
            Ok(Some(bytes)) => {
                let bytes = Arc::new(bytes);
                self.store_local(key, Arc::clone(&bytes), ttl).await;
                return Ok(Some(bytes));
            }
            Ok(None) => {}
            Err(BreakerError::Open) => {
                tracing::debug!(key, "distributed tier open-circuited, treating as miss");
            }
            Err(BreakerError::Inner(err)) => {
                tracing::warn!(key, error = %err, "distributed tier read failed, treating as miss");
            }
        }

        match loader().await? {
            Loaded::Value(value) => {
                let bytes = Arc::new(encode(&value)?);
                self.store_both(key, Arc::clone(&bytes), ttl).await;
                Ok(Some(bytes))
            }
            Loaded::Negative => {
                let bytes = Arc::new(vec![TAG_NEGATIVE]);
                self.store_both(key, Arc::clone(&bytes), self.negative_ttl).await;
                Ok(None)
            }
        }
    }

    /// Write a value to both tiers.
    ///
    /// # Errors
    ///
    /// [`CacheError::Codec`] if the value cannot be encoded. A distributed
    /// write failure is absorbed: the local tier is still populated and the
    /// call succeeds degraded.
    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let bytes = Arc::new(encode(value)?);
        self.store_both(key, bytes, ttl).await;
        Ok(())
    }

    /// Drop a key from both tiers. The distributed delete is authoritative;
    /// the returned broadcast lets peers drop their local copies.
    pub async fn invalidate(&self, key: &str) -> InvalidationMsg {
        self.local.invalidate(key).await;

        let remote = self.remote.clone();
        let owned = key.to_string();
        let result = self
            .breaker
            .call_classified(
                || async move { remote.delete(&owned).await },
                KvError::is_expected,
            )
            .await;
        if let Err(err) = result {
            tracing::warn!(key, error = %err, "distributed invalidation failed");
        }

        self.sign_invalidation(key)
    }

    /// Build a signed invalidation broadcast for `key`.
    #[must_use]
    pub fn sign_invalidation(&self, key: &str) -> InvalidationMsg {
        InvalidationMsg {
            key: key.to_string(),
            mac: self.mac_for(key),
        }
    }

    /// Honor a peer's invalidation broadcast after verifying its signature.
    ///
    /// # Errors
    ///
    /// [`CacheError::BadSignature`] when the MAC does not verify; the local
    /// entry is kept.
    pub async fn apply_invalidation(&self, msg: &InvalidationMsg) -> Result<(), CacheError> {
        let mut mac = HmacSha256::new_from_slice(&self.invalidation_key)
            .map_err(|_| CacheError::BadSignature)?;
        mac.update(msg.key.as_bytes());
        mac.verify_slice(&msg.mac)
            .map_err(|_| CacheError::BadSignature)?;

        self.local.invalidate(&msg.key).await;
        Ok(())
    }

    fn mac_for(&self, key: &str) -> Vec<u8> {
        // Key length was validated at construction; HMAC accepts any length.
        #[allow(clippy::unwrap_used)]
        let mut mac = HmacSha256::new_from_slice(&self.invalidation_key).unwrap();
        mac.update(key.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    async fn store_local(&self, key: &str, bytes: Arc<Vec<u8>>, ttl: Duration) {
        self.local
            .insert(key.to_string(), LocalEntry { bytes, ttl })
            .await;
    }

    async fn store_both(&self, key: &str, bytes: Arc<Vec<u8>>, ttl: Duration) {
        self.store_local(key, Arc::clone(&bytes), ttl).await;

        let remote = self.remote.clone();
        let owned = key.to_string();
        let payload = bytes.as_ref().clone();
        let result = self
            .breaker
            .call_classified(
                || async move { remote.set(&owned, payload, ttl).await },
                KvError::is_expected,
            )
            .await;
        match result {
            Ok(()) => {}
            Err(BreakerError::Open) => {
                tracing::debug!(key, "distributed tier open-circuited, local-only write");
            }
            Err(BreakerError::Inner(err)) => {
                tracing::warn!(key, error = %err, "distributed write failed, local-only");
            }
        }
    }
}

/// Encode a value with the value tag.
fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    let mut bytes = vec![TAG_VALUE];
    let payload = bincode::serialize(value).map_err(|e| CacheError::Codec(e.to_string()))?;
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode tagged bytes; a negative marker decodes to `None`.
fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<Option<T>, CacheError> {
    match bytes.first() {
        Some(&TAG_VALUE) => bincode::deserialize(&bytes[1..])
            .map(Some)
            .map_err(|e| CacheError::Codec(e.to_string())),
        Some(&TAG_NEGATIVE) => Ok(None),
        _ => Err(CacheError::Codec("empty cache payload".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory KV with a fail switch, standing in for Redis.
    #[derive(Clone, Default)]
    struct MemoryKv {
        entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        failing: Arc<AtomicBool>,
        gets: Arc<AtomicUsize>,
    }

    impl MemoryKv {
        fn fail(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    impl DistributedKv for MemoryKv {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(KvError::Unavailable("injected".into()));
            }
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, key: &str, value: Vec<u8>, _ttl: Duration) -> Result<(), KvError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(KvError::Unavailable("injected".into()));
            }
            self.entries.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), KvError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(KvError::Unavailable("injected".into()));
            }
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }
    }

    fn cache_over(kv: MemoryKv) -> TieredCache<MemoryKv> {
        TieredCache::new(kv, TieredCacheConfig::default())
    }

    #[tokio::test]
    async fn miss_loads_once_and_populates_both_tiers() {
        let kv = MemoryKv::default();
        let cache = cache_over(kv.clone());
        let loads = Arc::new(AtomicUsize::new(0));

        let loads_clone = Arc::clone(&loads);
        let value: Option<String> = cache
            .get_or_load("greeting", Duration::from_secs(60), move || async move {
                loads_clone.fetch_add(1, Ordering::SeqCst);
                Ok(Loaded::Value("hello".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("hello"));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(kv.entries.lock().unwrap().contains_key("greeting"));

        // Second read is a local hit: no loader, no remote round-trip.
        let gets_before = kv.gets.load(Ordering::SeqCst);
        let value: Option<String> = cache
            .get_or_load("greeting", Duration::from_secs(60), || async {
                panic!("loader must not run on a hit")
            })
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("hello"));
        assert_eq!(kv.gets.load(Ordering::SeqCst), gets_before);
    }

    #[tokio::test]
    async fn distributed_hit_skips_loader() {
        let kv = MemoryKv::default();
        let primed = cache_over(kv.clone());
        let _: Option<u32> = primed
            .get_or_load("n", Duration::from_secs(60), || async {
                Ok(Loaded::Value(7u32))
            })
            .await
            .unwrap();

        // A different process (fresh local tier) over the same KV.
        let other = cache_over(kv);
        let value: Option<u32> = other
            .get_or_load("n", Duration::from_secs(60), || async {
                panic!("distributed tier should have answered")
            })
            .await
            .unwrap();
        assert_eq!(value, Some(7));
    }

    #[tokio::test]
    async fn negative_result_is_cached() {
        let cache = cache_over(MemoryKv::default());
        let loads = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let loads = Arc::clone(&loads);
            let value: Option<u32> = cache
                .get_or_load("absent", Duration::from_secs(60), move || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(Loaded::Negative)
                })
                .await
                .unwrap();
            assert_eq!(value, None);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn loader_failure_is_not_cached() {
        let cache = cache_over(MemoryKv::default());
        let loads = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let loads = Arc::clone(&loads);
            let result: Result<Option<u32>, _> = cache
                .get_or_load("flaky", Duration::from_secs(60), move || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Err(CacheError::Origin("db down".into()))
                })
                .await;
            assert!(result.is_err());
        }
        // Both attempts ran the loader: the failure was never cached.
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_distributed_tier() {
        let kv = MemoryKv::default();
        let cache = TieredCache::new(
            kv.clone(),
            TieredCacheConfig {
                breaker: CircuitBreakerConfig::builder()
                    .failure_threshold(3)
                    .recovery_timeout(Duration::from_secs(3600))
                    .build(),
                ..TieredCacheConfig::default()
            },
        );

        kv.fail(true);
        for i in 0..3 {
            let key = format!("k{i}");
            let _: Option<u32> = cache
                .get_or_load(&key, Duration::from_secs(1), || async {
                    Ok(Loaded::Value(1u32))
                })
                .await
                .unwrap();
        }
        assert_eq!(cache.breaker().state().await, crate::circuit_breaker::State::Open);

        // While open, reads still succeed via the origin and the KV is not touched.
        let gets_before = kv.gets.load(Ordering::SeqCst);
        let value: Option<u32> = cache
            .get_or_load("k-open", Duration::from_secs(1), || async {
                Ok(Loaded::Value(42u32))
            })
            .await
            .unwrap();
        assert_eq!(value, Some(42));
        assert_eq!(kv.gets.load(Ordering::SeqCst), gets_before);
    }

    #[tokio::test]
    async fn invalidation_round_trip() {
        let kv = MemoryKv::default();
        let cache = cache_over(kv.clone());

        cache.put("user:1", &"alice".to_string(), Duration::from_secs(60)).await.unwrap();
        let msg = cache.invalidate("user:1").await;
        assert!(!kv.entries.lock().unwrap().contains_key("user:1"));

        // A peer over the same signing key honors the broadcast.
        let peer = cache_over(kv);
        peer.put("user:1", &"stale".to_string(), Duration::from_secs(60)).await.unwrap();
        peer.apply_invalidation(&msg).await.unwrap();
        // Local tier dropped: the next read goes back through the KV/loader.
        let value: Option<String> = peer
            .get_or_load("user:1", Duration::from_secs(60), || async {
                Ok(Loaded::Negative)
            })
            .await
            .unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn forged_invalidation_is_rejected() {
        let cache = cache_over(MemoryKv::default());
        let forged = InvalidationMsg {
            key: "user:1".to_string(),
            mac: vec![0xAB; 32],
        };
        assert_eq!(
            cache.apply_invalidation(&forged).await,
            Err(CacheError::BadSignature)
        );
    }
}
