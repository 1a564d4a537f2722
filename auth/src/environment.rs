//! Authentication environment: the interface bundle handed to the
//! orchestrator.
//!
//! Contains every external dependency of the core. Passed by value into
//! [`crate::orchestrator::Authenticator`]; there are no global mutable
//! singletons besides the key store (shared via `Arc`) and the circuit
//! breaker's state record inside the cache.

use crate::audit::AuditEmitter;
use crate::challenge::ChallengeBroker;
use crate::config::AuthConfig;
use crate::hasher::PasswordHasher;
use crate::keys::KeyStore;
use crate::providers::{
    ChallengeStore, CredentialRegistry, DeviceRepository, MessageSink, RateLimiter, SessionStore,
    UserRepository, WebAuthnCeremony,
};
use crate::risk::RiskEngine;
use crate::tokens::TokenService;
use std::sync::Arc;
use vigil_runtime::cache::{DistributedKv, TieredCache};

/// The interface bundle for one deployment of the core.
///
/// # Type Parameters
///
/// - `S`: session store (session tier)
/// - `C`: credential registry (durable tier)
/// - `U`: user repository (durable tier)
/// - `D`: device repository (durable tier)
/// - `H`: challenge store (ephemeral tier)
/// - `L`: rate limiter (ephemeral tier)
/// - `W`: WebAuthn ceremony
/// - `K`: distributed KV behind the tiered cache
#[derive(Clone)]
pub struct AuthEnvironment<S, C, U, D, H, L, W, K>
where
    S: SessionStore + Clone,
    C: CredentialRegistry + Clone,
    U: UserRepository + Clone,
    D: DeviceRepository + Clone,
    H: ChallengeStore + Clone,
    L: RateLimiter + Clone,
    W: WebAuthnCeremony + Clone,
    K: DistributedKv + Clone,
{
    /// Session store.
    pub sessions: S,

    /// Credential registry.
    pub credentials: C,

    /// User repository.
    pub users: U,

    /// Device repository.
    pub devices: D,

    /// Challenge broker over the ephemeral store.
    pub challenges: ChallengeBroker<H>,

    /// Rate limiter.
    pub rate_limiter: L,

    /// WebAuthn relying-party ceremonies.
    pub webauthn: W,

    /// Two-tier cache (projections, aggregates, security versions).
    pub cache: TieredCache<K>,

    /// Outbound delivery sink for challenge material.
    pub delivery: Arc<dyn MessageSink>,

    /// Key store (signing, sealing, peppers).
    pub keys: Arc<KeyStore>,

    /// Password hasher.
    pub hasher: PasswordHasher,

    /// Token service.
    pub tokens: TokenService,

    /// Risk engine.
    pub risk: RiskEngine,

    /// Audit emitter.
    pub audit: AuditEmitter,

    /// Core configuration.
    pub config: AuthConfig,
}

impl<S, C, U, D, H, L, W, K> AuthEnvironment<S, C, U, D, H, L, W, K>
where
    S: SessionStore + Clone,
    C: CredentialRegistry + Clone,
    U: UserRepository + Clone,
    D: DeviceRepository + Clone,
    H: ChallengeStore + Clone,
    L: RateLimiter + Clone,
    W: WebAuthnCeremony + Clone,
    K: DistributedKv + Clone,
{
    /// Assemble an environment.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: S,
        credentials: C,
        users: U,
        devices: D,
        challenge_store: H,
        rate_limiter: L,
        webauthn: W,
        cache: TieredCache<K>,
        delivery: Arc<dyn MessageSink>,
        keys: Arc<KeyStore>,
        hasher: PasswordHasher,
        tokens: TokenService,
        risk: RiskEngine,
        audit: AuditEmitter,
        config: AuthConfig,
    ) -> Self {
        Self {
            sessions,
            credentials,
            users,
            devices,
            challenges: ChallengeBroker::new(challenge_store),
            rate_limiter,
            webauthn,
            cache,
            delivery,
            keys,
            hasher,
            tokens,
            risk,
            audit,
            config,
        }
    }
}
