//! Shared test harness: a full authenticator wired over the in-memory
//! mocks, with helpers for seeding users and credentials.

// Each integration binary uses a different slice of the harness.
#![allow(dead_code)]

use chrono::{Duration, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use vigil_auth::audit::AuditEmitter;
use vigil_auth::challenge::generate_totp_seed;
use vigil_auth::config::{AuthConfig, PasswordHashParams, RiskThresholds};
use vigil_auth::environment::AuthEnvironment;
use vigil_auth::hasher::PasswordHasher;
use vigil_auth::keys::{KeyStore, KeyStoreConfig};
use vigil_auth::mocks::{
    CaptureEventSink, CaptureMessageSink, MemoryKv, MockChallengeStore, MockCredentialRegistry,
    MockDeviceRepository, MockRateLimiter, MockSessionStore, MockUserRepository,
    MockWebAuthnCeremony,
};
use vigil_auth::orchestrator::{AuthenticateRequest, Authenticator, ChallengeAnswer, RefreshRequest};
use vigil_auth::providers::credentials::{PasswordCredential, TotpEnrollment};
use vigil_auth::providers::{CredentialRegistry, UserRepository};
use vigil_auth::risk::{RiskConfig, RiskEngine};
use vigil_auth::state::{ChallengeId, User, UserId, UserStatus};
use vigil_auth::tokens::TokenService;
use vigil_runtime::cache::{TieredCache, TieredCacheConfig};

pub type TestAuthenticator = Authenticator<
    MockSessionStore,
    MockCredentialRegistry,
    MockUserRepository,
    MockDeviceRepository,
    MockChallengeStore,
    MockRateLimiter,
    MockWebAuthnCeremony,
    MemoryKv,
>;

pub struct Harness {
    pub authenticator: TestAuthenticator,
    pub users: MockUserRepository,
    pub credentials: MockCredentialRegistry,
    pub devices: MockDeviceRepository,
    pub sessions: MockSessionStore,
    pub challenges: MockChallengeStore,
    pub limiter: MockRateLimiter,
    pub delivery: CaptureMessageSink,
    pub events: CaptureEventSink,
    pub keys: Arc<KeyStore>,
    pub kv: MemoryKv,
    pub hasher: PasswordHasher,
    pub config: AuthConfig,
}

/// Cheap Argon2 parameters keeping the suite fast.
pub fn test_hash_params() -> PasswordHashParams {
    PasswordHashParams {
        memory_kib: 8,
        time_cost: 1,
        parallelism: 1,
    }
}

/// Default test config: roomy risk floors so a first login from a fresh
/// device stays below the challenge floor.
pub fn test_config() -> AuthConfig {
    let mut config = AuthConfig::default();
    config.password_hash = test_hash_params();
    config.risk_thresholds = RiskThresholds {
        challenge_floor: 55,
        deny_floor: 90,
    };
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AuthConfig) -> Self {
        config.validate().expect("test config must validate");
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let users = MockUserRepository::new();
        let credentials = MockCredentialRegistry::new();
        let devices = MockDeviceRepository::new();
        let sessions = MockSessionStore::new();
        let challenges = MockChallengeStore::new();
        let limiter = MockRateLimiter::new();
        let delivery = CaptureMessageSink::new();
        let events = CaptureEventSink::new();
        let kv = MemoryKv::new();

        let keys = Arc::new(KeyStore::from_config(KeyStoreConfig::generate()).expect("keys"));
        let hasher = PasswordHasher::new(config.password_hash).expect("hasher");
        let tokens = TokenService::new(
            Arc::clone(&keys),
            config.issuer.clone(),
            config.audience.clone(),
        );
        let cache = TieredCache::new(
            kv.clone(),
            TieredCacheConfig {
                breaker: config.breaker.to_runtime(),
                ..TieredCacheConfig::default()
            },
        );
        let risk = RiskEngine::new(RiskConfig::default());
        let audit = AuditEmitter::new(Arc::new(events.clone()), 256);

        let env = AuthEnvironment::new(
            sessions.clone(),
            credentials.clone(),
            users.clone(),
            devices.clone(),
            challenges.clone(),
            limiter.clone(),
            MockWebAuthnCeremony::new(),
            cache,
            Arc::new(delivery.clone()),
            Arc::clone(&keys),
            hasher.clone(),
            tokens,
            risk,
            audit,
            config.clone(),
        );

        Self {
            authenticator: Authenticator::new(env),
            users,
            credentials,
            devices,
            sessions,
            challenges,
            limiter,
            delivery,
            events,
            keys,
            kv,
            hasher,
            config,
        }
    }

    /// Seed an aged, active, verified user.
    pub async fn create_user(&self, email: &str) -> User {
        let now = Utc::now();
        let user = User {
            user_id: UserId::new(),
            email: email.to_string(),
            display_name: Some("Test User".to_string()),
            status: UserStatus::Active,
            email_verified: true,
            security_version: 1,
            created_at: now - Duration::days(400),
            updated_at: now,
        };
        self.users.create(&user).await.expect("create user");
        user
    }

    /// Attach a password credential.
    pub async fn set_password(&self, user: &User, password: &str) {
        let hashed = self.hasher.hash(password, &self.keys).expect("hash");
        let now = Utc::now();
        let credential = PasswordCredential {
            user_id: user.user_id,
            digest: hashed.digest,
            pepper_version: hashed.pepper_version,
            created_at: now,
            updated_at: now,
            failed_attempts: 0,
            lockout_until: None,
        };
        self.credentials
            .upsert_password(&credential)
            .await
            .expect("set password");
    }

    /// Enroll a TOTP authenticator; returns the raw seed for code
    /// generation in tests.
    pub async fn enroll_totp(&self, user: &User) -> Vec<u8> {
        let seed = generate_totp_seed();
        let sealed = self.keys.seal(&seed).expect("seal seed");
        let enrollment = TotpEnrollment {
            user_id: user.user_id,
            secret: sealed,
            drift_windows: 1,
            scratch_code_hashes: Vec::new(),
            created_at: Utc::now(),
        };
        self.credentials
            .upsert_totp(&enrollment)
            .await
            .expect("enroll totp");
        seed
    }

    /// A password-login request from the canonical test client.
    pub fn login_request(&self, email: &str, password: &str) -> AuthenticateRequest {
        AuthenticateRequest {
            email: email.to_string(),
            password: password.to_string(),
            fingerprint: "fp-canvas-1".to_string(),
            ip: test_ip(),
            user_agent: "UA1".to_string(),
            location_hint: None,
            correlation_id: uuid::Uuid::new_v4(),
        }
    }

    /// An answer to a pending challenge from the same client.
    pub fn challenge_answer(&self, challenge_id: ChallengeId, secret: &str) -> ChallengeAnswer {
        ChallengeAnswer {
            challenge_id,
            secret: secret.to_string(),
            fingerprint: "fp-canvas-1".to_string(),
            ip: test_ip(),
            user_agent: "UA1".to_string(),
            remember_device: false,
            correlation_id: uuid::Uuid::new_v4(),
        }
    }

    /// A refresh request from the same client.
    pub fn refresh_request(&self, refresh_token: &str) -> RefreshRequest {
        RefreshRequest {
            refresh_token: refresh_token.to_string(),
            fingerprint: "fp-canvas-1".to_string(),
            ip: test_ip(),
            user_agent: "UA1".to_string(),
            correlation_id: uuid::Uuid::new_v4(),
        }
    }

    /// Let the audit forwarding task drain.
    pub async fn settle(&self) {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

pub fn test_ip() -> IpAddr {
    "1.2.3.4".parse().expect("ip")
}
