//! Authentication configuration.
//!
//! Every recognized option is an explicit struct field; there is no
//! string-keyed bag, so an unrecognized option is a compile error at the
//! call site rather than a silent default. [`AuthConfig::validate`] rejects
//! nonsensical combinations at load time.

use crate::error::{AuthError, Result};
use chrono::Duration;

/// Argon2id parameters, stored alongside every digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordHashParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub time_cost: u32,
    /// Lanes.
    pub parallelism: u32,
}

impl Default for PasswordHashParams {
    fn default() -> Self {
        // OWASP baseline for Argon2id.
        Self {
            memory_kib: 19_456,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

/// Credential-level lockout policy.
///
/// Orthogonal to rate limiting: lockout targets the credential, the limiter
/// targets request rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutConfig {
    /// Consecutive failures before lockout arms.
    pub threshold: u32,
    /// First lockout duration; doubles per further failure.
    pub base_duration: Duration,
    /// Ceiling on the lockout duration.
    pub cap: Duration,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            base_duration: Duration::minutes(1),
            cap: Duration::hours(1),
        }
    }
}

impl LockoutConfig {
    /// Lockout duration after `failures` consecutive failures, exponential
    /// past the threshold and capped.
    #[must_use]
    pub fn duration_for(&self, failures: u32) -> Duration {
        if failures < self.threshold {
            return Duration::zero();
        }
        let exponent = (failures - self.threshold).min(16);
        let duration = self.base_duration * 2_i32.pow(exponent);
        duration.min(self.cap)
    }
}

/// Decision floors for the risk engine, on the [0, 100] score scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskThresholds {
    /// Scores at or above this require a step-up challenge.
    pub challenge_floor: u8,
    /// Scores at or above this are denied outright.
    pub deny_floor: u8,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            challenge_floor: 40,
            deny_floor: 75,
        }
    }
}

/// One sliding-window rate-limit rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    /// Window size.
    pub window: Duration,
    /// Maximum requests per window.
    pub max_requests: u32,
    /// Count only failed attempts (successes don't consume budget).
    pub count_failures_only: bool,
}

/// Per-class rate-limit table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitsConfig {
    /// Password authentication, keyed by (ip, email).
    pub password_auth: RateLimitRule,
    /// Magic-link issuance, keyed by email.
    pub magic_link_issue: RateLimitRule,
    /// TOTP/code verification, keyed by user.
    pub totp_verify: RateLimitRule,
    /// WebAuthn assertion ceremonies, keyed by email (begin) or user
    /// (complete).
    pub webauthn_verify: RateLimitRule,
    /// Refresh rotation, keyed by session.
    pub refresh: RateLimitRule,
    /// Generic mutating calls, keyed by user or ip.
    pub generic_write: RateLimitRule,
    /// Generic read calls, keyed by user or ip.
    pub generic_read: RateLimitRule,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            password_auth: RateLimitRule {
                window: Duration::minutes(15),
                max_requests: 5,
                count_failures_only: false,
            },
            magic_link_issue: RateLimitRule {
                window: Duration::hours(1),
                max_requests: 3,
                count_failures_only: false,
            },
            totp_verify: RateLimitRule {
                window: Duration::minutes(5),
                max_requests: 10,
                count_failures_only: false,
            },
            webauthn_verify: RateLimitRule {
                window: Duration::minutes(5),
                max_requests: 10,
                count_failures_only: false,
            },
            refresh: RateLimitRule {
                window: Duration::minutes(1),
                max_requests: 30,
                count_failures_only: false,
            },
            generic_write: RateLimitRule {
                window: Duration::minutes(1),
                max_requests: 50,
                count_failures_only: false,
            },
            generic_read: RateLimitRule {
                window: Duration::minutes(1),
                max_requests: 200,
                count_failures_only: false,
            },
        }
    }
}

/// Circuit-breaker settings for the distributed tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: usize,
    /// How long to stay open before probing.
    pub recovery_timeout: Duration,
    /// Failures older than this no longer count toward the threshold.
    pub monitoring_period: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::seconds(30),
            monitoring_period: Duration::seconds(60),
        }
    }
}

impl BreakerConfig {
    /// Lower into the runtime crate's breaker configuration.
    #[must_use]
    pub fn to_runtime(self) -> vigil_runtime::circuit_breaker::CircuitBreakerConfig {
        vigil_runtime::circuit_breaker::CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: self.recovery_timeout.to_std().unwrap_or_default(),
            monitoring_period: self.monitoring_period.to_std().unwrap_or_default(),
        }
    }
}

/// Top-level configuration for the authentication core.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Access-token lifetime. Default: 1 hour.
    pub access_token_ttl: Duration,

    /// Refresh-token lifetime per rotation. Default: 30 days.
    pub refresh_token_ttl: Duration,

    /// Absolute ceiling on a session's total lifetime. Default: 90 days.
    pub absolute_session_lifetime: Duration,

    /// Magic-link validity. Default: 15 minutes.
    pub magic_link_ttl: Duration,

    /// Email/SMS code validity. Default: 10 minutes.
    pub code_ttl: Duration,

    /// WebAuthn ceremony validity. Default: 5 minutes.
    pub webauthn_ttl: Duration,

    /// TOTP drift tolerance in 30-second windows. Default: 1.
    pub totp_drift_windows: u8,

    /// Attempt budget for short-code challenges. Default: 5.
    pub code_max_attempts: u32,

    /// Argon2id parameters.
    pub password_hash: PasswordHashParams,

    /// Credential-level lockout policy.
    pub lockout: LockoutConfig,

    /// Risk decision floors.
    pub risk_thresholds: RiskThresholds,

    /// Per-class rate limits.
    pub rate_limits: RateLimitsConfig,

    /// Circuit breaker for the distributed tier.
    pub breaker: BreakerConfig,

    /// Bounded staleness of the cached per-user security version.
    ///
    /// Must be well below `access_token_ttl` so direct revocation plus TTL
    /// closes the invalidation window.
    pub security_version_staleness: Duration,

    /// Token issuer claim.
    pub issuer: String,

    /// Token audience claim.
    pub audience: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_token_ttl: Duration::hours(1),
            refresh_token_ttl: Duration::days(30),
            absolute_session_lifetime: Duration::days(90),
            magic_link_ttl: Duration::minutes(15),
            code_ttl: Duration::minutes(10),
            webauthn_ttl: Duration::minutes(5),
            totp_drift_windows: 1,
            code_max_attempts: 5,
            password_hash: PasswordHashParams::default(),
            lockout: LockoutConfig::default(),
            risk_thresholds: RiskThresholds::default(),
            rate_limits: RateLimitsConfig::default(),
            breaker: BreakerConfig::default(),
            security_version_staleness: Duration::seconds(30),
            issuer: "vigil".to_string(),
            audience: "vigil-clients".to_string(),
        }
    }
}

impl AuthConfig {
    /// Set the access-token lifetime.
    #[must_use]
    pub const fn with_access_token_ttl(mut self, ttl: Duration) -> Self {
        self.access_token_ttl = ttl;
        self
    }

    /// Set the refresh-token lifetime per rotation.
    #[must_use]
    pub const fn with_refresh_token_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_token_ttl = ttl;
        self
    }

    /// Set the absolute session-lifetime ceiling.
    #[must_use]
    pub const fn with_absolute_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.absolute_session_lifetime = lifetime;
        self
    }

    /// Set the magic-link TTL.
    #[must_use]
    pub const fn with_magic_link_ttl(mut self, ttl: Duration) -> Self {
        self.magic_link_ttl = ttl;
        self
    }

    /// Set the TOTP drift tolerance.
    #[must_use]
    pub const fn with_totp_drift_windows(mut self, windows: u8) -> Self {
        self.totp_drift_windows = windows;
        self
    }

    /// Set the risk decision floors.
    #[must_use]
    pub const fn with_risk_thresholds(mut self, thresholds: RiskThresholds) -> Self {
        self.risk_thresholds = thresholds;
        self
    }

    /// Set the lockout policy.
    #[must_use]
    pub const fn with_lockout(mut self, lockout: LockoutConfig) -> Self {
        self.lockout = lockout;
        self
    }

    /// Set the per-class rate limits.
    #[must_use]
    pub fn with_rate_limits(mut self, limits: RateLimitsConfig) -> Self {
        self.rate_limits = limits;
        self
    }

    /// Reject nonsensical configurations at load time.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidInput`] naming the offending option.
    pub fn validate(&self) -> Result<()> {
        if self.access_token_ttl <= Duration::zero() {
            return Err(AuthError::InvalidInput("access_token_ttl must be positive".into()));
        }
        if self.refresh_token_ttl <= Duration::zero() {
            return Err(AuthError::InvalidInput("refresh_token_ttl must be positive".into()));
        }
        if self.absolute_session_lifetime < self.refresh_token_ttl {
            return Err(AuthError::InvalidInput(
                "absolute_session_lifetime must be >= refresh_token_ttl".into(),
            ));
        }
        if self.risk_thresholds.challenge_floor >= self.risk_thresholds.deny_floor {
            return Err(AuthError::InvalidInput(
                "risk challenge_floor must be below deny_floor".into(),
            ));
        }
        if self.risk_thresholds.deny_floor > 100 {
            return Err(AuthError::InvalidInput("risk deny_floor must be <= 100".into()));
        }
        if self.security_version_staleness >= self.access_token_ttl {
            return Err(AuthError::InvalidInput(
                "security_version_staleness must be below access_token_ttl".into(),
            ));
        }
        if self.lockout.threshold == 0 {
            return Err(AuthError::InvalidInput("lockout threshold must be positive".into()));
        }
        if self.code_max_attempts == 0 {
            return Err(AuthError::InvalidInput("code_max_attempts must be positive".into()));
        }
        Ok(())
    }
}
