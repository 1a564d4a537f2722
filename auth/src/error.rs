//! Error taxonomy for the authentication and session core.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Failure modes of the authentication core.
///
/// Variants are *kinds*, not transport responses: the orchestrator collapses
/// sensitive distinctions (user-missing vs password-wrong, challenge-expired
/// vs challenge-wrong) before anything leaves the core.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    // ═══════════════════════════════════════════════════════════
    // Credential Verification
    // ═══════════════════════════════════════════════════════════

    /// Password, challenge secret, or token did not verify.
    ///
    /// Returned uniformly for user-not-found and password-mismatch.
    #[error("invalid credentials")]
    InvalidCredential,

    /// Stored digest uses a retired hashing algorithm.
    #[error("credential uses a retired algorithm")]
    LegacyAlgorithm,

    /// Credential-level lockout in effect.
    #[error("account locked, retry after {retry_after}")]
    AccountLocked {
        /// When the lockout lifts.
        retry_after: DateTime<Utc>,
    },

    // ═══════════════════════════════════════════════════════════
    // Rate Limiting
    // ═══════════════════════════════════════════════════════════

    /// Request rate exceeded for the route class.
    #[error("rate limited until {reset_at}")]
    RateLimited {
        /// When the sliding window frees a slot.
        reset_at: DateTime<Utc>,
    },

    // ═══════════════════════════════════════════════════════════
    // Challenges
    // ═══════════════════════════════════════════════════════════

    /// Challenge is past its expiry.
    #[error("challenge expired")]
    ChallengeExpired,

    /// Challenge was already consumed by another verification.
    #[error("challenge already consumed")]
    ChallengeAlreadyConsumed,

    /// Challenge attempt budget exhausted.
    #[error("challenge attempts exhausted")]
    ChallengeAttemptsExhausted,

    /// Challenge ID is unknown (never issued, expired out, or consumed).
    #[error("challenge not found")]
    ChallengeNotFound,

    // ═══════════════════════════════════════════════════════════
    // Access Tokens
    // ═══════════════════════════════════════════════════════════

    /// Access token is past its expiry.
    #[error("token expired")]
    TokenExpired,

    /// Access token signature did not verify against any active key.
    #[error("token signature invalid")]
    TokenSignatureInvalid,

    /// Access token carries a stale security version or a revoked session.
    #[error("token revoked")]
    TokenRevoked,

    // ═══════════════════════════════════════════════════════════
    // Refresh Tokens
    // ═══════════════════════════════════════════════════════════

    /// Refresh token presented after its family rotated past it.
    ///
    /// Proof of theft: the whole family is revoked and a critical event
    /// emitted by the time this error surfaces.
    #[error("refresh token reuse detected")]
    RefreshReused,

    /// Refresh token or its family is past expiry.
    #[error("refresh token expired")]
    RefreshExpired,

    /// Refresh token does not map to any live family.
    #[error("refresh token unknown")]
    RefreshUnknown,

    // ═══════════════════════════════════════════════════════════
    // Risk & Policy
    // ═══════════════════════════════════════════════════════════

    /// The risk engine produced a deny decision.
    #[error("denied by risk policy")]
    RiskDenied,

    // ═══════════════════════════════════════════════════════════
    // Infrastructure
    // ═══════════════════════════════════════════════════════════

    /// A required downstream is unreachable and no safe fallback exists.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Transient error worth retrying.
    #[error("temporary failure: {0}")]
    TemporaryFailure(String),

    /// Internal contract breach. Fatal to the request, never retried.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Serialization of a stored value failed.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Malformed caller input (bad email, oversized field, …).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl AuthError {
    /// Returns `true` if this error is due to invalid user input or
    /// credentials rather than a system fault.
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredential
                | Self::InvalidInput(_)
                | Self::ChallengeExpired
                | Self::ChallengeAlreadyConsumed
                | Self::ChallengeAttemptsExhausted
                | Self::ChallengeNotFound
        )
    }

    /// Returns `true` if this error indicates a security event worth a
    /// critical audit record.
    #[must_use]
    pub const fn is_security_issue(&self) -> bool {
        matches!(
            self,
            Self::RefreshReused | Self::RiskDenied | Self::InvariantViolation(_)
        )
    }

    /// Returns `true` if retrying the operation once may succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::TemporaryFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_errors_classified() {
        assert!(AuthError::InvalidCredential.is_user_error());
        assert!(AuthError::ChallengeExpired.is_user_error());
        assert!(!AuthError::TemporaryFailure("x".into()).is_user_error());
    }

    #[test]
    fn security_issues_classified() {
        assert!(AuthError::RefreshReused.is_security_issue());
        assert!(AuthError::RiskDenied.is_security_issue());
        assert!(!AuthError::TokenExpired.is_security_issue());
    }

    #[test]
    fn only_temporary_failures_retry() {
        assert!(AuthError::TemporaryFailure("redis".into()).is_retriable());
        assert!(!AuthError::InvariantViolation("bad".into()).is_retriable());
        assert!(!AuthError::InvalidCredential.is_retriable());
    }
}
