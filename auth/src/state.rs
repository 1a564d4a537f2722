//! Core domain types: identifiers, users, devices, sessions, outcomes.
//!
//! All types are `Clone` and `serde`-serializable so they can cross the
//! session tier (Redis) and be projected into the in-process cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

// ═══════════════════════════════════════════════════════════════════════
// ID Types
// ═══════════════════════════════════════════════════════════════════════

/// Unique identifier for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
    /// Generate a new random `UserId`.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    /// Generate a new random `SessionId`.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub uuid::Uuid);

impl DeviceId {
    /// Generate a new random `DeviceId`.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a one-shot challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChallengeId(pub uuid::Uuid);

impl ChallengeId {
    /// Generate a new random `ChallengeId`.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ChallengeId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier of a refresh-token family (one login chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FamilyId(pub uuid::Uuid);

impl FamilyId {
    /// Generate a new random `FamilyId`.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for FamilyId {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Authenticated Factors
// ═══════════════════════════════════════════════════════════════════════

/// Bitset of authenticated factor categories.
///
/// # Examples
///
/// ```
/// # use vigil_auth::state::AuthFactors;
/// let factors = AuthFactors::KNOWLEDGE.with(AuthFactors::POSSESSION);
/// assert!(factors.contains(AuthFactors::KNOWLEDGE));
/// assert!(!factors.contains(AuthFactors::INHERENCE));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct AuthFactors(pub u8);

impl AuthFactors {
    /// No factors authenticated.
    pub const NONE: Self = Self(0);
    /// Something the user knows (password).
    pub const KNOWLEDGE: Self = Self(1);
    /// Something the user has (TOTP device, email inbox, phone).
    pub const POSSESSION: Self = Self(1 << 1);
    /// Something the user is (platform authenticator with user verification).
    pub const INHERENCE: Self = Self(1 << 2);

    /// Union with another factor set.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether every factor in `other` is present.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bits for the access-token claim.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Rebuild from the access-token claim.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Users & Devices
// ═══════════════════════════════════════════════════════════════════════

/// Account status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    /// Normal account.
    Active,
    /// Credential-level lockout or admin lock.
    Locked,
    /// Administratively suspended.
    Suspended,
    /// Soft-deleted; credentials cascade-deleted.
    Deleted,
}

/// User account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Stable identifier.
    pub user_id: UserId,

    /// Normalized email (unique).
    pub email: String,

    /// Display name.
    pub display_name: Option<String>,

    /// Account status.
    pub status: UserStatus,

    /// Email verified flag.
    pub email_verified: bool,

    /// Per-user integer that invalidates all access tokens carrying an
    /// older value when incremented.
    pub security_version: u32,

    /// Account created timestamp.
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Progressive device trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceTrustLevel {
    /// Never completed an authentication.
    Unknown,
    /// Seen on at least one successful authentication.
    Seen,
    /// User confirmed "remember this device" on a successful step-up.
    Trusted,
}

impl DeviceTrustLevel {
    /// One step up the trust ladder.
    #[must_use]
    pub const fn promoted(self) -> Self {
        match self {
            Self::Unknown => Self::Seen,
            Self::Seen | Self::Trusted => Self::Trusted,
        }
    }

    /// One step down (fingerprint re-bind, risk event).
    #[must_use]
    pub const fn demoted(self) -> Self {
        match self {
            Self::Trusted => Self::Seen,
            Self::Seen | Self::Unknown => Self::Unknown,
        }
    }
}

/// Pseudonymous device identity, bound to a user on first successful
/// authentication.
///
/// A `Device` is a stable entity; its fingerprint hash may be re-bound
/// (which demotes trust one level) without minting a new device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Device ID.
    pub device_id: DeviceId,

    /// Owning user.
    pub user_id: UserId,

    /// SHA-256 of the client-provided fingerprint.
    pub fingerprint_hash: String,

    /// First seen timestamp.
    pub first_seen: DateTime<Utc>,

    /// Last seen timestamp.
    pub last_seen: DateTime<Utc>,

    /// Progressive trust level.
    pub trust_level: DeviceTrustLevel,

    /// Aggregate risk across this device's authentications, in [0, 100].
    pub aggregate_risk: f32,
}

// ═══════════════════════════════════════════════════════════════════════
// Sessions
// ═══════════════════════════════════════════════════════════════════════

/// Why a session was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevocationReason {
    /// User logged this session out.
    UserLogout,
    /// `LogoutAll` / security-version bump.
    AllDevices,
    /// Refresh-token reuse detected on this family.
    RefreshReused,
    /// Administrative revocation.
    Admin,
    /// Reaped past expiry.
    Expired,
}

/// Live authentication context.
///
/// Sessions are authoritative in the session tier; the in-process cache only
/// holds immutable projections (user ID, security version, factor bits).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub session_id: SessionId,

    /// Owning user.
    pub user_id: UserId,

    /// Device the session was minted for.
    pub device_id: DeviceId,

    /// Session creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last activity timestamp.
    pub last_seen: DateTime<Utc>,

    /// Expiry of the most recently minted access token.
    pub access_expires_at: DateTime<Utc>,

    /// Refresh-token family (one login chain).
    pub family_id: FamilyId,

    /// Family generation; incremented atomically on every rotation.
    pub generation: u64,

    /// SHA-256 of the current refresh token. Raw tokens are never stored.
    pub refresh_hash: String,

    /// Sliding refresh expiry (extended per rotation, capped by
    /// `absolute_expires_at`).
    pub refresh_expires_at: DateTime<Utc>,

    /// Absolute ceiling on the session's lifetime.
    pub absolute_expires_at: DateTime<Utc>,

    /// Revocation flag.
    pub revoked: bool,

    /// Reason for termination, if any.
    pub revoked_reason: Option<RevocationReason>,

    /// IP the session was issued to.
    pub issued_ip: IpAddr,

    /// User agent at issue time.
    pub user_agent: String,

    /// Risk score at issue, in [0, 100].
    pub risk_at_issue: u8,

    /// Authenticated factors.
    pub factors: AuthFactors,
}

impl Session {
    /// Whether the session is live at `now` (not revoked, refresh window
    /// still open, absolute cap not reached).
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.refresh_expires_at && now < self.absolute_expires_at
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Outcomes
// ═══════════════════════════════════════════════════════════════════════

/// Token pair returned on successful authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    /// Signed access token.
    pub access_token: String,

    /// Opaque refresh token (version byte + ≥256 bits entropy, base64url).
    pub refresh_token: String,

    /// Access token expiry.
    pub access_expires_at: DateTime<Utc>,

    /// Refresh token expiry.
    pub refresh_expires_at: DateTime<Utc>,
}

/// Challenge variants the broker can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeVariant {
    /// High-entropy secret delivered by email link.
    MagicLink,
    /// Short numeric code delivered by email.
    EmailCode,
    /// Short numeric code delivered by SMS.
    SmsCode,
    /// Time-based one-time password from an enrolled authenticator.
    Totp,
    /// WebAuthn assertion (login).
    WebAuthnGet,
    /// WebAuthn attestation (registration).
    WebAuthnCreate,
}

impl ChallengeVariant {
    /// Stable name for audit records and rate-limit keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MagicLink => "magic-link",
            Self::EmailCode => "email-code",
            Self::SmsCode => "sms-code",
            Self::Totp => "totp",
            Self::WebAuthnGet => "webauthn-get",
            Self::WebAuthnCreate => "webauthn-create",
        }
    }
}

/// What a client needs to answer a pending challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeDescriptor {
    /// Challenge to answer.
    pub challenge_id: ChallengeId,

    /// Challenge variant.
    pub variant: ChallengeVariant,

    /// Delivery channel hint ("email", "sms"), when material was sent.
    pub delivered_via: Option<String>,

    /// Variant-specific client options (WebAuthn ceremony options).
    pub options: Option<serde_json::Value>,
}

/// Coarse denial reason exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DenialReason {
    /// Credentials did not verify (covers unknown-user uniformly).
    InvalidCredential,
    /// Credential-level lockout in effect.
    AccountLocked {
        /// When the lockout lifts.
        retry_after: DateTime<Utc>,
    },
    /// Risk engine denied the attempt.
    Risk,
    /// Challenge failed terminally (expired, consumed, or exhausted).
    ChallengeFailed,
}

/// Outcome of an authentication-surface call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuthOutcome {
    /// Fully authenticated: tokens minted, session persisted.
    Success {
        /// Access + refresh pair.
        tokens: TokenPair,
        /// Authenticated user.
        user: User,
        /// Factors proven so far.
        factors: AuthFactors,
    },

    /// A step-up challenge must be resolved before tokens are minted.
    ChallengeRequired {
        /// The pending challenge.
        challenge: ChallengeDescriptor,
    },

    /// Denied. Sensitive distinctions are already collapsed.
    Denied {
        /// Coarse reason.
        reason: DenialReason,
    },

    /// Request rate exceeded.
    RateLimited {
        /// When the window frees a slot.
        reset_at: DateTime<Utc>,
    },

    /// Transient downstream failure; worth retrying.
    TemporaryFailure,
}

/// Result of validating an access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenInfo {
    /// Subject user.
    pub user_id: UserId,

    /// Session the token belongs to.
    pub session_id: SessionId,

    /// Device the session was minted for.
    pub device_id: DeviceId,

    /// Authenticated factors at mint time.
    pub factors: AuthFactors,

    /// Token expiry.
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(UserId::new(), UserId::new());
        assert_ne!(SessionId::new(), SessionId::new());
        assert_ne!(FamilyId::new(), FamilyId::new());
    }

    #[test]
    fn factor_bits_round_trip() {
        let factors = AuthFactors::KNOWLEDGE.with(AuthFactors::INHERENCE);
        assert_eq!(AuthFactors::from_bits(factors.bits()), factors);
        assert!(factors.contains(AuthFactors::KNOWLEDGE));
        assert!(!factors.contains(AuthFactors::POSSESSION));
    }

    #[test]
    fn trust_ladder_is_bounded() {
        assert_eq!(DeviceTrustLevel::Unknown.promoted(), DeviceTrustLevel::Seen);
        assert_eq!(DeviceTrustLevel::Trusted.promoted(), DeviceTrustLevel::Trusted);
        assert_eq!(DeviceTrustLevel::Unknown.demoted(), DeviceTrustLevel::Unknown);
        assert_eq!(DeviceTrustLevel::Trusted.demoted(), DeviceTrustLevel::Seen);
    }

    #[test]
    fn challenge_variant_names() {
        assert_eq!(ChallengeVariant::MagicLink.as_str(), "magic-link");
        assert_eq!(ChallengeVariant::WebAuthnGet.as_str(), "webauthn-get");
    }
}
