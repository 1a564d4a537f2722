//! Credential registry trait and credential data models.

use crate::config::LockoutConfig;
use crate::error::Result;
use crate::keys::{KeyVersion, SealedSecret};
use crate::state::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Password credential. A user has at most one active one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasswordCredential {
    /// Owning user.
    pub user_id: UserId,

    /// PHC-format Argon2id digest; algorithm parameters are embedded.
    pub digest: String,

    /// Pepper version mixed into the digest.
    pub pepper_version: KeyVersion,

    /// Created timestamp.
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp (password change or transparent re-hash).
    pub updated_at: DateTime<Utc>,

    /// Consecutive failed verification attempts.
    pub failed_attempts: u32,

    /// Lockout deadline, once `failed_attempts` crossed the threshold.
    pub lockout_until: Option<DateTime<Utc>>,
}

/// WebAuthn credential (passkey).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebAuthnCredential {
    /// Credential ID (opaque bytes, unique).
    pub credential_id: Vec<u8>,

    /// Owning user.
    pub user_id: UserId,

    /// Serialized passkey (public key + ceremony material) for assertion
    /// verification.
    pub passkey: serde_json::Value,

    /// Signature counter. Strictly increasing; a regression is treated as
    /// cloned-authenticator evidence and fails closed.
    pub counter: u32,

    /// Authenticator AAGUID (zeros when attestation was not requested).
    pub aaguid: Vec<u8>,

    /// Authenticator attachment ("platform", "cross-platform"), if known.
    pub attachment: Option<String>,

    /// Registered transports ("usb", "internal", "hybrid", …).
    pub transports: Vec<String>,

    /// User-assigned friendly name.
    pub name: String,

    /// Created timestamp.
    pub created_at: DateTime<Utc>,

    /// Last successful assertion timestamp.
    pub last_used: Option<DateTime<Utc>>,
}

/// TOTP enrollment. A user has at most one primary enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotpEnrollment {
    /// Owning user.
    pub user_id: UserId,

    /// Shared secret, sealed with the key store's encryption keyset.
    pub secret: SealedSecret,

    /// Accepted drift in 30-second windows.
    pub drift_windows: u8,

    /// Hashed single-use scratch codes.
    pub scratch_code_hashes: Vec<String>,

    /// Created timestamp.
    pub created_at: DateTime<Utc>,
}

/// Second-factor delivery address kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactKind {
    /// Email address.
    Email,
    /// Phone number (SMS).
    Phone,
}

/// A verified-or-not delivery address for second-factor material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactChannel {
    /// Owning user.
    pub user_id: UserId,

    /// Channel kind.
    pub kind: ContactKind,

    /// Address (normalized email or E.164 phone).
    pub address: String,

    /// Whether ownership of the address was proven.
    pub verified: bool,
}

/// Result of recording a failed verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    /// Consecutive failures including this one.
    pub failed_attempts: u32,

    /// Lockout deadline, when the threshold is crossed.
    pub lockout_until: Option<DateTime<Utc>>,

    /// Whether this failure newly armed the lockout.
    pub lockout_armed: bool,
}

/// Credential registry (durable tier, secret fields encrypted at rest).
///
/// Enforces the ownership invariants: at most one active password
/// credential and one primary TOTP enrollment per user; deleting a user
/// cascades to all credentials.
pub trait CredentialRegistry: Send + Sync {
    /// The user's password credential, if any.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    fn find_password_for(
        &self,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<Option<PasswordCredential>>> + Send;

    /// Insert or replace the user's password credential.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn upsert_password(
        &self,
        credential: &PasswordCredential,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// All WebAuthn credentials for a user.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    fn list_webauthn_for(
        &self,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<Vec<WebAuthnCredential>>> + Send;

    /// Register a new WebAuthn credential.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a duplicate credential ID.
    fn add_webauthn(
        &self,
        credential: &WebAuthnCredential,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Bump the stored signature counter.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::AuthError::InvalidCredential`] when the new
    /// counter does not strictly increase (fail closed).
    fn update_webauthn_counter(
        &self,
        credential_id: &[u8],
        counter: u32,
        used_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// The user's primary TOTP enrollment, if any.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    fn find_totp_for(
        &self,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<Option<TotpEnrollment>>> + Send;

    /// Insert or replace the user's primary TOTP enrollment.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn upsert_totp(
        &self,
        enrollment: &TotpEnrollment,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Second-factor delivery addresses for a user.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    fn find_contact_channels_for(
        &self,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<Vec<ContactChannel>>> + Send;

    /// Record a failed credential verification: increments the counter and
    /// arms the exponential lockout once the threshold is crossed.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a missing password credential.
    fn record_failure(
        &self,
        user_id: UserId,
        lockout: &LockoutConfig,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<FailureRecord>> + Send;

    /// Record a successful verification: clears the failure counter and any
    /// lockout.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn record_success(
        &self,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Cascade-delete every credential owned by a user.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn remove_credentials_for(
        &self,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}
