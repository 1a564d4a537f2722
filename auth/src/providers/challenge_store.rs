//! One-shot challenge storage trait.
//!
//! Challenges live in the ephemeral (TTL-indexed) tier and are destroyed on
//! consumption. Consumption must be atomic — concurrent verifications
//! serialize on the challenge ID and the first consumer wins.

use crate::error::Result;
use crate::state::{AuthFactors, ChallengeId, ChallengeVariant, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The verifier material a challenge carries. Never the raw secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChallengeSecret {
    /// SHA-256 (hex) of the delivered secret (magic link, email/SMS code).
    HashedSecret {
        /// Hex digest of the raw secret.
        hash: String,
    },

    /// The expected code comes from the user's TOTP enrollment at verify
    /// time; nothing is stored here.
    TotpRef,

    /// Serialized WebAuthn ceremony state (registration or assertion).
    WebAuthn {
        /// Opaque ceremony state for the relying party.
        state: serde_json::Value,
    },
}

/// A stored one-shot challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeRecord {
    /// Challenge ID.
    pub challenge_id: ChallengeId,

    /// Variant, which selects the verifier.
    pub variant: ChallengeVariant,

    /// Subject user (absent for anonymous flows, e.g. a passwordless
    /// beginning for an unknown email).
    pub user_id: Option<UserId>,

    /// Fingerprint hash of the device the challenge was issued to.
    pub fingerprint_hash: String,

    /// Verifier material.
    pub secret: ChallengeSecret,

    /// Factors already proven when the challenge was issued (step-up carries
    /// the knowledge factor forward).
    pub prior_factors: AuthFactors,

    /// Issue timestamp.
    pub issued_at: DateTime<Utc>,

    /// Expiry timestamp.
    pub expires_at: DateTime<Utc>,

    /// Failed attempts so far.
    pub attempts: u32,

    /// Attempt budget; reaching it consumes the challenge terminally.
    pub max_attempts: u32,
}

/// Ephemeral challenge store with atomic consumption.
pub trait ChallengeStore: Send + Sync {
    /// Store a challenge with its TTL.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn put(
        &self,
        record: &ChallengeRecord,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Read a challenge without consuming it.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    fn load(
        &self,
        challenge_id: ChallengeId,
    ) -> impl std::future::Future<Output = Result<Option<ChallengeRecord>>> + Send;

    /// Atomically consume a challenge (get-and-delete). Exactly one
    /// concurrent caller receives the record; the rest get `None`.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    fn consume(
        &self,
        challenge_id: ChallengeId,
    ) -> impl std::future::Future<Output = Result<Option<ChallengeRecord>>> + Send;

    /// Atomically record a failed attempt; returns the new attempt count,
    /// or `None` when the challenge is already gone.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    fn record_attempt(
        &self,
        challenge_id: ChallengeId,
    ) -> impl std::future::Future<Output = Result<Option<u32>>> + Send;
}
