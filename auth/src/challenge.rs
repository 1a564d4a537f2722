//! Challenge broker: issues and verifies one-shot challenges.
//!
//! The broker owns single-use semantics for every variant: a challenge is
//! consumed on its first successful verification or on exhausting its
//! attempt budget, and both outcomes are terminal. Consumption rides on the
//! store's atomic get-and-delete, so concurrent verifications serialize on
//! the challenge ID and exactly one wins.
//!
//! Only verifier material is stored — the hash of a magic-link secret or
//! code, a reference to the TOTP enrollment, or opaque WebAuthn ceremony
//! state. Raw secrets exist in the delivery path only.

use crate::error::{AuthError, Result};
use crate::providers::challenge_store::{ChallengeRecord, ChallengeSecret, ChallengeStore};
use crate::state::{AuthFactors, ChallengeId, ChallengeVariant, UserId};
use crate::utils::hex_encode;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use constant_time_eq::constant_time_eq;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use totp_rs::{Algorithm as TotpAlgorithm, TOTP};

/// Entropy of a magic-link secret in bytes.
const MAGIC_LINK_ENTROPY: usize = 32;
/// Digits in a delivered short code.
const CODE_DIGITS: u32 = 6;

/// Issues, stores, and verifies one-shot challenges.
#[derive(Debug, Clone)]
pub struct ChallengeBroker<S: ChallengeStore> {
    store: S,
}

impl<S: ChallengeStore> ChallengeBroker<S> {
    /// Create a broker over a challenge store.
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    // ── issuance ───────────────────────────────────────────────────────

    /// Issue a magic-link challenge; returns the raw secret for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn issue_magic_link(
        &self,
        user_id: Option<UserId>,
        fingerprint_hash: &str,
        prior_factors: AuthFactors,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(ChallengeId, String)> {
        let mut entropy = [0u8; MAGIC_LINK_ENTROPY];
        OsRng.fill_bytes(&mut entropy);
        let secret = URL_SAFE_NO_PAD.encode(entropy);

        let challenge_id = self
            .put_hashed(
                ChallengeVariant::MagicLink,
                user_id,
                fingerprint_hash,
                prior_factors,
                &secret,
                // Magic links are single-attempt: one wrong secret burns them.
                1,
                ttl,
                now,
            )
            .await?;
        Ok((challenge_id, secret))
    }

    /// Issue a short-code challenge (email or SMS); returns the raw code.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn issue_code(
        &self,
        variant: ChallengeVariant,
        user_id: UserId,
        fingerprint_hash: &str,
        prior_factors: AuthFactors,
        max_attempts: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(ChallengeId, String)> {
        let code = format!("{:06}", OsRng.next_u32() % 10u32.pow(CODE_DIGITS));
        let challenge_id = self
            .put_hashed(
                variant,
                Some(user_id),
                fingerprint_hash,
                prior_factors,
                &code,
                max_attempts,
                ttl,
                now,
            )
            .await?;
        Ok((challenge_id, code))
    }

    /// Issue a TOTP challenge referencing the user's enrollment.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn issue_totp(
        &self,
        user_id: UserId,
        fingerprint_hash: &str,
        prior_factors: AuthFactors,
        max_attempts: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ChallengeId> {
        let record = ChallengeRecord {
            challenge_id: ChallengeId::new(),
            variant: ChallengeVariant::Totp,
            user_id: Some(user_id),
            fingerprint_hash: fingerprint_hash.to_string(),
            secret: ChallengeSecret::TotpRef,
            prior_factors,
            issued_at: now,
            expires_at: now + ttl,
            attempts: 0,
            max_attempts,
        };
        self.store.put(&record, ttl).await?;
        Ok(record.challenge_id)
    }

    /// Issue a WebAuthn challenge carrying opaque ceremony state.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn issue_webauthn(
        &self,
        variant: ChallengeVariant,
        user_id: Option<UserId>,
        fingerprint_hash: &str,
        prior_factors: AuthFactors,
        state: serde_json::Value,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ChallengeId> {
        let record = ChallengeRecord {
            challenge_id: ChallengeId::new(),
            variant,
            user_id,
            fingerprint_hash: fingerprint_hash.to_string(),
            secret: ChallengeSecret::WebAuthn { state },
            prior_factors,
            issued_at: now,
            expires_at: now + ttl,
            attempts: 0,
            max_attempts: 1,
        };
        self.store.put(&record, ttl).await?;
        Ok(record.challenge_id)
    }

    // ── verification ───────────────────────────────────────────────────

    /// Read a challenge without consuming it, enforcing expiry.
    ///
    /// # Errors
    ///
    /// [`AuthError::ChallengeNotFound`] for unknown/consumed IDs,
    /// [`AuthError::ChallengeExpired`] past expiry.
    pub async fn peek(&self, challenge_id: ChallengeId, now: DateTime<Utc>) -> Result<ChallengeRecord> {
        let record = self
            .store
            .load(challenge_id)
            .await?
            .ok_or(AuthError::ChallengeNotFound)?;
        if now >= record.expires_at {
            return Err(AuthError::ChallengeExpired);
        }
        Ok(record)
    }

    /// Verify a hashed-secret challenge (magic link, email/SMS code).
    ///
    /// Success consumes the challenge atomically; a failure burns one
    /// attempt and consumes terminally when the budget is exhausted.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidCredential`] on a wrong secret with budget left,
    /// [`AuthError::ChallengeAttemptsExhausted`] when this failure spends
    /// the last attempt, [`AuthError::ChallengeAlreadyConsumed`] when a
    /// concurrent verification won the race, plus the [`Self::peek`] errors.
    pub async fn verify_hashed_secret(
        &self,
        challenge_id: ChallengeId,
        presented: &str,
        now: DateTime<Utc>,
    ) -> Result<ChallengeRecord> {
        let record = self.peek(challenge_id, now).await?;
        let ChallengeSecret::HashedSecret { hash } = &record.secret else {
            return Err(AuthError::InvariantViolation(
                "hashed-secret verification on a non-secret challenge".into(),
            ));
        };

        let presented_hash = hash_secret(presented);
        if constant_time_eq(presented_hash.as_bytes(), hash.as_bytes()) {
            return self
                .store
                .consume(challenge_id)
                .await?
                .ok_or(AuthError::ChallengeAlreadyConsumed);
        }

        self.burn_attempt(&record).await
    }

    /// Verify a TOTP challenge against the enrollment's opened seed.
    ///
    /// Codes from the current window and ±`drift_windows` verify.
    ///
    /// # Errors
    ///
    /// Same surface as [`Self::verify_hashed_secret`].
    pub async fn verify_totp_code(
        &self,
        challenge_id: ChallengeId,
        code: &str,
        seed: &[u8],
        drift_windows: u8,
        now: DateTime<Utc>,
    ) -> Result<ChallengeRecord> {
        let record = self.peek(challenge_id, now).await?;
        if record.secret != ChallengeSecret::TotpRef {
            return Err(AuthError::InvariantViolation(
                "totp verification on a non-totp challenge".into(),
            ));
        }

        if totp_matches(code, seed, drift_windows, now)? {
            return self
                .store
                .consume(challenge_id)
                .await?
                .ok_or(AuthError::ChallengeAlreadyConsumed);
        }

        self.burn_attempt(&record).await
    }

    /// Consume a WebAuthn challenge after its ceremony verified.
    ///
    /// Call this *before* trusting the ceremony result so a concurrent
    /// verification cannot double-spend the nonce.
    ///
    /// # Errors
    ///
    /// [`AuthError::ChallengeAlreadyConsumed`] when another verification won
    /// the race, plus the [`Self::peek`] errors.
    pub async fn consume_webauthn(
        &self,
        challenge_id: ChallengeId,
        now: DateTime<Utc>,
    ) -> Result<ChallengeRecord> {
        let record = self.peek(challenge_id, now).await?;
        if !matches!(record.secret, ChallengeSecret::WebAuthn { .. }) {
            return Err(AuthError::InvariantViolation(
                "webauthn consumption on a non-webauthn challenge".into(),
            ));
        }
        self.store
            .consume(challenge_id)
            .await?
            .ok_or(AuthError::ChallengeAlreadyConsumed)
    }

    // ── internals ──────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn put_hashed(
        &self,
        variant: ChallengeVariant,
        user_id: Option<UserId>,
        fingerprint_hash: &str,
        prior_factors: AuthFactors,
        secret: &str,
        max_attempts: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ChallengeId> {
        let record = ChallengeRecord {
            challenge_id: ChallengeId::new(),
            variant,
            user_id,
            fingerprint_hash: fingerprint_hash.to_string(),
            secret: ChallengeSecret::HashedSecret { hash: hash_secret(secret) },
            prior_factors,
            issued_at: now,
            expires_at: now + ttl,
            attempts: 0,
            max_attempts,
        };
        self.store.put(&record, ttl).await?;
        Ok(record.challenge_id)
    }

    /// Record a failed attempt; exhausting the budget consumes terminally.
    async fn burn_attempt(&self, record: &ChallengeRecord) -> Result<ChallengeRecord> {
        match self.store.record_attempt(record.challenge_id).await? {
            None => Err(AuthError::ChallengeAlreadyConsumed),
            Some(attempts) if attempts >= record.max_attempts => {
                let _ = self.store.consume(record.challenge_id).await?;
                Err(AuthError::ChallengeAttemptsExhausted)
            }
            Some(_) => Err(AuthError::InvalidCredential),
        }
    }
}

/// SHA-256 (hex) of a challenge secret.
fn hash_secret(secret: &str) -> String {
    hex_encode(&Sha256::digest(secret.as_bytes()))
}

/// Check a TOTP code against the seed for the window at `now` ± drift.
fn totp_matches(code: &str, seed: &[u8], drift_windows: u8, now: DateTime<Utc>) -> Result<bool> {
    let totp = TOTP::new(
        TotpAlgorithm::SHA1,
        CODE_DIGITS as usize,
        drift_windows,
        30,
        seed.to_vec(),
    )
    .map_err(|_| AuthError::InvariantViolation("totp seed rejected".into()))?;

    #[allow(clippy::cast_sign_loss)]
    let timestamp = now.timestamp().max(0) as u64;
    Ok(totp.check(code, timestamp))
}

/// Generate a TOTP seed suitable for enrollment (160 bits, RFC 4226 size).
#[must_use]
pub fn generate_totp_seed() -> Vec<u8> {
    let mut seed = vec![0u8; 20];
    OsRng.fill_bytes(&mut seed);
    seed
}

/// Compute the current code for a seed. Test and enrollment-provisioning
/// helper; production verification goes through the broker.
///
/// # Errors
///
/// Returns an error when the seed is rejected by the TOTP construction.
pub fn current_totp_code(seed: &[u8], now: DateTime<Utc>) -> Result<String> {
    let totp = TOTP::new(TotpAlgorithm::SHA1, CODE_DIGITS as usize, 1, 30, seed.to_vec())
        .map_err(|_| AuthError::InvariantViolation("totp seed rejected".into()))?;
    #[allow(clippy::cast_sign_loss)]
    let timestamp = now.timestamp().max(0) as u64;
    Ok(totp.generate(timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockChallengeStore;

    fn broker() -> ChallengeBroker<MockChallengeStore> {
        ChallengeBroker::new(MockChallengeStore::new())
    }

    #[tokio::test]
    async fn magic_link_round_trip() {
        let broker = broker();
        let now = Utc::now();
        let user = UserId::new();
        let (id, secret) = broker
            .issue_magic_link(Some(user), "fp", AuthFactors::NONE, Duration::minutes(15), now)
            .await
            .unwrap();

        let record = broker.verify_hashed_secret(id, &secret, now).await.unwrap();
        assert_eq!(record.user_id, Some(user));

        // Consumed: the same secret never verifies twice.
        let again = broker.verify_hashed_secret(id, &secret, now).await;
        assert!(matches!(
            again,
            Err(AuthError::ChallengeNotFound | AuthError::ChallengeAlreadyConsumed)
        ));
    }

    #[tokio::test]
    async fn wrong_magic_link_secret_is_terminal() {
        let broker = broker();
        let now = Utc::now();
        let (id, secret) = broker
            .issue_magic_link(Some(UserId::new()), "fp", AuthFactors::NONE, Duration::minutes(15), now)
            .await
            .unwrap();

        // Single-attempt budget: one wrong guess burns the link.
        let result = broker.verify_hashed_secret(id, "wrong-secret", now).await;
        assert_eq!(result, Err(AuthError::ChallengeAttemptsExhausted));
        let replay = broker.verify_hashed_secret(id, &secret, now).await;
        assert!(matches!(
            replay,
            Err(AuthError::ChallengeNotFound | AuthError::ChallengeAlreadyConsumed)
        ));
    }

    #[tokio::test]
    async fn code_challenge_allows_retries_up_to_budget() {
        let broker = broker();
        let now = Utc::now();
        let (id, code) = broker
            .issue_code(
                ChallengeVariant::EmailCode,
                UserId::new(),
                "fp",
                AuthFactors::KNOWLEDGE,
                3,
                Duration::minutes(10),
                now,
            )
            .await
            .unwrap();

        assert_eq!(
            broker.verify_hashed_secret(id, "000000", now).await,
            Err(AuthError::InvalidCredential)
        );
        assert_eq!(
            broker.verify_hashed_secret(id, "111111", now).await,
            Err(AuthError::InvalidCredential)
        );
        // Correct code on the last attempt still wins.
        let record = broker.verify_hashed_secret(id, &code, now).await.unwrap();
        assert_eq!(record.prior_factors, AuthFactors::KNOWLEDGE);
    }

    #[tokio::test]
    async fn exhausted_budget_is_terminal_even_with_correct_code() {
        let broker = broker();
        let now = Utc::now();
        let (id, code) = broker
            .issue_code(
                ChallengeVariant::SmsCode,
                UserId::new(),
                "fp",
                AuthFactors::NONE,
                2,
                Duration::minutes(10),
                now,
            )
            .await
            .unwrap();

        assert_eq!(
            broker.verify_hashed_secret(id, "000000", now).await,
            Err(AuthError::InvalidCredential)
        );
        assert_eq!(
            broker.verify_hashed_secret(id, "111111", now).await,
            Err(AuthError::ChallengeAttemptsExhausted)
        );
        let after = broker.verify_hashed_secret(id, &code, now).await;
        assert!(matches!(
            after,
            Err(AuthError::ChallengeNotFound | AuthError::ChallengeAlreadyConsumed)
        ));
    }

    #[tokio::test]
    async fn expired_challenge_is_rejected() {
        let broker = broker();
        let now = Utc::now();
        let (id, secret) = broker
            .issue_magic_link(None, "fp", AuthFactors::NONE, Duration::minutes(15), now)
            .await
            .unwrap();

        let later = now + Duration::minutes(15);
        assert_eq!(
            broker.verify_hashed_secret(id, &secret, later).await,
            Err(AuthError::ChallengeExpired)
        );
    }

    #[tokio::test]
    async fn concurrent_verifications_consume_exactly_once() {
        let broker = std::sync::Arc::new(broker());
        let now = Utc::now();
        let (id, secret) = broker
            .issue_magic_link(Some(UserId::new()), "fp", AuthFactors::NONE, Duration::minutes(15), now)
            .await
            .unwrap();

        let mut handles = vec![];
        for _ in 0..8 {
            let broker = std::sync::Arc::clone(&broker);
            let secret = secret.clone();
            handles.push(tokio::spawn(async move {
                broker.verify_hashed_secret(id, &secret, now).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn totp_drift_accepts_adjacent_windows_only() {
        let broker = broker();
        let now = Utc::now();
        let seed = generate_totp_seed();
        let user = UserId::new();

        // Code from the previous 30-second window, drift 1: accepted.
        let id = broker
            .issue_totp(user, "fp", AuthFactors::KNOWLEDGE, 5, Duration::minutes(5), now)
            .await
            .unwrap();
        let previous_window = current_totp_code(&seed, now - Duration::seconds(30)).unwrap();
        assert!(
            broker
                .verify_totp_code(id, &previous_window, &seed, 1, now)
                .await
                .is_ok()
        );

        // Two windows back, drift 1: rejected.
        let id = broker
            .issue_totp(user, "fp", AuthFactors::KNOWLEDGE, 5, Duration::minutes(5), now)
            .await
            .unwrap();
        let stale = current_totp_code(&seed, now - Duration::seconds(90)).unwrap();
        let result = broker.verify_totp_code(id, &stale, &seed, 1, now).await;
        assert_eq!(result, Err(AuthError::InvalidCredential));
    }
}
