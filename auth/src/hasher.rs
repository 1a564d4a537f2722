//! Argon2id password hashing with pepper rotation.
//!
//! The pepper is mixed into the password via HMAC-SHA256 before hashing, so
//! a stolen digest table is useless without the process-held pepper. Peppers
//! are versioned through the key store: verification accepts any digest
//! whose pepper version is still in the active set and reports
//! `needs_rehash` when either the pepper or the Argon2 parameters are stale,
//! letting the orchestrator transparently re-hash on the next success.
//!
//! Digest comparison is constant-time (inside `argon2`); the dummy-verify
//! path keeps the user-missing case on the same timing profile.

use crate::config::PasswordHashParams;
use crate::error::{AuthError, Result};
use crate::keys::{KeyStore, KeyVersion};
use argon2::password_hash::{PasswordHash, SaltString, rand_core::OsRng};
use argon2::{Algorithm, Argon2, Params, PasswordHasher as _, PasswordVerifier as _, Version};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A freshly produced digest plus the pepper version baked into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedPassword {
    /// PHC-format Argon2id digest (parameters and salt embedded).
    pub digest: String,
    /// Pepper version mixed into the password before hashing.
    pub pepper_version: KeyVersion,
}

/// Result of a successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOutcome {
    /// Digest used stale parameters or a non-primary pepper; re-hash now.
    pub needs_rehash: bool,
}

/// Argon2id password hasher.
#[derive(Debug, Clone)]
pub struct PasswordHasher {
    params: PasswordHashParams,
    /// Digest verified for unknown users so the miss path costs the same.
    dummy_digest: String,
}

impl PasswordHasher {
    /// Create a hasher with the configured Argon2id parameters.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidInput`] if the parameters are outside
    /// Argon2's accepted ranges.
    pub fn new(params: PasswordHashParams) -> Result<Self> {
        let argon2 = argon2_for(params)?;
        let salt = SaltString::generate(&mut OsRng);
        let dummy_digest = argon2
            .hash_password(b"vigil-dummy-password", &salt)
            .map_err(|e| AuthError::InvalidInput(format!("argon2 parameters rejected: {e}")))?
            .to_string();
        Ok(Self { params, dummy_digest })
    }

    /// Hash a password with the current primary pepper.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvariantViolation`] if hashing fails.
    pub fn hash(&self, password: &str, keys: &KeyStore) -> Result<HashedPassword> {
        let (pepper_version, pepper) = keys.current_pepper();
        let peppered = pepper_password(&pepper, password);

        let argon2 = argon2_for(self.params)?;
        let salt = SaltString::generate(&mut OsRng);
        let digest = argon2
            .hash_password(&peppered, &salt)
            .map_err(|_| AuthError::InvariantViolation("password hashing failed".into()))?
            .to_string();

        Ok(HashedPassword { digest, pepper_version })
    }

    /// Verify a password against a stored digest.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidCredential`] on mismatch or a pepper version no
    /// longer in the active set, [`AuthError::LegacyAlgorithm`] on a digest
    /// whose algorithm is retired.
    pub fn verify(
        &self,
        password: &str,
        digest: &str,
        pepper_version: KeyVersion,
        keys: &KeyStore,
    ) -> Result<VerifyOutcome> {
        if !digest.starts_with("$argon2id$") {
            return Err(AuthError::LegacyAlgorithm);
        }
        let Some(pepper) = keys.pepper(pepper_version) else {
            // Retired pepper: burn the same time as a real mismatch.
            self.verify_dummy(password);
            return Err(AuthError::InvalidCredential);
        };

        let peppered = pepper_password(&pepper, password);
        let parsed = PasswordHash::new(digest)
            .map_err(|_| AuthError::SerializationError("stored digest malformed".into()))?;

        Argon2::default()
            .verify_password(&peppered, &parsed)
            .map_err(|_| AuthError::InvalidCredential)?;

        let stale_params = !digest_matches_params(&parsed, self.params);
        let stale_pepper = keys.current_pepper().0 != pepper_version;
        Ok(VerifyOutcome {
            needs_rehash: stale_params || stale_pepper,
        })
    }

    /// Burn a full verification against the dummy digest.
    ///
    /// The user-lookup-miss path calls this so user-absent and
    /// password-mismatch take the same time.
    pub fn verify_dummy(&self, password: &str) {
        if let Ok(parsed) = PasswordHash::new(&self.dummy_digest) {
            let _ = Argon2::default().verify_password(password.as_bytes(), &parsed);
        }
    }
}

/// HMAC-SHA256(pepper, password): fixed-width peppered input for Argon2.
fn pepper_password(pepper: &[u8], password: &str) -> [u8; 32] {
    // HMAC accepts any key length.
    #[allow(clippy::unwrap_used)]
    let mut mac = HmacSha256::new_from_slice(pepper).unwrap();
    mac.update(password.as_bytes());
    mac.finalize().into_bytes().into()
}

fn argon2_for(params: PasswordHashParams) -> Result<Argon2<'static>> {
    let params = Params::new(params.memory_kib, params.time_cost, params.parallelism, None)
        .map_err(|e| AuthError::InvalidInput(format!("argon2 parameters rejected: {e}")))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Whether a parsed digest carries the currently configured parameters.
fn digest_matches_params(parsed: &PasswordHash<'_>, expected: PasswordHashParams) -> bool {
    Params::try_from(parsed).is_ok_and(|p| {
        p.m_cost() == expected.memory_kib
            && p.t_cost() == expected.time_cost
            && p.p_cost() == expected.parallelism
    })
}
