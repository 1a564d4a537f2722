//! Token service: signed access tokens and opaque refresh tokens.
//!
//! Access tokens are a signed claims envelope (`jsonwebtoken`, HS256) whose
//! header carries the signing-key version (`kid`); validation accepts any
//! key still in the active set, so rotation never strands live tokens.
//! Expiry is half-open: a token is valid while `now < exp`, never at `exp`.
//!
//! Refresh tokens are opaque: one version byte plus 256 bits of OS
//! randomness, base64url-encoded. Only the SHA-256 of the encoded token is
//! ever persisted; the rotate-vs-reuse decision on presentation belongs to
//! the session store's compare-and-swap.

use crate::error::{AuthError, Result};
use crate::keys::{KeyStore, KeyVersion};
use crate::state::{AuthFactors, DeviceId, SessionId, UserId};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Version byte prefixed to every refresh token, for future format rotation.
pub const REFRESH_TOKEN_VERSION: u8 = 1;
/// Refresh-token entropy in bytes (256 bits minimum per policy).
const REFRESH_ENTROPY_BYTES: usize = 32;

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Issuer.
    pub iss: String,
    /// Subject user.
    pub sub: uuid::Uuid,
    /// Audience.
    pub aud: String,
    /// Token ID.
    pub jti: uuid::Uuid,
    /// Session ID.
    pub sid: uuid::Uuid,
    /// Device ID.
    pub did: uuid::Uuid,
    /// Authenticated-factors bitset.
    pub fct: u8,
    /// User security version at mint time.
    pub sv: u32,
    /// Issued-at (unix seconds).
    pub iat: i64,
    /// Not-before (unix seconds).
    pub nbf: i64,
    /// Expires-at (unix seconds).
    pub exp: i64,
}

impl AccessClaims {
    /// Subject as a typed ID.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        UserId(self.sub)
    }

    /// Session as a typed ID.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        SessionId(self.sid)
    }

    /// Device as a typed ID.
    #[must_use]
    pub const fn device_id(&self) -> DeviceId {
        DeviceId(self.did)
    }

    /// Factors bitset as a typed value.
    #[must_use]
    pub const fn factors(&self) -> AuthFactors {
        AuthFactors::from_bits(self.fct)
    }

    /// Expiry as a timestamp.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_default()
    }
}

/// A freshly minted refresh token and the hash the session store keeps.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshToken {
    /// Raw token handed to the client. Never persisted, never logged.
    pub raw: String,
    /// SHA-256 (hex) of the raw token; the only stored form.
    pub hash: String,
}

impl std::fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshToken")
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

/// Mints, parses, and validates tokens against the key store.
#[derive(Debug, Clone)]
pub struct TokenService {
    keys: Arc<KeyStore>,
    issuer: String,
    audience: String,
}

impl TokenService {
    /// Create a token service bound to a key store and issuer identity.
    #[must_use]
    pub const fn new(keys: Arc<KeyStore>, issuer: String, audience: String) -> Self {
        Self { keys, issuer, audience }
    }

    /// Mint a signed access token with the primary signing key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvariantViolation`] if signing fails.
    pub fn mint_access(
        &self,
        user_id: UserId,
        session_id: SessionId,
        device_id: DeviceId,
        factors: AuthFactors,
        security_version: u32,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(String, DateTime<Utc>)> {
        let expires_at = now + ttl;
        let claims = AccessClaims {
            iss: self.issuer.clone(),
            sub: user_id.0,
            aud: self.audience.clone(),
            jti: uuid::Uuid::new_v4(),
            sid: session_id.0,
            did: device_id.0,
            fct: factors.bits(),
            sv: security_version,
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let (key_version, secret) = self.keys.current_signing_key();
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(key_version.to_string());

        let token = jsonwebtoken::encode(&header, &claims, &EncodingKey::from_secret(&secret))
            .map_err(|_| AuthError::InvariantViolation("access token signing failed".into()))?;
        Ok((token, expires_at))
    }

    /// Validate signature, time bounds, issuer, and audience.
    ///
    /// The security-version comparison is the caller's job: it needs the
    /// cached per-user value, which this service does not hold.
    ///
    /// # Errors
    ///
    /// [`AuthError::TokenExpired`] once `now >= exp`,
    /// [`AuthError::TokenSignatureInvalid`] for everything else that fails.
    pub fn validate_access(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims> {
        let header =
            jsonwebtoken::decode_header(token).map_err(|_| AuthError::TokenSignatureInvalid)?;
        let key_version: KeyVersion = header
            .kid
            .as_deref()
            .and_then(|kid| kid.parse().ok())
            .ok_or(AuthError::TokenSignatureInvalid)?;
        let secret = self
            .keys
            .signing_key(key_version)
            .ok_or(AuthError::TokenSignatureInvalid)?;

        // Time, issuer, and audience are checked manually below: the expiry
        // comparison must be half-open and leeway-free.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<AccessClaims>(
            token,
            &DecodingKey::from_secret(&secret),
            &validation,
        )
        .map_err(|_| AuthError::TokenSignatureInvalid)?;
        let claims = data.claims;

        if claims.iss != self.issuer || claims.aud != self.audience {
            return Err(AuthError::TokenSignatureInvalid);
        }
        if now.timestamp() < claims.nbf {
            return Err(AuthError::TokenSignatureInvalid);
        }
        if now.timestamp() >= claims.exp {
            return Err(AuthError::TokenExpired);
        }

        Ok(claims)
    }

    /// Mint a fresh opaque refresh token.
    #[must_use]
    pub fn mint_refresh(&self) -> RefreshToken {
        let mut bytes = [0u8; 1 + REFRESH_ENTROPY_BYTES];
        bytes[0] = REFRESH_TOKEN_VERSION;
        OsRng.fill_bytes(&mut bytes[1..]);

        let raw = URL_SAFE_NO_PAD.encode(bytes);
        let hash = hash_refresh(&raw);
        RefreshToken { raw, hash }
    }

    /// Parse a presented refresh token and return its stored-form hash.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RefreshUnknown`] on malformed encoding, wrong
    /// length, or an unknown version byte.
    pub fn refresh_hash(&self, raw: &str) -> Result<String> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| AuthError::RefreshUnknown)?;
        if bytes.len() != 1 + REFRESH_ENTROPY_BYTES || bytes[0] != REFRESH_TOKEN_VERSION {
            return Err(AuthError::RefreshUnknown);
        }
        Ok(hash_refresh(raw))
    }
}

/// SHA-256 (hex) of a refresh token's encoded form.
fn hash_refresh(raw: &str) -> String {
    crate::utils::hex_encode(&Sha256::digest(raw.as_bytes()))
}
