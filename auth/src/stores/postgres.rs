//! PostgreSQL repositories for the durable tier.
//!
//! Users, credentials, and devices live in PostgreSQL; secret-bearing
//! fields (TOTP seeds, scratch codes) arrive here already sealed by the key
//! store, so the rows never contain plaintext secrets.
//!
//! Queries are written against the runtime API (`sqlx::query`) rather than
//! the compile-time macros, so the crate builds without `DATABASE_URL`.

use crate::config::LockoutConfig;
use crate::error::{AuthError, Result};
use crate::keys::SealedSecret;
use crate::providers::credentials::{
    ContactChannel, ContactKind, CredentialRegistry, FailureRecord, PasswordCredential,
    TotpEnrollment, WebAuthnCredential,
};
use crate::providers::device::DeviceRepository;
use crate::providers::user::UserRepository;
use crate::state::{Device, DeviceId, DeviceTrustLevel, User, UserId, UserStatus};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

fn db_error(context: &str, error: sqlx::Error) -> AuthError {
    AuthError::TemporaryFailure(format!("{context}: {error}"))
}

const fn status_str(status: UserStatus) -> &'static str {
    match status {
        UserStatus::Active => "active",
        UserStatus::Locked => "locked",
        UserStatus::Suspended => "suspended",
        UserStatus::Deleted => "deleted",
    }
}

fn status_from(value: &str) -> UserStatus {
    match value {
        "locked" => UserStatus::Locked,
        "suspended" => UserStatus::Suspended,
        "deleted" => UserStatus::Deleted,
        _ => UserStatus::Active,
    }
}

const fn trust_str(level: DeviceTrustLevel) -> &'static str {
    match level {
        DeviceTrustLevel::Unknown => "unknown",
        DeviceTrustLevel::Seen => "seen",
        DeviceTrustLevel::Trusted => "trusted",
    }
}

fn trust_from(value: &str) -> DeviceTrustLevel {
    match value {
        "seen" => DeviceTrustLevel::Seen,
        "trusted" => DeviceTrustLevel::Trusted,
        _ => DeviceTrustLevel::Unknown,
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Users
// ═══════════════════════════════════════════════════════════════════════

/// PostgreSQL-backed [`UserRepository`].
#[derive(Clone)]
pub struct PostgresUserRepository {
    pool: PgPool,
}

impl PostgresUserRepository {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn user_from_row(row: &PgRow) -> Result<User> {
        Ok(User {
            user_id: UserId(row.try_get("user_id").map_err(row_error)?),
            email: row.try_get("email").map_err(row_error)?,
            display_name: row.try_get("display_name").map_err(row_error)?,
            status: status_from(&row.try_get::<String, _>("status").map_err(row_error)?),
            email_verified: row.try_get("email_verified").map_err(row_error)?,
            security_version: to_u32(row.try_get::<i64, _>("security_version").map_err(row_error)?),
            created_at: row.try_get("created_at").map_err(row_error)?,
            updated_at: row.try_get("updated_at").map_err(row_error)?,
        })
    }
}

impl UserRepository for PostgresUserRepository {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT user_id, email, display_name, status, email_verified, security_version, \
             created_at, updated_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find user by email", e))?;
        row.as_ref().map(Self::user_from_row).transpose()
    }

    async fn find_by_id(&self, user_id: UserId) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT user_id, email, display_name, status, email_verified, security_version, \
             created_at, updated_at FROM users WHERE user_id = $1",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find user by id", e))?;
        row.as_ref().map(Self::user_from_row).transpose()
    }

    async fn security_version(&self, user_id: UserId) -> Result<Option<u32>> {
        let row = sqlx::query("SELECT security_version FROM users WHERE user_id = $1")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("read security version", e))?;
        row.map(|row| {
            row.try_get::<i64, _>("security_version")
                .map(to_u32)
                .map_err(row_error)
        })
        .transpose()
    }

    async fn bump_security_version(&self, user_id: UserId) -> Result<u32> {
        let row = sqlx::query(
            "UPDATE users SET security_version = security_version + 1, updated_at = $2 \
             WHERE user_id = $1 RETURNING security_version",
        )
        .bind(user_id.0)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("bump security version", e))?
        .ok_or_else(|| AuthError::InvariantViolation("security version bump on unknown user".into()))?;
        row.try_get::<i64, _>("security_version")
            .map(to_u32)
            .map_err(row_error)
    }

    async fn create(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (user_id, email, display_name, status, email_verified, \
             security_version, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(user.user_id.0)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(status_str(user.status))
        .bind(user.email_verified)
        .bind(i64::from(user.security_version))
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("create user", e))?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Credentials
// ═══════════════════════════════════════════════════════════════════════

/// PostgreSQL-backed [`CredentialRegistry`].
///
/// The at-most-one invariants ride on primary keys: `password_credentials`
/// and `totp_enrollments` key on `user_id`, so an upsert replaces.
#[derive(Clone)]
pub struct PostgresCredentialRegistry {
    pool: PgPool,
}

impl PostgresCredentialRegistry {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CredentialRegistry for PostgresCredentialRegistry {
    async fn find_password_for(&self, user_id: UserId) -> Result<Option<PasswordCredential>> {
        let row = sqlx::query(
            "SELECT user_id, digest, pepper_version, created_at, updated_at, failed_attempts, \
             lockout_until FROM password_credentials WHERE user_id = $1",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find password", e))?;

        row.map(|row| {
            Ok(PasswordCredential {
                user_id: UserId(row.try_get("user_id").map_err(row_error)?),
                digest: row.try_get("digest").map_err(row_error)?,
                pepper_version: to_u32(row.try_get::<i64, _>("pepper_version").map_err(row_error)?),
                created_at: row.try_get("created_at").map_err(row_error)?,
                updated_at: row.try_get("updated_at").map_err(row_error)?,
                failed_attempts: to_u32(
                    row.try_get::<i64, _>("failed_attempts").map_err(row_error)?,
                ),
                lockout_until: row.try_get("lockout_until").map_err(row_error)?,
            })
        })
        .transpose()
    }

    async fn upsert_password(&self, credential: &PasswordCredential) -> Result<()> {
        sqlx::query(
            "INSERT INTO password_credentials (user_id, digest, pepper_version, created_at, \
             updated_at, failed_attempts, lockout_until) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (user_id) DO UPDATE SET digest = $2, pepper_version = $3, \
             updated_at = $5, failed_attempts = $6, lockout_until = $7",
        )
        .bind(credential.user_id.0)
        .bind(&credential.digest)
        .bind(i64::from(credential.pepper_version))
        .bind(credential.created_at)
        .bind(credential.updated_at)
        .bind(i64::from(credential.failed_attempts))
        .bind(credential.lockout_until)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("upsert password", e))?;
        Ok(())
    }

    async fn list_webauthn_for(&self, user_id: UserId) -> Result<Vec<WebAuthnCredential>> {
        let rows = sqlx::query(
            "SELECT credential_id, user_id, passkey, counter, aaguid, attachment, transports, \
             name, created_at, last_used FROM webauthn_credentials WHERE user_id = $1",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list webauthn", e))?;

        rows.iter()
            .map(|row| {
                let passkey: String = row.try_get("passkey").map_err(row_error)?;
                Ok(WebAuthnCredential {
                    credential_id: row.try_get("credential_id").map_err(row_error)?,
                    user_id: UserId(row.try_get("user_id").map_err(row_error)?),
                    passkey: serde_json::from_str(&passkey)
                        .map_err(|e| AuthError::SerializationError(e.to_string()))?,
                    counter: to_u32(row.try_get::<i64, _>("counter").map_err(row_error)?),
                    aaguid: row.try_get("aaguid").map_err(row_error)?,
                    attachment: row.try_get("attachment").map_err(row_error)?,
                    transports: row.try_get("transports").map_err(row_error)?,
                    name: row.try_get("name").map_err(row_error)?,
                    created_at: row.try_get("created_at").map_err(row_error)?,
                    last_used: row.try_get("last_used").map_err(row_error)?,
                })
            })
            .collect()
    }

    async fn add_webauthn(&self, credential: &WebAuthnCredential) -> Result<()> {
        let passkey = serde_json::to_string(&credential.passkey)
            .map_err(|e| AuthError::SerializationError(e.to_string()))?;
        sqlx::query(
            "INSERT INTO webauthn_credentials (credential_id, user_id, passkey, counter, aaguid, \
             attachment, transports, name, created_at, last_used) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&credential.credential_id)
        .bind(credential.user_id.0)
        .bind(passkey)
        .bind(i64::from(credential.counter))
        .bind(&credential.aaguid)
        .bind(&credential.attachment)
        .bind(&credential.transports)
        .bind(&credential.name)
        .bind(credential.created_at)
        .bind(credential.last_used)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("add webauthn", e))?;
        Ok(())
    }

    async fn update_webauthn_counter(
        &self,
        credential_id: &[u8],
        counter: u32,
        used_at: DateTime<Utc>,
    ) -> Result<()> {
        // Strictly-increasing guard lives in the predicate.
        let result = sqlx::query(
            "UPDATE webauthn_credentials SET counter = $2, last_used = $3 \
             WHERE credential_id = $1 AND counter < $2",
        )
        .bind(credential_id)
        .bind(i64::from(counter))
        .bind(used_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("update counter", e))?;

        if result.rows_affected() == 0 {
            return Err(AuthError::InvalidCredential);
        }
        Ok(())
    }

    async fn find_totp_for(&self, user_id: UserId) -> Result<Option<TotpEnrollment>> {
        let row = sqlx::query(
            "SELECT user_id, key_version, nonce, ciphertext, drift_windows, scratch_code_hashes, \
             created_at FROM totp_enrollments WHERE user_id = $1",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find totp", e))?;

        row.map(|row| {
            Ok(TotpEnrollment {
                user_id: UserId(row.try_get("user_id").map_err(row_error)?),
                secret: SealedSecret {
                    key_version: to_u32(row.try_get::<i64, _>("key_version").map_err(row_error)?),
                    nonce: row.try_get("nonce").map_err(row_error)?,
                    ciphertext: row.try_get("ciphertext").map_err(row_error)?,
                },
                drift_windows: to_u8(row.try_get::<i16, _>("drift_windows").map_err(row_error)?),
                scratch_code_hashes: row.try_get("scratch_code_hashes").map_err(row_error)?,
                created_at: row.try_get("created_at").map_err(row_error)?,
            })
        })
        .transpose()
    }

    async fn upsert_totp(&self, enrollment: &TotpEnrollment) -> Result<()> {
        sqlx::query(
            "INSERT INTO totp_enrollments (user_id, key_version, nonce, ciphertext, \
             drift_windows, scratch_code_hashes, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (user_id) DO UPDATE SET key_version = $2, nonce = $3, ciphertext = $4, \
             drift_windows = $5, scratch_code_hashes = $6",
        )
        .bind(enrollment.user_id.0)
        .bind(i64::from(enrollment.secret.key_version))
        .bind(&enrollment.secret.nonce)
        .bind(&enrollment.secret.ciphertext)
        .bind(i16::from(enrollment.drift_windows))
        .bind(&enrollment.scratch_code_hashes)
        .bind(enrollment.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("upsert totp", e))?;
        Ok(())
    }

    async fn find_contact_channels_for(&self, user_id: UserId) -> Result<Vec<ContactChannel>> {
        let rows = sqlx::query(
            "SELECT user_id, kind, address, verified FROM contact_channels WHERE user_id = $1",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("find channels", e))?;

        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("kind").map_err(row_error)?;
                Ok(ContactChannel {
                    user_id: UserId(row.try_get("user_id").map_err(row_error)?),
                    kind: if kind == "phone" { ContactKind::Phone } else { ContactKind::Email },
                    address: row.try_get("address").map_err(row_error)?,
                    verified: row.try_get("verified").map_err(row_error)?,
                })
            })
            .collect()
    }

    async fn record_failure(
        &self,
        user_id: UserId,
        lockout: &LockoutConfig,
        now: DateTime<Utc>,
    ) -> Result<FailureRecord> {
        let row = sqlx::query(
            "UPDATE password_credentials SET failed_attempts = failed_attempts + 1, \
             updated_at = $2 WHERE user_id = $1 RETURNING failed_attempts",
        )
        .bind(user_id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("record failure", e))?
        .ok_or_else(|| AuthError::InvariantViolation("failure recorded without credential".into()))?;

        let failed_attempts = to_u32(row.try_get::<i64, _>("failed_attempts").map_err(row_error)?);
        let lockout_duration = lockout.duration_for(failed_attempts);
        let lockout_until = if lockout_duration > chrono::Duration::zero() {
            let until = now + lockout_duration;
            sqlx::query("UPDATE password_credentials SET lockout_until = $2 WHERE user_id = $1")
                .bind(user_id.0)
                .bind(until)
                .execute(&self.pool)
                .await
                .map_err(|e| db_error("arm lockout", e))?;
            Some(until)
        } else {
            None
        };

        Ok(FailureRecord {
            failed_attempts,
            lockout_until,
            lockout_armed: failed_attempts == lockout.threshold,
        })
    }

    async fn record_success(&self, user_id: UserId) -> Result<()> {
        sqlx::query(
            "UPDATE password_credentials SET failed_attempts = 0, lockout_until = NULL \
             WHERE user_id = $1",
        )
        .bind(user_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("record success", e))?;
        Ok(())
    }

    async fn remove_credentials_for(&self, user_id: UserId) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin cascade", e))?;
        for table in [
            "password_credentials",
            "webauthn_credentials",
            "totp_enrollments",
            "contact_channels",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE user_id = $1"))
                .bind(user_id.0)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("cascade delete", e))?;
        }
        tx.commit().await.map_err(|e| db_error("commit cascade", e))?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Devices
// ═══════════════════════════════════════════════════════════════════════

/// PostgreSQL-backed [`DeviceRepository`].
#[derive(Clone)]
pub struct PostgresDeviceRepository {
    pool: PgPool,
}

impl PostgresDeviceRepository {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn device_from_row(row: &PgRow) -> Result<Device> {
        Ok(Device {
            device_id: DeviceId(row.try_get("device_id").map_err(row_error)?),
            user_id: UserId(row.try_get("user_id").map_err(row_error)?),
            fingerprint_hash: row.try_get("fingerprint_hash").map_err(row_error)?,
            first_seen: row.try_get("first_seen").map_err(row_error)?,
            last_seen: row.try_get("last_seen").map_err(row_error)?,
            trust_level: trust_from(&row.try_get::<String, _>("trust_level").map_err(row_error)?),
            aggregate_risk: row.try_get("aggregate_risk").map_err(row_error)?,
        })
    }
}

impl DeviceRepository for PostgresDeviceRepository {
    async fn find_by_fingerprint(
        &self,
        user_id: UserId,
        fingerprint_hash: &str,
    ) -> Result<Option<Device>> {
        let row = sqlx::query(
            "SELECT device_id, user_id, fingerprint_hash, first_seen, last_seen, trust_level, \
             aggregate_risk FROM devices WHERE user_id = $1 AND fingerprint_hash = $2",
        )
        .bind(user_id.0)
        .bind(fingerprint_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find device", e))?;
        row.as_ref().map(Self::device_from_row).transpose()
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Device>> {
        let rows = sqlx::query(
            "SELECT device_id, user_id, fingerprint_hash, first_seen, last_seen, trust_level, \
             aggregate_risk FROM devices WHERE user_id = $1",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list devices", e))?;
        rows.iter().map(Self::device_from_row).collect()
    }

    async fn upsert(&self, device: &Device) -> Result<()> {
        sqlx::query(
            "INSERT INTO devices (device_id, user_id, fingerprint_hash, first_seen, last_seen, \
             trust_level, aggregate_risk) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (device_id) DO UPDATE SET fingerprint_hash = $3, last_seen = $5, \
             trust_level = $6, aggregate_risk = $7",
        )
        .bind(device.device_id.0)
        .bind(device.user_id.0)
        .bind(&device.fingerprint_hash)
        .bind(device.first_seen)
        .bind(device.last_seen)
        .bind(trust_str(device.trust_level))
        .bind(device.aggregate_risk)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("upsert device", e))?;
        Ok(())
    }
}

fn row_error(error: sqlx::Error) -> AuthError {
    AuthError::SerializationError(format!("row decode: {error}"))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u32(value: i64) -> u32 {
    value.max(0) as u32
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u8(value: i16) -> u8 {
    value.clamp(0, 255) as u8
}
