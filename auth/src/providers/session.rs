//! Session store trait.

use crate::error::Result;
use crate::state::{RevocationReason, Session, SessionId, UserId};
use chrono::{DateTime, Duration, Utc};

/// Outcome of a refresh rotation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RotateOutcome {
    /// The presented hash matched the current generation; the family rotated
    /// atomically and this is the updated session.
    Rotated(Session),

    /// The presented hash belonged to a superseded generation: theft
    /// evidence. The store has already revoked the whole family; the caller
    /// emits the critical event.
    Reused {
        /// The revoked session, for event details.
        session: Session,
    },

    /// The hash maps to no live family (never issued, reaped, or the family
    /// was revoked earlier).
    Unknown,

    /// The family exists but its refresh window or absolute lifetime is
    /// over.
    Expired,
}

/// Authoritative record of live sessions, refresh families, and their
/// current generation (session tier: durable, low-latency).
///
/// # Consistency
///
/// Rotation is serializable per family: implementations perform the
/// compare-and-swap on (family, generation) atomically (Lua script in Redis,
/// a mutex in the in-memory mock). Either the new tuple commits or nothing
/// changes; a cancelled rotation never partially rotates. Revocations across
/// families only need eventual consistency — the access-token
/// security-version check closes the window.
pub trait SessionStore: Send + Sync {
    /// Persist a new session and index it by user, family, and refresh hash.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a session-ID collision.
    fn create_session(
        &self,
        session: &Session,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Fetch a session by ID.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    fn get_session(
        &self,
        session_id: SessionId,
    ) -> impl std::future::Future<Output = Result<Option<Session>>> + Send;

    /// Atomically rotate the family owning `presented_hash`.
    ///
    /// On success: generation increments, `new_hash` becomes current, the
    /// refresh window extends by `refresh_ttl` capped at the absolute
    /// lifetime, and `access_expires_at` is updated — all in one step.
    /// On a superseded hash: the family is revoked before returning
    /// [`RotateOutcome::Reused`].
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    fn rotate_refresh(
        &self,
        presented_hash: &str,
        new_hash: &str,
        now: DateTime<Utc>,
        refresh_ttl: Duration,
        access_expires_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<RotateOutcome>> + Send;

    /// Revoke one session. Returns `false` when the session was not found.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn revoke_session(
        &self,
        session_id: SessionId,
        reason: RevocationReason,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Revoke every live session for a user. Returns the count revoked.
    ///
    /// The caller pairs this with a security-version bump so outstanding
    /// access tokens die at their next validation.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn revoke_all_for_user(
        &self,
        user_id: UserId,
        reason: RevocationReason,
    ) -> impl std::future::Future<Output = Result<usize>> + Send;

    /// Live (non-revoked, non-expired) sessions for a user.
    ///
    /// The orchestrator joins these with device rows
    /// ([`crate::orchestrator::Authenticator::list_sessions`]) for
    /// device-management surfaces.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    fn list_active(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Session>>> + Send;

    /// Sweep expired sessions and families past the absolute cap. Returns
    /// the count removed.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn reap(&self, now: DateTime<Utc>)
    -> impl std::future::Future<Output = Result<usize>> + Send;
}
