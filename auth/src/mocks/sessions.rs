//! Mock session store with the same CAS rotation semantics as Redis.

use crate::error::{AuthError, Result};
use crate::providers::session::{RotateOutcome, SessionStore};
use crate::state::{FamilyId, RevocationReason, Session, SessionId, UserId};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    /// Every refresh hash ever issued → (family, generation), including
    /// superseded generations, so reuse is distinguishable from unknown.
    hash_index: HashMap<String, (FamilyId, u64)>,
    family_index: HashMap<FamilyId, SessionId>,
}

/// In-memory [`SessionStore`]. One mutex makes every operation atomic,
/// which is exactly the per-family serializability the contract asks for.
#[derive(Debug, Clone, Default)]
pub struct MockSessionStore {
    inner: Arc<Mutex<Inner>>,
}

impl MockSessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of stored sessions (live or revoked). Test helper.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SessionStore for MockSessionStore {
    async fn create_session(&self, session: &Session) -> Result<()> {
        let mut inner = self.lock();
        if inner.sessions.contains_key(&session.session_id) {
            return Err(AuthError::InvariantViolation("session id already exists".into()));
        }
        inner
            .hash_index
            .insert(session.refresh_hash.clone(), (session.family_id, session.generation));
        inner.family_index.insert(session.family_id, session.session_id);
        inner.sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        Ok(self.lock().sessions.get(&session_id).cloned())
    }

    async fn rotate_refresh(
        &self,
        presented_hash: &str,
        new_hash: &str,
        now: DateTime<Utc>,
        refresh_ttl: Duration,
        access_expires_at: DateTime<Utc>,
    ) -> Result<RotateOutcome> {
        let mut inner = self.lock();

        let Some(&(family_id, presented_gen)) = inner.hash_index.get(presented_hash) else {
            return Ok(RotateOutcome::Unknown);
        };
        let Some(&session_id) = inner.family_index.get(&family_id) else {
            return Ok(RotateOutcome::Unknown);
        };
        let Some(session) = inner.sessions.get(&session_id).cloned() else {
            return Ok(RotateOutcome::Unknown);
        };
        if session.revoked {
            return Ok(RotateOutcome::Unknown);
        }
        if now >= session.refresh_expires_at || now >= session.absolute_expires_at {
            return Ok(RotateOutcome::Expired);
        }

        if presented_gen < session.generation {
            // Theft evidence: revoke the whole family before reporting.
            let mut revoked = session;
            revoked.revoked = true;
            revoked.revoked_reason = Some(RevocationReason::RefreshReused);
            inner.sessions.insert(session_id, revoked.clone());
            return Ok(RotateOutcome::Reused { session: revoked });
        }

        let mut rotated = session;
        rotated.generation += 1;
        rotated.refresh_hash = new_hash.to_string();
        rotated.refresh_expires_at = (now + refresh_ttl).min(rotated.absolute_expires_at);
        rotated.access_expires_at = access_expires_at;
        rotated.last_seen = now;
        inner
            .hash_index
            .insert(new_hash.to_string(), (family_id, rotated.generation));
        inner.sessions.insert(session_id, rotated.clone());
        Ok(RotateOutcome::Rotated(rotated))
    }

    async fn revoke_session(
        &self,
        session_id: SessionId,
        reason: RevocationReason,
    ) -> Result<bool> {
        let mut inner = self.lock();
        match inner.sessions.get_mut(&session_id) {
            Some(session) => {
                session.revoked = true;
                session.revoked_reason = Some(reason);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        _reason: RevocationReason,
    ) -> Result<usize> {
        let mut inner = self.lock();
        let doomed: Vec<SessionId> = inner
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.session_id)
            .collect();

        for session_id in &doomed {
            if let Some(session) = inner.sessions.remove(session_id) {
                inner.family_index.remove(&session.family_id);
                inner
                    .hash_index
                    .retain(|_, (family, _)| *family != session.family_id);
            }
        }
        Ok(doomed.len())
    }

    async fn list_active(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<Session>> {
        Ok(self
            .lock()
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_live(now))
            .cloned()
            .collect())
    }

    async fn reap(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock();
        let doomed: Vec<SessionId> = inner
            .sessions
            .values()
            .filter(|s| !s.is_live(now))
            .map(|s| s.session_id)
            .collect();
        for session_id in &doomed {
            if let Some(session) = inner.sessions.remove(session_id) {
                inner.family_index.remove(&session.family_id);
                inner
                    .hash_index
                    .retain(|_, (family, _)| *family != session.family_id);
            }
        }
        Ok(doomed.len())
    }
}
