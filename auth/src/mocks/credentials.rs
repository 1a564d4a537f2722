//! Mock credential registry.

use crate::config::LockoutConfig;
use crate::error::{AuthError, Result};
use crate::providers::credentials::{
    ContactChannel, CredentialRegistry, FailureRecord, PasswordCredential, TotpEnrollment,
    WebAuthnCredential,
};
use crate::state::UserId;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Inner {
    passwords: HashMap<UserId, PasswordCredential>,
    webauthn: Vec<WebAuthnCredential>,
    totp: HashMap<UserId, TotpEnrollment>,
    channels: Vec<ContactChannel>,
}

/// In-memory [`CredentialRegistry`] enforcing the at-most-one invariants.
#[derive(Debug, Clone, Default)]
pub struct MockCredentialRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl MockCredentialRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a contact channel. Test wiring helper.
    pub fn add_contact_channel(&self, channel: ContactChannel) {
        self.lock().channels.push(channel);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl CredentialRegistry for MockCredentialRegistry {
    async fn find_password_for(&self, user_id: UserId) -> Result<Option<PasswordCredential>> {
        Ok(self.lock().passwords.get(&user_id).cloned())
    }

    async fn upsert_password(&self, credential: &PasswordCredential) -> Result<()> {
        // At most one active password credential: upsert replaces.
        self.lock().passwords.insert(credential.user_id, credential.clone());
        Ok(())
    }

    async fn list_webauthn_for(&self, user_id: UserId) -> Result<Vec<WebAuthnCredential>> {
        Ok(self
            .lock()
            .webauthn
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn add_webauthn(&self, credential: &WebAuthnCredential) -> Result<()> {
        let mut inner = self.lock();
        if inner
            .webauthn
            .iter()
            .any(|c| c.credential_id == credential.credential_id)
        {
            return Err(AuthError::InvalidInput("credential id already registered".into()));
        }
        inner.webauthn.push(credential.clone());
        Ok(())
    }

    async fn update_webauthn_counter(
        &self,
        credential_id: &[u8],
        counter: u32,
        used_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let credential = inner
            .webauthn
            .iter_mut()
            .find(|c| c.credential_id == credential_id)
            .ok_or(AuthError::InvalidCredential)?;
        if counter <= credential.counter {
            return Err(AuthError::InvalidCredential);
        }
        credential.counter = counter;
        credential.last_used = Some(used_at);
        Ok(())
    }

    async fn find_totp_for(&self, user_id: UserId) -> Result<Option<TotpEnrollment>> {
        Ok(self.lock().totp.get(&user_id).cloned())
    }

    async fn upsert_totp(&self, enrollment: &TotpEnrollment) -> Result<()> {
        // At most one primary enrollment: upsert replaces.
        self.lock().totp.insert(enrollment.user_id, enrollment.clone());
        Ok(())
    }

    async fn find_contact_channels_for(&self, user_id: UserId) -> Result<Vec<ContactChannel>> {
        Ok(self
            .lock()
            .channels
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn record_failure(
        &self,
        user_id: UserId,
        lockout: &LockoutConfig,
        now: DateTime<Utc>,
    ) -> Result<FailureRecord> {
        let mut inner = self.lock();
        let credential = inner
            .passwords
            .get_mut(&user_id)
            .ok_or_else(|| AuthError::InvariantViolation("failure recorded without credential".into()))?;

        credential.failed_attempts += 1;
        credential.updated_at = now;

        let duration = lockout.duration_for(credential.failed_attempts);
        let lockout_until = if duration > Duration::zero() {
            let until = now + duration;
            credential.lockout_until = Some(until);
            Some(until)
        } else {
            None
        };

        Ok(FailureRecord {
            failed_attempts: credential.failed_attempts,
            lockout_until,
            lockout_armed: credential.failed_attempts == lockout.threshold,
        })
    }

    async fn record_success(&self, user_id: UserId) -> Result<()> {
        if let Some(credential) = self.lock().passwords.get_mut(&user_id) {
            credential.failed_attempts = 0;
            credential.lockout_until = None;
        }
        Ok(())
    }

    async fn remove_credentials_for(&self, user_id: UserId) -> Result<()> {
        let mut inner = self.lock();
        inner.passwords.remove(&user_id);
        inner.webauthn.retain(|c| c.user_id != user_id);
        inner.totp.remove(&user_id);
        inner.channels.retain(|c| c.user_id != user_id);
        Ok(())
    }
}
