//! Mock user and device repositories.

use crate::error::{AuthError, Result};
use crate::providers::device::DeviceRepository;
use crate::providers::user::UserRepository;
use crate::state::{Device, DeviceId, User, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory [`UserRepository`] with optional transient-failure injection.
#[derive(Debug, Clone, Default)]
pub struct MockUserRepository {
    users: Arc<Mutex<HashMap<UserId, User>>>,
    /// Remaining calls that fail with a transient error before succeeding.
    fail_budget: Arc<AtomicUsize>,
}

impl MockUserRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with a transient error.
    pub fn fail_next(&self, count: usize) {
        self.fail_budget.store(count, Ordering::SeqCst);
    }

    fn maybe_fail(&self) -> Result<()> {
        let remaining = self.fail_budget.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_budget.store(remaining - 1, Ordering::SeqCst);
            return Err(AuthError::TemporaryFailure("injected".into()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, User>> {
        match self.users.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl UserRepository for MockUserRepository {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        self.maybe_fail()?;
        Ok(self.lock().values().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, user_id: UserId) -> Result<Option<User>> {
        self.maybe_fail()?;
        Ok(self.lock().get(&user_id).cloned())
    }

    async fn security_version(&self, user_id: UserId) -> Result<Option<u32>> {
        self.maybe_fail()?;
        Ok(self.lock().get(&user_id).map(|u| u.security_version))
    }

    async fn bump_security_version(&self, user_id: UserId) -> Result<u32> {
        self.maybe_fail()?;
        let mut users = self.lock();
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| AuthError::InvariantViolation("bump on unknown user".into()))?;
        user.security_version += 1;
        Ok(user.security_version)
    }

    async fn create(&self, user: &User) -> Result<()> {
        self.maybe_fail()?;
        let mut users = self.lock();
        if users.values().any(|u| u.email == user.email) {
            return Err(AuthError::InvalidInput("email already registered".into()));
        }
        users.insert(user.user_id, user.clone());
        Ok(())
    }
}

/// In-memory [`DeviceRepository`].
#[derive(Debug, Clone, Default)]
pub struct MockDeviceRepository {
    devices: Arc<Mutex<HashMap<DeviceId, Device>>>,
}

impl MockDeviceRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceId, Device>> {
        match self.devices.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl DeviceRepository for MockDeviceRepository {
    async fn find_by_fingerprint(
        &self,
        user_id: UserId,
        fingerprint_hash: &str,
    ) -> Result<Option<Device>> {
        Ok(self
            .lock()
            .values()
            .find(|d| d.user_id == user_id && d.fingerprint_hash == fingerprint_hash)
            .cloned())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Device>> {
        Ok(self
            .lock()
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn upsert(&self, device: &Device) -> Result<()> {
        self.lock().insert(device.device_id, device.clone());
        Ok(())
    }
}
