//! Device repository trait.

use crate::error::Result;
use crate::state::{Device, UserId};

/// Device registry (durable tier).
///
/// Devices are pseudonymous: only the fingerprint *hash* is stored, and a
/// device is bound to a user on their first successful authentication from
/// it.
pub trait DeviceRepository: Send + Sync {
    /// Find the user's device carrying this fingerprint hash.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    fn find_by_fingerprint(
        &self,
        user_id: UserId,
        fingerprint_hash: &str,
    ) -> impl std::future::Future<Output = Result<Option<Device>>> + Send;

    /// All devices bound to a user.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    fn list_for_user(
        &self,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<Vec<Device>>> + Send;

    /// Insert or update a device row.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn upsert(&self, device: &Device) -> impl std::future::Future<Output = Result<()>> + Send;
}
