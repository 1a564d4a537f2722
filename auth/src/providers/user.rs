//! User repository trait.

use crate::error::Result;
use crate::state::{User, UserId};

/// User repository (durable tier).
///
/// Lookups key on the *normalized* email ([`crate::utils::normalize_email`]);
/// callers normalize before calling so the unique-email invariant holds.
pub trait UserRepository: Send + Sync {
    /// Find a user by normalized email.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure; an unknown email is
    /// `Ok(None)`.
    fn find_by_email(
        &self,
        email: &str,
    ) -> impl std::future::Future<Output = Result<Option<User>>> + Send;

    /// Find a user by ID.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    fn find_by_id(
        &self,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<Option<User>>> + Send;

    /// Current security version for a user.
    ///
    /// Validators read this through the cache with bounded staleness; the
    /// repository read is the authoritative value.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    fn security_version(
        &self,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<Option<u32>>> + Send;

    /// Increment the security version, invalidating every outstanding
    /// access token at its next validation. Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or an unknown user.
    fn bump_security_version(
        &self,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<u32>> + Send;

    /// Persist a new user.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a duplicate email.
    fn create(&self, user: &User) -> impl std::future::Future<Output = Result<()>> + Send;
}
