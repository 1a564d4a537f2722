//! External identity verifier seam.
//!
//! Delegated identities (OAuth/OIDC providers, enterprise SSO) reach the
//! core only through this abstract interface: the transport layer completes
//! whatever provider dance it runs and hands the resulting assertion here
//! for verification. No provider integration lives in the core.

use crate::error::Result;
use std::future::Future;
use std::pin::Pin;

/// A verified delegated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// Stable subject identifier at the external provider.
    pub subject: String,

    /// Email asserted by the provider, normalized.
    pub email: String,

    /// Whether the provider asserts the email as verified.
    pub email_verified: bool,

    /// Display name, if the provider supplies one.
    pub display_name: Option<String>,
}

/// Verifier for externally issued identity assertions.
///
/// Dyn-compatible (boxed futures) so deployments can register one verifier
/// per upstream provider behind `Arc<dyn IdentityVerifier>`.
pub trait IdentityVerifier: Send + Sync {
    /// Verify an opaque assertion and return the identity it proves.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::AuthError::InvalidCredential`] when the
    /// assertion does not verify.
    fn verify(
        &self,
        assertion: &str,
    ) -> Pin<Box<dyn Future<Output = Result<VerifiedIdentity>> + Send + '_>>;
}
