//! Sliding-window rate limiter trait and route classes.

use crate::config::{RateLimitRule, RateLimitsConfig};
use crate::error::Result;
use chrono::{DateTime, Utc};

/// Route classes with distinct windows, caps, and key dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    /// Password authentication, keyed by (ip, email).
    PasswordAuth,
    /// Magic-link issuance, keyed by email.
    MagicLinkIssue,
    /// TOTP / code verification, keyed by user ID.
    TotpVerify,
    /// WebAuthn assertion ceremonies, keyed by email (begin) or user ID
    /// (complete).
    WebAuthnVerify,
    /// Refresh rotation, keyed by session (refresh-hash prefix).
    Refresh,
    /// Generic mutating calls, keyed by user or ip.
    GenericWrite,
    /// Generic read calls, keyed by user or ip.
    GenericRead,
}

impl RouteClass {
    /// Stable name used in counter keys and audit details.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PasswordAuth => "password-auth",
            Self::MagicLinkIssue => "magic-link-issue",
            Self::TotpVerify => "totp-verify",
            Self::WebAuthnVerify => "webauthn-verify",
            Self::Refresh => "refresh",
            Self::GenericWrite => "generic-write",
            Self::GenericRead => "generic-read",
        }
    }

    /// The configured rule for this class.
    #[must_use]
    pub const fn rule(self, config: &RateLimitsConfig) -> RateLimitRule {
        match self {
            Self::PasswordAuth => config.password_auth,
            Self::MagicLinkIssue => config.magic_link_issue,
            Self::TotpVerify => config.totp_verify,
            Self::WebAuthnVerify => config.webauthn_verify,
            Self::Refresh => config.refresh,
            Self::GenericWrite => config.generic_write,
            Self::GenericRead => config.generic_read,
        }
    }
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,

    /// Requests left in the window after this one.
    pub remaining: u32,

    /// When the window frees a slot.
    pub reset_at: DateTime<Utc>,
}

/// Sliding-window rate limiter.
///
/// Counters live in the distributed tier (replicated through the cache
/// substrate); checks and increments are atomic per counter. A timestamp
/// falling exactly on the window boundary counts in the newer window.
pub trait RateLimiter: Send + Sync {
    /// Check the counter for `(class, key)` and record this request in one
    /// atomic step.
    ///
    /// Implementations degrade to a conservative local window rather than
    /// blocking when the distributed tier is unavailable.
    ///
    /// # Errors
    ///
    /// Returns an error only when no safe local fallback exists.
    fn check_and_record(
        &self,
        class: RouteClass,
        key: &str,
        rule: RateLimitRule,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<RateDecision>> + Send;

    /// Forget the most recent recorded attempt for `(class, key)`.
    ///
    /// Supports `count_failures_only` rules: the gate records up front and
    /// un-counts after a success.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    fn forget_last(
        &self,
        class: RouteClass,
        key: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_names_are_stable() {
        assert_eq!(RouteClass::PasswordAuth.as_str(), "password-auth");
        assert_eq!(RouteClass::GenericRead.as_str(), "generic-read");
    }

    #[test]
    fn rules_come_from_config() {
        let config = RateLimitsConfig::default();
        assert_eq!(RouteClass::PasswordAuth.rule(&config).max_requests, 5);
        assert_eq!(RouteClass::MagicLinkIssue.rule(&config).max_requests, 3);
        assert_eq!(RouteClass::WebAuthnVerify.rule(&config).max_requests, 10);
        assert_eq!(RouteClass::Refresh.rule(&config).max_requests, 30);
    }
}
