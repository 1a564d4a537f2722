//! Utility functions: email normalization, fingerprint hashing.

use crate::error::{AuthError, Result};
use sha2::{Digest, Sha256};

/// Normalize an email address for storage and keying: trim and lowercase.
///
/// Normalization happens before validation so `" Alice@Example.COM "` and
/// `"alice@example.com"` key the same account and the same rate counters.
///
/// # Examples
///
/// ```
/// use vigil_auth::utils::normalize_email;
///
/// assert_eq!(normalize_email(" Alice@Example.COM "), "alice@example.com");
/// ```
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Validate a normalized email address.
///
/// # Rules
///
/// - Length: 3-255 characters
/// - Exactly one `@`, non-empty local and domain parts
/// - Domain contains at least one `.`, no empty labels
/// - Only alphanumerics plus `. - + _` in the local part, `. -` in the domain
/// - No control or injection characters
///
/// # Examples
///
/// ```
/// use vigil_auth::utils::validate_email;
///
/// assert!(validate_email("user@example.com").is_ok());
/// assert!(validate_email("user+tag@sub.example.com").is_ok());
/// assert!(validate_email("invalid").is_err());
/// assert!(validate_email("@example.com").is_err());
/// ```
///
/// # Errors
///
/// Returns [`AuthError::InvalidInput`] naming the failed rule.
pub fn validate_email(email: &str) -> Result<()> {
    if email.len() < 3 {
        return Err(AuthError::InvalidInput("email too short".into()));
    }
    if email.len() > 255 {
        return Err(AuthError::InvalidInput("email too long".into()));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 {
        return Err(AuthError::InvalidInput("email must contain exactly one '@'".into()));
    }

    let local = parts[0];
    let domain = parts[1];
    if local.is_empty() || domain.is_empty() {
        return Err(AuthError::InvalidInput("email parts cannot be empty".into()));
    }
    if !domain.contains('.') {
        return Err(AuthError::InvalidInput("email domain must contain a '.'".into()));
    }
    if email.chars().any(char::is_control) {
        return Err(AuthError::InvalidInput("email contains control characters".into()));
    }

    const DANGEROUS_CHARS: &[char] = &['<', '>', '"', '\'', '&', '\\', '\0'];
    if email.chars().any(|c| DANGEROUS_CHARS.contains(&c)) {
        return Err(AuthError::InvalidInput("email contains invalid characters".into()));
    }

    let valid_local = |c: char| c.is_alphanumeric() || matches!(c, '.' | '-' | '+' | '_');
    let valid_domain = |c: char| c.is_alphanumeric() || matches!(c, '.' | '-');
    if !local.chars().all(valid_local) {
        return Err(AuthError::InvalidInput("email local part contains invalid characters".into()));
    }
    if !domain.chars().all(valid_domain) {
        return Err(AuthError::InvalidInput("email domain contains invalid characters".into()));
    }
    if domain.split('.').any(str::is_empty) {
        return Err(AuthError::InvalidInput("email domain has empty labels".into()));
    }

    Ok(())
}

/// SHA-256 of a client-provided device fingerprint, hex-encoded.
///
/// The raw fingerprint never leaves the request; only the hash is stored,
/// compared, and bound to challenges.
#[must_use]
pub fn fingerprint_hash(fingerprint: &str) -> String {
    let digest = Sha256::digest(fingerprint.as_bytes());
    hex_encode(&digest)
}

/// Lowercase hex encoding.
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_folds_case_and_whitespace() {
        assert_eq!(normalize_email("Bob@EXAMPLE.com"), "bob@example.com");
        assert_eq!(normalize_email("  a@b.c\n"), "a@b.c");
    }

    #[test]
    fn valid_emails() {
        assert!(validate_email("user@example.com").is_ok());
        assert!(validate_email("user.name+tag@sub.example.co.uk").is_ok());
        assert!(validate_email("a@b.c").is_ok());
    }

    #[test]
    fn invalid_emails() {
        assert!(validate_email("invalid").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("user@").is_err());
        assert!(validate_email("user@@example.com").is_err());
        assert!(validate_email("user@example..com").is_err());
        assert!(validate_email("user@nodot").is_err());
        assert!(validate_email("user<script>@example.com").is_err());
        assert!(validate_email("user\n@example.com").is_err());
        assert!(validate_email(&format!("{}@example.com", "a".repeat(250))).is_err());
    }

    #[test]
    fn fingerprint_hash_is_stable_and_opaque() {
        let h1 = fingerprint_hash("canvas:abc|webgl:def");
        let h2 = fingerprint_hash("canvas:abc|webgl:def");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, fingerprint_hash("canvas:abc|webgl:xyz"));
    }
}
