//! Authentication orchestrator: the per-request state machines.
//!
//! Composes the hasher, key store, token service, cache, rate limiter,
//! session store, credential registry, challenge broker, and risk engine
//! into the login, step-up, refresh, and logout flows. Every material
//! outcome is emitted through the audit emitter.
//!
//! External behavior is deliberately coarse: user-not-found and
//! password-mismatch share one code path (with a dummy hash verification to
//! equalize timing), and challenge failures collapse to a single denial
//! reason. Transient cache/session-store errors are retried at most once
//! with jitter before surfacing as a temporary failure.

use crate::audit::{AuthEventKind, EventDraft};
use crate::environment::AuthEnvironment;
use crate::error::{AuthError, Result};
use crate::providers::challenge_store::{ChallengeRecord, ChallengeSecret};
use crate::providers::credentials::{PasswordCredential, WebAuthnCredential};
use crate::providers::delivery::{ChallengeDelivery, DeliveryChannel};
use crate::providers::rate_limiter::RouteClass;
use crate::providers::session::RotateOutcome;
use crate::providers::{
    ChallengeStore, ContactKind, CredentialRegistry, DeviceRepository, MessageSink, RateLimiter,
    SessionStore, UserRepository, WebAuthnCeremony,
};
use crate::risk::{RiskContext, RiskDecision};
use crate::state::{
    AccessTokenInfo, AuthFactors, AuthOutcome, ChallengeDescriptor, ChallengeId, ChallengeVariant,
    DenialReason, Device, DeviceTrustLevel, FamilyId, RevocationReason, Session, SessionId,
    TokenPair, User, UserId, UserStatus,
};
use crate::utils::{fingerprint_hash, normalize_email, validate_email};
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use vigil_runtime::cache::{CacheError, DistributedKv, Loaded};
use vigil_runtime::retry::RetryPolicy;

/// Password-login request.
#[derive(Clone)]
pub struct AuthenticateRequest {
    /// Email as typed by the user (normalized internally).
    pub email: String,
    /// Password.
    pub password: String,
    /// Client-provided device fingerprint.
    pub fingerprint: String,
    /// Source IP.
    pub ip: IpAddr,
    /// User agent.
    pub user_agent: String,
    /// Transport-provided coarse location estimate, when available.
    pub location_hint: Option<String>,
    /// Correlation ID for audit records.
    pub correlation_id: uuid::Uuid,
}

impl std::fmt::Debug for AuthenticateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticateRequest")
            .field("email", &self.email)
            .field("ip", &self.ip)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

/// Answer to a pending challenge (step-up code, TOTP, or magic link).
#[derive(Clone)]
pub struct ChallengeAnswer {
    /// Challenge being answered.
    pub challenge_id: ChallengeId,
    /// Presented secret (code or magic-link token).
    pub secret: String,
    /// Client-provided device fingerprint.
    pub fingerprint: String,
    /// Source IP.
    pub ip: IpAddr,
    /// User agent.
    pub user_agent: String,
    /// Record a "remember this device" decision on success.
    pub remember_device: bool,
    /// Correlation ID for audit records.
    pub correlation_id: uuid::Uuid,
}

impl std::fmt::Debug for ChallengeAnswer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeAnswer")
            .field("challenge_id", &self.challenge_id)
            .field("ip", &self.ip)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

/// Refresh-rotation request.
#[derive(Clone)]
pub struct RefreshRequest {
    /// Presented refresh token.
    pub refresh_token: String,
    /// Client-provided device fingerprint.
    pub fingerprint: String,
    /// Source IP.
    pub ip: IpAddr,
    /// User agent.
    pub user_agent: String,
    /// Correlation ID for audit records.
    pub correlation_id: uuid::Uuid,
}

impl std::fmt::Debug for RefreshRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshRequest")
            .field("ip", &self.ip)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

/// Reference to a newly registered credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRef {
    /// Credential ID.
    pub credential_id: Vec<u8>,
    /// Friendly name.
    pub name: String,
}

/// A live session joined with the device it was minted for, for
/// "manage devices" surfaces.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    /// The session.
    pub session: Session,
    /// The device row, when it still exists.
    pub device: Option<Device>,
}

/// The authentication orchestrator.
pub struct Authenticator<S, C, U, D, H, L, W, K>
where
    S: SessionStore + Clone,
    C: CredentialRegistry + Clone,
    U: UserRepository + Clone,
    D: DeviceRepository + Clone,
    H: ChallengeStore + Clone,
    L: RateLimiter + Clone,
    W: WebAuthnCeremony + Clone,
    K: DistributedKv + Clone,
{
    env: AuthEnvironment<S, C, U, D, H, L, W, K>,
}

impl<S, C, U, D, H, L, W, K> Authenticator<S, C, U, D, H, L, W, K>
where
    S: SessionStore + Clone,
    C: CredentialRegistry + Clone,
    U: UserRepository + Clone,
    D: DeviceRepository + Clone,
    H: ChallengeStore + Clone,
    L: RateLimiter + Clone,
    W: WebAuthnCeremony + Clone,
    K: DistributedKv + Clone,
{
    /// Create an orchestrator over an environment bundle.
    #[must_use]
    pub const fn new(env: AuthEnvironment<S, C, U, D, H, L, W, K>) -> Self {
        Self { env }
    }

    /// The wrapped environment (for wiring and tests).
    #[must_use]
    pub const fn env(&self) -> &AuthEnvironment<S, C, U, D, H, L, W, K> {
        &self.env
    }

    // ═══════════════════════════════════════════════════════════════════
    // Password login
    // ═══════════════════════════════════════════════════════════════════

    /// Password login flow.
    ///
    /// # Errors
    ///
    /// Returns an error only on unrecoverable internal failures; every
    /// user-facing result is an [`AuthOutcome`].
    pub async fn authenticate(&self, request: AuthenticateRequest) -> Result<AuthOutcome> {
        let now = Utc::now();
        let email = normalize_email(&request.email);
        if validate_email(&email).is_err() {
            // Malformed email follows the invalid-credential path uniformly.
            self.env.hasher.verify_dummy(&request.password);
            return self
                .deny_login(None, &request, DenialReason::InvalidCredential)
                .await;
        }

        let rate_key = format!("{}|{email}", request.ip);
        if let Some(limited) = self
            .rate_gate(RouteClass::PasswordAuth, &rate_key, None, &request.correlation_id, request.ip, now)
            .await?
        {
            return Ok(limited);
        }

        let user = self
            .retry_transient(|| self.env.users.find_by_email(&email))
            .await?;
        let Some(user) = user else {
            self.env.hasher.verify_dummy(&request.password);
            return self
                .deny_login(None, &request, DenialReason::InvalidCredential)
                .await;
        };
        if !matches!(user.status, UserStatus::Active | UserStatus::Locked) {
            self.env.hasher.verify_dummy(&request.password);
            return self
                .deny_login(Some(&user), &request, DenialReason::InvalidCredential)
                .await;
        }

        let credential = self
            .retry_transient(|| self.env.credentials.find_password_for(user.user_id))
            .await?;
        let Some(credential) = credential else {
            self.env.hasher.verify_dummy(&request.password);
            return self
                .deny_login(Some(&user), &request, DenialReason::InvalidCredential)
                .await;
        };

        if let Some(retry_after) = credential.lockout_until.filter(|until| *until > now) {
            self.env.hasher.verify_dummy(&request.password);
            return self
                .deny_login(Some(&user), &request, DenialReason::AccountLocked { retry_after })
                .await;
        }

        match self.env.hasher.verify(
            &request.password,
            &credential.digest,
            credential.pepper_version,
            &self.env.keys,
        ) {
            Ok(outcome) => {
                self.env.credentials.record_success(user.user_id).await?;
                if outcome.needs_rehash {
                    self.rehash_password(&user, &credential, &request.password, now).await;
                }
            }
            Err(AuthError::InvalidCredential | AuthError::LegacyAlgorithm) => {
                return self.record_password_failure(&user, &request, now).await;
            }
            Err(other) => return Err(other),
        }

        // Knowledge factor proven; risk decides the branch.
        let fp_hash = fingerprint_hash(&request.fingerprint);
        let device = self
            .retry_transient(|| self.env.devices.find_by_fingerprint(user.user_id, &fp_hash))
            .await?;
        let assessment = self.assess_risk(&user, device.as_ref(), &fp_hash, &request, now).await;

        match assessment.decision {
            RiskDecision::Deny => {
                self.env
                    .audit
                    .emit(
                        EventDraft::new(AuthEventKind::RiskDenied, request.correlation_id)
                            .actor(user.user_id)
                            .source_ip(request.ip)
                            .details(serde_json::json!({
                                "score": assessment.score,
                                "signals": assessment.signals,
                            })),
                    )
                    .await;
                Ok(AuthOutcome::Denied { reason: DenialReason::Risk })
            }
            RiskDecision::StepUp => {
                self.issue_step_up(&user, &fp_hash, AuthFactors::KNOWLEDGE, &request, now).await
            }
            RiskDecision::Allow => {
                self.finish_rate_accounting(RouteClass::PasswordAuth, &rate_key).await;
                let (tokens, session) = self
                    .mint_session(
                        &user,
                        &fp_hash,
                        AuthFactors::KNOWLEDGE,
                        assessment.score,
                        request.ip,
                        &request.user_agent,
                        request.correlation_id,
                        false,
                        now,
                    )
                    .await?;
                self.remember_location(&user, request.location_hint.as_deref()).await;
                self.env
                    .audit
                    .emit(
                        EventDraft::new(AuthEventKind::LoginSucceeded, request.correlation_id)
                            .actor(user.user_id)
                            .device(session.device_id)
                            .source_ip(request.ip)
                            .details(serde_json::json!({ "method": "password" })),
                    )
                    .await;
                Ok(AuthOutcome::Success {
                    tokens,
                    factors: session.factors,
                    user,
                })
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Passwordless (magic link)
    // ═══════════════════════════════════════════════════════════════════

    /// Begin a passwordless login: issue and deliver a magic link.
    ///
    /// The response is identical whether or not the email maps to an
    /// account; material is only delivered when it does.
    ///
    /// # Errors
    ///
    /// Returns an error only on unrecoverable internal failures.
    pub async fn begin_passwordless(
        &self,
        email: &str,
        fingerprint: &str,
        ip: IpAddr,
        correlation_id: uuid::Uuid,
    ) -> Result<AuthOutcome> {
        let now = Utc::now();
        let email = normalize_email(email);

        if let Some(limited) = self
            .rate_gate(RouteClass::MagicLinkIssue, &email, None, &correlation_id, ip, now)
            .await?
        {
            return Ok(limited);
        }

        let user = if validate_email(&email).is_ok() {
            self.retry_transient(|| self.env.users.find_by_email(&email)).await?
        } else {
            None
        };

        let fp_hash = fingerprint_hash(fingerprint);
        let (challenge_id, secret) = self
            .env
            .challenges
            .issue_magic_link(
                user.as_ref().map(|u| u.user_id),
                &fp_hash,
                AuthFactors::NONE,
                self.env.config.magic_link_ttl,
                now,
            )
            .await?;

        if let Some(user) = &user {
            let delivery = ChallengeDelivery {
                challenge_id,
                variant: ChallengeVariant::MagicLink,
                channel: DeliveryChannel::Email { to: user.email.clone() },
                secret,
            };
            if let Err(error) = self.env.delivery.deliver(delivery).await {
                tracing::warn!(%error, "magic link delivery failed");
                return Ok(AuthOutcome::TemporaryFailure);
            }
            self.env
                .audit
                .emit(
                    EventDraft::new(AuthEventKind::MfaIssued, correlation_id)
                        .actor(user.user_id)
                        .source_ip(ip)
                        .details(serde_json::json!({ "variant": "magic-link" })),
                )
                .await;
        }

        Ok(AuthOutcome::ChallengeRequired {
            challenge: ChallengeDescriptor {
                challenge_id,
                variant: ChallengeVariant::MagicLink,
                delivered_via: Some("email".to_string()),
                options: None,
            },
        })
    }

    /// Complete a passwordless login with the delivered secret.
    ///
    /// # Errors
    ///
    /// Returns an error only on unrecoverable internal failures.
    pub async fn complete_passwordless(&self, answer: ChallengeAnswer) -> Result<AuthOutcome> {
        let now = Utc::now();
        let record = match self
            .env
            .challenges
            .verify_hashed_secret(answer.challenge_id, &answer.secret, now)
            .await
        {
            Ok(record) => record,
            Err(error) => return self.challenge_failure(&answer, AuthEventKind::LoginFailed, &error).await,
        };

        let Some(user_id) = record.user_id else {
            // Challenge was issued for an unknown email: uniform denial.
            return Ok(AuthOutcome::Denied { reason: DenialReason::InvalidCredential });
        };
        let user = self.require_user(user_id).await?;

        if self.verify_challenge_binding(&record, &answer).is_err() {
            // Consumed but presented from a different device: fail closed.
            return self
                .challenge_failure(&answer, AuthEventKind::LoginFailed, &AuthError::InvalidCredential)
                .await;
        }

        let (tokens, session) = self
            .mint_session(
                &user,
                &record.fingerprint_hash,
                record.prior_factors.with(AuthFactors::POSSESSION),
                0,
                answer.ip,
                &answer.user_agent,
                answer.correlation_id,
                answer.remember_device,
                now,
            )
            .await?;
        self.env
            .audit
            .emit(
                EventDraft::new(AuthEventKind::LoginSucceeded, answer.correlation_id)
                    .actor(user.user_id)
                    .device(session.device_id)
                    .source_ip(answer.ip)
                    .details(serde_json::json!({ "method": "magic-link" })),
            )
            .await;
        Ok(AuthOutcome::Success {
            tokens,
            factors: session.factors,
            user,
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // Step-up resolution (TOTP / delivered codes)
    // ═══════════════════════════════════════════════════════════════════

    /// Resolve a pending step-up challenge.
    ///
    /// # Errors
    ///
    /// Returns an error only on unrecoverable internal failures.
    pub async fn resolve_mfa(&self, answer: ChallengeAnswer) -> Result<AuthOutcome> {
        let now = Utc::now();
        let record = match self.env.challenges.peek(answer.challenge_id, now).await {
            Ok(record) => record,
            Err(error) => return self.challenge_failure(&answer, AuthEventKind::MfaFailed, &error).await,
        };

        let Some(user_id) = record.user_id else {
            return Ok(AuthOutcome::Denied { reason: DenialReason::ChallengeFailed });
        };

        let rate_key = user_id.0.to_string();
        if let Some(limited) = self
            .rate_gate(
                RouteClass::TotpVerify,
                &rate_key,
                Some(user_id),
                &answer.correlation_id,
                answer.ip,
                now,
            )
            .await?
        {
            return Ok(limited);
        }

        if self.verify_challenge_binding(&record, &answer).is_err() {
            return self
                .challenge_failure(&answer, AuthEventKind::MfaFailed, &AuthError::InvalidCredential)
                .await;
        }

        let verified = match record.variant {
            ChallengeVariant::Totp => {
                let seed = match self.totp_seed_for(user_id).await? {
                    Some(seed) => seed,
                    None => {
                        return Ok(AuthOutcome::Denied { reason: DenialReason::ChallengeFailed });
                    }
                };
                self.env
                    .challenges
                    .verify_totp_code(
                        answer.challenge_id,
                        &answer.secret,
                        &seed,
                        self.env.config.totp_drift_windows,
                        now,
                    )
                    .await
            }
            ChallengeVariant::EmailCode | ChallengeVariant::SmsCode | ChallengeVariant::MagicLink => {
                self.env
                    .challenges
                    .verify_hashed_secret(answer.challenge_id, &answer.secret, now)
                    .await
            }
            ChallengeVariant::WebAuthnGet | ChallengeVariant::WebAuthnCreate => {
                return Err(AuthError::InvariantViolation(
                    "webauthn challenges resolve through the webauthn flow".into(),
                ));
            }
        };

        let record = match verified {
            Ok(record) => record,
            Err(error) => return self.challenge_failure(&answer, AuthEventKind::MfaFailed, &error).await,
        };

        let user = self.require_user(user_id).await?;
        let (tokens, session) = self
            .mint_session(
                &user,
                &record.fingerprint_hash,
                record.prior_factors.with(AuthFactors::POSSESSION),
                0,
                answer.ip,
                &answer.user_agent,
                answer.correlation_id,
                answer.remember_device,
                now,
            )
            .await?;
        self.env
            .audit
            .emit(
                EventDraft::new(AuthEventKind::MfaVerified, answer.correlation_id)
                    .actor(user.user_id)
                    .device(session.device_id)
                    .source_ip(answer.ip)
                    .details(serde_json::json!({ "variant": record.variant.as_str() })),
            )
            .await;
        Ok(AuthOutcome::Success {
            tokens,
            factors: session.factors,
            user,
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // WebAuthn
    // ═══════════════════════════════════════════════════════════════════

    /// Begin passkey registration for an authenticated user.
    ///
    /// # Errors
    ///
    /// Returns an error on ceremony or storage failure.
    pub async fn begin_webauthn_register(
        &self,
        user_id: UserId,
        credential_name: &str,
        fingerprint: &str,
    ) -> Result<ChallengeDescriptor> {
        let now = Utc::now();
        let user = self.require_user(user_id).await?;
        let existing = self
            .retry_transient(|| self.env.credentials.list_webauthn_for(user_id))
            .await?;
        let exclude: Vec<Vec<u8>> = existing.iter().map(|c| c.credential_id.clone()).collect();

        let display_name = user.display_name.clone().unwrap_or_else(|| user.email.clone());
        let (options, state) =
            self.env
                .webauthn
                .begin_registration(user_id, &user.email, &display_name, &exclude)?;

        let challenge_id = self
            .env
            .challenges
            .issue_webauthn(
                ChallengeVariant::WebAuthnCreate,
                Some(user_id),
                &fingerprint_hash(fingerprint),
                AuthFactors::NONE,
                state,
                self.env.config.webauthn_ttl,
                now,
            )
            .await?;

        tracing::debug!(user_id = %user_id.0, name = credential_name, "webauthn registration begun");
        Ok(ChallengeDescriptor {
            challenge_id,
            variant: ChallengeVariant::WebAuthnCreate,
            delivered_via: None,
            options: Some(options),
        })
    }

    /// Complete passkey registration with the client attestation.
    ///
    /// # Errors
    ///
    /// Challenge and attestation failures surface from the broker and
    /// ceremony respectively.
    pub async fn complete_webauthn_register(
        &self,
        challenge_id: ChallengeId,
        attestation: &serde_json::Value,
        credential_name: &str,
        correlation_id: uuid::Uuid,
    ) -> Result<CredentialRef> {
        let now = Utc::now();
        let record = self.env.challenges.consume_webauthn(challenge_id, now).await?;
        let ChallengeSecret::WebAuthn { state } = &record.secret else {
            return Err(AuthError::InvariantViolation("webauthn challenge without state".into()));
        };
        let user_id = record
            .user_id
            .ok_or_else(|| AuthError::InvariantViolation("registration challenge without user".into()))?;

        let registered = self.env.webauthn.finish_registration(attestation, state)?;
        let credential = WebAuthnCredential {
            credential_id: registered.credential_id.clone(),
            user_id,
            passkey: registered.passkey,
            counter: registered.counter,
            aaguid: registered.aaguid,
            attachment: None,
            transports: registered.transports,
            name: credential_name.to_string(),
            created_at: now,
            last_used: None,
        };
        self.env.credentials.add_webauthn(&credential).await?;

        self.env
            .audit
            .emit(
                EventDraft::new(AuthEventKind::CredentialAdded, correlation_id)
                    .actor(user_id)
                    .details(serde_json::json!({ "kind": "webauthn", "name": credential_name })),
            )
            .await;
        Ok(CredentialRef {
            credential_id: registered.credential_id,
            name: credential_name.to_string(),
        })
    }

    /// Begin a passkey login for an email.
    ///
    /// # Errors
    ///
    /// Returns an error only on unrecoverable internal failures.
    pub async fn begin_webauthn_login(
        &self,
        email: &str,
        fingerprint: &str,
        ip: IpAddr,
        correlation_id: uuid::Uuid,
    ) -> Result<AuthOutcome> {
        let now = Utc::now();
        let email = normalize_email(email);

        if let Some(limited) = self
            .rate_gate(RouteClass::WebAuthnVerify, &email, None, &correlation_id, ip, now)
            .await?
        {
            return Ok(limited);
        }

        let user = self.retry_transient(|| self.env.users.find_by_email(&email)).await?;
        let Some(user) = user else {
            return Ok(AuthOutcome::Denied { reason: DenialReason::InvalidCredential });
        };

        let credentials = self
            .retry_transient(|| self.env.credentials.list_webauthn_for(user.user_id))
            .await?;
        if credentials.is_empty() {
            return Ok(AuthOutcome::Denied { reason: DenialReason::InvalidCredential });
        }

        let passkeys: Vec<serde_json::Value> =
            credentials.iter().map(|c| c.passkey.clone()).collect();
        let (options, state) = self.env.webauthn.begin_authentication(&passkeys)?;

        let challenge_id = self
            .env
            .challenges
            .issue_webauthn(
                ChallengeVariant::WebAuthnGet,
                Some(user.user_id),
                &fingerprint_hash(fingerprint),
                AuthFactors::NONE,
                state,
                self.env.config.webauthn_ttl,
                now,
            )
            .await?;

        Ok(AuthOutcome::ChallengeRequired {
            challenge: ChallengeDescriptor {
                challenge_id,
                variant: ChallengeVariant::WebAuthnGet,
                delivered_via: None,
                options: Some(options),
            },
        })
    }

    /// Complete a passkey login with the client assertion.
    ///
    /// # Errors
    ///
    /// Returns an error only on unrecoverable internal failures.
    pub async fn complete_webauthn_login(
        &self,
        answer: ChallengeAnswer,
        assertion: &serde_json::Value,
    ) -> Result<AuthOutcome> {
        let now = Utc::now();

        // Gate before consuming: a rate-limited request must not burn the
        // single-use challenge.
        let pending = match self.env.challenges.peek(answer.challenge_id, now).await {
            Ok(record) => record,
            Err(error) => return self.challenge_failure(&answer, AuthEventKind::LoginFailed, &error).await,
        };
        let user_id = pending
            .user_id
            .ok_or_else(|| AuthError::InvariantViolation("assertion challenge without user".into()))?;
        let rate_key = user_id.0.to_string();
        if let Some(limited) = self
            .rate_gate(
                RouteClass::WebAuthnVerify,
                &rate_key,
                Some(user_id),
                &answer.correlation_id,
                answer.ip,
                now,
            )
            .await?
        {
            return Ok(limited);
        }

        let record = match self.env.challenges.consume_webauthn(answer.challenge_id, now).await {
            Ok(record) => record,
            Err(error) => return self.challenge_failure(&answer, AuthEventKind::LoginFailed, &error).await,
        };
        let ChallengeSecret::WebAuthn { state } = &record.secret else {
            return Err(AuthError::InvariantViolation("webauthn challenge without state".into()));
        };

        let outcome = match self.env.webauthn.finish_authentication(assertion, state) {
            Ok(outcome) => outcome,
            Err(error) => return self.challenge_failure(&answer, AuthEventKind::LoginFailed, &error).await,
        };

        let credentials = self
            .retry_transient(|| self.env.credentials.list_webauthn_for(user_id))
            .await?;
        let Some(stored) = credentials
            .iter()
            .find(|c| c.credential_id == outcome.credential_id)
        else {
            return Ok(AuthOutcome::Denied { reason: DenialReason::InvalidCredential });
        };

        // A non-increasing signature counter is cloned-authenticator
        // evidence; fail closed.
        if outcome.counter <= stored.counter {
            self.env
                .audit
                .emit(
                    EventDraft::new(AuthEventKind::LoginFailed, answer.correlation_id)
                        .actor(user_id)
                        .source_ip(answer.ip)
                        .details(serde_json::json!({
                            "method": "webauthn",
                            "reason": "counter-regression",
                            "stored": stored.counter,
                            "presented": outcome.counter,
                        })),
                )
                .await;
            return Ok(AuthOutcome::Denied { reason: DenialReason::InvalidCredential });
        }
        self.env
            .credentials
            .update_webauthn_counter(&outcome.credential_id, outcome.counter, now)
            .await?;

        let user = self.require_user(user_id).await?;
        let factors = if outcome.user_verified {
            AuthFactors::POSSESSION.with(AuthFactors::INHERENCE)
        } else {
            AuthFactors::POSSESSION
        };
        let (tokens, session) = self
            .mint_session(
                &user,
                &record.fingerprint_hash,
                factors,
                0,
                answer.ip,
                &answer.user_agent,
                answer.correlation_id,
                answer.remember_device,
                now,
            )
            .await?;
        self.env
            .audit
            .emit(
                EventDraft::new(AuthEventKind::LoginSucceeded, answer.correlation_id)
                    .actor(user.user_id)
                    .device(session.device_id)
                    .source_ip(answer.ip)
                    .details(serde_json::json!({ "method": "webauthn" })),
            )
            .await;
        Ok(AuthOutcome::Success {
            tokens,
            factors: session.factors,
            user,
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // Refresh
    // ═══════════════════════════════════════════════════════════════════

    /// Rotate a refresh token.
    ///
    /// # Errors
    ///
    /// [`AuthError::RefreshReused`] on a superseded token (the family is
    /// revoked and a critical event emitted), [`AuthError::RefreshExpired`]
    /// / [`AuthError::RefreshUnknown`] per taxonomy.
    pub async fn refresh(&self, request: RefreshRequest) -> Result<AuthOutcome> {
        let now = Utc::now();
        let presented_hash = self.env.tokens.refresh_hash(&request.refresh_token)?;

        let rate_key = presented_hash.chars().take(16).collect::<String>();
        if let Some(limited) = self
            .rate_gate(RouteClass::Refresh, &rate_key, None, &request.correlation_id, request.ip, now)
            .await?
        {
            return Ok(limited);
        }

        let replacement = self.env.tokens.mint_refresh();
        let access_expires_at = now + self.env.config.access_token_ttl;
        let outcome = self
            .retry_transient(|| {
                self.env.sessions.rotate_refresh(
                    &presented_hash,
                    &replacement.hash,
                    now,
                    self.env.config.refresh_token_ttl,
                    access_expires_at,
                )
            })
            .await?;

        match outcome {
            RotateOutcome::Rotated(session) => {
                let user = self.require_user(session.user_id).await?;
                let fp_hash = fingerprint_hash(&request.fingerprint);
                let bound_device = self
                    .retry_transient(|| {
                        self.env.devices.find_by_fingerprint(session.user_id, &fp_hash)
                    })
                    .await?;
                if bound_device.as_ref().map(|d| d.device_id) != Some(session.device_id) {
                    tracing::warn!(
                        session_id = %session.session_id.0,
                        "refresh presented from an unrecognized device fingerprint"
                    );
                }

                let (access_token, _) = self.env.tokens.mint_access(
                    user.user_id,
                    session.session_id,
                    session.device_id,
                    session.factors,
                    user.security_version,
                    now,
                    self.env.config.access_token_ttl,
                )?;
                self.env
                    .audit
                    .emit(
                        EventDraft::new(AuthEventKind::TokenRefreshed, request.correlation_id)
                            .actor(user.user_id)
                            .device(session.device_id)
                            .source_ip(request.ip)
                            .details(serde_json::json!({
                                "family": session.family_id.0,
                                "generation": session.generation,
                            })),
                    )
                    .await;
                Ok(AuthOutcome::Success {
                    tokens: TokenPair {
                        access_token,
                        refresh_token: replacement.raw,
                        access_expires_at,
                        refresh_expires_at: session.refresh_expires_at,
                    },
                    factors: session.factors,
                    user,
                })
            }
            RotateOutcome::Reused { session } => {
                self.env
                    .audit
                    .emit(
                        EventDraft::new(AuthEventKind::RefreshReused, request.correlation_id)
                            .actor(session.user_id)
                            .device(session.device_id)
                            .source_ip(request.ip)
                            .details(serde_json::json!({
                                "family": session.family_id.0,
                                "generation": session.generation,
                            })),
                    )
                    .await;
                Err(AuthError::RefreshReused)
            }
            RotateOutcome::Unknown => Err(AuthError::RefreshUnknown),
            RotateOutcome::Expired => Err(AuthError::RefreshExpired),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Validation, logout
    // ═══════════════════════════════════════════════════════════════════

    /// Validate an access token: signature, expiry, security version, and
    /// session revocation.
    ///
    /// # Errors
    ///
    /// [`AuthError::TokenExpired`] / [`AuthError::TokenSignatureInvalid`] /
    /// [`AuthError::TokenRevoked`] per taxonomy.
    pub async fn validate_access_token(&self, token: &str) -> Result<AccessTokenInfo> {
        let now = Utc::now();
        let claims = self.env.tokens.validate_access(token, now)?;
        let user_id = claims.user_id();

        let current_version = self.cached_security_version(user_id).await?;
        let Some(current_version) = current_version else {
            return Err(AuthError::TokenRevoked);
        };
        if claims.sv != current_version {
            return Err(AuthError::TokenRevoked);
        }

        let session = self
            .retry_transient(|| self.env.sessions.get_session(claims.session_id()))
            .await?;
        match session {
            Some(session) if !session.revoked => Ok(AccessTokenInfo {
                user_id,
                session_id: session.session_id,
                device_id: session.device_id,
                factors: claims.factors(),
                expires_at: claims.expires_at(),
            }),
            _ => Err(AuthError::TokenRevoked),
        }
    }

    /// Revoke one session.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn logout(&self, session_id: SessionId, correlation_id: uuid::Uuid) -> Result<()> {
        let revoked = self
            .retry_transient(|| {
                self.env
                    .sessions
                    .revoke_session(session_id, RevocationReason::UserLogout)
            })
            .await?;
        if revoked {
            self.env
                .audit
                .emit(
                    EventDraft::new(AuthEventKind::SessionRevoked, correlation_id)
                        .details(serde_json::json!({ "scope": "session" })),
                )
                .await;
        }
        Ok(())
    }

    /// Revoke every session for a user and bump their security version,
    /// invalidating all outstanding access tokens at next use.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn logout_all(&self, user_id: UserId, correlation_id: uuid::Uuid) -> Result<usize> {
        let new_version = self.env.users.bump_security_version(user_id).await?;
        // Push the new version into the cache so validators converge
        // immediately rather than after the staleness window.
        let _ = self
            .env
            .cache
            .put(
                &security_version_key(user_id),
                &Some(new_version),
                self.env
                    .config
                    .security_version_staleness
                    .to_std()
                    .unwrap_or_default(),
            )
            .await;

        let revoked = self
            .retry_transient(|| {
                self.env
                    .sessions
                    .revoke_all_for_user(user_id, RevocationReason::AllDevices)
            })
            .await?;
        self.env
            .audit
            .emit(
                EventDraft::new(AuthEventKind::SessionRevoked, correlation_id)
                    .actor(user_id)
                    .details(serde_json::json!({
                        "scope": "all-devices",
                        "revoked": revoked,
                        "security_version": new_version,
                    })),
            )
            .await;
        Ok(revoked)
    }

    /// Live sessions for a user, each joined with its device row.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn list_sessions(&self, user_id: UserId) -> Result<Vec<SessionView>> {
        let now = Utc::now();
        let sessions = self
            .retry_transient(|| self.env.sessions.list_active(user_id, now))
            .await?;
        let devices = self
            .retry_transient(|| self.env.devices.list_for_user(user_id))
            .await?;

        Ok(sessions
            .into_iter()
            .map(|session| {
                let device = devices
                    .iter()
                    .find(|d| d.device_id == session.device_id)
                    .cloned();
                SessionView { session, device }
            })
            .collect())
    }

    /// Sweep expired sessions and families past the absolute cap.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn reap_sessions(&self) -> Result<usize> {
        self.env.sessions.reap(Utc::now()).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Internals
    // ═══════════════════════════════════════════════════════════════════

    /// Check a rate class; emits and returns the outcome on a breach.
    async fn rate_gate(
        &self,
        class: RouteClass,
        key: &str,
        actor: Option<UserId>,
        correlation_id: &uuid::Uuid,
        ip: IpAddr,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthOutcome>> {
        let rule = class.rule(&self.env.config.rate_limits);
        let decision = self
            .env
            .rate_limiter
            .check_and_record(class, key, rule, now)
            .await?;
        if decision.allowed {
            return Ok(None);
        }

        let mut draft = EventDraft::new(AuthEventKind::RateLimited, *correlation_id)
            .source_ip(ip)
            .details(serde_json::json!({
                "class": class.as_str(),
                "reset_at": decision.reset_at,
            }));
        if let Some(actor) = actor {
            draft = draft.actor(actor);
        }
        self.env.audit.emit(draft).await;
        Ok(Some(AuthOutcome::RateLimited { reset_at: decision.reset_at }))
    }

    /// Un-count a successful request for failure-only rate rules.
    async fn finish_rate_accounting(&self, class: RouteClass, key: &str) {
        let rule = class.rule(&self.env.config.rate_limits);
        if rule.count_failures_only {
            if let Err(error) = self.env.rate_limiter.forget_last(class, key).await {
                tracing::debug!(%error, "failed to un-count successful attempt");
            }
        }
    }

    /// Uniform denial for the login path, with its audit record.
    async fn deny_login(
        &self,
        user: Option<&User>,
        request: &AuthenticateRequest,
        reason: DenialReason,
    ) -> Result<AuthOutcome> {
        let mut draft = EventDraft::new(AuthEventKind::LoginFailed, request.correlation_id)
            .source_ip(request.ip)
            .details(serde_json::json!({ "method": "password" }));
        if let Some(user) = user {
            draft = draft.actor(user.user_id);
        }
        self.env.audit.emit(draft).await;
        Ok(AuthOutcome::Denied { reason })
    }

    /// Record a failed password verify, arming lockout when crossed.
    async fn record_password_failure(
        &self,
        user: &User,
        request: &AuthenticateRequest,
        now: DateTime<Utc>,
    ) -> Result<AuthOutcome> {
        let failure = self
            .env
            .credentials
            .record_failure(user.user_id, &self.env.config.lockout, now)
            .await?;
        if failure.lockout_armed {
            self.env
                .audit
                .emit(
                    EventDraft::new(AuthEventKind::AccountLocked, request.correlation_id)
                        .actor(user.user_id)
                        .source_ip(request.ip)
                        .details(serde_json::json!({
                            "failed_attempts": failure.failed_attempts,
                            "until": failure.lockout_until,
                        })),
                )
                .await;
        }
        self.deny_login(Some(user), request, DenialReason::InvalidCredential).await
    }

    /// Transparent re-hash after a successful verify with stale parameters.
    async fn rehash_password(
        &self,
        user: &User,
        credential: &PasswordCredential,
        password: &str,
        now: DateTime<Utc>,
    ) {
        let Ok(rehashed) = self.env.hasher.hash(password, &self.env.keys) else {
            return;
        };
        let updated = PasswordCredential {
            digest: rehashed.digest,
            pepper_version: rehashed.pepper_version,
            updated_at: now,
            failed_attempts: 0,
            lockout_until: None,
            ..credential.clone()
        };
        if let Err(error) = self.env.credentials.upsert_password(&updated).await {
            tracing::warn!(%error, "transparent re-hash failed to persist");
        }
    }

    /// Build the risk context (cached aggregates, conservative defaults) and
    /// run the engine.
    async fn assess_risk(
        &self,
        user: &User,
        device: Option<&Device>,
        fp_hash: &str,
        request: &AuthenticateRequest,
        now: DateTime<Utc>,
    ) -> crate::risk::RiskAssessment {
        let prior_locations = self.cached_locations(user.user_id).await;
        let recent_failures = self
            .env
            .credentials
            .find_password_for(user.user_id)
            .await
            .ok()
            .flatten()
            .map_or(0, |c| c.failed_attempts);

        let context = RiskContext {
            account_created_at: user.created_at,
            device: device.cloned(),
            fingerprint_hash: fp_hash.to_string(),
            ip: request.ip,
            location: request.location_hint.clone(),
            prior_locations,
            recent_failures,
            now,
        };
        self.env.risk.assess(&context, self.env.config.risk_thresholds)
    }

    /// Issue the step-up challenge the user can actually answer: TOTP when
    /// enrolled, else a code to a verified contact channel, else a magic
    /// link to the account email.
    async fn issue_step_up(
        &self,
        user: &User,
        fp_hash: &str,
        prior_factors: AuthFactors,
        request: &AuthenticateRequest,
        now: DateTime<Utc>,
    ) -> Result<AuthOutcome> {
        let config = &self.env.config;

        let descriptor = if self.env.credentials.find_totp_for(user.user_id).await?.is_some() {
            let challenge_id = self
                .env
                .challenges
                .issue_totp(
                    user.user_id,
                    fp_hash,
                    prior_factors,
                    config.code_max_attempts,
                    config.code_ttl,
                    now,
                )
                .await?;
            ChallengeDescriptor {
                challenge_id,
                variant: ChallengeVariant::Totp,
                delivered_via: None,
                options: None,
            }
        } else {
            let channels = self
                .env
                .credentials
                .find_contact_channels_for(user.user_id)
                .await?;
            let channel = channels
                .iter()
                .find(|c| c.verified && c.kind == ContactKind::Phone)
                .or_else(|| channels.iter().find(|c| c.verified && c.kind == ContactKind::Email));

            let (variant, delivery_channel) = match channel {
                Some(channel) if channel.kind == ContactKind::Phone => (
                    ChallengeVariant::SmsCode,
                    DeliveryChannel::Sms { to: channel.address.clone() },
                ),
                Some(channel) => (
                    ChallengeVariant::EmailCode,
                    DeliveryChannel::Email { to: channel.address.clone() },
                ),
                None => (
                    ChallengeVariant::EmailCode,
                    DeliveryChannel::Email { to: user.email.clone() },
                ),
            };

            let (challenge_id, code) = self
                .env
                .challenges
                .issue_code(
                    variant,
                    user.user_id,
                    fp_hash,
                    prior_factors,
                    config.code_max_attempts,
                    config.code_ttl,
                    now,
                )
                .await?;
            let delivered_via = delivery_channel.as_str().to_string();
            let delivery = ChallengeDelivery {
                challenge_id,
                variant,
                channel: delivery_channel,
                secret: code,
            };
            if let Err(error) = self.env.delivery.deliver(delivery).await {
                tracing::warn!(%error, "step-up code delivery failed");
                return Ok(AuthOutcome::TemporaryFailure);
            }
            ChallengeDescriptor {
                challenge_id,
                variant,
                delivered_via: Some(delivered_via),
                options: None,
            }
        };

        self.env
            .audit
            .emit(
                EventDraft::new(AuthEventKind::MfaIssued, request.correlation_id)
                    .actor(user.user_id)
                    .source_ip(request.ip)
                    .details(serde_json::json!({ "variant": descriptor.variant.as_str() })),
            )
            .await;
        Ok(AuthOutcome::ChallengeRequired { challenge: descriptor })
    }

    /// Bind (or update) the device for this fingerprint and create the
    /// session + token pair atomically from the caller's view.
    #[allow(clippy::too_many_arguments)]
    async fn mint_session(
        &self,
        user: &User,
        fp_hash: &str,
        factors: AuthFactors,
        risk_score: u8,
        ip: IpAddr,
        user_agent: &str,
        correlation_id: uuid::Uuid,
        remember_device: bool,
        now: DateTime<Utc>,
    ) -> Result<(TokenPair, Session)> {
        let device = self.bind_device(user.user_id, fp_hash, risk_score, remember_device, now).await?;

        let refresh = self.env.tokens.mint_refresh();
        let config = &self.env.config;
        let absolute_expires_at = now + config.absolute_session_lifetime;
        let session = Session {
            session_id: SessionId::new(),
            user_id: user.user_id,
            device_id: device.device_id,
            created_at: now,
            last_seen: now,
            access_expires_at: now + config.access_token_ttl,
            family_id: FamilyId::new(),
            generation: 0,
            refresh_hash: refresh.hash.clone(),
            refresh_expires_at: (now + config.refresh_token_ttl).min(absolute_expires_at),
            absolute_expires_at,
            revoked: false,
            revoked_reason: None,
            issued_ip: ip,
            user_agent: user_agent.to_string(),
            risk_at_issue: risk_score,
            factors,
        };
        self.retry_transient(|| self.env.sessions.create_session(&session)).await?;

        let (access_token, access_expires_at) = self.env.tokens.mint_access(
            user.user_id,
            session.session_id,
            device.device_id,
            factors,
            user.security_version,
            now,
            config.access_token_ttl,
        )?;
        self.env
            .audit
            .emit(
                EventDraft::new(AuthEventKind::TokenMinted, correlation_id)
                    .actor(user.user_id)
                    .device(device.device_id)
                    .source_ip(ip)
                    .details(serde_json::json!({ "family": session.family_id.0 })),
            )
            .await;

        Ok((
            TokenPair {
                access_token,
                refresh_token: refresh.raw,
                access_expires_at,
                refresh_expires_at: session.refresh_expires_at,
            },
            session,
        ))
    }

    /// First success binds the device; later successes bump trust slowly.
    /// "Remember this device" (successful step-up only) jumps to Trusted.
    async fn bind_device(
        &self,
        user_id: UserId,
        fp_hash: &str,
        risk_score: u8,
        remember: bool,
        now: DateTime<Utc>,
    ) -> Result<Device> {
        let existing = self
            .retry_transient(|| self.env.devices.find_by_fingerprint(user_id, fp_hash))
            .await?;

        let device = match existing {
            Some(mut device) => {
                device.last_seen = now;
                device.aggregate_risk =
                    device.aggregate_risk.mul_add(0.9, f32::from(risk_score) * 0.1);
                if remember {
                    device.trust_level = DeviceTrustLevel::Trusted;
                } else if device.trust_level == DeviceTrustLevel::Unknown {
                    device.trust_level = DeviceTrustLevel::Seen;
                }
                device
            }
            None => Device {
                device_id: crate::state::DeviceId::new(),
                user_id,
                fingerprint_hash: fp_hash.to_string(),
                first_seen: now,
                last_seen: now,
                trust_level: if remember {
                    DeviceTrustLevel::Trusted
                } else {
                    DeviceTrustLevel::Seen
                },
                aggregate_risk: f32::from(risk_score),
            },
        };
        self.retry_transient(|| self.env.devices.upsert(&device)).await?;
        Ok(device)
    }

    /// Challenge-path failure: audit + uniform external denial.
    async fn challenge_failure(
        &self,
        answer: &ChallengeAnswer,
        kind: AuthEventKind,
        error: &AuthError,
    ) -> Result<AuthOutcome> {
        self.env
            .audit
            .emit(
                EventDraft::new(kind, answer.correlation_id)
                    .source_ip(answer.ip)
                    .details(serde_json::json!({ "challenge": answer.challenge_id.0 })),
            )
            .await;
        tracing::debug!(%error, challenge = %answer.challenge_id.0, "challenge verification failed");
        Ok(AuthOutcome::Denied { reason: DenialReason::ChallengeFailed })
    }

    /// A challenge only verifies from the device it was issued to.
    fn verify_challenge_binding(
        &self,
        record: &ChallengeRecord,
        answer: &ChallengeAnswer,
    ) -> Result<()> {
        if record.fingerprint_hash == fingerprint_hash(&answer.fingerprint) {
            Ok(())
        } else {
            Err(AuthError::InvalidCredential)
        }
    }

    /// Open the user's sealed TOTP seed.
    async fn totp_seed_for(&self, user_id: UserId) -> Result<Option<Vec<u8>>> {
        let Some(enrollment) = self.env.credentials.find_totp_for(user_id).await? else {
            return Ok(None);
        };
        Ok(Some(self.env.keys.open(&enrollment.secret)?))
    }

    /// Security version through the cache with bounded staleness, falling
    /// back to the repository when the cache is unusable.
    async fn cached_security_version(&self, user_id: UserId) -> Result<Option<u32>> {
        let users = self.env.users.clone();
        let ttl = self
            .env
            .config
            .security_version_staleness
            .to_std()
            .unwrap_or_default();
        let cached: std::result::Result<Option<Option<u32>>, CacheError> = self
            .env
            .cache
            .get_or_load(&security_version_key(user_id), ttl, || async move {
                match users.security_version(user_id).await {
                    Ok(Some(version)) => Ok(Loaded::Value(Some(version))),
                    Ok(None) => Ok(Loaded::Value(None)),
                    Err(error) => Err(CacheError::Origin(error.to_string())),
                }
            })
            .await;

        match cached {
            Ok(Some(version)) => Ok(version),
            Ok(None) => Ok(None),
            Err(_) => self
                .retry_transient(|| self.env.users.security_version(user_id))
                .await,
        }
    }

    /// Prior successful-login locations, via the cache; empty on degradation.
    async fn cached_locations(&self, user_id: UserId) -> Vec<String> {
        let result: std::result::Result<Option<Vec<String>>, CacheError> = self
            .env
            .cache
            .get_or_load(
                &locations_key(user_id),
                std::time::Duration::from_secs(24 * 60 * 60),
                || async { Ok(Loaded::Negative) },
            )
            .await;
        result.ok().flatten().unwrap_or_default()
    }

    /// Append a successful-login location to the cached aggregate.
    async fn remember_location(&self, user: &User, location: Option<&str>) {
        let Some(location) = location else { return };
        let mut locations = self.cached_locations(user.user_id).await;
        if !locations.iter().any(|known| known == location) {
            locations.push(location.to_string());
            let _ = self
                .env
                .cache
                .put(
                    &locations_key(user.user_id),
                    &locations,
                    std::time::Duration::from_secs(24 * 60 * 60),
                )
                .await;
        }
    }

    /// Load a user that must exist at this point in a flow.
    async fn require_user(&self, user_id: UserId) -> Result<User> {
        self.retry_transient(|| self.env.users.find_by_id(user_id))
            .await?
            .ok_or_else(|| AuthError::InvariantViolation("referenced user vanished".into()))
    }

    /// Retry transient failures once with jitter, per the propagation
    /// policy; other errors pass through untouched.
    async fn retry_transient<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match operation().await {
            Err(error) if error.is_retriable() => {
                let policy = RetryPolicy::once_with_jitter();
                let bound = policy.backoff_bound(0);
                #[allow(clippy::cast_possible_truncation)]
                let bound_ms = bound.as_millis() as u64;
                let jitter = if bound_ms == 0 {
                    0
                } else {
                    use rand::Rng;
                    rand::thread_rng().gen_range(0..bound_ms)
                };
                tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;
                operation().await
            }
            other => other,
        }
    }
}

fn security_version_key(user_id: UserId) -> String {
    format!("auth:sv:{}", user_id.0)
}

fn locations_key(user_id: UserId) -> String {
    format!("auth:locs:{}", user_id.0)
}
