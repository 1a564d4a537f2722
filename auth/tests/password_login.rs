//! Password-login integration: happy path, uniform denials, brute-force
//! lockout, rate limiting, and security-version invalidation.

mod common;

use chrono::Utc;
use common::{Harness, test_config};
use vigil_auth::audit::AuthEventKind;
use vigil_auth::config::RiskThresholds;
use vigil_auth::error::AuthError;
use vigil_auth::providers::rate_limiter::{RateLimiter, RouteClass};
use vigil_auth::providers::{CredentialRegistry, SessionStore};
use vigil_auth::state::{AuthFactors, AuthOutcome, DenialReason};

#[tokio::test]
async fn happy_password_login_mints_session_and_tokens() {
    let harness = Harness::new();
    let alice = harness.create_user("alice@example.com").await;
    harness.set_password(&alice, "P@ssw0rd!").await;

    let outcome = harness
        .authenticator
        .authenticate(harness.login_request("alice@example.com", "P@ssw0rd!"))
        .await
        .unwrap();

    let AuthOutcome::Success { tokens, user, factors } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(user.user_id, alice.user_id);
    assert_eq!(factors, AuthFactors::KNOWLEDGE);
    assert!(!tokens.access_token.is_empty());
    assert!(!tokens.refresh_token.is_empty());

    // A session row exists at generation zero.
    let sessions = harness
        .sessions
        .list_active(alice.user_id, Utc::now())
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].generation, 0);
    assert_eq!(sessions[0].factors, AuthFactors::KNOWLEDGE);

    // The access token validates and points back at the session.
    let info = harness
        .authenticator
        .validate_access_token(&tokens.access_token)
        .await
        .unwrap();
    assert_eq!(info.user_id, alice.user_id);
    assert_eq!(info.session_id, sessions[0].session_id);

    harness.settle().await;
    assert!(harness.events.saw(AuthEventKind::LoginSucceeded));
    assert!(harness.events.saw(AuthEventKind::TokenMinted));
}

#[tokio::test]
async fn email_case_and_whitespace_are_normalized() {
    let harness = Harness::new();
    let alice = harness.create_user("alice@example.com").await;
    harness.set_password(&alice, "P@ssw0rd!").await;

    let outcome = harness
        .authenticator
        .authenticate(harness.login_request("  Alice@Example.COM ", "P@ssw0rd!"))
        .await
        .unwrap();
    assert!(matches!(outcome, AuthOutcome::Success { .. }));
}

#[tokio::test]
async fn unknown_user_and_wrong_password_deny_identically() {
    let harness = Harness::new();
    let alice = harness.create_user("alice@example.com").await;
    harness.set_password(&alice, "P@ssw0rd!").await;

    let wrong_password = harness
        .authenticator
        .authenticate(harness.login_request("alice@example.com", "nope"))
        .await
        .unwrap();
    let unknown_user = harness
        .authenticator
        .authenticate(harness.login_request("nobody@example.com", "nope"))
        .await
        .unwrap();

    // Same external answer for both: no enumeration signal.
    assert_eq!(
        wrong_password,
        AuthOutcome::Denied { reason: DenialReason::InvalidCredential }
    );
    assert_eq!(unknown_user, wrong_password);
}

#[tokio::test]
async fn brute_force_is_limited_then_locked_out() {
    let harness = Harness::new();
    let alice = harness.create_user("alice@example.com").await;
    harness.set_password(&alice, "P@ssw0rd!").await;

    // Five wrong passwords inside the window: all invalid-credential.
    for _ in 0..5 {
        let outcome = harness
            .authenticator
            .authenticate(harness.login_request("alice@example.com", "wrong"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AuthOutcome::Denied { reason: DenialReason::InvalidCredential }
        );
    }

    // The sixth attempt trips the password-auth window.
    let sixth = harness
        .authenticator
        .authenticate(harness.login_request("alice@example.com", "wrong"))
        .await
        .unwrap();
    let AuthOutcome::RateLimited { reset_at } = sixth else {
        panic!("expected rate limited, got {sixth:?}");
    };
    let window = harness.config.rate_limits.password_auth.window;
    let expected_reset = Utc::now() + window;
    assert!((expected_reset - reset_at).num_seconds().abs() < 5);

    // Credential-level accounting saw exactly the five verifications.
    let credential = harness
        .credentials
        .find_password_for(alice.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(credential.failed_attempts, 5);
    assert!(credential.lockout_until.is_some());

    harness.settle().await;
    assert!(harness.events.saw(AuthEventKind::AccountLocked));
    assert!(harness.events.saw(AuthEventKind::RateLimited));
}

#[tokio::test]
async fn correct_password_after_lockout_expiry_resets_counter() {
    let harness = Harness::new();
    let alice = harness.create_user("alice@example.com").await;
    harness.set_password(&alice, "P@ssw0rd!").await;

    for _ in 0..5 {
        let _ = harness
            .authenticator
            .authenticate(harness.login_request("alice@example.com", "wrong"))
            .await
            .unwrap();
    }

    // Simulate the lockout deadline passing.
    let mut credential = harness
        .credentials
        .find_password_for(alice.user_id)
        .await
        .unwrap()
        .unwrap();
    credential.lockout_until = Some(Utc::now() - chrono::Duration::seconds(1));
    harness.credentials.upsert_password(&credential).await.unwrap();

    // A fresh source IP gets a fresh request-rate window; the credential
    // counter is what's under test here.
    let mut request = harness.login_request("alice@example.com", "P@ssw0rd!");
    request.ip = "5.6.7.8".parse().unwrap();
    let outcome = harness.authenticator.authenticate(request).await.unwrap();
    assert!(matches!(outcome, AuthOutcome::Success { .. }));

    let credential = harness
        .credentials
        .find_password_for(alice.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(credential.failed_attempts, 0);
    assert_eq!(credential.lockout_until, None);
}

#[tokio::test]
async fn active_lockout_denies_with_retry_hint() {
    let harness = Harness::new();
    let alice = harness.create_user("alice@example.com").await;
    harness.set_password(&alice, "P@ssw0rd!").await;

    let until = Utc::now() + chrono::Duration::minutes(10);
    let mut credential = harness
        .credentials
        .find_password_for(alice.user_id)
        .await
        .unwrap()
        .unwrap();
    credential.failed_attempts = 7;
    credential.lockout_until = Some(until);
    harness.credentials.upsert_password(&credential).await.unwrap();

    let outcome = harness
        .authenticator
        .authenticate(harness.login_request("alice@example.com", "P@ssw0rd!"))
        .await
        .unwrap();
    let AuthOutcome::Denied { reason: DenialReason::AccountLocked { retry_after } } = outcome else {
        panic!("expected lockout denial, got {outcome:?}");
    };
    assert_eq!(retry_after.timestamp(), until.timestamp());
}

#[tokio::test]
async fn risk_denial_emits_security_event() {
    let mut config = test_config();
    config.risk_thresholds = RiskThresholds {
        challenge_floor: 30,
        deny_floor: 41,
    };
    let harness = Harness::with_config(config);
    let alice = harness.create_user("alice@example.com").await;
    harness.set_password(&alice, "P@ssw0rd!").await;

    // Unknown device (25) + unrecognized location (20) clears the floor.
    let mut request = harness.login_request("alice@example.com", "P@ssw0rd!");
    request.location_hint = Some("BR".to_string());
    let outcome = harness.authenticator.authenticate(request).await.unwrap();

    assert_eq!(outcome, AuthOutcome::Denied { reason: DenialReason::Risk });
    harness.settle().await;
    assert!(harness.events.saw(AuthEventKind::RiskDenied));
}

#[tokio::test]
async fn logout_all_invalidates_outstanding_access_tokens() {
    let harness = Harness::new();
    let alice = harness.create_user("alice@example.com").await;
    harness.set_password(&alice, "P@ssw0rd!").await;

    let outcome = harness
        .authenticator
        .authenticate(harness.login_request("alice@example.com", "P@ssw0rd!"))
        .await
        .unwrap();
    let AuthOutcome::Success { tokens, .. } = outcome else {
        panic!("expected success");
    };
    assert!(
        harness
            .authenticator
            .validate_access_token(&tokens.access_token)
            .await
            .is_ok()
    );

    let revoked = harness
        .authenticator
        .logout_all(alice.user_id, uuid::Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(revoked, 1);

    // The embedded security version no longer matches.
    assert_eq!(
        harness
            .authenticator
            .validate_access_token(&tokens.access_token)
            .await,
        Err(AuthError::TokenRevoked)
    );

    // Tokens issued after the bump validate again.
    let outcome = harness
        .authenticator
        .authenticate(harness.login_request("alice@example.com", "P@ssw0rd!"))
        .await
        .unwrap();
    let AuthOutcome::Success { tokens, .. } = outcome else {
        panic!("expected success");
    };
    assert!(
        harness
            .authenticator
            .validate_access_token(&tokens.access_token)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn single_logout_revokes_only_that_session() {
    let harness = Harness::new();
    let alice = harness.create_user("alice@example.com").await;
    harness.set_password(&alice, "P@ssw0rd!").await;

    let first = harness
        .authenticator
        .authenticate(harness.login_request("alice@example.com", "P@ssw0rd!"))
        .await
        .unwrap();
    let AuthOutcome::Success { tokens: first_tokens, .. } = first else {
        panic!("expected success");
    };
    let info = harness
        .authenticator
        .validate_access_token(&first_tokens.access_token)
        .await
        .unwrap();

    // Second device, second session.
    let mut request = harness.login_request("alice@example.com", "P@ssw0rd!");
    request.fingerprint = "fp-canvas-2".to_string();
    let second = harness.authenticator.authenticate(request).await.unwrap();
    let AuthOutcome::Success { tokens: second_tokens, .. } = second else {
        panic!("expected success");
    };

    harness
        .authenticator
        .logout(info.session_id, uuid::Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(
        harness
            .authenticator
            .validate_access_token(&first_tokens.access_token)
            .await,
        Err(AuthError::TokenRevoked)
    );
    assert!(
        harness
            .authenticator
            .validate_access_token(&second_tokens.access_token)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn session_listing_joins_device_rows() {
    let harness = Harness::new();
    let alice = harness.create_user("alice@example.com").await;
    harness.set_password(&alice, "P@ssw0rd!").await;

    // Two sessions from two devices.
    let first = harness
        .authenticator
        .authenticate(harness.login_request("alice@example.com", "P@ssw0rd!"))
        .await
        .unwrap();
    assert!(matches!(first, AuthOutcome::Success { .. }));

    let mut request = harness.login_request("alice@example.com", "P@ssw0rd!");
    request.fingerprint = "fp-canvas-2".to_string();
    let second = harness.authenticator.authenticate(request).await.unwrap();
    assert!(matches!(second, AuthOutcome::Success { .. }));

    let views = harness
        .authenticator
        .list_sessions(alice.user_id)
        .await
        .unwrap();
    assert_eq!(views.len(), 2);
    for view in &views {
        let device = view.device.as_ref().expect("device row joined");
        assert_eq!(device.device_id, view.session.device_id);
        assert_eq!(device.user_id, alice.user_id);
    }
    // The two sessions really are distinct devices.
    assert_ne!(views[0].session.device_id, views[1].session.device_id);

    // Revoking one session drops it from the listing.
    harness
        .authenticator
        .logout(views[0].session.session_id, uuid::Uuid::new_v4())
        .await
        .unwrap();
    let views = harness
        .authenticator
        .list_sessions(alice.user_id)
        .await
        .unwrap();
    assert_eq!(views.len(), 1);
}

#[tokio::test]
async fn window_never_admits_more_than_max_requests() {
    let harness = Harness::new();
    let rule = RouteClass::PasswordAuth.rule(&harness.config.rate_limits);

    let mut allowed = 0;
    for _ in 0..(rule.max_requests * 3) {
        let decision = harness
            .limiter
            .check_and_record(RouteClass::PasswordAuth, "1.2.3.4|x@y.z", rule, Utc::now())
            .await
            .unwrap();
        if decision.allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, rule.max_requests);
}

#[tokio::test]
async fn transient_store_failures_are_retried_once() {
    let harness = Harness::new();
    let alice = harness.create_user("alice@example.com").await;
    harness.set_password(&alice, "P@ssw0rd!").await;

    // One transient failure: absorbed by the single retry.
    harness.users.fail_next(1);
    let outcome = harness
        .authenticator
        .authenticate(harness.login_request("alice@example.com", "P@ssw0rd!"))
        .await
        .unwrap();
    assert!(matches!(outcome, AuthOutcome::Success { .. }));

    // Two consecutive failures exhaust the retry budget.
    harness.users.fail_next(2);
    let result = harness
        .authenticator
        .authenticate(harness.login_request("alice@example.com", "P@ssw0rd!"))
        .await;
    assert!(matches!(result, Err(AuthError::TemporaryFailure(_))));
}
