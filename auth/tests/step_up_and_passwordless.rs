//! Step-up challenges, passwordless login, and WebAuthn ceremonies.

mod common;

use common::{Harness, test_config};
use vigil_auth::audit::AuthEventKind;
use vigil_auth::challenge::current_totp_code;
use vigil_auth::config::RiskThresholds;
use vigil_auth::mocks::MockWebAuthnCeremony;
use vigil_auth::providers::CredentialRegistry;
use vigil_auth::state::{
    AuthFactors, AuthOutcome, ChallengeDescriptor, ChallengeVariant, DenialReason,
    DeviceTrustLevel, User,
};

/// Config whose floors force a step-up for an unknown device + new
/// location, without reaching the deny floor.
fn step_up_config() -> vigil_auth::config::AuthConfig {
    let mut config = test_config();
    config.risk_thresholds = RiskThresholds {
        challenge_floor: 40,
        deny_floor: 90,
    };
    config
}

async fn password_user(harness: &Harness) -> User {
    let alice = harness.create_user("alice@example.com").await;
    harness.set_password(&alice, "P@ssw0rd!").await;
    alice
}

/// Authenticate from a new country so risk lands between the floors.
async fn step_up_login(harness: &Harness) -> ChallengeDescriptor {
    let mut request = harness.login_request("alice@example.com", "P@ssw0rd!");
    request.location_hint = Some("BR".to_string());
    let outcome = harness.authenticator.authenticate(request).await.unwrap();
    match outcome {
        AuthOutcome::ChallengeRequired { challenge } => challenge,
        other => panic!("expected step-up, got {other:?}"),
    }
}

#[tokio::test]
async fn step_up_delivers_code_and_resolves_to_full_factors() {
    let harness = Harness::with_config(step_up_config());
    let alice = password_user(&harness).await;

    let challenge = step_up_login(&harness).await;
    assert_eq!(challenge.variant, ChallengeVariant::EmailCode);
    assert_eq!(challenge.delivered_via.as_deref(), Some("email"));

    // The code went to the account email, not the response.
    let code = harness.delivery.last_secret().expect("code delivered");
    let outcome = harness
        .authenticator
        .resolve_mfa(harness.challenge_answer(challenge.challenge_id, &code))
        .await
        .unwrap();

    let AuthOutcome::Success { user, factors, .. } = outcome else {
        panic!("expected success");
    };
    assert_eq!(user.user_id, alice.user_id);
    assert_eq!(factors, AuthFactors::KNOWLEDGE.with(AuthFactors::POSSESSION));

    harness.settle().await;
    assert!(harness.events.saw(AuthEventKind::MfaIssued));
    assert!(harness.events.saw(AuthEventKind::MfaVerified));
}

#[tokio::test]
async fn step_up_prefers_totp_when_enrolled() {
    let harness = Harness::with_config(step_up_config());
    let alice = password_user(&harness).await;
    let seed = harness.enroll_totp(&alice).await;

    let challenge = step_up_login(&harness).await;
    assert_eq!(challenge.variant, ChallengeVariant::Totp);
    // Nothing to deliver: the authenticator app has the secret.
    assert!(harness.delivery.deliveries().is_empty());

    let code = current_totp_code(&seed, chrono::Utc::now()).unwrap();
    let outcome = harness
        .authenticator
        .resolve_mfa(harness.challenge_answer(challenge.challenge_id, &code))
        .await
        .unwrap();
    assert!(matches!(outcome, AuthOutcome::Success { .. }));
}

#[tokio::test]
async fn wrong_code_denies_and_right_code_still_works_within_budget() {
    let harness = Harness::with_config(step_up_config());
    let _alice = password_user(&harness).await;

    let challenge = step_up_login(&harness).await;
    let code = harness.delivery.last_secret().expect("code delivered");

    let wrong = harness
        .authenticator
        .resolve_mfa(harness.challenge_answer(challenge.challenge_id, "000000"))
        .await
        .unwrap();
    assert_eq!(wrong, AuthOutcome::Denied { reason: DenialReason::ChallengeFailed });

    let right = harness
        .authenticator
        .resolve_mfa(harness.challenge_answer(challenge.challenge_id, &code))
        .await
        .unwrap();
    assert!(matches!(right, AuthOutcome::Success { .. }));
}

#[tokio::test]
async fn challenge_from_another_device_is_rejected() {
    let harness = Harness::with_config(step_up_config());
    let _alice = password_user(&harness).await;

    let challenge = step_up_login(&harness).await;
    let code = harness.delivery.last_secret().expect("code delivered");

    let mut answer = harness.challenge_answer(challenge.challenge_id, &code);
    answer.fingerprint = "fp-attacker".to_string();
    let outcome = harness.authenticator.resolve_mfa(answer).await.unwrap();
    assert_eq!(outcome, AuthOutcome::Denied { reason: DenialReason::ChallengeFailed });
}

#[tokio::test]
async fn remember_device_on_step_up_marks_device_trusted() {
    let harness = Harness::with_config(step_up_config());
    let alice = password_user(&harness).await;

    let challenge = step_up_login(&harness).await;
    let code = harness.delivery.last_secret().expect("code delivered");
    let mut answer = harness.challenge_answer(challenge.challenge_id, &code);
    answer.remember_device = true;
    let outcome = harness.authenticator.resolve_mfa(answer).await.unwrap();
    assert!(matches!(outcome, AuthOutcome::Success { .. }));

    let devices = {
        use vigil_auth::providers::DeviceRepository;
        harness.devices.list_for_user(alice.user_id).await.unwrap()
    };
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].trust_level, DeviceTrustLevel::Trusted);
}

#[tokio::test]
async fn passwordless_round_trip() {
    let harness = Harness::new();
    let alice = harness.create_user("alice@example.com").await;

    let outcome = harness
        .authenticator
        .begin_passwordless("alice@example.com", "fp-canvas-1", common::test_ip(), uuid::Uuid::new_v4())
        .await
        .unwrap();
    let AuthOutcome::ChallengeRequired { challenge } = outcome else {
        panic!("expected challenge");
    };
    assert_eq!(challenge.variant, ChallengeVariant::MagicLink);

    let secret = harness.delivery.last_secret().expect("link delivered");
    let outcome = harness
        .authenticator
        .complete_passwordless(harness.challenge_answer(challenge.challenge_id, &secret))
        .await
        .unwrap();
    let AuthOutcome::Success { user, factors, .. } = outcome else {
        panic!("expected success");
    };
    assert_eq!(user.user_id, alice.user_id);
    assert!(factors.contains(AuthFactors::POSSESSION));
}

#[tokio::test]
async fn unknown_email_gets_indistinguishable_response_and_no_delivery() {
    let harness = Harness::new();
    let _alice = harness.create_user("alice@example.com").await;

    let known = harness
        .authenticator
        .begin_passwordless("alice@example.com", "fp", common::test_ip(), uuid::Uuid::new_v4())
        .await
        .unwrap();
    let deliveries_after_known = harness.delivery.deliveries().len();

    let unknown = harness
        .authenticator
        .begin_passwordless("ghost@example.com", "fp", common::test_ip(), uuid::Uuid::new_v4())
        .await
        .unwrap();

    // Same outcome shape, but nothing was sent for the unknown address.
    assert!(matches!(known, AuthOutcome::ChallengeRequired { .. }));
    assert!(matches!(unknown, AuthOutcome::ChallengeRequired { .. }));
    assert_eq!(harness.delivery.deliveries().len(), deliveries_after_known);
}

#[tokio::test]
async fn magic_link_issue_rate_is_limited_per_email() {
    let harness = Harness::new();
    let _alice = harness.create_user("alice@example.com").await;

    let max = harness.config.rate_limits.magic_link_issue.max_requests;
    for _ in 0..max {
        let outcome = harness
            .authenticator
            .begin_passwordless("alice@example.com", "fp", common::test_ip(), uuid::Uuid::new_v4())
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::ChallengeRequired { .. }));
    }

    let outcome = harness
        .authenticator
        .begin_passwordless("alice@example.com", "fp", common::test_ip(), uuid::Uuid::new_v4())
        .await
        .unwrap();
    assert!(matches!(outcome, AuthOutcome::RateLimited { .. }));
}

#[tokio::test]
async fn webauthn_register_then_login() {
    let harness = Harness::new();
    let alice = harness.create_user("alice@example.com").await;

    let descriptor = harness
        .authenticator
        .begin_webauthn_register(alice.user_id, "YubiKey", "fp-canvas-1")
        .await
        .unwrap();
    assert_eq!(descriptor.variant, ChallengeVariant::WebAuthnCreate);
    let options = descriptor.options.expect("registration options");

    let credential_id = b"cred-0001".to_vec();
    let attestation = MockWebAuthnCeremony::attestation_for(&options, &credential_id);
    let credential_ref = harness
        .authenticator
        .complete_webauthn_register(
            descriptor.challenge_id,
            &attestation,
            "YubiKey",
            uuid::Uuid::new_v4(),
        )
        .await
        .unwrap();
    assert_eq!(credential_ref.credential_id, credential_id);

    // Assertion ceremony with a user-verifying authenticator.
    let outcome = harness
        .authenticator
        .begin_webauthn_login("alice@example.com", "fp-canvas-1", common::test_ip(), uuid::Uuid::new_v4())
        .await
        .unwrap();
    let AuthOutcome::ChallengeRequired { challenge } = outcome else {
        panic!("expected challenge");
    };
    let options = challenge.options.expect("assertion options");
    let assertion = MockWebAuthnCeremony::assertion_for(&options, &credential_id, 7, true);

    let outcome = harness
        .authenticator
        .complete_webauthn_login(
            harness.challenge_answer(challenge.challenge_id, ""),
            &assertion,
        )
        .await
        .unwrap();
    let AuthOutcome::Success { factors, .. } = outcome else {
        panic!("expected success");
    };
    assert!(factors.contains(AuthFactors::POSSESSION));
    assert!(factors.contains(AuthFactors::INHERENCE));

    harness.settle().await;
    assert!(harness.events.saw(AuthEventKind::CredentialAdded));
}

#[tokio::test]
async fn webauthn_login_attempts_are_rate_limited() {
    let harness = Harness::new();
    let alice = harness.create_user("alice@example.com").await;

    let descriptor = harness
        .authenticator
        .begin_webauthn_register(alice.user_id, "YubiKey", "fp-canvas-1")
        .await
        .unwrap();
    let options = descriptor.options.expect("options");
    let credential_id = b"cred-0003".to_vec();
    let attestation = MockWebAuthnCeremony::attestation_for(&options, &credential_id);
    harness
        .authenticator
        .complete_webauthn_register(descriptor.challenge_id, &attestation, "Key", uuid::Uuid::new_v4())
        .await
        .unwrap();

    // Ceremony starts are keyed by email and share the webauthn window.
    let max = harness.config.rate_limits.webauthn_verify.max_requests;
    for _ in 0..max {
        let outcome = harness
            .authenticator
            .begin_webauthn_login("alice@example.com", "fp-canvas-1", common::test_ip(), uuid::Uuid::new_v4())
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::ChallengeRequired { .. }));
    }
    let outcome = harness
        .authenticator
        .begin_webauthn_login("alice@example.com", "fp-canvas-1", common::test_ip(), uuid::Uuid::new_v4())
        .await
        .unwrap();
    assert!(matches!(outcome, AuthOutcome::RateLimited { .. }));
}

#[tokio::test]
async fn webauthn_counter_must_strictly_increase() {
    let harness = Harness::new();
    let alice = harness.create_user("alice@example.com").await;

    let descriptor = harness
        .authenticator
        .begin_webauthn_register(alice.user_id, "YubiKey", "fp-canvas-1")
        .await
        .unwrap();
    let options = descriptor.options.expect("options");
    let credential_id = b"cred-0002".to_vec();
    let attestation = MockWebAuthnCeremony::attestation_for(&options, &credential_id);
    harness
        .authenticator
        .complete_webauthn_register(descriptor.challenge_id, &attestation, "Key", uuid::Uuid::new_v4())
        .await
        .unwrap();

    // First assertion at counter 3: accepted, stored counter bumps.
    let login = |counter: u32| {
        let harness = &harness;
        let credential_id = credential_id.clone();
        async move {
            let outcome = harness
                .authenticator
                .begin_webauthn_login("alice@example.com", "fp-canvas-1", common::test_ip(), uuid::Uuid::new_v4())
                .await
                .unwrap();
            let AuthOutcome::ChallengeRequired { challenge } = outcome else {
                panic!("expected challenge");
            };
            let options = challenge.options.expect("options");
            let assertion =
                MockWebAuthnCeremony::assertion_for(&options, &credential_id, counter, true);
            harness
                .authenticator
                .complete_webauthn_login(
                    harness.challenge_answer(challenge.challenge_id, ""),
                    &assertion,
                )
                .await
                .unwrap()
        }
    };

    assert!(matches!(login(3).await, AuthOutcome::Success { .. }));

    // Replay at the same counter: cloned-authenticator evidence.
    let replay = login(3).await;
    assert_eq!(replay, AuthOutcome::Denied { reason: DenialReason::InvalidCredential });

    // The stored counter did not move on the rejected assertion.
    let stored = harness
        .credentials
        .list_webauthn_for(alice.user_id)
        .await
        .unwrap();
    assert_eq!(stored[0].counter, 3);

    // A strictly higher counter is accepted again.
    assert!(matches!(login(4).await, AuthOutcome::Success { .. }));
}
