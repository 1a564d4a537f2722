//! Refresh-family rotation: sliding window, reuse detection, family
//! revocation, and the one-rotation-per-token law.

mod common;

use chrono::{Duration, Utc};
use common::Harness;
use vigil_auth::audit::AuthEventKind;
use vigil_auth::error::AuthError;
use vigil_auth::providers::SessionStore;
use vigil_auth::state::{AuthOutcome, TokenPair};

async fn login(harness: &Harness) -> TokenPair {
    let alice = harness.create_user("alice@example.com").await;
    harness.set_password(&alice, "P@ssw0rd!").await;
    let outcome = harness
        .authenticator
        .authenticate(harness.login_request("alice@example.com", "P@ssw0rd!"))
        .await
        .unwrap();
    match outcome {
        AuthOutcome::Success { tokens, .. } => tokens,
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test]
async fn refresh_rotates_generation_and_mints_new_pair() {
    let harness = Harness::new();
    let tokens = login(&harness).await;

    let outcome = harness
        .authenticator
        .refresh(harness.refresh_request(&tokens.refresh_token))
        .await
        .unwrap();
    let AuthOutcome::Success { tokens: rotated, user, .. } = outcome else {
        panic!("expected success");
    };
    assert_ne!(rotated.refresh_token, tokens.refresh_token);
    assert_ne!(rotated.access_token, tokens.access_token);

    let sessions = harness
        .sessions
        .list_active(user.user_id, Utc::now())
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].generation, 1);

    harness.settle().await;
    assert!(harness.events.saw(AuthEventKind::TokenRefreshed));
}

#[tokio::test]
async fn reused_refresh_token_revokes_the_family() {
    let harness = Harness::new();
    let first = login(&harness).await;

    // R0 → R1: fine.
    let outcome = harness
        .authenticator
        .refresh(harness.refresh_request(&first.refresh_token))
        .await
        .unwrap();
    let AuthOutcome::Success { tokens: second, user, .. } = outcome else {
        panic!("expected success");
    };

    // R0 again: theft evidence.
    let reuse = harness
        .authenticator
        .refresh(harness.refresh_request(&first.refresh_token))
        .await;
    assert_eq!(reuse, Err(AuthError::RefreshReused));

    // The whole family is revoked, so R1 is now unknown.
    let follow_up = harness
        .authenticator
        .refresh(harness.refresh_request(&second.refresh_token))
        .await;
    assert_eq!(follow_up, Err(AuthError::RefreshUnknown));

    let sessions = harness
        .sessions
        .list_active(user.user_id, Utc::now())
        .await
        .unwrap();
    assert!(sessions.is_empty());

    harness.settle().await;
    assert!(harness.events.saw(AuthEventKind::RefreshReused));
}

#[tokio::test]
async fn each_refresh_token_rotates_exactly_once() {
    let harness = Harness::new();
    let mut tokens = login(&harness).await;

    // A chain of rotations: each token works exactly once.
    for _ in 0..5 {
        let outcome = harness
            .authenticator
            .refresh(harness.refresh_request(&tokens.refresh_token))
            .await
            .unwrap();
        let AuthOutcome::Success { tokens: next, .. } = outcome else {
            panic!("expected success");
        };
        tokens = next;
    }

    let sessions = harness.sessions.session_count();
    assert_eq!(sessions, 1, "rotation must reuse the session row");
}

#[tokio::test]
async fn malformed_and_foreign_tokens_are_unknown() {
    let harness = Harness::new();
    let _ = login(&harness).await;

    assert_eq!(
        harness
            .authenticator
            .refresh(harness.refresh_request("definitely-not-a-token"))
            .await,
        Err(AuthError::RefreshUnknown)
    );

    // Well-formed but never issued.
    let foreign = harness.authenticator.env().tokens.mint_refresh();
    assert_eq!(
        harness
            .authenticator
            .refresh(harness.refresh_request(&foreign.raw))
            .await,
        Err(AuthError::RefreshUnknown)
    );
}

#[tokio::test]
async fn sliding_window_never_exceeds_absolute_lifetime() {
    let harness = Harness::new();
    let tokens = login(&harness).await;

    let outcome = harness
        .authenticator
        .refresh(harness.refresh_request(&tokens.refresh_token))
        .await
        .unwrap();
    let AuthOutcome::Success { user, .. } = outcome else {
        panic!("expected success");
    };

    let sessions = harness
        .sessions
        .list_active(user.user_id, Utc::now())
        .await
        .unwrap();
    let session = &sessions[0];
    assert!(session.refresh_expires_at <= session.absolute_expires_at);
}

#[tokio::test]
async fn expired_family_refuses_rotation() {
    let harness = Harness::new();
    let tokens = login(&harness).await;
    let presented_hash = harness
        .authenticator
        .env()
        .tokens
        .refresh_hash(&tokens.refresh_token)
        .unwrap();
    let replacement = harness.authenticator.env().tokens.mint_refresh();

    // Drive the store directly with a clock past the refresh window.
    let far_future = Utc::now() + Duration::days(365);
    let outcome = harness
        .sessions
        .rotate_refresh(
            &presented_hash,
            &replacement.hash,
            far_future,
            Duration::days(30),
            far_future + Duration::hours(1),
        )
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        vigil_auth::providers::session::RotateOutcome::Expired
    ));
}

#[tokio::test]
async fn concurrent_refreshes_rotate_at_most_once() {
    let harness = Harness::new();
    let tokens = login(&harness).await;

    let auth = std::sync::Arc::new(harness.authenticator);
    let mut handles = vec![];
    for _ in 0..4 {
        let auth = std::sync::Arc::clone(&auth);
        let request = vigil_auth::orchestrator::RefreshRequest {
            refresh_token: tokens.refresh_token.clone(),
            fingerprint: "fp-canvas-1".to_string(),
            ip: common::test_ip(),
            user_agent: "UA1".to_string(),
            correlation_id: uuid::Uuid::new_v4(),
        };
        handles.push(tokio::spawn(async move { auth.refresh(request).await }));
    }

    let mut rotations = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), Ok(AuthOutcome::Success { .. })) {
            rotations += 1;
        }
    }
    // Exactly one presentation rotates; the rest are rejected.
    assert_eq!(rotations, 1);
}
