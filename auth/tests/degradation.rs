//! Degraded-dependency behavior: the distributed tier going down must not
//! take the request path with it.

mod common;

use common::Harness;
use vigil_auth::state::AuthOutcome;
use vigil_runtime::circuit_breaker::State;

#[tokio::test]
async fn validation_survives_distributed_cache_outage() {
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

    // Kill the distributed tier: validations degrade to origin reads
    // through the breaker instead of failing.
    harness.kv.fail(true);
    for _ in 0..8 {
        assert!(
            harness
                .authenticator
                .validate_access_token(&tokens.access_token)
                .await
                .is_ok()
        );
    }
}

#[tokio::test]
async fn breaker_opens_and_stops_touching_the_distributed_tier() {
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

    harness.kv.fail(true);
    let breaker = harness.authenticator.env().cache.breaker();
    let threshold = 5; // default failure threshold

    // Security-version reads keep succeeding while the breaker counts
    // failures. Distinct users are not needed: each validation may hit the
    // local tier, so force misses by invalidating locally via fresh keys —
    // simplest is to drive the cache directly.
    let mut probes = 0;
    while breaker.state().await != State::Open && probes < threshold * 3 {
        let key = format!("probe:{probes}");
        let _: Result<Option<u32>, _> = harness
            .authenticator
            .env()
            .cache
            .get_or_load(&key, std::time::Duration::from_secs(1), || async {
                Ok(vigil_runtime::cache::Loaded::Value(1u32))
            })
            .await;
        probes += 1;
    }
    assert_eq!(breaker.state().await, State::Open);

    let rejected_before = breaker.metrics().total_rejections;
    assert!(
        harness
            .authenticator
            .validate_access_token(&tokens.access_token)
            .await
            .is_ok()
    );
    // While open, calls short-circuit: rejections grow, the KV stays idle.
    assert!(breaker.metrics().total_rejections > rejected_before);
}
