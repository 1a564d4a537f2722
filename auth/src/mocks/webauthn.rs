//! Deterministic mock WebAuthn ceremony.
//!
//! Clients in tests fabricate attestation/assertion JSON instead of running
//! a real authenticator:
//!
//! - attestation: `{ "challenge": …, "credential_id": <b64>, "counter": n }`
//! - assertion: `{ "challenge": …, "credential_id": <b64>, "counter": n,
//!   "user_verified": bool }`
//!
//! The mock checks the challenge matches the ceremony state, mirroring the
//! replay protection of the real relying party.

use crate::error::{AuthError, Result};
use crate::providers::webauthn::{AssertionOutcome, RegisteredPasskey, WebAuthnCeremony};
use crate::state::UserId;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};

/// In-memory [`WebAuthnCeremony`].
#[derive(Debug, Clone, Default)]
pub struct MockWebAuthnCeremony;

impl MockWebAuthnCeremony {
    /// Create a mock ceremony.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Build a test attestation answering `options`.
    #[must_use]
    pub fn attestation_for(options: &Value, credential_id: &[u8]) -> Value {
        json!({
            "challenge": options.get("challenge").cloned().unwrap_or(Value::Null),
            "credential_id": URL_SAFE_NO_PAD.encode(credential_id),
            "counter": 0,
        })
    }

    /// Build a test assertion answering `options`.
    #[must_use]
    pub fn assertion_for(
        options: &Value,
        credential_id: &[u8],
        counter: u32,
        user_verified: bool,
    ) -> Value {
        json!({
            "challenge": options.get("challenge").cloned().unwrap_or(Value::Null),
            "credential_id": URL_SAFE_NO_PAD.encode(credential_id),
            "counter": counter,
            "user_verified": user_verified,
        })
    }
}

fn challenge_of(value: &Value) -> Result<&str> {
    value
        .get("challenge")
        .and_then(Value::as_str)
        .ok_or(AuthError::InvalidCredential)
}

fn credential_id_of(value: &Value) -> Result<Vec<u8>> {
    let encoded = value
        .get("credential_id")
        .and_then(Value::as_str)
        .ok_or(AuthError::InvalidCredential)?;
    URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| AuthError::InvalidCredential)
}

fn counter_of(value: &Value) -> u32 {
    let counter = value.get("counter").and_then(Value::as_u64).unwrap_or_default();
    #[allow(clippy::cast_possible_truncation)]
    let counter = counter as u32;
    counter
}

impl WebAuthnCeremony for MockWebAuthnCeremony {
    fn begin_registration(
        &self,
        user_id: UserId,
        _user_name: &str,
        _display_name: &str,
        exclude: &[Vec<u8>],
    ) -> Result<(Value, Value)> {
        let challenge = uuid::Uuid::new_v4().to_string();
        let options = json!({
            "challenge": challenge,
            "user": user_id.0,
            "exclude": exclude.iter().map(|id| URL_SAFE_NO_PAD.encode(id)).collect::<Vec<_>>(),
        });
        let state = json!({ "challenge": challenge, "user": user_id.0 });
        Ok((options, state))
    }

    fn finish_registration(&self, attestation: &Value, state: &Value) -> Result<RegisteredPasskey> {
        if challenge_of(attestation)? != challenge_of(state)? {
            return Err(AuthError::InvalidCredential);
        }
        let credential_id = credential_id_of(attestation)?;
        Ok(RegisteredPasskey {
            passkey: json!({ "credential_id": URL_SAFE_NO_PAD.encode(&credential_id) }),
            counter: counter_of(attestation),
            aaguid: vec![0; 16],
            transports: vec!["internal".to_string()],
            credential_id,
        })
    }

    fn begin_authentication(&self, passkeys: &[Value]) -> Result<(Value, Value)> {
        if passkeys.is_empty() {
            return Err(AuthError::InvalidCredential);
        }
        let challenge = uuid::Uuid::new_v4().to_string();
        let allowed: Vec<Value> = passkeys
            .iter()
            .filter_map(|p| p.get("credential_id").cloned())
            .collect();
        let options = json!({ "challenge": challenge, "allow": allowed });
        let state = json!({ "challenge": challenge, "allow": allowed });
        Ok((options, state))
    }

    fn finish_authentication(&self, assertion: &Value, state: &Value) -> Result<AssertionOutcome> {
        if challenge_of(assertion)? != challenge_of(state)? {
            return Err(AuthError::InvalidCredential);
        }
        Ok(AssertionOutcome {
            credential_id: credential_id_of(assertion)?,
            counter: counter_of(assertion),
            user_verified: assertion
                .get("user_verified")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}
