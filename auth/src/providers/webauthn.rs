//! WebAuthn ceremony trait and the `webauthn-rs` relying party.
//!
//! The ceremony trait covers the pure protocol work: building client
//! options, verifying attestations and assertions. Challenge storage,
//! single-use consumption, and the signature-counter check stay with the
//! challenge broker and credential registry, so the ceremony itself holds no
//! state beyond the relying-party identity.

use crate::error::{AuthError, Result};
use crate::state::UserId;
use serde_json::Value;
use webauthn_rs::prelude::{
    CredentialID, PasskeyAuthentication, PasskeyRegistration, PublicKeyCredential,
    RegisterPublicKeyCredential, Url,
};
use webauthn_rs::{Webauthn, WebauthnBuilder};

/// A passkey accepted at registration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredPasskey {
    /// Credential ID (opaque bytes).
    pub credential_id: Vec<u8>,

    /// Serialized passkey for later assertion verification.
    pub passkey: Value,

    /// Initial signature counter.
    pub counter: u32,

    /// Authenticator AAGUID (zeros unless an attestation policy is active).
    pub aaguid: Vec<u8>,

    /// Transports the client reported.
    pub transports: Vec<String>,
}

/// A verified assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionOutcome {
    /// Credential that signed.
    pub credential_id: Vec<u8>,

    /// Counter reported by the authenticator. The registry only accepts a
    /// strict increase over the stored value.
    pub counter: u32,

    /// Whether the authenticator performed user verification.
    pub user_verified: bool,
}

/// WebAuthn ceremony operations.
pub trait WebAuthnCeremony: Send + Sync {
    /// Build registration options and opaque server state.
    ///
    /// # Errors
    ///
    /// Returns an error if option generation fails.
    fn begin_registration(
        &self,
        user_id: UserId,
        user_name: &str,
        display_name: &str,
        exclude: &[Vec<u8>],
    ) -> Result<(Value, Value)>;

    /// Verify an attestation against stored ceremony state.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredential`] when the attestation does
    /// not verify.
    fn finish_registration(&self, attestation: &Value, state: &Value) -> Result<RegisteredPasskey>;

    /// Build assertion options (allow-list from the user's passkeys) and
    /// opaque server state.
    ///
    /// # Errors
    ///
    /// Returns an error when the passkey set is empty or malformed.
    fn begin_authentication(&self, passkeys: &[Value]) -> Result<(Value, Value)>;

    /// Verify an assertion against stored ceremony state. Checks the
    /// signature and user presence; the counter comparison is the caller's.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredential`] when the assertion does not
    /// verify.
    fn finish_authentication(&self, assertion: &Value, state: &Value) -> Result<AssertionOutcome>;
}

/// `webauthn-rs` relying party.
#[derive(Clone)]
pub struct WebauthnRelyingParty {
    webauthn: Webauthn,
}

impl std::fmt::Debug for WebauthnRelyingParty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebauthnRelyingParty").finish_non_exhaustive()
    }
}

impl WebauthnRelyingParty {
    /// Build a relying party for the given RP ID and origin.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidInput`] on a malformed origin or RP ID.
    pub fn new(rp_id: &str, origin: &str, rp_name: &str) -> Result<Self> {
        let origin = Url::parse(origin)
            .map_err(|e| AuthError::InvalidInput(format!("invalid WebAuthn origin: {e}")))?;
        let webauthn = WebauthnBuilder::new(rp_id, &origin)
            .map_err(|e| AuthError::InvalidInput(format!("invalid WebAuthn RP: {e}")))?
            .rp_name(rp_name)
            .build()
            .map_err(|e| AuthError::InvalidInput(format!("invalid WebAuthn RP: {e}")))?;
        Ok(Self { webauthn })
    }
}

impl WebAuthnCeremony for WebauthnRelyingParty {
    fn begin_registration(
        &self,
        user_id: UserId,
        user_name: &str,
        display_name: &str,
        exclude: &[Vec<u8>],
    ) -> Result<(Value, Value)> {
        let exclude: Option<Vec<CredentialID>> = if exclude.is_empty() {
            None
        } else {
            Some(exclude.iter().cloned().map(CredentialID::from).collect())
        };

        let (options, state) = self
            .webauthn
            .start_passkey_registration(user_id.0, user_name, display_name, exclude)
            .map_err(|e| {
                AuthError::InvalidInput(format!("webauthn registration options failed: {e}"))
            })?;

        Ok((to_value(&options)?, to_value(&state)?))
    }

    fn finish_registration(&self, attestation: &Value, state: &Value) -> Result<RegisteredPasskey> {
        let attestation: RegisterPublicKeyCredential =
            from_value(attestation).map_err(|_| AuthError::InvalidCredential)?;
        let state: PasskeyRegistration =
            from_value(state).map_err(|_| AuthError::SerializationError("ceremony state".into()))?;

        let passkey = self
            .webauthn
            .finish_passkey_registration(&attestation, &state)
            .map_err(|_| AuthError::InvalidCredential)?;

        Ok(RegisteredPasskey {
            credential_id: passkey.cred_id().as_ref().to_vec(),
            passkey: to_value(&passkey)?,
            counter: 0,
            // AAGUID requires an attestation policy; none is enforced here.
            aaguid: vec![0; 16],
            transports: attestation
                .response
                .transports
                .as_ref()
                .map(|transports| transports.iter().map(|t| format!("{t:?}").to_lowercase()).collect())
                .unwrap_or_default(),
        })
    }

    fn begin_authentication(&self, passkeys: &[Value]) -> Result<(Value, Value)> {
        let passkeys: Vec<webauthn_rs::prelude::Passkey> = passkeys
            .iter()
            .map(from_value)
            .collect::<Result<_>>()
            .map_err(|_| AuthError::SerializationError("stored passkey malformed".into()))?;
        if passkeys.is_empty() {
            return Err(AuthError::InvalidCredential);
        }

        let (options, state) = self
            .webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(|_| AuthError::InvalidCredential)?;

        Ok((to_value(&options)?, to_value(&state)?))
    }

    fn finish_authentication(&self, assertion: &Value, state: &Value) -> Result<AssertionOutcome> {
        let assertion: PublicKeyCredential =
            from_value(assertion).map_err(|_| AuthError::InvalidCredential)?;
        let state: PasskeyAuthentication =
            from_value(state).map_err(|_| AuthError::SerializationError("ceremony state".into()))?;

        let result = self
            .webauthn
            .finish_passkey_authentication(&assertion, &state)
            .map_err(|_| AuthError::InvalidCredential)?;

        Ok(AssertionOutcome {
            credential_id: result.cred_id().as_ref().to_vec(),
            counter: result.counter(),
            user_verified: result.user_verified(),
        })
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| AuthError::SerializationError(e.to_string()))
}

fn from_value<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T> {
    serde_json::from_value(value.clone()).map_err(|e| AuthError::SerializationError(e.to_string()))
}
