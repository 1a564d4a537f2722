//! Provider traits: the core's external dependencies.
//!
//! Providers are **interfaces**, not implementations. The orchestrator
//! depends on these traits; the runtime wires concrete implementations
//! (`stores::*` for Redis/Postgres, `mocks::*` for tests). This is the
//! dependency-injection seam: an interface bundle
//! ([`crate::environment::AuthEnvironment`]) is passed by value to
//! orchestrator calls, with no global mutable singletons besides the key
//! store and the breaker's state record.

pub mod challenge_store;
pub mod credentials;
pub mod delivery;
pub mod device;
pub mod rate_limiter;
pub mod session;
pub mod user;
pub mod verifier;
pub mod webauthn;

pub use challenge_store::{ChallengeRecord, ChallengeSecret, ChallengeStore};
pub use credentials::{
    ContactChannel, ContactKind, CredentialRegistry, FailureRecord, PasswordCredential,
    TotpEnrollment, WebAuthnCredential,
};
pub use delivery::{ChallengeDelivery, ConsoleMessageSink, DeliveryChannel, MessageSink};
pub use device::DeviceRepository;
pub use rate_limiter::{RateDecision, RateLimiter, RouteClass};
pub use session::{RotateOutcome, SessionStore};
pub use user::UserRepository;
pub use verifier::{IdentityVerifier, VerifiedIdentity};
pub use webauthn::{AssertionOutcome, RegisteredPasskey, WebAuthnCeremony, WebauthnRelyingParty};
