//! In-memory mock providers for testing.
//!
//! Every provider trait has a deterministic in-memory implementation here,
//! sharing state through `Arc<Mutex<…>>` so clones observe each other —
//! the same topology the Redis/Postgres stores give separate processes.
//! Auth logic tests run at memory speed against these.

pub mod challenges;
pub mod credentials;
pub mod rate_limiter;
pub mod sessions;
pub mod sinks;
pub mod users;
pub mod webauthn;

pub use challenges::MockChallengeStore;
pub use credentials::MockCredentialRegistry;
pub use rate_limiter::MockRateLimiter;
pub use sessions::MockSessionStore;
pub use sinks::{CaptureEventSink, CaptureMessageSink, MemoryKv, MockIdentityVerifier};
pub use users::{MockDeviceRepository, MockUserRepository};
pub use webauthn::MockWebAuthnCeremony;
