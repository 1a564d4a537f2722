//! # Vigil Authentication & Session Core
//!
//! Transport-agnostic authentication backend: clients exchange credentials
//! or delegated identities for short-lived bearer tokens and present those
//! tokens on subsequent requests. The core authenticates, enforces policy,
//! tracks risk, and manages the lifecycle of sessions and credentials.
//!
//! ## Components
//!
//! - [`hasher`]: Argon2id password verification with pepper rotation
//! - [`keys`]: signing/sealing/pepper keysets with atomic rotation
//! - [`tokens`]: signed access tokens + rotating opaque refresh tokens
//! - [`providers`]: traits for every external dependency (sessions,
//!   credentials, users, devices, challenges, rate limits, delivery)
//! - [`challenge`]: one-shot challenge broker (magic link, codes, TOTP,
//!   WebAuthn) with single-use semantics
//! - [`risk`]: weighted-signal risk scoring with adaptive-challenge floors
//! - [`orchestrator`]: the login / step-up / refresh / logout state machines
//! - [`audit`]: bounded, ordered audit event stream
//! - [`stores`]: Redis (and optionally Postgres) implementations
//! - [`mocks`]: in-memory implementations for tests
//!
//! ## Example: password login
//!
//! ```rust,ignore
//! use vigil_auth::orchestrator::{Authenticator, AuthenticateRequest};
//!
//! let outcome = authenticator
//!     .authenticate(AuthenticateRequest {
//!         email: "alice@example.com".into(),
//!         password: "P@ssw0rd!".into(),
//!         fingerprint: client_fingerprint,
//!         ip: peer_ip,
//!         user_agent: ua.into(),
//!         location_hint: geo_estimate,
//!         correlation_id: request_id,
//!     })
//!     .await?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod audit;
pub mod challenge;
pub mod config;
pub mod environment;
pub mod error;
pub mod hasher;
pub mod keys;
pub mod orchestrator;
pub mod providers;
pub mod risk;
pub mod state;
pub mod stores;
pub mod tokens;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod mocks;

// Re-export main types for convenience
pub use config::AuthConfig;
pub use environment::AuthEnvironment;
pub use error::{AuthError, Result};
pub use orchestrator::Authenticator;
pub use state::{AuthOutcome, Session, SessionId, TokenPair, User, UserId};
