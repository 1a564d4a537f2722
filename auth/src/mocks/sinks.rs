//! Mock sinks and the in-memory distributed KV.

use crate::audit::{AuthEventKind, AuthEventRecord, EventSink};
use crate::error::{AuthError, Result};
use crate::providers::delivery::{ChallengeDelivery, MessageSink};
use crate::providers::verifier::{IdentityVerifier, VerifiedIdentity};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vigil_runtime::cache::{DistributedKv, KvError};

/// Capturing [`MessageSink`]: tests read delivered secrets from here.
#[derive(Debug, Clone, Default)]
pub struct CaptureMessageSink {
    deliveries: Arc<Mutex<Vec<ChallengeDelivery>>>,
    failing: Arc<AtomicBool>,
}

impl CaptureMessageSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All deliveries so far.
    #[must_use]
    pub fn deliveries(&self) -> Vec<ChallengeDelivery> {
        self.lock().clone()
    }

    /// The secret of the most recent delivery, if any.
    #[must_use]
    pub fn last_secret(&self) -> Option<String> {
        self.lock().last().map(|d| d.secret.clone())
    }

    /// Toggle failure injection.
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ChallengeDelivery>> {
        match self.deliveries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl MessageSink for CaptureMessageSink {
    fn deliver(
        &self,
        delivery: ChallengeDelivery,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(AuthError::DependencyUnavailable("delivery transport".into()));
            }
            self.lock().push(delivery);
            Ok(())
        })
    }
}

/// Capturing [`EventSink`] for asserting on the audit stream.
#[derive(Debug, Clone, Default)]
pub struct CaptureEventSink {
    records: Arc<Mutex<Vec<AuthEventRecord>>>,
}

impl CaptureEventSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records so far.
    #[must_use]
    pub fn records(&self) -> Vec<AuthEventRecord> {
        self.lock().clone()
    }

    /// Event kinds in emission order.
    #[must_use]
    pub fn kinds(&self) -> Vec<AuthEventKind> {
        self.lock().iter().map(|r| r.kind).collect()
    }

    /// Whether any record of `kind` was emitted.
    #[must_use]
    pub fn saw(&self, kind: AuthEventKind) -> bool {
        self.lock().iter().any(|r| r.kind == kind)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AuthEventRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl EventSink for CaptureEventSink {
    fn publish(&self, event: AuthEventRecord) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.lock().push(event);
        })
    }
}

/// In-memory [`DistributedKv`] with failure injection, standing in for the
/// Redis cache tier.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryKv {
    /// Create an empty KV.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle failure injection (every call errors while on).
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check(&self) -> std::result::Result<(), KvError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(KvError::Unavailable("injected".into()))
        } else {
            Ok(())
        }
    }
}

impl DistributedKv for MemoryKv {
    async fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, KvError> {
        self.check()?;
        Ok(self.lock().get(key).cloned())
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        _ttl: Duration,
    ) -> std::result::Result<(), KvError> {
        self.check()?;
        self.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> std::result::Result<(), KvError> {
        self.check()?;
        self.lock().remove(key);
        Ok(())
    }
}

/// Table-driven [`IdentityVerifier`].
#[derive(Debug, Clone, Default)]
pub struct MockIdentityVerifier {
    identities: Arc<Mutex<HashMap<String, VerifiedIdentity>>>,
}

impl MockIdentityVerifier {
    /// Create an empty verifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `assertion` as proving `identity`.
    pub fn accept(&self, assertion: &str, identity: VerifiedIdentity) {
        match self.identities.lock() {
            Ok(mut guard) => {
                guard.insert(assertion.to_string(), identity);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(assertion.to_string(), identity);
            }
        }
    }
}

impl IdentityVerifier for MockIdentityVerifier {
    fn verify(
        &self,
        assertion: &str,
    ) -> Pin<Box<dyn Future<Output = Result<VerifiedIdentity>> + Send + '_>> {
        let assertion = assertion.to_string();
        Box::pin(async move {
            let identities = match self.identities.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            identities
                .get(&assertion)
                .cloned()
                .ok_or(AuthError::InvalidCredential)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_verifier_accepts_known_assertions_only() {
        let verifier = MockIdentityVerifier::new();
        verifier.accept(
            "assertion-1",
            VerifiedIdentity {
                subject: "sub-1".into(),
                email: "user@example.com".into(),
                email_verified: true,
                display_name: None,
            },
        );

        let identity = verifier.verify("assertion-1").await.unwrap();
        assert_eq!(identity.email, "user@example.com");
        assert_eq!(
            verifier.verify("assertion-2").await,
            Err(AuthError::InvalidCredential)
        );
    }
}
