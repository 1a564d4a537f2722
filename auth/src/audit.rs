//! Audit/event emitter: a structured, ordered event stream to an external
//! sink.
//!
//! Every material outcome of the core produces one [`AuthEventRecord`].
//! Records are immutable after emission and carry a process-monotonic ID, a
//! correlation ID, the actor and device when known, and structured details.
//!
//! The emitter buffers into a bounded channel. When the buffer is full,
//! non-critical events are dropped (and counted) before critical ones:
//! critical emits apply backpressure instead of dropping.

use crate::state::{DeviceId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Event kinds emitted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthEventKind {
    /// A login flow completed successfully.
    LoginSucceeded,
    /// A login flow failed (bad credentials, lockout, policy).
    LoginFailed,
    /// A step-up challenge was issued.
    MfaIssued,
    /// A step-up challenge verified.
    MfaVerified,
    /// A step-up challenge failed.
    MfaFailed,
    /// An access/refresh pair was minted.
    TokenMinted,
    /// A refresh family rotated.
    TokenRefreshed,
    /// A superseded refresh token was presented: theft evidence.
    RefreshReused,
    /// A session (or all of a user's sessions) was revoked.
    SessionRevoked,
    /// Credential-level lockout armed.
    AccountLocked,
    /// A credential was added.
    CredentialAdded,
    /// A credential was removed.
    CredentialRemoved,
    /// The risk engine denied an attempt.
    RiskDenied,
    /// A rate limit rejected a request.
    RateLimited,
    /// An internal invariant was breached.
    InvariantViolated,
}

impl AuthEventKind {
    /// Dotted event name for the sink.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LoginSucceeded => "login.succeeded",
            Self::LoginFailed => "login.failed",
            Self::MfaIssued => "mfa.issued",
            Self::MfaVerified => "mfa.verified",
            Self::MfaFailed => "mfa.failed",
            Self::TokenMinted => "token.minted",
            Self::TokenRefreshed => "token.refreshed",
            Self::RefreshReused => "refresh.reused",
            Self::SessionRevoked => "session.revoked",
            Self::AccountLocked => "account.locked",
            Self::CredentialAdded => "credential.added",
            Self::CredentialRemoved => "credential.removed",
            Self::RiskDenied => "risk.denied",
            Self::RateLimited => "rate.limited",
            Self::InvariantViolated => "invariant.violated",
        }
    }

    /// Critical events are never dropped; they apply backpressure instead.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(
            self,
            Self::RefreshReused | Self::RiskDenied | Self::AccountLocked | Self::InvariantViolated
        )
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthEventRecord {
    /// Process-monotonic event ID.
    pub event_id: u64,

    /// Event kind.
    pub kind: AuthEventKind,

    /// Acting user, when known.
    pub actor: Option<UserId>,

    /// Device involved, when known.
    pub device: Option<DeviceId>,

    /// Source IP, when known.
    pub source_ip: Option<IpAddr>,

    /// Correlation ID tying the record to one request.
    pub correlation_id: uuid::Uuid,

    /// Structured details (never raw secrets).
    pub details: serde_json::Value,

    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Destination for audit records.
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of
/// `async fn` so it stays dyn-compatible.
pub trait EventSink: Send + Sync {
    /// Persist or forward one record. Infallible from the core's view —
    /// a sink that can fail must buffer or drop internally.
    fn publish(&self, event: AuthEventRecord) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Sink that logs records through `tracing`. The default when no external
/// sink is wired.
#[derive(Debug, Clone, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: AuthEventRecord) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            tracing::info!(
                event_id = event.event_id,
                kind = event.kind.as_str(),
                actor = ?event.actor.map(|a| a.0),
                correlation_id = %event.correlation_id,
                details = %event.details,
                "audit event"
            );
        })
    }
}

/// Bounded, ordered audit emitter.
///
/// Cloning is cheap; clones share the channel, ID counter, and drop counter.
#[derive(Clone)]
pub struct AuditEmitter {
    tx: mpsc::Sender<AuthEventRecord>,
    next_id: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for AuditEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditEmitter")
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl AuditEmitter {
    /// Start an emitter forwarding into `sink` with the given buffer size.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuthEventRecord>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.publish(event).await;
            }
        });
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit one event.
    ///
    /// Critical events await buffer space; non-critical events are dropped
    /// (and counted) when the buffer is full.
    pub async fn emit(&self, event: EventDraft) {
        let record = AuthEventRecord {
            event_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind: event.kind,
            actor: event.actor,
            device: event.device,
            source_ip: event.source_ip,
            correlation_id: event.correlation_id,
            details: event.details,
            timestamp: Utc::now(),
        };

        if record.kind.is_critical() {
            if self.tx.send(record).await.is_err() {
                tracing::error!("audit sink task gone; critical event lost");
            }
        } else if let Err(mpsc::error::TrySendError::Full(record)) = self.tx.try_send(record) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                kind = record.kind.as_str(),
                dropped_total = dropped,
                "audit buffer full, non-critical event dropped"
            );
        }
    }

    /// Number of non-critical events dropped so far.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The caller-supplied parts of a record; IDs and timestamps are added by
/// the emitter.
#[derive(Debug, Clone)]
pub struct EventDraft {
    /// Event kind.
    pub kind: AuthEventKind,
    /// Acting user, when known.
    pub actor: Option<UserId>,
    /// Device involved, when known.
    pub device: Option<DeviceId>,
    /// Source IP, when known.
    pub source_ip: Option<IpAddr>,
    /// Correlation ID.
    pub correlation_id: uuid::Uuid,
    /// Structured details.
    pub details: serde_json::Value,
}

impl EventDraft {
    /// A draft with just a kind and correlation ID.
    #[must_use]
    pub const fn new(kind: AuthEventKind, correlation_id: uuid::Uuid) -> Self {
        Self {
            kind,
            actor: None,
            device: None,
            source_ip: None,
            correlation_id,
            details: serde_json::Value::Null,
        }
    }

    /// Attach the acting user.
    #[must_use]
    pub const fn actor(mut self, user_id: UserId) -> Self {
        self.actor = Some(user_id);
        self
    }

    /// Attach the device.
    #[must_use]
    pub const fn device(mut self, device_id: DeviceId) -> Self {
        self.device = Some(device_id);
        self
    }

    /// Attach the source IP.
    #[must_use]
    pub const fn source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    /// Attach structured details.
    #[must_use]
    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Sink capturing records, optionally holding each publish open.
    #[derive(Default)]
    struct CaptureSink {
        records: Mutex<Vec<AuthEventRecord>>,
        delay: Option<Duration>,
    }

    impl EventSink for CaptureSink {
        fn publish(&self, event: AuthEventRecord) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                self.records.lock().unwrap().push(event);
            })
        }
    }

    #[tokio::test]
    async fn events_are_ordered_and_monotonic() {
        let sink = Arc::new(CaptureSink::default());
        let emitter = AuditEmitter::new(Arc::clone(&sink) as Arc<dyn EventSink>, 64);

        for _ in 0..10 {
            emitter
                .emit(EventDraft::new(AuthEventKind::LoginSucceeded, uuid::Uuid::new_v4()))
                .await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 10);
        for pair in records.windows(2) {
            assert!(pair[0].event_id < pair[1].event_id);
        }
    }

    #[tokio::test]
    async fn full_buffer_drops_only_non_critical() {
        let sink = Arc::new(CaptureSink {
            records: Mutex::new(Vec::new()),
            delay: Some(Duration::from_millis(20)),
        });
        let emitter = AuditEmitter::new(Arc::clone(&sink) as Arc<dyn EventSink>, 1);

        // Saturate the buffer with non-critical events.
        for _ in 0..20 {
            emitter
                .emit(EventDraft::new(AuthEventKind::LoginFailed, uuid::Uuid::new_v4()))
                .await;
        }
        assert!(emitter.dropped_count() > 0);

        // A critical event still gets through (backpressure, not drop).
        let before = emitter.dropped_count();
        emitter
            .emit(EventDraft::new(AuthEventKind::RefreshReused, uuid::Uuid::new_v4()))
            .await;
        assert_eq!(emitter.dropped_count(), before);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let records = sink.records.lock().unwrap();
        assert!(records.iter().any(|r| r.kind == AuthEventKind::RefreshReused));
    }

    #[test]
    fn criticality_policy() {
        assert!(AuthEventKind::RefreshReused.is_critical());
        assert!(AuthEventKind::RiskDenied.is_critical());
        assert!(AuthEventKind::AccountLocked.is_critical());
        assert!(!AuthEventKind::LoginFailed.is_critical());
        assert!(!AuthEventKind::TokenMinted.is_critical());
    }

    #[test]
    fn event_names_are_dotted() {
        assert_eq!(AuthEventKind::LoginSucceeded.as_str(), "login.succeeded");
        assert_eq!(AuthEventKind::RefreshReused.as_str(), "refresh.reused");
        assert_eq!(AuthEventKind::RateLimited.as_str(), "rate.limited");
    }
}
