//! Challenge-material delivery sink.
//!
//! Email/SMS transport is an external collaborator: the core only hands a
//! [`ChallengeDelivery`] to a [`MessageSink`] and records the outcome. The
//! sink is a dyn-compatible trait (boxed futures) so the environment can
//! hold `Arc<dyn MessageSink>` without a generic parameter per transport.

use crate::error::Result;
use crate::state::{ChallengeId, ChallengeVariant};
use std::future::Future;
use std::pin::Pin;

/// Where challenge material is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryChannel {
    /// Email to a normalized address.
    Email {
        /// Recipient address.
        to: String,
    },
    /// SMS to an E.164 number.
    Sms {
        /// Recipient number.
        to: String,
    },
}

impl DeliveryChannel {
    /// Channel name for outcome descriptors ("email" / "sms").
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Email { .. } => "email",
            Self::Sms { .. } => "sms",
        }
    }
}

/// One piece of challenge material to deliver.
///
/// The `secret` is the only place the raw verifier exists outside the
/// client; sinks must not persist it.
#[derive(Clone, PartialEq, Eq)]
pub struct ChallengeDelivery {
    /// Challenge this material answers.
    pub challenge_id: ChallengeId,

    /// Challenge variant (shapes the message body).
    pub variant: ChallengeVariant,

    /// Delivery channel and address.
    pub channel: DeliveryChannel,

    /// Raw secret (magic-link token or numeric code).
    pub secret: String,
}

impl std::fmt::Debug for ChallengeDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeDelivery")
            .field("challenge_id", &self.challenge_id)
            .field("variant", &self.variant)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Outbound delivery sink.
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of
/// `async fn` so it stays dyn-compatible.
pub trait MessageSink: Send + Sync {
    /// Deliver challenge material to its channel.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport definitively failed; the
    /// orchestrator surfaces that as a temporary failure.
    fn deliver(
        &self,
        delivery: ChallengeDelivery,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Development sink: prints deliveries to the log instead of sending.
///
/// The secret is intentionally visible here — that is the entire point of a
/// console sink in local development. Production deployments wire a real
/// transport.
#[derive(Debug, Clone, Default)]
pub struct ConsoleMessageSink;

impl MessageSink for ConsoleMessageSink {
    fn deliver(
        &self,
        delivery: ChallengeDelivery,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!(
                challenge_id = %delivery.challenge_id.0,
                variant = delivery.variant.as_str(),
                channel = delivery.channel.as_str(),
                secret = %delivery.secret,
                "console delivery sink (development only)"
            );
            Ok(())
        })
    }
}
