//! Risk-scoring engine: weighted, independent signals → score in [0, 100].
//!
//! Each signal inspects the context and reports a magnitude in [0, 1]; the
//! engine multiplies by the signal's configured weight (in score points),
//! sums, and clips to [0, 100]. Signals never mutate their inputs and the
//! evaluation is idempotent: the same context always produces the same
//! assessment.
//!
//! Per-user aggregates (failure velocity, prior locations) are fetched by
//! the orchestrator through the cache *before* evaluation; when the cache is
//! unavailable the orchestrator passes conservative defaults, so a degraded
//! cache can raise a score but never fail an evaluation.

use crate::config::RiskThresholds;
use crate::state::{Device, DeviceTrustLevel};
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Per-signal weights, in score points. Data-driven: nothing risk-related
/// is compiled in.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskConfig {
    /// Weight for an unrecognized or low-trust device.
    pub unknown_device: f32,
    /// Weight for a fingerprint that no longer matches the bound device.
    pub fingerprint_drift: f32,
    /// Weight for a location absent from the user's successful history.
    pub new_location: f32,
    /// Weight for recent failed-attempt velocity.
    pub failure_velocity: f32,
    /// Weight for very young accounts.
    pub young_account: f32,
    /// Weight for logins far outside the user's usual hours.
    pub odd_hours: f32,
    /// Weight for source IPs on the configured denylist.
    pub denylisted_ip: f32,
    /// Known-bad source IPs.
    pub ip_denylist: Vec<IpAddr>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            unknown_device: 25.0,
            fingerprint_drift: 20.0,
            new_location: 20.0,
            failure_velocity: 15.0,
            young_account: 10.0,
            odd_hours: 5.0,
            denylisted_ip: 100.0,
            ip_denylist: Vec::new(),
        }
    }
}

/// Everything a signal may look at. Owned snapshots only; the engine holds
/// no references into live state.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskContext {
    /// When the account was created.
    pub account_created_at: DateTime<Utc>,
    /// The device bound to this fingerprint, if any.
    pub device: Option<Device>,
    /// Fingerprint hash presented on this attempt.
    pub fingerprint_hash: String,
    /// Source IP.
    pub ip: IpAddr,
    /// Coarse location estimate for the source IP, when available.
    pub location: Option<String>,
    /// Locations of prior *successful* logins (cached aggregate; empty when
    /// the cache degraded).
    pub prior_locations: Vec<String>,
    /// Failed attempts in the recent window (cached aggregate; conservative
    /// default when the cache degraded).
    pub recent_failures: u32,
    /// Evaluation instant.
    pub now: DateTime<Utc>,
}

/// One signal's contribution, for the explanation bag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalReport {
    /// Signal name.
    pub name: &'static str,
    /// Magnitude in [0, 1].
    pub magnitude: f32,
    /// Weight in score points.
    pub weight: f32,
}

impl SignalReport {
    fn points(&self) -> f32 {
        self.magnitude * self.weight
    }
}

/// Decision derived from the score and the configured floors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskDecision {
    /// Proceed without a challenge.
    Allow,
    /// Require a step-up challenge.
    StepUp,
    /// Deny and emit a security event.
    Deny,
}

/// Score, explanation bag, and decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    /// Final score, clipped to [0, 100].
    pub score: u8,
    /// Per-signal contributions.
    pub signals: Vec<SignalReport>,
    /// Decision against the configured floors.
    pub decision: RiskDecision,
}

/// The weighted-sum engine.
#[derive(Debug, Clone)]
pub struct RiskEngine {
    config: RiskConfig,
}

impl RiskEngine {
    /// Create an engine with the given weights.
    #[must_use]
    pub const fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Assess one authentication attempt.
    #[must_use]
    pub fn assess(&self, context: &RiskContext, thresholds: RiskThresholds) -> RiskAssessment {
        let signals: Vec<SignalReport> = [
            self.device_signal(context),
            self.fingerprint_signal(context),
            self.location_signal(context),
            self.velocity_signal(context),
            self.account_age_signal(context),
            self.hours_signal(context),
            self.denylist_signal(context),
        ]
        .into_iter()
        .flatten()
        .collect();

        let raw: f32 = signals.iter().map(SignalReport::points).sum();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let score = raw.clamp(0.0, 100.0).round() as u8;

        let decision = if score >= thresholds.deny_floor {
            RiskDecision::Deny
        } else if score >= thresholds.challenge_floor {
            RiskDecision::StepUp
        } else {
            RiskDecision::Allow
        };

        RiskAssessment { score, signals, decision }
    }

    fn device_signal(&self, context: &RiskContext) -> Option<SignalReport> {
        let magnitude = match &context.device {
            None => 1.0,
            Some(device) => match device.trust_level {
                DeviceTrustLevel::Unknown => 0.7,
                DeviceTrustLevel::Seen => 0.3,
                DeviceTrustLevel::Trusted => 0.0,
            },
        };
        Some(SignalReport {
            name: "unknown-device",
            magnitude,
            weight: self.config.unknown_device,
        })
    }

    fn fingerprint_signal(&self, context: &RiskContext) -> Option<SignalReport> {
        let device = context.device.as_ref()?;
        let magnitude = if device.fingerprint_hash == context.fingerprint_hash {
            0.0
        } else {
            1.0
        };
        Some(SignalReport {
            name: "fingerprint-drift",
            magnitude,
            weight: self.config.fingerprint_drift,
        })
    }

    fn location_signal(&self, context: &RiskContext) -> Option<SignalReport> {
        let magnitude = match &context.location {
            // No estimate (cache degraded or geo unavailable): conservative.
            None => 0.5,
            Some(location) => {
                if context.prior_locations.iter().any(|prior| prior == location) {
                    0.0
                } else {
                    1.0
                }
            }
        };
        Some(SignalReport {
            name: "new-location",
            magnitude,
            weight: self.config.new_location,
        })
    }

    fn velocity_signal(&self, context: &RiskContext) -> Option<SignalReport> {
        #[allow(clippy::cast_precision_loss)]
        let magnitude = (context.recent_failures as f32 / 10.0).min(1.0);
        Some(SignalReport {
            name: "failure-velocity",
            magnitude,
            weight: self.config.failure_velocity,
        })
    }

    fn account_age_signal(&self, context: &RiskContext) -> Option<SignalReport> {
        let age = context.now - context.account_created_at;
        let magnitude = if age < Duration::days(1) {
            1.0
        } else if age < Duration::days(7) {
            0.5
        } else {
            0.0
        };
        Some(SignalReport {
            name: "young-account",
            magnitude,
            weight: self.config.young_account,
        })
    }

    fn hours_signal(&self, context: &RiskContext) -> Option<SignalReport> {
        let hour = context.now.hour();
        let magnitude = if (1..5).contains(&hour) { 1.0 } else { 0.0 };
        Some(SignalReport {
            name: "odd-hours",
            magnitude,
            weight: self.config.odd_hours,
        })
    }

    fn denylist_signal(&self, context: &RiskContext) -> Option<SignalReport> {
        let magnitude = if self.config.ip_denylist.contains(&context.ip) {
            1.0
        } else {
            0.0
        };
        Some(SignalReport {
            name: "denylisted-ip",
            magnitude,
            weight: self.config.denylisted_ip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DeviceId, UserId};

    fn trusted_device(fingerprint_hash: &str) -> Device {
        Device {
            device_id: DeviceId::new(),
            user_id: UserId::new(),
            fingerprint_hash: fingerprint_hash.to_string(),
            first_seen: Utc::now() - Duration::days(30),
            last_seen: Utc::now(),
            trust_level: DeviceTrustLevel::Trusted,
            aggregate_risk: 5.0,
        }
    }

    fn daytime(base: DateTime<Utc>) -> DateTime<Utc> {
        base.date_naive()
            .and_hms_opt(14, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(base)
    }

    fn quiet_context() -> RiskContext {
        let now = daytime(Utc::now());
        RiskContext {
            account_created_at: now - Duration::days(400),
            device: Some(trusted_device("fp-hash")),
            fingerprint_hash: "fp-hash".into(),
            ip: "10.0.0.1".parse().unwrap(),
            location: Some("DE".into()),
            prior_locations: vec!["DE".into(), "FR".into()],
            recent_failures: 0,
            now,
        }
    }

    #[test]
    fn trusted_device_known_location_scores_low() {
        let engine = RiskEngine::new(RiskConfig::default());
        let assessment = engine.assess(&quiet_context(), RiskThresholds::default());
        assert!(assessment.score < 40, "score was {}", assessment.score);
        assert_eq!(assessment.decision, RiskDecision::Allow);
    }

    #[test]
    fn unknown_device_new_location_requires_step_up() {
        let engine = RiskEngine::new(RiskConfig::default());
        let context = RiskContext {
            device: None,
            location: Some("BR".into()),
            ..quiet_context()
        };
        let assessment = engine.assess(&context, RiskThresholds::default());
        assert_eq!(assessment.decision, RiskDecision::StepUp);
    }

    #[test]
    fn denylisted_ip_is_denied() {
        let config = RiskConfig {
            ip_denylist: vec!["203.0.113.7".parse().unwrap()],
            ..RiskConfig::default()
        };
        let engine = RiskEngine::new(config);
        let context = RiskContext {
            ip: "203.0.113.7".parse().unwrap(),
            ..quiet_context()
        };
        let assessment = engine.assess(&context, RiskThresholds::default());
        assert_eq!(assessment.decision, RiskDecision::Deny);
        assert_eq!(assessment.score, 100);
    }

    #[test]
    fn missing_location_degrades_conservatively() {
        let engine = RiskEngine::new(RiskConfig::default());
        let degraded = RiskContext {
            location: None,
            ..quiet_context()
        };
        let clean = engine.assess(&quiet_context(), RiskThresholds::default());
        let assessment = engine.assess(&degraded, RiskThresholds::default());
        assert!(assessment.score > clean.score);
    }

    #[test]
    fn assessment_is_idempotent() {
        let engine = RiskEngine::new(RiskConfig::default());
        let context = quiet_context();
        let first = engine.assess(&context, RiskThresholds::default());
        let second = engine.assess(&context, RiskThresholds::default());
        assert_eq!(first, second);
    }

    #[test]
    fn explanation_bag_names_every_contributor() {
        let engine = RiskEngine::new(RiskConfig::default());
        let assessment = engine.assess(&quiet_context(), RiskThresholds::default());
        let names: Vec<_> = assessment.signals.iter().map(|s| s.name).collect();
        assert!(names.contains(&"unknown-device"));
        assert!(names.contains(&"new-location"));
        assert!(names.contains(&"failure-velocity"));
    }
}
