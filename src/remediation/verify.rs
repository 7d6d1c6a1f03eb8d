//! Post-action check that a remediation actually cleared its anomaly

use crate::collectors::MetricSource;
use crate::detector::ThresholdRule;
use crate::events::AnomalyKey;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What a fresh reading said after the effector reported success
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verification {
    /// The metric is back within the rule
    Verified { value: f64 },
    /// The metric still violates the rule; needs manual intervention
    Persists { value: f64 },
    /// No usable reading could be obtained
    Unavailable { reason: String },
}

impl Verification {
    pub fn persists(&self) -> bool {
        matches!(self, Verification::Persists { .. })
    }
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verification::Verified { value } => write!(f, "verified at {:.2}", value),
            Verification::Persists { value } => write!(f, "anomaly persists at {:.2}", value),
            Verification::Unavailable { reason } => {
                write!(f, "verification unavailable: {}", reason)
            }
        }
    }
}

/// Waits for the system to settle, pulls once and re-applies the rule
pub struct RemediationVerifier {
    source: Arc<dyn MetricSource>,
    rules: Vec<ThresholdRule>,
    delay: Duration,
    pull_timeout: Duration,
}

impl RemediationVerifier {
    pub fn new(
        source: Arc<dyn MetricSource>,
        rules: Vec<ThresholdRule>,
        delay: Duration,
        pull_timeout: Duration,
    ) -> Self {
        Self {
            source,
            rules,
            delay,
            pull_timeout,
        }
    }

    pub async fn verify(&self, key: &AnomalyKey) -> Verification {
        let Some(rule) = self.rules.iter().find(|rule| &rule.key() == key) else {
            return Verification::Unavailable {
                reason: format!("no rule for {}", key),
            };
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let samples = match tokio::time::timeout(self.pull_timeout, self.source.pull()).await {
            Ok(Ok(samples)) => samples,
            Ok(Err(e)) => {
                warn!("Could not verify {}: {}", key, e);
                return Verification::Unavailable {
                    reason: e.to_string(),
                };
            }
            Err(_) => {
                warn!("Could not verify {}: pull timed out", key);
                return Verification::Unavailable {
                    reason: format!("pull timed out after {:?}", self.pull_timeout),
                };
            }
        };

        let reading = samples
            .iter()
            .rev()
            .find(|sample| sample.metric_name == rule.metric_name && sample.value.is_finite());

        let verification = match reading {
            Some(sample) if rule.is_violated_by(sample.value) => Verification::Persists {
                value: sample.value,
            },
            Some(sample) => Verification::Verified {
                value: sample.value,
            },
            None => Verification::Unavailable {
                reason: format!("no fresh {} reading", rule.metric_name),
            },
        };

        if verification.persists() {
            warn!("Remediation of {} did not help: {}", key, verification);
        } else {
            info!("Remediation check for {}: {}", key, verification);
        }
        verification
    }
}
