//! Decides whether a diagnosed incident may be remediated
//!
//! The policy is a pure function of the incident's diagnosis, the incident
//! history for its key, the configuration and the current time. It never
//! performs I/O; the orchestrator fetches the history beforehand.

use crate::config::PolicyConfig;
use crate::events::Timestamp;
use crate::incidents::Incident;
use crate::remediation::{ActionKind, RemediationAction};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the policy approved or withheld an action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum PolicyVerdict {
    Approved,
    AutoRemediationDisabled,
    LowConfidence { confidence: f64, threshold: f64 },
    NoActionSuggested,
    RetryBudgetExhausted { failures: u32 },
    NotAllowListed { kind: ActionKind },
    /// Incident history could not be read, so the retry budget is unknown
    HistoryUnavailable,
}

impl PolicyVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, PolicyVerdict::Approved)
    }

    /// Withheld verdicts the operator should hear about
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            PolicyVerdict::LowConfidence { .. } | PolicyVerdict::HistoryUnavailable
        )
    }

    /// Short snake_case name used in outcomes
    pub fn name(&self) -> &'static str {
        match self {
            PolicyVerdict::Approved => "approved",
            PolicyVerdict::AutoRemediationDisabled => "auto_remediation_disabled",
            PolicyVerdict::LowConfidence { .. } => "low_confidence",
            PolicyVerdict::NoActionSuggested => "no_action_suggested",
            PolicyVerdict::RetryBudgetExhausted { .. } => "retry_budget_exhausted",
            PolicyVerdict::NotAllowListed { .. } => "not_allow_listed",
            PolicyVerdict::HistoryUnavailable => "history_unavailable",
        }
    }
}

impl fmt::Display for PolicyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyVerdict::LowConfidence {
                confidence,
                threshold,
            } => write!(f, "low_confidence ({:.2} < {:.2})", confidence, threshold),
            PolicyVerdict::RetryBudgetExhausted { failures } => {
                write!(f, "retry_budget_exhausted ({} prior failures)", failures)
            }
            PolicyVerdict::NotAllowListed { kind } => {
                write!(f, "not_allow_listed ({:?})", kind)
            }
            other => f.write_str(other.name()),
        }
    }
}

/// The action chosen for an incident and the reason for it
///
/// `action` is `NoAction` for every verdict except `Approved`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub action: RemediationAction,
    pub verdict: PolicyVerdict,
}

impl Decision {
    pub fn approve(action: RemediationAction) -> Self {
        Self {
            action,
            verdict: PolicyVerdict::Approved,
        }
    }

    pub fn suppress(verdict: PolicyVerdict) -> Self {
        Self {
            action: RemediationAction::NoAction,
            verdict,
        }
    }

    /// Whether an effector call follows this decision
    pub fn acts(&self) -> bool {
        self.verdict.is_approved() && !self.action.is_no_action()
    }
}

pub struct RemediationPolicy {
    config: PolicyConfig,
}

impl RemediationPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Decide what to do about a diagnosed incident
    ///
    /// Rules are checked in order and the first match wins:
    /// disabled, low confidence, nothing suggested, retry budget,
    /// allow-list, then approval. An incident without a diagnosis is
    /// treated as confidence 0.
    pub fn decide(&self, incident: &Incident, history: &[Incident], now: Timestamp) -> Decision {
        let decision = self.evaluate(incident, history, now);
        if decision.acts() {
            info!(
                "Incident {}: approved {}",
                incident.id, decision.action
            );
        } else {
            info!(
                "Incident {}: no action ({})",
                incident.id, decision.verdict
            );
        }
        decision
    }

    fn evaluate(&self, incident: &Incident, history: &[Incident], now: Timestamp) -> Decision {
        if !self.config.auto_remediation {
            return Decision::suppress(PolicyVerdict::AutoRemediationDisabled);
        }

        let confidence = incident.confidence().unwrap_or(0.0);
        if confidence < self.config.minimum_confidence {
            return Decision::suppress(PolicyVerdict::LowConfidence {
                confidence,
                threshold: self.config.minimum_confidence,
            });
        }

        let action = match incident
            .diagnosis
            .as_ref()
            .and_then(|d| d.suggested_action.as_ref())
        {
            Some(action) if !action.is_no_action() => action.clone(),
            _ => return Decision::suppress(PolicyVerdict::NoActionSuggested),
        };

        let failures = self.prior_failures(incident, &action, history, now);
        if failures >= self.config.max_retry_count {
            return Decision::suppress(PolicyVerdict::RetryBudgetExhausted { failures });
        }

        let kind = action.kind();
        if !self.config.allow_list.contains(&kind) {
            return Decision::suppress(PolicyVerdict::NotAllowListed { kind });
        }

        Decision::approve(action)
    }

    /// Unsuccessful attempts of exactly `action` on this incident's key
    /// inside the lookback window, including attempts aborted mid-action
    fn prior_failures(
        &self,
        incident: &Incident,
        action: &RemediationAction,
        history: &[Incident],
        now: Timestamp,
    ) -> u32 {
        let since = now - self.config.lookback();
        let count = history
            .iter()
            .filter(|past| past.id != incident.id)
            .filter(|past| past.anomaly_key == incident.anomaly_key)
            .filter(|past| past.closed_at.unwrap_or(past.opened_at) >= since)
            .filter(|past| past.unsuccessful_action() == Some(action))
            .count();

        debug!(
            "Incident {}: {} prior failures of {} within {}s",
            incident.id,
            count,
            action,
            self.config.lookback_seconds
        );
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}
