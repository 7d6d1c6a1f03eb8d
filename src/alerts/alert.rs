//! Outbound notification events
//!
//! Every incident state change becomes an [`IncidentTransition`]. Exhausted
//! ledger writes are reported separately because they stop the agent.

use crate::events::{AnomalyKey, Severity, Timestamp};
use crate::incidents::{Incident, IncidentState};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Opened,
    Diagnosed,
    Decided,
    Suppressed,
    Acting,
    Resolved,
    Failed,
}

impl TransitionKind {
    /// The notification kind for entering `state`
    pub fn for_state(state: IncidentState) -> Self {
        match state {
            IncidentState::Open => TransitionKind::Opened,
            IncidentState::Diagnosing => TransitionKind::Diagnosed,
            IncidentState::Decided => TransitionKind::Decided,
            IncidentState::Acting => TransitionKind::Acting,
            IncidentState::Suppressed => TransitionKind::Suppressed,
            IncidentState::Resolved => TransitionKind::Resolved,
            IncidentState::Failed => TransitionKind::Failed,
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransitionKind::Opened => "opened",
            TransitionKind::Diagnosed => "diagnosed",
            TransitionKind::Decided => "decided",
            TransitionKind::Suppressed => "suppressed",
            TransitionKind::Acting => "acting",
            TransitionKind::Resolved => "resolved",
            TransitionKind::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One incident state change, as reported to operators
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncidentTransition {
    pub incident_id: Uuid,
    pub anomaly_key: AnomalyKey,
    pub kind: TransitionKind,
    /// `None` for the opening notification
    pub from: Option<IncidentState>,
    pub to: IncidentState,
    pub at: Timestamp,
    pub detail: String,
    pub severity: Severity,
    pub needs_attention: bool,
}

impl IncidentTransition {
    /// Describe the most recent state change of `incident`
    ///
    /// An incident with no recorded changes yields the `opened` notification.
    pub fn latest(incident: &Incident) -> Self {
        let (from, to, at) = match incident.transitions.last() {
            Some(change) => (Some(change.from), change.to, change.at),
            None => (None, incident.state, incident.opened_at),
        };

        let needs_attention = match to {
            IncidentState::Failed => true,
            IncidentState::Resolved => incident
                .verification
                .as_ref()
                .map(|verification| verification.persists())
                .unwrap_or(false),
            IncidentState::Suppressed => incident
                .decision
                .as_ref()
                .map(|decision| decision.verdict.needs_attention())
                .unwrap_or(false),
            _ => false,
        };

        let severity = if needs_attention {
            Severity::Critical
        } else {
            incident.anomaly.severity
        };

        Self {
            incident_id: incident.id,
            anomaly_key: incident.anomaly_key.clone(),
            kind: TransitionKind::for_state(to),
            from,
            to,
            at,
            detail: describe(incident, to),
            severity,
            needs_attention,
        }
    }
}

fn describe(incident: &Incident, state: IncidentState) -> String {
    match state {
        IncidentState::Open => format!(
            "{} = {:.2} violates {}",
            incident.anomaly.metric_name,
            incident.anomaly.observed_value,
            incident.anomaly.rule_violated
        ),
        IncidentState::Diagnosing => "diagnosis requested".to_string(),
        IncidentState::Decided => match (&incident.diagnosis, &incident.decision) {
            (Some(diagnosis), Some(decision)) => format!(
                "{} (confidence {:.2}); decision: {}",
                diagnosis.root_cause_summary, diagnosis.confidence, decision.verdict
            ),
            (_, Some(decision)) => format!("decision: {}", decision.verdict),
            _ => "decided".to_string(),
        },
        IncidentState::Suppressed => incident
            .decision
            .as_ref()
            .map(|decision| format!("action withheld: {}", decision.verdict))
            .unwrap_or_else(|| "action withheld".to_string()),
        IncidentState::Acting => incident
            .action_taken
            .as_ref()
            .map(|action| format!("executing {}", action))
            .unwrap_or_else(|| "executing".to_string()),
        IncidentState::Resolved | IncidentState::Failed => incident
            .outcome
            .clone()
            .or_else(|| {
                incident
                    .action_outcome
                    .as_ref()
                    .map(|outcome| outcome.detail.clone())
            })
            .unwrap_or_else(|| state.to_string().to_lowercase()),
    }
}

/// Anything the alert manager delivers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Alert {
    Transition(IncidentTransition),
    /// The ledger refused a terminal incident after every retry
    LedgerWriteFailed { incident_id: Uuid, reason: String },
}

impl Alert {
    pub fn severity(&self) -> Severity {
        match self {
            Alert::Transition(transition) => transition.severity,
            Alert::LedgerWriteFailed { .. } => Severity::Critical,
        }
    }

    pub fn needs_attention(&self) -> bool {
        match self {
            Alert::Transition(transition) => transition.needs_attention,
            Alert::LedgerWriteFailed { .. } => true,
        }
    }

    /// One-line summary for logs and notification titles
    pub fn summary(&self) -> String {
        match self {
            Alert::Transition(t) => format!(
                "Incident {} {} on {}: {}",
                short_id(&t.incident_id),
                t.kind,
                t.anomaly_key,
                t.detail
            ),
            Alert::LedgerWriteFailed {
                incident_id,
                reason,
            } => format!(
                "Ledger write failed for incident {}: {}",
                short_id(incident_id),
                reason
            ),
        }
    }
}

impl From<IncidentTransition> for Alert {
    fn from(transition: IncidentTransition) -> Self {
        Alert::Transition(transition)
    }
}

fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}
