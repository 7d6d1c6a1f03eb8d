//! The incident: the unit of work tracked from detection to resolution

use crate::ai::Diagnosis;
use crate::events::{Anomaly, AnomalyKey, Timestamp};
use crate::remediation::{ActionOutcome, Decision, RemediationAction, Verification};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Outcome recorded when an anomaly clears before diagnosis starts
pub const SELF_RESOLVED: &str = "self-resolved";

/// Outcome recorded for incidents aborted by agent shutdown
pub const SHUTDOWN: &str = "shutdown";

/// Lifecycle state of an incident
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentState {
    Open,
    Diagnosing,
    Decided,
    Acting,
    Suppressed,
    Resolved,
    Failed,
}

impl IncidentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, IncidentState::Resolved | IncidentState::Failed)
    }

    /// Whether the regular lifecycle allows moving from `self` to `next`
    ///
    /// Aborts (watchdog, shutdown) bypass this table and may fail any
    /// non-terminal incident.
    pub fn can_advance_to(self, next: IncidentState) -> bool {
        use IncidentState::*;
        matches!(
            (self, next),
            (Open, Diagnosing)
                | (Open, Resolved)
                | (Diagnosing, Decided)
                | (Diagnosing, Failed)
                | (Decided, Acting)
                | (Decided, Suppressed)
                | (Suppressed, Resolved)
                | (Acting, Resolved)
                | (Acting, Failed)
        )
    }
}

impl fmt::Display for IncidentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IncidentState::Open => "OPEN",
            IncidentState::Diagnosing => "DIAGNOSING",
            IncidentState::Decided => "DECIDED",
            IncidentState::Acting => "ACTING",
            IncidentState::Suppressed => "SUPPRESSED",
            IncidentState::Resolved => "RESOLVED",
            IncidentState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// One recorded state change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateChange {
    pub from: IncidentState,
    pub to: IncidentState,
    pub at: Timestamp,
}

/// The tracked lifecycle object for one anomaly occurrence
///
/// Once terminal, an incident is an immutable history record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incident {
    pub id: Uuid,
    pub anomaly_key: AnomalyKey,
    /// Latest snapshot of the anomaly that opened this incident
    pub anomaly: Anomaly,
    pub state: IncidentState,
    pub opened_at: Timestamp,
    pub closed_at: Option<Timestamp>,
    pub diagnosis: Option<Diagnosis>,
    pub decision: Option<Decision>,
    pub action_taken: Option<RemediationAction>,
    pub action_outcome: Option<ActionOutcome>,
    /// Fresh reading taken after a successful action
    #[serde(default)]
    pub verification: Option<Verification>,
    /// Short human-readable outcome once terminal
    pub outcome: Option<String>,
    /// Every state change in order
    pub transitions: Vec<StateChange>,
}

impl Incident {
    /// Open a new incident for an anomaly
    pub fn open(anomaly: Anomaly, now: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            anomaly_key: anomaly.key.clone(),
            anomaly,
            state: IncidentState::Open,
            opened_at: now,
            closed_at: None,
            diagnosis: None,
            decision: None,
            action_taken: None,
            action_outcome: None,
            verification: None,
            outcome: None,
            transitions: Vec::new(),
        }
    }

    /// Record a state change; sets `closed_at` when the new state is terminal
    ///
    /// `at` is clamped so recorded changes never go back in time, even when
    /// racing callers read the clock before taking the registry lock.
    pub(crate) fn enter(&mut self, next: IncidentState, at: Timestamp) {
        let previous = self
            .transitions
            .last()
            .map(|change| change.at)
            .unwrap_or(self.opened_at);
        let at = at.max(previous);
        self.transitions.push(StateChange {
            from: self.state,
            to: next,
            at,
        });
        self.state = next;
        if next.is_terminal() {
            self.closed_at = Some(at);
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether this incident passed through SUPPRESSED
    pub fn was_suppressed(&self) -> bool {
        self.transitions
            .iter()
            .any(|change| change.to == IncidentState::Suppressed)
    }

    /// Whether an action was executed and failed
    pub fn action_failed(&self) -> bool {
        self.action_outcome
            .as_ref()
            .map(|outcome| !outcome.success)
            .unwrap_or(false)
    }

    /// The action this incident spent without clearing its anomaly
    ///
    /// Any FAILED incident that reached ACTING counts, including ones the
    /// watchdog or shutdown aborted mid-action, since the effector may
    /// already have run. So does a successful action whose verification
    /// found the anomaly still present.
    pub fn unsuccessful_action(&self) -> Option<&RemediationAction> {
        let action = self.action_taken.as_ref()?;
        let persisted = self
            .verification
            .as_ref()
            .map(Verification::persists)
            .unwrap_or(false);
        if self.state == IncidentState::Failed || persisted {
            Some(action)
        } else {
            None
        }
    }

    /// Confidence of the attached diagnosis, if any
    pub fn confidence(&self) -> Option<f64> {
        self.diagnosis.as_ref().map(|d| d.confidence)
    }
}
