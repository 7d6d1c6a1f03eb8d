/// Durable incident history
pub mod jsonl;
pub mod store;

pub use jsonl::JsonlStore;
pub use store::{IncidentStore, LedgerQuery, MemoryStore};

use crate::error::LedgerError;
use crate::incidents::Incident;
use crate::retry::{retry, RetryPolicy};
use log::{debug, error};
use std::sync::Arc;

/// Append-only incident ledger with bounded write retries
///
/// Only terminal incidents are written, each exactly once.
pub struct IncidentLedger {
    store: Arc<dyn IncidentStore>,
    retry: RetryPolicy,
}

impl IncidentLedger {
    pub fn new(store: Arc<dyn IncidentStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Persist a terminal incident, retrying with backoff
    ///
    /// # Errors
    ///
    /// `WriteFailed` if the incident is not terminal, and
    /// `RetriesExhausted` once every attempt failed. Exhaustion means
    /// history is being lost and the agent must stop.
    pub async fn append(&self, incident: &Incident) -> Result<(), LedgerError> {
        if !incident.is_terminal() {
            return Err(LedgerError::WriteFailed(format!(
                "incident {} is still {}",
                incident.id, incident.state
            )));
        }

        let label = format!("ledger append of incident {}", incident.id);
        match retry(&self.retry, &label, |_| self.store.append(incident)).await {
            Ok(()) => {
                debug!(
                    "Incident {} persisted as {} ({})",
                    incident.id,
                    incident.state,
                    incident.outcome.as_deref().unwrap_or("-")
                );
                Ok(())
            }
            Err(exhausted) => {
                error!(
                    "Giving up on persisting incident {}: {}",
                    incident.id, exhausted.last_error
                );
                Err(LedgerError::RetriesExhausted {
                    attempts: exhausted.attempts,
                    reason: exhausted.last_error.to_string(),
                })
            }
        }
    }

    pub async fn query(&self, filter: &LedgerQuery) -> Result<Vec<Incident>, LedgerError> {
        self.store.query(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Anomaly, AnomalyKey, Severity};
    use crate::incidents::IncidentState;
    use chrono::Utc;
    use std::time::Duration;

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            deadline: None,
        }
    }

    fn incident() -> Incident {
        let now = Utc::now();
        Incident::open(
            Anomaly {
                key: AnomalyKey::new("disk_usage", "disk_usage > 90"),
                metric_name: "disk_usage".to_string(),
                observed_value: 93.0,
                rule_violated: "disk_usage > 90".to_string(),
                severity: Severity::Warning,
                first_observed_at: now,
                last_observed_at: now,
            },
            now,
        )
    }

    #[tokio::test]
    async fn test_append_retries_transient_failures() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_appends(2);
        let ledger = IncidentLedger::new(store.clone(), quick_retry(3));

        let mut incident = incident();
        incident.enter(IncidentState::Resolved, Utc::now());
        ledger.append(&incident).await.unwrap();

        assert_eq!(store.records(), vec![incident]);
    }

    #[tokio::test]
    async fn test_append_exhaustion() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_appends(10);
        let ledger = IncidentLedger::new(store.clone(), quick_retry(3));

        let mut incident = incident();
        incident.enter(IncidentState::Resolved, Utc::now());
        let result = ledger.append(&incident).await;

        assert!(matches!(
            result,
            Err(LedgerError::RetriesExhausted { attempts: 3, .. })
        ));
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_refuses_live_incident() {
        let store = Arc::new(MemoryStore::new());
        let ledger = IncidentLedger::new(store.clone(), quick_retry(3));

        let result = ledger.append(&incident()).await;
        assert!(matches!(result, Err(LedgerError::WriteFailed(_))));
        assert!(store.records().is_empty());
    }
}
