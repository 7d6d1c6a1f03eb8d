use crate::error::LedgerError;
use crate::events::{AnomalyKey, Timestamp};
use crate::incidents::Incident;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LedgerError>> + Send + 'a>>;

/// Filter for history queries; `None` fields match everything
///
/// `since` and `until` apply to the time the incident closed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerQuery {
    pub anomaly_key: Option<AnomalyKey>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
}

impl LedgerQuery {
    pub fn for_key(key: &AnomalyKey) -> Self {
        Self {
            anomaly_key: Some(key.clone()),
            ..Self::default()
        }
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    pub fn matches(&self, incident: &Incident) -> bool {
        let at = incident.closed_at.unwrap_or(incident.opened_at);
        self.anomaly_key
            .as_ref()
            .map(|key| &incident.anomaly_key == key)
            .unwrap_or(true)
            && self.since.map(|since| at >= since).unwrap_or(true)
            && self.until.map(|until| at <= until).unwrap_or(true)
    }
}

/// Durable append-only record of terminal incidents
pub trait IncidentStore: Send + Sync {
    fn append<'a>(&'a self, incident: &'a Incident) -> StoreFuture<'a, ()>;
    fn query<'a>(&'a self, filter: &'a LedgerQuery) -> StoreFuture<'a, Vec<Incident>>;
}

/// In-memory store with failure injection
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<Incident>>,
    failing_appends: AtomicU32,
    failing_queries: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends fail
    pub fn fail_next_appends(&self, count: u32) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    pub fn set_queries_failing(&self, failing: bool) {
        self.failing_queries.store(failing, Ordering::SeqCst);
    }

    /// Every record appended so far, in append order
    pub fn records(&self) -> Vec<Incident> {
        lock(&self.records).clone()
    }

    /// Seed history without going through `append`
    pub fn insert(&self, incident: Incident) {
        lock(&self.records).push(incident);
    }
}

impl IncidentStore for MemoryStore {
    fn append<'a>(&'a self, incident: &'a Incident) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let injected = self
                .failing_appends
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(LedgerError::WriteFailed("injected failure".to_string()));
            }
            lock(&self.records).push(incident.clone());
            Ok(())
        })
    }

    fn query<'a>(&'a self, filter: &'a LedgerQuery) -> StoreFuture<'a, Vec<Incident>> {
        Box::pin(async move {
            if self.failing_queries.load(Ordering::SeqCst) {
                return Err(LedgerError::QueryFailed("injected failure".to_string()));
            }
            Ok(lock(&self.records)
                .iter()
                .filter(|incident| filter.matches(incident))
                .cloned()
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Anomaly, Severity};
    use crate::incidents::IncidentState;
    use chrono::{Duration, Utc};

    fn closed_incident(metric: &str, closed_at: Timestamp) -> Incident {
        let mut incident = Incident::open(
            Anomaly {
                key: AnomalyKey::new(metric, "rule"),
                metric_name: metric.to_string(),
                observed_value: 1.0,
                rule_violated: "rule".to_string(),
                severity: Severity::Warning,
                first_observed_at: closed_at,
                last_observed_at: closed_at,
            },
            closed_at,
        );
        incident.enter(IncidentState::Resolved, closed_at);
        incident
    }

    #[test]
    fn test_query_filters() {
        let now = Utc::now();
        let old = closed_incident("cpu_usage", now - Duration::hours(2));
        let recent = closed_incident("cpu_usage", now - Duration::minutes(5));
        let other = closed_incident("memory_usage", now);

        let key = AnomalyKey::new("cpu_usage", "rule");
        let query = LedgerQuery::for_key(&key).since(now - Duration::hours(1));
        assert!(!query.matches(&old));
        assert!(query.matches(&recent));
        assert!(!query.matches(&other));

        let until = LedgerQuery::default().until(now - Duration::hours(1));
        assert!(until.matches(&old));
        assert!(!until.matches(&recent));
        assert!(LedgerQuery::default().matches(&other));
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryStore::new();
        let incident = closed_incident("cpu_usage", Utc::now());

        store.fail_next_appends(2);
        assert!(store.append(&incident).await.is_err());
        assert!(store.append(&incident).await.is_err());
        assert!(store.append(&incident).await.is_ok());
        assert_eq!(store.records().len(), 1);

        store.set_queries_failing(true);
        assert!(matches!(
            store.query(&LedgerQuery::default()).await,
            Err(LedgerError::QueryFailed(_))
        ));
        store.set_queries_failing(false);
        assert_eq!(store.query(&LedgerQuery::default()).await.unwrap().len(), 1);
    }
}
