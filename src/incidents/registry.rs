use crate::events::{AnomalyKey, AnomalyTransition, Timestamp};
use crate::incidents::{Incident, IncidentState, SELF_RESOLVED};
use chrono::Duration;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

/// Rejected lifecycle step
///
/// Returned when the incident a caller wants to advance is gone or is no
/// longer in the state the caller expected. Callers must stop working on
/// the incident: another party (watchdog, shutdown, self-resolution) owns it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("incident {id} not found for {key}")]
    NotFound { key: AnomalyKey, id: Uuid },

    #[error("stale transition for incident {id}: expected {expected}, found {actual}")]
    Stale {
        id: Uuid,
        expected: IncidentState,
        actual: IncidentState,
    },

    #[error("transition {from} -> {to} is not allowed")]
    NotAllowed {
        from: IncidentState,
        to: IncidentState,
    },
}

/// What the registry did with one detector transition
#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    /// A fresh incident was created in OPEN
    Opened(Incident),
    /// An existing non-terminal incident got a new anomaly snapshot
    Refreshed,
    /// An OPEN incident was resolved because its anomaly cleared
    SelfResolved(Incident),
    /// Nothing changed
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The key is cooling down after a previous incident closed
    CoolingDown,
    /// The previous incident for this key is terminal but not yet persisted
    Closing,
    /// Cleared while past OPEN, or cleared with no incident
    NoEffect,
}

#[derive(Debug, Default)]
struct RegistryState {
    incidents: HashMap<AnomalyKey, Incident>,
    cooldowns: HashMap<AnomalyKey, Timestamp>,
}

/// Arena of live incidents indexed by anomaly key
///
/// This is the per-key exclusion point: every state change goes through a
/// compare-and-set on `(key, incident id, expected state)` under one mutex,
/// so at most one non-terminal incident exists per key and no late result
/// can advance an incident that has already moved on. The lock is never
/// held across an await.
///
/// A terminal incident stays in the arena until [`release`](Self::release)
/// is called after it has been persisted, which keeps ledger order within a
/// key equal to lifecycle order.
#[derive(Debug)]
pub struct IncidentRegistry {
    state: Mutex<RegistryState>,
    reopen_cooldown: Duration,
}

impl IncidentRegistry {
    /// Create a registry
    ///
    /// # Arguments
    ///
    /// * `reopen_cooldown` - How long a key stays closed for new incidents
    ///   after an incident ends other than by self-resolution
    pub fn new(reopen_cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            reopen_cooldown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // A panic while holding the lock cannot leave a half-applied
        // transition behind, so the poisoned state is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a detector transition
    pub fn on_transition(&self, transition: &AnomalyTransition, now: Timestamp) -> DedupOutcome {
        let mut state = self.lock();
        let key = transition.key().clone();

        match transition {
            AnomalyTransition::Opened(anomaly) | AnomalyTransition::Updated(anomaly) => {
                if let Some(existing) = state.incidents.get_mut(&key) {
                    if existing.is_terminal() {
                        debug!("Incident {} for {} is closing, ignoring transition", existing.id, key);
                        return DedupOutcome::Ignored(IgnoreReason::Closing);
                    }
                    existing.anomaly = anomaly.clone();
                    return DedupOutcome::Refreshed;
                }

                if let Some(until) = state.cooldowns.get(&key).copied() {
                    if now < until {
                        debug!("Key {} cooling down until {}", key, until);
                        return DedupOutcome::Ignored(IgnoreReason::CoolingDown);
                    }
                    state.cooldowns.remove(&key);
                }

                let incident = Incident::open(anomaly.clone(), now);
                info!("Opened incident {} for {}", incident.id, key);
                state.incidents.insert(key, incident.clone());
                DedupOutcome::Opened(incident)
            }
            AnomalyTransition::Cleared(anomaly) => match state.incidents.get_mut(&key) {
                Some(existing) if existing.state == IncidentState::Open => {
                    existing.anomaly = anomaly.clone();
                    existing.outcome = Some(SELF_RESOLVED.to_string());
                    existing.enter(IncidentState::Resolved, now);
                    info!("Incident {} for {} self-resolved", existing.id, key);
                    DedupOutcome::SelfResolved(existing.clone())
                }
                Some(existing) => {
                    debug!(
                        "Anomaly {} cleared while incident {} is {}, continuing",
                        key, existing.id, existing.state
                    );
                    DedupOutcome::Ignored(IgnoreReason::NoEffect)
                }
                None => DedupOutcome::Ignored(IgnoreReason::NoEffect),
            },
        }
    }

    /// Compare-and-set state change
    ///
    /// Moves the incident `id` under `key` from `expected` to `next` and
    /// applies `update` to it in the same critical section. Returns a
    /// snapshot of the updated incident.
    pub fn advance<F>(
        &self,
        key: &AnomalyKey,
        id: Uuid,
        expected: IncidentState,
        next: IncidentState,
        now: Timestamp,
        update: F,
    ) -> Result<Incident, LifecycleError>
    where
        F: FnOnce(&mut Incident),
    {
        if !expected.can_advance_to(next) {
            return Err(LifecycleError::NotAllowed {
                from: expected,
                to: next,
            });
        }

        let mut state = self.lock();
        let incident = Self::find(&mut state, key, id)?;

        if incident.state != expected {
            return Err(LifecycleError::Stale {
                id,
                expected,
                actual: incident.state,
            });
        }

        update(incident);
        incident.enter(next, now);
        let snapshot = incident.clone();

        if next.is_terminal() {
            self.start_cooldown(&mut state, &snapshot, now);
        }

        Ok(snapshot)
    }

    /// Update a non-terminal incident without changing its state
    pub fn update<F>(
        &self,
        key: &AnomalyKey,
        id: Uuid,
        expected: IncidentState,
        update: F,
    ) -> Result<Incident, LifecycleError>
    where
        F: FnOnce(&mut Incident),
    {
        let mut state = self.lock();
        let incident = Self::find(&mut state, key, id)?;

        if incident.state != expected {
            return Err(LifecycleError::Stale {
                id,
                expected,
                actual: incident.state,
            });
        }

        update(incident);
        Ok(incident.clone())
    }

    /// Fail a non-terminal incident from whatever state it is in
    ///
    /// Used by the lifecycle watchdog and by shutdown. Fails with `Stale`
    /// when the incident already reached a terminal state.
    pub fn abort(
        &self,
        key: &AnomalyKey,
        id: Uuid,
        reason: &str,
        now: Timestamp,
    ) -> Result<Incident, LifecycleError> {
        let mut state = self.lock();
        let incident = Self::find(&mut state, key, id)?;

        if incident.is_terminal() {
            return Err(LifecycleError::Stale {
                id,
                expected: incident.state,
                actual: incident.state,
            });
        }

        warn!(
            "Aborting incident {} for {} in state {}: {}",
            id, key, incident.state, reason
        );
        incident.outcome = Some(reason.to_string());
        incident.enter(IncidentState::Failed, now);
        let snapshot = incident.clone();
        self.start_cooldown(&mut state, &snapshot, now);
        Ok(snapshot)
    }

    /// Drop a persisted terminal incident from the arena
    ///
    /// Returns `false` if the incident is not present or still live.
    pub fn release(&self, key: &AnomalyKey, id: Uuid) -> bool {
        let mut state = self.lock();
        match state.incidents.get(key) {
            Some(incident) if incident.id == id && incident.is_terminal() => {
                state.incidents.remove(key);
                debug!("Released incident {} for {}", id, key);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of the incident currently held for a key
    pub fn get(&self, key: &AnomalyKey) -> Option<Incident> {
        self.lock().incidents.get(key).cloned()
    }

    /// Snapshot of every incident held in the arena
    pub fn snapshot(&self) -> Vec<Incident> {
        self.lock().incidents.values().cloned().collect()
    }

    /// Number of non-terminal incidents
    pub fn active_count(&self) -> usize {
        self.lock()
            .incidents
            .values()
            .filter(|incident| !incident.is_terminal())
            .count()
    }

    fn find<'a>(
        state: &'a mut RegistryState,
        key: &AnomalyKey,
        id: Uuid,
    ) -> Result<&'a mut Incident, LifecycleError> {
        match state.incidents.get_mut(key) {
            Some(incident) if incident.id == id => Ok(incident),
            _ => Err(LifecycleError::NotFound {
                key: key.clone(),
                id,
            }),
        }
    }

    fn start_cooldown(&self, state: &mut RegistryState, incident: &Incident, now: Timestamp) {
        if incident.outcome.as_deref() == Some(SELF_RESOLVED) {
            return;
        }
        let until = now + self.reopen_cooldown;
        debug!("Key {} cooling down until {}", incident.anomaly_key, until);
        state.cooldowns.insert(incident.anomaly_key.clone(), until);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Anomaly, Severity};
    use chrono::Utc;

    fn anomaly(metric: &str, value: f64) -> Anomaly {
        let now = Utc::now();
        Anomaly {
            key: AnomalyKey::new(metric, format!("{} > 80", metric)),
            metric_name: metric.to_string(),
            observed_value: value,
            rule_violated: format!("{} > 80", metric),
            severity: Severity::Warning,
            first_observed_at: now,
            last_observed_at: now,
        }
    }

    fn registry() -> IncidentRegistry {
        IncidentRegistry::new(Duration::minutes(15))
    }

    fn open(registry: &IncidentRegistry, metric: &str) -> Incident {
        match registry.on_transition(&AnomalyTransition::Opened(anomaly(metric, 90.0)), Utc::now()) {
            DedupOutcome::Opened(incident) => incident,
            other => panic!("expected opened incident, got {:?}", other),
        }
    }

    #[test]
    fn test_opened_creates_single_incident() {
        let registry = registry();
        let incident = open(&registry, "cpu_usage");
        assert_eq!(incident.state, IncidentState::Open);

        let again = registry.on_transition(
            &AnomalyTransition::Opened(anomaly("cpu_usage", 95.0)),
            Utc::now(),
        );
        assert_eq!(again, DedupOutcome::Refreshed);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(
            registry.get(&incident.anomaly_key).unwrap().anomaly.observed_value,
            95.0
        );
    }

    #[test]
    fn test_updated_refreshes_without_state_change() {
        let registry = registry();
        let incident = open(&registry, "cpu_usage");
        registry
            .advance(
                &incident.anomaly_key,
                incident.id,
                IncidentState::Open,
                IncidentState::Diagnosing,
                Utc::now(),
                |_| {},
            )
            .unwrap();

        let outcome = registry.on_transition(
            &AnomalyTransition::Updated(anomaly("cpu_usage", 99.0)),
            Utc::now(),
        );
        assert_eq!(outcome, DedupOutcome::Refreshed);

        let current = registry.get(&incident.anomaly_key).unwrap();
        assert_eq!(current.state, IncidentState::Diagnosing);
        assert_eq!(current.anomaly.observed_value, 99.0);
    }

    #[test]
    fn test_cleared_while_open_self_resolves() {
        let registry = registry();
        let incident = open(&registry, "cpu_usage");

        let outcome = registry.on_transition(
            &AnomalyTransition::Cleared(anomaly("cpu_usage", 40.0)),
            Utc::now(),
        );
        match outcome {
            DedupOutcome::SelfResolved(resolved) => {
                assert_eq!(resolved.id, incident.id);
                assert_eq!(resolved.state, IncidentState::Resolved);
                assert_eq!(resolved.outcome.as_deref(), Some(SELF_RESOLVED));
                assert!(resolved.closed_at.is_some());
                assert!(resolved.diagnosis.is_none());
            }
            other => panic!("expected self-resolution, got {:?}", other),
        }
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_cleared_after_diagnosis_started_has_no_effect() {
        let registry = registry();
        let incident = open(&registry, "cpu_usage");
        registry
            .advance(
                &incident.anomaly_key,
                incident.id,
                IncidentState::Open,
                IncidentState::Diagnosing,
                Utc::now(),
                |_| {},
            )
            .unwrap();

        let outcome = registry.on_transition(
            &AnomalyTransition::Cleared(anomaly("cpu_usage", 40.0)),
            Utc::now(),
        );
        assert_eq!(outcome, DedupOutcome::Ignored(IgnoreReason::NoEffect));
        assert_eq!(
            registry.get(&incident.anomaly_key).unwrap().state,
            IncidentState::Diagnosing
        );
    }

    #[test]
    fn test_stale_advance_is_rejected() {
        let registry = registry();
        let incident = open(&registry, "cpu_usage");
        let key = incident.anomaly_key.clone();

        registry.abort(&key, incident.id, "lifecycle deadline exceeded", Utc::now()).unwrap();

        let late = registry.advance(
            &key,
            incident.id,
            IncidentState::Open,
            IncidentState::Diagnosing,
            Utc::now(),
            |_| {},
        );
        assert_eq!(
            late,
            Err(LifecycleError::Stale {
                id: incident.id,
                expected: IncidentState::Open,
                actual: IncidentState::Failed,
            })
        );
    }

    #[test]
    fn test_disallowed_transition_is_rejected() {
        let registry = registry();
        let incident = open(&registry, "cpu_usage");
        let result = registry.advance(
            &incident.anomaly_key,
            incident.id,
            IncidentState::Open,
            IncidentState::Acting,
            Utc::now(),
            |_| {},
        );
        assert!(matches!(result, Err(LifecycleError::NotAllowed { .. })));
    }

    #[test]
    fn test_wrong_id_is_not_found() {
        let registry = registry();
        let incident = open(&registry, "cpu_usage");
        let result = registry.update(&incident.anomaly_key, Uuid::new_v4(), IncidentState::Open, |_| {});
        assert!(matches!(result, Err(LifecycleError::NotFound { .. })));
    }

    #[test]
    fn test_terminal_incident_blocks_key_until_released() {
        let registry = IncidentRegistry::new(Duration::zero());
        let incident = open(&registry, "cpu_usage");
        let key = incident.anomaly_key.clone();
        registry.abort(&key, incident.id, "shutdown", Utc::now()).unwrap();

        let blocked = registry.on_transition(
            &AnomalyTransition::Updated(anomaly("cpu_usage", 91.0)),
            Utc::now(),
        );
        assert_eq!(blocked, DedupOutcome::Ignored(IgnoreReason::Closing));

        assert!(registry.release(&key, incident.id));
        assert!(!registry.release(&key, incident.id));

        let reopened = registry.on_transition(
            &AnomalyTransition::Updated(anomaly("cpu_usage", 91.0)),
            Utc::now(),
        );
        assert!(matches!(reopened, DedupOutcome::Opened(ref i) if i.id != incident.id));
    }

    #[test]
    fn test_release_refuses_live_incident() {
        let registry = registry();
        let incident = open(&registry, "cpu_usage");
        assert!(!registry.release(&incident.anomaly_key, incident.id));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_cooldown_after_failure() {
        let registry = registry();
        let incident = open(&registry, "cpu_usage");
        let key = incident.anomaly_key.clone();
        let closed_at = Utc::now();
        registry.abort(&key, incident.id, "shutdown", closed_at).unwrap();
        registry.release(&key, incident.id);

        let during = registry.on_transition(
            &AnomalyTransition::Opened(anomaly("cpu_usage", 91.0)),
            closed_at + Duration::minutes(5),
        );
        assert_eq!(during, DedupOutcome::Ignored(IgnoreReason::CoolingDown));

        let after = registry.on_transition(
            &AnomalyTransition::Opened(anomaly("cpu_usage", 91.0)),
            closed_at + Duration::minutes(16),
        );
        assert!(matches!(after, DedupOutcome::Opened(_)));
    }

    #[test]
    fn test_self_resolution_has_no_cooldown() {
        let registry = registry();
        let incident = open(&registry, "cpu_usage");
        let key = incident.anomaly_key.clone();
        registry.on_transition(&AnomalyTransition::Cleared(anomaly("cpu_usage", 10.0)), Utc::now());
        registry.release(&key, incident.id);

        let reopened = registry.on_transition(
            &AnomalyTransition::Opened(anomaly("cpu_usage", 91.0)),
            Utc::now(),
        );
        assert!(matches!(reopened, DedupOutcome::Opened(_)));
    }

    #[test]
    fn test_keys_are_independent() {
        let registry = registry();
        open(&registry, "cpu_usage");
        open(&registry, "memory_usage");
        assert_eq!(registry.active_count(), 2);
        assert_eq!(registry.snapshot().len(), 2);
    }
}
