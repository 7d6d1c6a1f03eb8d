//! The agent's control loop
//!
//! Samples flow from the sampler task into [`Orchestrator::run`], through the
//! detector and the incident registry. Every opened incident is driven by its
//! own lifecycle task. Every terminal incident is handed to a single ledger
//! writer task, which persists it and only then releases its key, so the
//! registry never opens a new incident for a key whose previous one is not
//! yet on record.

use crate::aggregator::SampleHistory;
use crate::ai::{Diagnoser, IncidentContext, ReasoningProvider};
use crate::alerts::{Alert, AlertManager, AlertSender, IncidentTransition, Notifier};
use crate::collectors::{EvidenceSource, MetricSource, MetricsCollector};
use crate::config::Config;
use crate::detector::AnomalyDetector;
use crate::error::{AgentError, LedgerError};
use crate::events::Sample;
use crate::incidents::{
    DedupOutcome, Incident, IncidentRegistry, IncidentState, LifecycleError, SHUTDOWN,
};
use crate::ledger::{IncidentLedger, IncidentStore, LedgerQuery};
use crate::monitoring::AgentMonitor;
use crate::remediation::{
    Decision, Effector, PolicyVerdict, RemediationExecutor, RemediationPolicy, RemediationVerifier,
};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

/// Outcome recorded when the lifecycle watchdog fires
pub const LIFECYCLE_DEADLINE_EXCEEDED: &str = "lifecycle deadline exceeded";

const SAMPLE_CHANNEL_CAPACITY: usize = 1024;

/// Upper bound on draining the alert queue at shutdown
const ALERT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// The external systems the agent talks to
pub struct Collaborators {
    pub source: Arc<dyn MetricSource>,
    pub provider: Arc<dyn ReasoningProvider>,
    pub effector: Arc<dyn Effector>,
    pub evidence: Arc<dyn EvidenceSource>,
    pub store: Arc<dyn IncidentStore>,
    pub notifiers: Vec<Arc<dyn Notifier>>,
}

enum LedgerCommand {
    Persist(Incident),
    /// Everything queued before this has been sent; finish and stop
    Close,
}

/// Everything a lifecycle task needs, shared between tasks
struct Pipeline {
    registry: Arc<IncidentRegistry>,
    diagnoser: Diagnoser,
    policy: RemediationPolicy,
    executor: RemediationExecutor,
    /// Absent when post-action verification is off
    verifier: Option<RemediationVerifier>,
    evidence: Arc<dyn EvidenceSource>,
    ledger: Arc<IncidentLedger>,
    alerts: AlertSender,
    persist: mpsc::UnboundedSender<LedgerCommand>,
    settle: Duration,
    lifecycle_deadline: Duration,
}

impl Pipeline {
    fn notify(&self, incident: &Incident) {
        let transition = IncidentTransition::latest(incident);
        debug!(
            "Incident {} {} -> {}",
            incident.id,
            transition
                .from
                .map(|state| state.to_string())
                .unwrap_or_else(|| "-".to_string()),
            transition.to
        );
        if self.alerts.send(transition.into()).is_err() {
            debug!("Alert manager gone, dropping notification for {}", incident.id);
        }
    }

    fn persist(&self, incident: Incident) {
        let id = incident.id;
        if self.persist.send(LedgerCommand::Persist(incident)).is_err() {
            error!("Ledger writer is gone, incident {} will not be persisted", id);
        }
    }

    /// Run one incident's lifecycle under the watchdog and hand the terminal
    /// incident to the ledger writer
    ///
    /// Nothing awaits between an incident turning terminal and it being
    /// queued for the ledger, so aborting this task never loses or repeats
    /// a record.
    async fn supervise(self: Arc<Self>, incident: Incident, recent_samples: Vec<Sample>) {
        let key = incident.anomaly_key.clone();
        let id = incident.id;

        match tokio::time::timeout(self.lifecycle_deadline, self.drive(incident, recent_samples))
            .await
        {
            Ok(Ok(closed)) => self.persist(closed),
            Ok(Err(e)) => debug!("Lifecycle of incident {} stopped: {}", id, e),
            Err(_) => match self
                .registry
                .abort(&key, id, LIFECYCLE_DEADLINE_EXCEEDED, Utc::now())
            {
                Ok(failed) => {
                    self.notify(&failed);
                    self.persist(failed);
                }
                Err(e) => debug!("Watchdog for incident {} found nothing to abort: {}", id, e),
            },
        }
    }

    /// OPEN -> DIAGNOSING -> DECIDED -> (SUPPRESSED | ACTING) -> terminal
    ///
    /// A successful action is followed by one fresh reading of the metric;
    /// the incident resolves either way and the reading goes into its
    /// outcome.
    ///
    /// Returns `LifecycleError` as soon as another party (self-resolution,
    /// watchdog, shutdown) has taken the incident over.
    async fn drive(
        &self,
        incident: Incident,
        recent_samples: Vec<Sample>,
    ) -> Result<Incident, LifecycleError> {
        use IncidentState::*;

        let key = incident.anomaly_key.clone();
        let id = incident.id;

        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        let diagnosing = self
            .registry
            .advance(&key, id, Open, Diagnosing, Utc::now(), |_| {})?;
        self.notify(&diagnosing);

        let since = Utc::now() - self.policy.config().lookback();
        let query = LedgerQuery::for_key(&key).since(since);
        let (history, evidence) = tokio::join!(
            self.ledger.query(&query),
            self.evidence.gather(&diagnosing.anomaly)
        );
        let history = match history {
            Ok(history) => Some(history),
            Err(e) => {
                warn!("History for {} unavailable: {}", key, e);
                None
            }
        };

        let context = IncidentContext {
            incident_id: id,
            anomaly: diagnosing.anomaly.clone(),
            opened_at: diagnosing.opened_at,
            recent_samples,
            prior_incidents: history.as_ref().map(Vec::len).unwrap_or(0),
            evidence,
        };

        let diagnosis = match self.diagnoser.diagnose(&context).await {
            Ok(diagnosis) => diagnosis,
            Err(e) => {
                let failed = self.registry.advance(&key, id, Diagnosing, Failed, Utc::now(), |i| {
                    i.outcome = Some(format!("diagnosis failed: {}", e))
                })?;
                self.notify(&failed);
                return Ok(failed);
            }
        };

        let diagnosed = self
            .registry
            .update(&key, id, Diagnosing, |i| i.diagnosis = Some(diagnosis))?;

        let now = Utc::now();
        let decision = match &history {
            Some(history) => self.policy.decide(&diagnosed, history, now),
            None => Decision::suppress(PolicyVerdict::HistoryUnavailable),
        };
        let decided = self.registry.advance(&key, id, Diagnosing, Decided, now, |i| {
            i.decision = Some(decision.clone())
        })?;
        self.notify(&decided);

        if !decision.acts() {
            let suppressed = self
                .registry
                .advance(&key, id, Decided, Suppressed, Utc::now(), |_| {})?;
            self.notify(&suppressed);

            let resolved = self.registry.advance(&key, id, Suppressed, Resolved, Utc::now(), |i| {
                i.outcome = Some(format!("suppressed: {}", decision.verdict.name()))
            })?;
            self.notify(&resolved);
            return Ok(resolved);
        }

        let action = decision.action;
        let acting = self.registry.advance(&key, id, Decided, Acting, Utc::now(), |i| {
            i.action_taken = Some(action.clone())
        })?;
        self.notify(&acting);

        let outcome = self.executor.execute(&action).await;
        let verification = match &self.verifier {
            Some(verifier) if outcome.success => Some(verifier.verify(&key).await),
            _ => None,
        };
        let (next, summary) = match (&verification, outcome.success) {
            (Some(verification), true) => (
                Resolved,
                format!("action succeeded: {}; {}", outcome.detail, verification),
            ),
            (None, true) => (Resolved, format!("action succeeded: {}", outcome.detail)),
            (_, false) => (Failed, format!("action failed: {}", outcome.detail)),
        };
        let closed = self.registry.advance(&key, id, Acting, next, Utc::now(), |i| {
            i.outcome = Some(summary);
            i.action_outcome = Some(outcome);
            i.verification = verification;
        })?;
        self.notify(&closed);
        Ok(closed)
    }
}

/// Persists terminal incidents in arrival order, then releases their keys
struct LedgerWriter {
    ledger: Arc<IncidentLedger>,
    registry: Arc<IncidentRegistry>,
    alerts: AlertSender,
    monitor: Arc<AgentMonitor>,
}

impl LedgerWriter {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<LedgerCommand>) -> Result<(), LedgerError> {
        while let Some(command) = commands.recv().await {
            let incident = match command {
                LedgerCommand::Persist(incident) => incident,
                LedgerCommand::Close => break,
            };

            if let Err(e) = self.ledger.append(&incident).await {
                let alert = Alert::LedgerWriteFailed {
                    incident_id: incident.id,
                    reason: e.to_string(),
                };
                if self.alerts.send(alert).is_err() {
                    error!("Could not raise ledger failure alert for {}", incident.id);
                }
                return Err(e);
            }

            self.registry.release(&incident.anomaly_key, incident.id);
            self.monitor.record_incident_closed(
                incident.state == IncidentState::Failed,
                incident.was_suppressed(),
            );
            info!(
                "Incident {} for {} closed as {}: {}",
                incident.id,
                incident.anomaly_key,
                incident.state,
                incident.outcome.as_deref().unwrap_or("-")
            );
        }
        debug!("Ledger writer stopped");
        Ok(())
    }
}

/// Binds the sampler, detector, registry and incident pipeline together
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn MetricSource>,
    detector: AnomalyDetector,
    history: SampleHistory,
    registry: Arc<IncidentRegistry>,
    monitor: Arc<AgentMonitor>,
    pipeline: Arc<Pipeline>,
    lifecycles: JoinSet<()>,
    sample_interval: Duration,
    writer: Option<(LedgerWriter, mpsc::UnboundedReceiver<LedgerCommand>)>,
    alert_manager: Option<(AlertManager, mpsc::UnboundedReceiver<Alert>)>,
}

impl Orchestrator {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let monitor = Arc::new(AgentMonitor::new());
        let registry = Arc::new(IncidentRegistry::new(config.reopen_cooldown()));
        let ledger = Arc::new(IncidentLedger::new(
            collaborators.store,
            config.ledger.retry_policy(),
        ));

        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();

        let alert_manager = AlertManager::new(&config.alerts, collaborators.notifiers)
            .with_monitor(Arc::clone(&monitor));

        let writer = LedgerWriter {
            ledger: Arc::clone(&ledger),
            registry: Arc::clone(&registry),
            alerts: alert_tx.clone(),
            monitor: Arc::clone(&monitor),
        };

        let pipeline = Arc::new(Pipeline {
            registry: Arc::clone(&registry),
            diagnoser: Diagnoser::new(
                collaborators.provider,
                config.diagnosis.call_timeout(),
                config.diagnosis.retry_policy(),
            )
            .with_monitor(Arc::clone(&monitor)),
            policy: RemediationPolicy::new(config.policy.clone()),
            executor: RemediationExecutor::new(
                collaborators.effector,
                config.executor.action_timeout(),
            )
            .with_monitor(Arc::clone(&monitor)),
            verifier: config.executor.verify_remediation.then(|| {
                RemediationVerifier::new(
                    Arc::clone(&collaborators.source),
                    config.rules.clone(),
                    config.executor.verify_after(),
                    Duration::from_secs(config.source.query_timeout_seconds.max(1)),
                )
            }),
            evidence: collaborators.evidence,
            ledger,
            alerts: alert_tx,
            persist: persist_tx,
            settle: Duration::from_secs(config.agent.settle_seconds),
            lifecycle_deadline: Duration::from_secs(config.agent.lifecycle_deadline_seconds),
        });

        Self {
            detector: AnomalyDetector::new(config.rules.clone()),
            history: SampleHistory::new(config.agent.history_window),
            sample_interval: config.sample_interval(),
            source: collaborators.source,
            registry,
            monitor,
            pipeline,
            lifecycles: JoinSet::new(),
            writer: Some((writer, persist_rx)),
            alert_manager: Some((alert_manager, alert_rx)),
            config,
        }
    }

    /// Sample more often than whole seconds allow
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn monitor(&self) -> Arc<AgentMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn registry(&self) -> Arc<IncidentRegistry> {
        Arc::clone(&self.registry)
    }

    /// Feed one sample through detection and deduplication
    ///
    /// Opened incidents get a lifecycle task and self-resolved ones go
    /// straight to the ledger. Never waits on incident processing.
    pub fn handle_sample(&mut self, sample: Sample) {
        self.monitor.record_samples_processed(1);
        let transitions = self.detector.observe(&sample);
        self.history.record(sample);

        for transition in transitions {
            match self.registry.on_transition(&transition, Utc::now()) {
                DedupOutcome::Opened(incident) => {
                    self.monitor.record_incident_opened();
                    self.pipeline.notify(&incident);

                    let recent = self.history.all(&incident.anomaly.metric_name);
                    let pipeline = Arc::clone(&self.pipeline);
                    self.lifecycles
                        .spawn(pipeline.supervise(incident, recent));
                }
                DedupOutcome::SelfResolved(incident) => {
                    self.pipeline.notify(&incident);
                    self.pipeline.persist(incident);
                }
                DedupOutcome::Refreshed => {
                    debug!("Refreshed open incident for {}", transition.key());
                }
                DedupOutcome::Ignored(reason) => {
                    debug!("Ignored transition for {}: {:?}", transition.key(), reason);
                }
            }
        }
    }

    /// Run until `shutdown` turns `true`
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Ledger` when a terminal incident could not be
    /// persisted after every retry; the agent stops rather than lose history.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        let (writer, persist_rx) = self.writer.take().ok_or(AgentError::ChannelClosed)?;
        let (alert_manager, alert_rx) = self
            .alert_manager
            .take()
            .ok_or(AgentError::ChannelClosed)?;

        let alert_task = tokio::spawn(alert_manager.run(alert_rx));
        let mut writer_task = tokio::spawn(writer.run(persist_rx));

        let collector = MetricsCollector::new(Arc::clone(&self.source), self.sample_interval)
            .with_monitor(Arc::clone(&self.monitor));
        if let Some(samples) = collector.health_check().await {
            for sample in samples {
                self.handle_sample(sample);
            }
        }

        let (sample_tx, mut samples) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
        let (stop_sampler, sampler_stopped) = watch::channel(false);
        let sampler = collector.spawn(sample_tx, sampler_stopped);

        let summary_period = Duration::from_secs(self.config.agent.monitor_interval_seconds.max(1));
        let mut summary = tokio::time::interval_at(Instant::now() + summary_period, summary_period);

        info!(
            "Agent running with {} rules, auto-remediation {}",
            self.detector.rule_count(),
            if self.config.policy.auto_remediation {
                "enabled"
            } else {
                "disabled"
            }
        );

        let mut failure = None;
        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested");
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown signal source dropped");
                        break;
                    }
                }
                Some(sample) = samples.recv() => self.handle_sample(sample),
                Some(joined) = self.lifecycles.join_next() => {
                    if let Err(e) = joined {
                        error!("Incident lifecycle task ended abnormally: {}", e);
                    }
                }
                written = &mut writer_task => {
                    failure = Some(match written {
                        Ok(Err(e)) => AgentError::Ledger(e),
                        Ok(Ok(())) => AgentError::ChannelClosed,
                        Err(e) => AgentError::TaskFailed(format!("ledger writer: {}", e)),
                    });
                    break;
                }
                _ = summary.tick() => {
                    self.monitor.log_summary();
                }
            }
        }

        if stop_sampler.send(true).is_err() {
            debug!("Sampler already stopped");
        }
        if let Err(e) = sampler.await {
            error!("Sampler task ended abnormally: {}", e);
        }

        self.stop_lifecycles().await;

        match failure {
            Some(e) => {
                error!("Stopping agent: {}", e);
                self.finish(alert_task).await;
                Err(e)
            }
            None => {
                self.abort_unfinished();
                if self.pipeline.persist.send(LedgerCommand::Close).is_err() {
                    debug!("Ledger writer already stopped");
                }
                let written = writer_task.await;
                self.finish(alert_task).await;
                match written {
                    Ok(result) => result.map_err(AgentError::from),
                    Err(e) => Err(AgentError::TaskFailed(format!("ledger writer: {}", e))),
                }
            }
        }
    }

    /// Give in-flight lifecycles the shutdown grace, then abort the rest
    async fn stop_lifecycles(&mut self) {
        let grace = Duration::from_secs(self.config.agent.shutdown_grace_seconds);
        let in_flight = self.lifecycles.len();
        if in_flight > 0 {
            info!(
                "Waiting up to {:?} for {} incident lifecycles",
                grace, in_flight
            );
        }

        let lifecycles = &mut self.lifecycles;
        let drained = tokio::time::timeout(grace, async {
            while lifecycles.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "Aborting {} incident lifecycles after shutdown grace",
                self.lifecycles.len()
            );
            self.lifecycles.abort_all();
            while self.lifecycles.join_next().await.is_some() {}
        }
    }

    /// Fail every incident that is still live and queue it for the ledger
    fn abort_unfinished(&self) {
        for incident in self.registry.snapshot() {
            if incident.is_terminal() {
                continue;
            }
            match self
                .registry
                .abort(&incident.anomaly_key, incident.id, SHUTDOWN, Utc::now())
            {
                Ok(failed) => {
                    self.pipeline.notify(&failed);
                    self.pipeline.persist(failed);
                }
                Err(e) => debug!("Nothing to abort for {}: {}", incident.id, e),
            }
        }
    }

    /// Log the final summary and let the alert manager drain
    async fn finish(self, alert_task: JoinHandle<()>) {
        self.monitor.log_summary();

        // The alert manager stops once every sender is gone.
        drop(self);
        match tokio::time::timeout(ALERT_FLUSH_TIMEOUT, alert_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Alert manager ended abnormally: {}", e),
            Err(_) => warn!("Alert manager did not drain within {:?}", ALERT_FLUSH_TIMEOUT),
        }
        info!("Agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{Diagnosis, MockBackend};
    use crate::alerts::{MockNotifier, TransitionKind};
    use crate::collectors::{MockEvidence, ScriptedSource, SourceFuture};
    use crate::detector::{Comparator, ThresholdRule};
    use crate::ledger::MemoryStore;
    use crate::remediation::{MockEffector, RemediationAction, Verification};
    use std::sync::Mutex;

    struct Harness {
        source: Arc<ScriptedSource>,
        effector: Arc<MockEffector>,
        store: Arc<MemoryStore>,
        notifier: MockNotifier,
    }

    fn create_test_config() -> Config {
        let mut config = Config::default();
        config.rules = vec![ThresholdRule::new("cpu_usage", Comparator::GreaterThan, 80.0, 2)];
        config.agent.shutdown_grace_seconds = 5;
        config.diagnosis.max_attempts = 1;
        config.diagnosis.base_delay_ms = 1;
        config.ledger.max_attempts = 2;
        config.ledger.base_delay_ms = 1;
        config.executor.verify_remediation = false;
        config
    }

    /// Reports the same cpu reading on every pull until told otherwise
    struct SteadySource {
        value: Mutex<f64>,
    }

    impl SteadySource {
        fn new(value: f64) -> Self {
            Self {
                value: Mutex::new(value),
            }
        }

        fn set(&self, value: f64) {
            *self.value.lock().unwrap() = value;
        }
    }

    impl MetricSource for SteadySource {
        fn pull(&self) -> SourceFuture<'_> {
            let value = *self.value.lock().unwrap();
            Box::pin(async move { Ok(vec![Sample::new("cpu_usage", value, "%")]) })
        }

        fn name(&self) -> &str {
            "steady"
        }
    }

    fn restart_app_diagnosis() -> MockBackend {
        MockBackend::with_response(Ok(Diagnosis::new(
            "stuck service",
            0.9,
            Some(RemediationAction::RestartService {
                name: "app".to_string(),
            }),
        )))
    }

    fn violating_samples(count: usize) -> Vec<Sample> {
        (0..count)
            .map(|i| Sample::new("cpu_usage", 90.0 + i as f64, "%"))
            .collect()
    }

    fn start(
        config: Config,
        provider: MockBackend,
        samples: Vec<Sample>,
    ) -> (
        Harness,
        watch::Sender<bool>,
        JoinHandle<Result<(), AgentError>>,
    ) {
        let harness = Harness {
            source: Arc::new(ScriptedSource::from_samples(samples)),
            effector: Arc::new(MockEffector::new()),
            store: Arc::new(MemoryStore::new()),
            notifier: MockNotifier::new(),
        };
        start_with(config, provider, harness)
    }

    fn start_with(
        config: Config,
        provider: MockBackend,
        harness: Harness,
    ) -> (
        Harness,
        watch::Sender<bool>,
        JoinHandle<Result<(), AgentError>>,
    ) {
        let source = harness.source.clone();
        let (stop_tx, handle) = spawn(config, provider, source, &harness);
        (harness, stop_tx, handle)
    }

    fn spawn(
        config: Config,
        provider: MockBackend,
        source: Arc<dyn MetricSource>,
        harness: &Harness,
    ) -> (watch::Sender<bool>, JoinHandle<Result<(), AgentError>>) {
        let orchestrator = Orchestrator::new(
            config,
            Collaborators {
                source,
                provider: Arc::new(provider),
                effector: harness.effector.clone(),
                evidence: Arc::new(MockEvidence::default()),
                store: harness.store.clone(),
                notifiers: vec![Arc::new(harness.notifier.clone())],
            },
        )
        .with_sample_interval(Duration::from_millis(10));

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(orchestrator.run(stop_rx));
        (stop_tx, handle)
    }

    fn resolved_transitions(notifier: &MockNotifier) -> Vec<IncidentTransition> {
        notifier
            .delivered()
            .into_iter()
            .filter_map(|alert| match alert {
                Alert::Transition(t) if t.kind == TransitionKind::Resolved => Some(t),
                _ => None,
            })
            .collect()
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_watchdog_fails_stuck_lifecycle() {
        let mut config = create_test_config();
        config.agent.lifecycle_deadline_seconds = 1;
        config.diagnosis.call_timeout_seconds = 30;
        let provider = MockBackend::success().with_delay(Duration::from_secs(20));

        let (harness, stop, handle) = start(config, provider, violating_samples(2));
        wait_for(|| harness.store.records().len() == 1).await;

        let incident = &harness.store.records()[0];
        assert_eq!(incident.state, IncidentState::Failed);
        assert_eq!(incident.outcome.as_deref(), Some(LIFECYCLE_DEADLINE_EXCEEDED));
        assert_eq!(harness.effector.call_count(), 0);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(harness.store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_in_flight_incident() {
        let mut config = create_test_config();
        config.agent.shutdown_grace_seconds = 0;
        config.diagnosis.call_timeout_seconds = 60;
        let provider = MockBackend::success().with_delay(Duration::from_secs(30));

        let (harness, stop, handle) = start(config, provider, violating_samples(2));
        wait_for(|| harness.source.remaining() == 0).await;
        assert!(harness.store.records().is_empty());

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let records = harness.store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, IncidentState::Failed);
        assert_eq!(records[0].outcome.as_deref(), Some(SHUTDOWN));

        let kinds: Vec<TransitionKind> = harness
            .notifier
            .delivered()
            .into_iter()
            .filter_map(|alert| match alert {
                Alert::Transition(t) => Some(t.kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds.first(), Some(&TransitionKind::Opened));
        assert_eq!(kinds.last(), Some(&TransitionKind::Failed));
    }

    #[tokio::test]
    async fn test_history_unavailable_suppresses() {
        let config = create_test_config();
        let provider = MockBackend::with_response(Ok(Diagnosis::new(
            "runaway worker",
            0.95,
            Some(RemediationAction::RestartService {
                name: "app".to_string(),
            }),
        )));

        let harness = Harness {
            source: Arc::new(ScriptedSource::from_samples(violating_samples(2))),
            effector: Arc::new(MockEffector::new()),
            store: Arc::new(MemoryStore::new()),
            notifier: MockNotifier::new(),
        };
        harness.store.set_queries_failing(true);
        let (harness, stop, handle) = start_with(config, provider, harness);

        wait_for(|| harness.store.records().len() == 1).await;
        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let incident = &harness.store.records()[0];
        assert_eq!(incident.state, IncidentState::Resolved);
        assert_eq!(
            incident.outcome.as_deref(),
            Some("suppressed: history_unavailable")
        );
        assert_eq!(harness.effector.call_count(), 0);

        let attention = harness
            .notifier
            .delivered()
            .into_iter()
            .any(|alert| match alert {
                Alert::Transition(t) => t.kind == TransitionKind::Suppressed && t.needs_attention,
                _ => false,
            });
        assert!(attention);
    }

    #[tokio::test]
    async fn test_ledger_exhaustion_stops_agent() {
        let config = create_test_config();
        let harness = Harness {
            source: Arc::new(ScriptedSource::from_samples(vec![
                Sample::new("cpu_usage", 85.0, "%"),
                Sample::new("cpu_usage", 86.0, "%"),
                Sample::new("cpu_usage", 40.0, "%"),
            ])),
            effector: Arc::new(MockEffector::new()),
            store: Arc::new(MemoryStore::new()),
            notifier: MockNotifier::new(),
        };
        harness.store.fail_next_appends(100);
        let mut config = config;
        config.agent.settle_seconds = 1;

        let (harness, _stop, handle) = start_with(config, MockBackend::success(), harness);

        let result = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(AgentError::Ledger(LedgerError::RetriesExhausted { attempts: 2, .. }))
        ));
        assert!(harness
            .notifier
            .delivered()
            .iter()
            .any(|alert| matches!(alert, Alert::LedgerWriteFailed { .. })));
    }

    #[tokio::test]
    async fn test_failed_incident_starts_cooldown() {
        let config = create_test_config();
        let provider = MockBackend::with_response(Ok(Diagnosis::new(
            "stuck service",
            0.9,
            Some(RemediationAction::RestartService {
                name: "app".to_string(),
            }),
        )));
        let harness = Harness {
            source: Arc::new(ScriptedSource::from_samples(violating_samples(2))),
            effector: Arc::new(MockEffector::failing("restart refused")),
            store: Arc::new(MemoryStore::new()),
            notifier: MockNotifier::new(),
        };
        let (harness, stop, handle) = start_with(config, provider, harness);

        wait_for(|| harness.store.records().len() == 1).await;
        assert_eq!(
            harness.store.records()[0].outcome.as_deref(),
            Some("action failed: restart refused")
        );

        // The anomaly keeps going but the key is cooling down
        for value in [95.0, 96.0, 97.0] {
            harness.source.push(Ok(vec![Sample::new("cpu_usage", value, "%")]));
        }
        wait_for(|| harness.source.remaining() == 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(harness.store.records().len(), 1);
        assert_eq!(harness.effector.call_count(), 1);
    }

    #[tokio::test]
    async fn test_watchdog_abort_while_acting_counts_against_retry_budget() {
        let mut config = create_test_config();
        config.agent.lifecycle_deadline_seconds = 1;
        config.agent.reopen_cooldown_seconds = 0;
        config.policy.max_retry_count = 1;

        let harness = Harness {
            source: Arc::new(ScriptedSource::from_samples(violating_samples(2))),
            effector: Arc::new(MockEffector::new().with_delay(Duration::from_secs(20))),
            store: Arc::new(MemoryStore::new()),
            notifier: MockNotifier::new(),
        };
        let (harness, stop, handle) = start_with(config, restart_app_diagnosis(), harness);

        wait_for(|| harness.store.records().len() == 1).await;
        let aborted = harness.store.records()[0].clone();
        assert_eq!(aborted.state, IncidentState::Failed);
        assert_eq!(aborted.outcome.as_deref(), Some(LIFECYCLE_DEADLINE_EXCEEDED));
        assert!(aborted.action_taken.is_some());
        assert!(aborted.action_outcome.is_none());

        // The anomaly is still there and the key may reopen right away
        harness.source.push(Ok(vec![Sample::new("cpu_usage", 97.0, "%")]));
        wait_for(|| harness.store.records().len() == 2).await;

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let retried = &harness.store.records()[1];
        assert_eq!(retried.state, IncidentState::Resolved);
        assert_eq!(
            retried.decision.as_ref().map(|d| &d.verdict),
            Some(&PolicyVerdict::RetryBudgetExhausted { failures: 1 })
        );
        assert_eq!(harness.effector.call_count(), 1);
    }

    #[tokio::test]
    async fn test_remediation_that_does_not_help_needs_attention() {
        let mut config = create_test_config();
        config.executor.verify_remediation = true;
        config.executor.verify_after_seconds = 0;

        let harness = Harness {
            source: Arc::new(ScriptedSource::default()),
            effector: Arc::new(MockEffector::new()),
            store: Arc::new(MemoryStore::new()),
            notifier: MockNotifier::new(),
        };
        let (stop, handle) = spawn(
            config,
            restart_app_diagnosis(),
            Arc::new(SteadySource::new(90.0)),
            &harness,
        );

        wait_for(|| harness.store.records().len() == 1).await;
        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let incident = &harness.store.records()[0];
        assert_eq!(incident.state, IncidentState::Resolved);
        assert_eq!(
            incident.verification,
            Some(Verification::Persists { value: 90.0 })
        );
        let outcome = incident.outcome.as_deref().unwrap_or_default();
        assert!(outcome.starts_with("action succeeded"));
        assert!(outcome.ends_with("anomaly persists at 90.00"));
        // Cooling down, so the lingering anomaly does not reopen
        assert_eq!(harness.effector.call_count(), 1);

        let resolved = resolved_transitions(&harness.notifier);
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].needs_attention);
    }

    #[tokio::test]
    async fn test_remediation_is_verified_with_a_fresh_reading() {
        let mut config = create_test_config();
        config.executor.verify_remediation = true;
        config.executor.verify_after_seconds = 1;

        let harness = Harness {
            source: Arc::new(ScriptedSource::default()),
            effector: Arc::new(MockEffector::new()),
            store: Arc::new(MemoryStore::new()),
            notifier: MockNotifier::new(),
        };
        let source = Arc::new(SteadySource::new(92.0));
        let (stop, handle) = spawn(config, restart_app_diagnosis(), source.clone(), &harness);

        wait_for(|| harness.effector.call_count() == 1).await;
        source.set(40.0);
        wait_for(|| harness.store.records().len() == 1).await;
        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let incident = &harness.store.records()[0];
        assert_eq!(
            incident.verification,
            Some(Verification::Verified { value: 40.0 })
        );
        assert!(incident
            .outcome
            .as_deref()
            .unwrap_or_default()
            .ends_with("verified at 40.00"));
        assert!(!resolved_transitions(&harness.notifier)[0].needs_attention);
    }
}
