//! End-to-end incident scenarios driven through the orchestrator with
//! scripted metrics, a mock reasoning provider and a mock effector.

use opsbot::ai::{Diagnosis, MockBackend};
use opsbot::alerts::{Alert, MockNotifier, TransitionKind};
use opsbot::collectors::{EvidenceSection, MockEvidence, ScriptedSource};
use opsbot::config::Config;
use opsbot::detector::{Comparator, ThresholdRule};
use opsbot::error::DiagnosisError;
use opsbot::events::Sample;
use opsbot::incidents::{Incident, IncidentState, SELF_RESOLVED};
use opsbot::ledger::{IncidentStore, JsonlStore, LedgerQuery, MemoryStore};
use opsbot::remediation::{MockEffector, RemediationAction};
use opsbot::{AgentError, Collaborators, Orchestrator};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Agent {
    source: Arc<ScriptedSource>,
    provider: Arc<MockBackend>,
    effector: Arc<MockEffector>,
    evidence: Arc<MockEvidence>,
    notifier: MockNotifier,
    stop: watch::Sender<bool>,
    handle: JoinHandle<Result<(), AgentError>>,
}

impl Agent {
    /// Signal shutdown and wait for the agent to drain
    async fn shutdown(&mut self) {
        self.stop.send(true).unwrap();
        (&mut self.handle).await.unwrap().unwrap();
    }

    fn transition_kinds(&self) -> Vec<TransitionKind> {
        self.notifier
            .delivered()
            .into_iter()
            .filter_map(|alert| match alert {
                Alert::Transition(transition) => Some(transition.kind),
                _ => None,
            })
            .collect()
    }
}

fn create_test_config() -> Config {
    let mut config = Config::default();
    config.rules = vec![
        ThresholdRule::new("cpu_usage", Comparator::GreaterThan, 80.0, 2),
        ThresholdRule::new("memory_usage", Comparator::GreaterThan, 85.0, 2),
    ];
    config.diagnosis.max_attempts = 3;
    config.diagnosis.base_delay_ms = 1;
    config.ledger.base_delay_ms = 1;
    config.agent.shutdown_grace_seconds = 5;
    // Scripted sources run dry; a re-check would only consume the script
    config.executor.verify_remediation = false;
    config
}

fn cpu(values: &[f64]) -> ScriptedSource {
    ScriptedSource::from_samples(
        values
            .iter()
            .map(|value| Sample::new("cpu_usage", *value, "%"))
            .collect(),
    )
}

fn start(
    config: Config,
    source: ScriptedSource,
    provider: MockBackend,
    store: Arc<dyn IncidentStore>,
) -> Agent {
    let source = Arc::new(source);
    let provider = Arc::new(provider);
    let effector = Arc::new(MockEffector::new());
    let evidence = Arc::new(MockEvidence::new(vec![EvidenceSection::new(
        "top processes",
        "USER PID %CPU COMMAND\napp 4242 97.1 worker",
    )]));
    let notifier = MockNotifier::new();

    let orchestrator = Orchestrator::new(
        config,
        Collaborators {
            source: source.clone(),
            provider: provider.clone(),
            effector: effector.clone(),
            evidence: evidence.clone(),
            store,
            notifiers: vec![Arc::new(notifier.clone())],
        },
    )
    .with_sample_interval(Duration::from_millis(10));

    let (stop, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(orchestrator.run(stop_rx));

    Agent {
        source,
        provider,
        effector,
        evidence,
        notifier,
        stop,
        handle,
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn states(incident: &Incident) -> Vec<IncidentState> {
    let mut states = vec![IncidentState::Open];
    states.extend(incident.transitions.iter().map(|change| change.to));
    states
}

#[tokio::test]
async fn test_confident_diagnosis_restarts_service() {
    use IncidentState::*;

    let store = Arc::new(MemoryStore::new());
    let provider = MockBackend::with_response(Ok(Diagnosis::new(
        "app worker pool saturated",
        0.9,
        Some(RemediationAction::RestartService {
            name: "app".to_string(),
        }),
    )));
    let mut agent = start(
        create_test_config(),
        cpu(&[85.0, 86.0, 84.0]),
        provider,
        store.clone(),
    );

    wait_for(|| store.records().len() == 1).await;
    agent.shutdown().await;

    let incident = &store.records()[0];
    assert_eq!(states(incident), vec![Open, Diagnosing, Decided, Acting, Resolved]);
    assert!(incident
        .outcome
        .as_deref()
        .unwrap_or_default()
        .starts_with("action succeeded"));
    assert_eq!(
        incident.action_taken,
        Some(RemediationAction::RestartService {
            name: "app".to_string()
        })
    );
    assert!(incident.action_outcome.as_ref().map(|o| o.success).unwrap_or(false));
    assert_eq!(agent.effector.calls(), vec![RemediationAction::RestartService {
        name: "app".to_string()
    }]);
    assert_eq!(agent.provider.call_count(), 1);

    // Host evidence reached the provider with the incident
    assert_eq!(agent.evidence.call_count(), 1);
    let context = agent.provider.last_context().unwrap();
    assert_eq!(context.incident_id, incident.id);
    assert_eq!(context.evidence[0].source, "top processes");

    // The anomaly opened on the second sample
    let opened = agent
        .notifier
        .delivered()
        .into_iter()
        .find_map(|alert| match alert {
            Alert::Transition(t) if t.kind == TransitionKind::Opened => Some(t),
            _ => None,
        })
        .unwrap();
    assert!(opened.detail.contains("86.00"));
    assert_eq!(
        agent.transition_kinds(),
        vec![
            TransitionKind::Opened,
            TransitionKind::Diagnosed,
            TransitionKind::Decided,
            TransitionKind::Acting,
            TransitionKind::Resolved,
        ]
    );
}

#[tokio::test]
async fn test_low_confidence_is_suppressed() {
    use IncidentState::*;

    let store = Arc::new(MemoryStore::new());
    let provider = MockBackend::with_response(Ok(Diagnosis::new(
        "possibly a noisy neighbour",
        0.3,
        Some(RemediationAction::RestartService {
            name: "app".to_string(),
        }),
    )));
    let mut agent = start(
        create_test_config(),
        cpu(&[85.0, 86.0, 84.0]),
        provider,
        store.clone(),
    );

    wait_for(|| store.records().len() == 1).await;
    agent.shutdown().await;

    let incident = &store.records()[0];
    assert_eq!(
        states(incident),
        vec![Open, Diagnosing, Decided, Suppressed, Resolved]
    );
    assert_eq!(incident.outcome.as_deref(), Some("suppressed: low_confidence"));
    assert_eq!(
        incident.decision.as_ref().map(|d| &d.action),
        Some(&RemediationAction::NoAction)
    );
    assert!(incident.action_taken.is_none());
    assert_eq!(agent.effector.call_count(), 0);

    let attention = agent.notifier.delivered().into_iter().any(|alert| match alert {
        Alert::Transition(t) => t.kind == TransitionKind::Suppressed && t.needs_attention,
        _ => false,
    });
    assert!(attention);
}

#[tokio::test]
async fn test_provider_timeouts_fail_incident() {
    use IncidentState::*;

    let store = Arc::new(MemoryStore::new());
    let mut agent = start(
        create_test_config(),
        cpu(&[85.0, 86.0, 84.0]),
        MockBackend::with_response(Err(DiagnosisError::Timeout)),
        store.clone(),
    );

    wait_for(|| store.records().len() == 1).await;
    agent.shutdown().await;

    let incident = &store.records()[0];
    assert_eq!(states(incident), vec![Open, Diagnosing, Failed]);
    assert_eq!(incident.outcome.as_deref(), Some("diagnosis failed: timeout"));
    assert!(incident.diagnosis.is_none());
    assert!(incident.action_taken.is_none());
    assert_eq!(agent.provider.call_count(), 3);
    assert_eq!(agent.effector.call_count(), 0);
    assert_eq!(agent.transition_kinds().last(), Some(&TransitionKind::Failed));
}

#[tokio::test]
async fn test_cleared_before_diagnosis_self_resolves() {
    use IncidentState::*;

    let mut config = create_test_config();
    config.agent.settle_seconds = 1;

    let store = Arc::new(MemoryStore::new());
    let mut agent = start(
        config,
        cpu(&[85.0, 86.0, 50.0]),
        MockBackend::success(),
        store.clone(),
    );

    wait_for(|| store.records().len() == 1).await;
    // Shutdown waits for the settling lifecycle, which finds nothing to diagnose
    agent.shutdown().await;

    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(states(&records[0]), vec![Open, Resolved]);
    assert_eq!(records[0].outcome.as_deref(), Some(SELF_RESOLVED));
    assert_eq!(agent.provider.call_count(), 0);
    assert_eq!(agent.evidence.call_count(), 0);
    assert_eq!(agent.effector.call_count(), 0);
}

#[tokio::test]
async fn test_every_terminal_incident_is_persisted_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        JsonlStore::open(dir.path().join("incidents.jsonl"))
            .await
            .unwrap(),
    );

    let mut config = create_test_config();
    // Allow cpu to reopen right away after each self-resolution
    config.agent.reopen_cooldown_seconds = 0;

    let mut samples = Vec::new();
    for round in 0..3 {
        let base = 81.0 + round as f64;
        samples.push(vec![
            Sample::new("cpu_usage", base, "%"),
            Sample::new("memory_usage", 90.0, "%"),
        ]);
        samples.push(vec![
            Sample::new("cpu_usage", base + 1.0, "%"),
            Sample::new("memory_usage", 91.0, "%"),
        ]);
        samples.push(vec![
            Sample::new("cpu_usage", 20.0, "%"),
            Sample::new("memory_usage", 40.0, "%"),
        ]);
    }

    let provider = MockBackend::with_response(Ok(Diagnosis::new(
        "transient load",
        0.8,
        Some(RemediationAction::NoAction),
    )));
    let mut agent = start(
        config,
        ScriptedSource::new(samples.into_iter().map(Ok).collect()),
        provider,
        store.clone(),
    );

    wait_for(|| agent.source.remaining() == 0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    agent.shutdown().await;

    let records = store.query(&LedgerQuery::default()).await.unwrap();
    assert!(!records.is_empty());

    let ids: HashSet<_> = records.iter().map(|incident| incident.id).collect();
    assert_eq!(ids.len(), records.len(), "an incident was persisted twice");

    for incident in &records {
        assert!(incident.is_terminal());
        let last = incident.transitions.last().unwrap();
        assert_eq!(last.to, incident.state);
        assert_eq!(incident.closed_at, Some(last.at));
        assert_eq!(incident.transitions[0].from, IncidentState::Open);
        for pair in incident.transitions.windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
            assert!(pair[0].at <= pair[1].at);
        }
    }
}
