use crate::ai::backends::ReasoningProvider;
use crate::collectors::EvidenceSection;
use crate::error::DiagnosisError;
use crate::events::{Anomaly, Sample, Timestamp};
use crate::monitoring::{AgentMonitor, DiagnosisTimer};
use crate::remediation::RemediationAction;
use crate::retry::{retry, RetryPolicy};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Root-cause explanation attached to an incident
///
/// Attached once per incident and never changed afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagnosis {
    pub root_cause_summary: String,
    /// Always within [0, 1] once validated
    pub confidence: f64,
    pub evidence: Vec<String>,
    pub suggested_action: Option<RemediationAction>,
}

impl Diagnosis {
    pub fn new(
        root_cause_summary: impl Into<String>,
        confidence: f64,
        suggested_action: Option<RemediationAction>,
    ) -> Self {
        Self {
            root_cause_summary: root_cause_summary.into(),
            confidence,
            evidence: Vec::new(),
            suggested_action,
        }
    }

    pub fn with_evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }

    /// Reject confidences outside [0, 1] and empty summaries
    pub fn validate(&self) -> Result<(), DiagnosisError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(DiagnosisError::InvalidResponse(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if self.root_cause_summary.trim().is_empty() {
            return Err(DiagnosisError::InvalidResponse(
                "empty root cause".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything the reasoning provider gets to see about one incident
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncidentContext {
    pub incident_id: Uuid,
    pub anomaly: Anomaly,
    pub opened_at: Timestamp,
    /// Recent samples of the anomalous metric, oldest first
    pub recent_samples: Vec<Sample>,
    /// Number of earlier incidents for the same key within the lookback
    pub prior_incidents: usize,
    /// Bounded output of host diagnostic commands
    #[serde(default)]
    pub evidence: Vec<EvidenceSection>,
}

/// Build the prompt sent to text-completion providers
pub fn format_prompt(context: &IncidentContext) -> String {
    let anomaly = &context.anomaly;

    let samples = context
        .recent_samples
        .iter()
        .rev()
        .take(20)
        .rev()
        .map(|sample| {
            format!(
                "[{}] {} = {:.2}{}",
                sample.timestamp.format("%H:%M:%S"),
                sample.metric_name,
                sample.value,
                sample.unit
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let labels = context
        .recent_samples
        .last()
        .map(|sample| {
            sample
                .source_labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .filter(|labels| !labels.is_empty())
        .unwrap_or_else(|| "none".to_string());

    let evidence = context
        .evidence
        .iter()
        .map(|section| format!("--- {} ---\n{}", section.source, section.text))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r#"You are an expert Site Reliability Engineer. Diagnose the following infrastructure anomaly.

Incident: {}
- Metric: {}
- Rule violated: {}
- Observed value: {:.2}
- Severity: {:?}
- Violating since: {}
- Last observed: {}
- Source labels: {}
- Earlier incidents for this anomaly: {}

Recent samples:
{}

Host evidence:
{}

Respond in JSON format with fields:
- root_cause (string): most likely underlying cause
- confidence (number between 0 and 1, or "HIGH", "MEDIUM", "LOW")
- evidence (array of strings): observations supporting the root cause
- suggested_action (object or null): one of
  {{"type": "restart_container", "name": "<container>"}}
  {{"type": "restart_service", "name": "<systemd unit>"}}
  {{"type": "kill_process", "target": {{"pid": <pid>}}}} or {{"type": "kill_process", "target": {{"pattern": "<command line pattern>"}}}}
  {{"type": "clear_disk", "path": "<absolute directory>", "pattern": "<glob>"}}
  {{"type": "no_action"}}

Only suggest an action you are confident addresses the root cause."#,
        context.incident_id,
        anomaly.metric_name,
        anomaly.rule_violated,
        anomaly.observed_value,
        anomaly.severity,
        anomaly.first_observed_at.format("%Y-%m-%d %H:%M:%S"),
        anomaly.last_observed_at.format("%Y-%m-%d %H:%M:%S"),
        labels,
        context.prior_incidents,
        if samples.is_empty() {
            "No recent samples"
        } else {
            &samples
        },
        if evidence.is_empty() {
            "None collected"
        } else {
            &evidence
        }
    )
}

/// Obtains a diagnosis for an incident from a reasoning provider
///
/// Each provider call is bounded by `call_timeout` and the whole exchange is
/// retried under `retry`. Responses are validated before they are returned,
/// so callers only ever see a confidence within [0, 1].
pub struct Diagnoser {
    provider: Arc<dyn ReasoningProvider>,
    monitor: Option<Arc<AgentMonitor>>,
    call_timeout: Duration,
    retry: RetryPolicy,
}

impl Diagnoser {
    pub fn new(provider: Arc<dyn ReasoningProvider>, call_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            provider,
            monitor: None,
            call_timeout,
            retry,
        }
    }

    /// Record provider latency in the agent monitor
    pub fn with_monitor(mut self, monitor: Arc<AgentMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Diagnose an incident
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt once retries are exhausted:
    /// `Timeout` when the provider did not answer within `call_timeout`,
    /// `InvalidResponse` for malformed or out-of-range responses, and the
    /// provider's own error otherwise.
    pub async fn diagnose(&self, context: &IncidentContext) -> Result<Diagnosis, DiagnosisError> {
        info!(
            "Diagnosing incident {} ({} = {:.2}) with {}",
            context.incident_id,
            context.anomaly.metric_name,
            context.anomaly.observed_value,
            self.provider.name()
        );

        let label = format!("diagnosis of incident {}", context.incident_id);
        let started = Instant::now();

        match retry(&self.retry, &label, |attempt| self.call_once(context, attempt)).await {
            Ok(diagnosis) => {
                info!(
                    "Incident {} diagnosed in {:?}: confidence={:.2}, action={}",
                    context.incident_id,
                    started.elapsed(),
                    diagnosis.confidence,
                    diagnosis
                        .suggested_action
                        .as_ref()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "none".to_string())
                );
                Ok(diagnosis)
            }
            Err(exhausted) => {
                error!(
                    "Diagnosis of incident {} unavailable after {} attempts: {}",
                    context.incident_id, exhausted.attempts, exhausted.last_error
                );
                Err(exhausted.last_error)
            }
        }
    }

    async fn call_once(
        &self,
        context: &IncidentContext,
        attempt: u32,
    ) -> Result<Diagnosis, DiagnosisError> {
        debug!(
            "Diagnosis attempt {} for incident {}",
            attempt, context.incident_id
        );

        let timer = self
            .monitor
            .as_ref()
            .map(|m| DiagnosisTimer::start(Arc::clone(m)));

        let result = tokio::time::timeout(self.call_timeout, self.provider.analyze(context)).await;

        if let Some(timer) = timer {
            timer.finish();
        }

        let diagnosis = match result {
            Ok(result) => result?,
            Err(_) => return Err(DiagnosisError::Timeout),
        };
        diagnosis.validate()?;
        Ok(diagnosis)
    }
}
