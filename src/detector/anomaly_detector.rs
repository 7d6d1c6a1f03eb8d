use crate::detector::ThresholdRule;
use crate::events::{Anomaly, AnomalyKey, AnomalyTransition, Sample, Timestamp};
use log::{debug, info, warn};
use std::collections::HashMap;

/// Detector that turns metric samples into anomaly transitions
///
/// State is tracked independently for every `(metric, rule)` pair. A rule
/// violation has to persist for the rule's sustain window before an
/// `Opened` transition fires, so a single noisy sample never opens an anomaly.
pub struct AnomalyDetector {
    rules: Vec<ThresholdRule>,
    tracks: HashMap<AnomalyKey, Track>,
}

/// Rolling violation state for one `(metric, rule)` pair
#[derive(Debug, Clone)]
struct Track {
    first_violation_at: Timestamp,
    consecutive: u32,
    open: Option<Anomaly>,
}

impl AnomalyDetector {
    /// Create a detector over a fixed set of rules
    pub fn new(rules: Vec<ThresholdRule>) -> Self {
        Self {
            rules,
            tracks: HashMap::new(),
        }
    }

    /// Feed one sample and return the transitions it causes
    ///
    /// Samples for metrics without rules, and samples with non-finite values,
    /// produce no transitions and leave tracked state untouched.
    pub fn observe(&mut self, sample: &Sample) -> Vec<AnomalyTransition> {
        if !sample.value.is_finite() {
            warn!(
                "Ignoring non-finite sample for metric '{}': {}",
                sample.metric_name, sample.value
            );
            return Vec::new();
        }

        let mut transitions = Vec::new();

        for rule in self
            .rules
            .iter()
            .filter(|rule| rule.metric_name == sample.metric_name)
        {
            let key = rule.key();

            if rule.is_violated_by(sample.value) {
                let track = self.tracks.entry(key.clone()).or_insert_with(|| Track {
                    first_violation_at: sample.timestamp,
                    consecutive: 0,
                    open: None,
                });
                track.consecutive = track.consecutive.saturating_add(1);

                if let Some(anomaly) = track.open.as_mut() {
                    anomaly.observed_value = sample.value;
                    anomaly.last_observed_at = sample.timestamp;
                    anomaly.severity = anomaly.severity.max(rule.severity_for(sample.value));
                    transitions.push(AnomalyTransition::Updated(anomaly.clone()));
                    continue;
                }

                let elapsed = sample.timestamp - track.first_violation_at;
                if track.consecutive >= rule.sustained_samples && elapsed >= rule.sustain_window() {
                    let anomaly = Anomaly {
                        key: key.clone(),
                        metric_name: sample.metric_name.clone(),
                        observed_value: sample.value,
                        rule_violated: rule.describe(),
                        severity: rule.severity_for(sample.value),
                        first_observed_at: track.first_violation_at,
                        last_observed_at: sample.timestamp,
                    };
                    info!(
                        "Anomaly opened for {}: value {} after {} consecutive violations",
                        key, sample.value, track.consecutive
                    );
                    track.open = Some(anomaly.clone());
                    transitions.push(AnomalyTransition::Opened(anomaly));
                } else {
                    debug!(
                        "Violation pending for {}: {}/{} samples",
                        key, track.consecutive, rule.sustained_samples
                    );
                }
            } else if let Some(track) = self.tracks.remove(&key) {
                if let Some(mut anomaly) = track.open {
                    info!("Anomaly cleared for {}: value {}", key, sample.value);
                    anomaly.observed_value = sample.value;
                    anomaly.last_observed_at = sample.timestamp;
                    transitions.push(AnomalyTransition::Cleared(anomaly));
                } else {
                    debug!("Pending violation for {} reset", key);
                }
            }
        }

        transitions
    }

    /// Currently open anomalies
    pub fn open_anomalies(&self) -> Vec<&Anomaly> {
        self.tracks
            .values()
            .filter_map(|track| track.open.as_ref())
            .collect()
    }

    /// Get the number of configured rules
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
