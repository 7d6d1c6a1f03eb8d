//! Core event types shared by the sampler, detector and incident pipeline
//!
//! This module defines the metric sample produced by collectors and the
//! anomaly events the detector derives from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// A single labeled metric reading
///
/// Produced by a metric source and consumed once by the detector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    /// Name of the metric (e.g. `cpu_usage`)
    pub metric_name: String,
    /// Observed value
    pub value: f64,
    /// Unit of the value (e.g. `percent`, `bytes_per_second`)
    pub unit: String,
    /// When the value was observed
    pub timestamp: Timestamp,
    /// Labels identifying where the value came from
    #[serde(default)]
    pub source_labels: BTreeMap<String, String>,
}

impl Sample {
    pub fn new(metric_name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self::at(metric_name, value, unit, Utc::now())
    }

    pub fn at(
        metric_name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            metric_name: metric_name.into(),
            value,
            unit: unit.into(),
            timestamp,
            source_labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.source_labels.insert(key.into(), value.into());
        self
    }
}

/// Severity level for anomalies and operator alerts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, no action required
    Info,
    /// Threshold crossed
    Warning,
    /// Critical limit crossed or operator attention required
    Critical,
}

/// Identity of an anomaly: the metric plus the rule it violates
///
/// Exactly one non-terminal incident exists per key at any time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnomalyKey {
    pub metric_name: String,
    pub rule: String,
}

impl AnomalyKey {
    pub fn new(metric_name: impl Into<String>, rule: impl Into<String>) -> Self {
        Self {
            metric_name: metric_name.into(),
            rule: rule.into(),
        }
    }
}

impl fmt::Display for AnomalyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.metric_name, self.rule)
    }
}

/// A sustained threshold violation on one metric
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Anomaly {
    pub key: AnomalyKey,
    pub metric_name: String,
    /// Most recent violating value
    pub observed_value: f64,
    /// Human-readable description of the violated rule
    pub rule_violated: String,
    pub severity: Severity,
    pub first_observed_at: Timestamp,
    pub last_observed_at: Timestamp,
}

/// State change reported by the detector for one `(metric, rule)` pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "transition", content = "anomaly", rename_all = "lowercase")]
pub enum AnomalyTransition {
    /// The violation has lasted for the sustain window
    Opened(Anomaly),
    /// Another violating sample arrived for an open anomaly
    Updated(Anomaly),
    /// A satisfying sample arrived for an open anomaly
    Cleared(Anomaly),
}

impl AnomalyTransition {
    pub fn anomaly(&self) -> &Anomaly {
        match self {
            AnomalyTransition::Opened(a)
            | AnomalyTransition::Updated(a)
            | AnomalyTransition::Cleared(a) => a,
        }
    }

    pub fn key(&self) -> &AnomalyKey {
        &self.anomaly().key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_anomaly() -> Anomaly {
        let now = Utc::now();
        Anomaly {
            key: AnomalyKey::new("cpu_usage", "cpu_usage > 80"),
            metric_name: "cpu_usage".to_string(),
            observed_value: 91.5,
            rule_violated: "cpu_usage > 80".to_string(),
            severity: Severity::Warning,
            first_observed_at: now,
            last_observed_at: now,
        }
    }

    #[test]
    fn test_sample_serialization() {
        let sample = Sample::new("memory_usage", 72.5, "percent").with_label("host", "web-1");

        let json = serde_json::to_string(&sample).unwrap();
        let deserialized: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(sample, deserialized);
        assert_eq!(deserialized.source_labels["host"], "web-1");
    }

    #[test]
    fn test_sample_labels_default_to_empty() {
        let json = r#"{"metric_name":"cpu_usage","value":1.0,"unit":"percent","timestamp":"2024-01-01T00:00:00Z"}"#;
        let sample: Sample = serde_json::from_str(json).unwrap();
        assert!(sample.source_labels.is_empty());
    }

    #[test]
    fn test_anomaly_key_display() {
        let key = AnomalyKey::new("disk_usage", "disk_full");
        assert_eq!(key.to_string(), "disk_usage[disk_full]");
    }

    #[test]
    fn test_transition_accessors() {
        let anomaly = create_test_anomaly();
        let transition = AnomalyTransition::Cleared(anomaly.clone());
        assert_eq!(transition.anomaly(), &anomaly);
        assert_eq!(transition.key(), &anomaly.key);
    }

    #[test]
    fn test_transition_serialization() {
        let transition = AnomalyTransition::Opened(create_test_anomaly());
        let json = serde_json::to_value(&transition).unwrap();
        assert_eq!(json["transition"], "opened");
        assert_eq!(json["anomaly"]["metric_name"], "cpu_usage");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
    }

    #[test]
    fn test_severity_serialization() {
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            "\"critical\""
        );
        assert_eq!(
            serde_json::to_string(&Severity::Warning).unwrap(),
            "\"warning\""
        );
    }
}
