//! Threshold rules evaluated by the anomaly detector
//!
//! Rules are read-only configuration. Each rule compares one metric against a
//! limit and declares how long a violation must persist before it counts as
//! an anomaly.

use crate::error::ConfigError;
use crate::events::{AnomalyKey, Severity};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison applied between an observed value and a rule limit
///
/// The rule is violated when `value <comparator> limit` holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Comparator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessOrEqual,
}

impl Comparator {
    pub fn holds(self, value: f64, limit: f64) -> bool {
        match self {
            Comparator::GreaterThan => value > limit,
            Comparator::GreaterOrEqual => value >= limit,
            Comparator::LessThan => value < limit,
            Comparator::LessOrEqual => value <= limit,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::GreaterThan => ">",
            Comparator::GreaterOrEqual => ">=",
            Comparator::LessThan => "<",
            Comparator::LessOrEqual => "<=",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Longest time window accepted anywhere in configuration (30 days)
pub const MAX_WINDOW_SECONDS: u64 = 30 * 24 * 3600;

fn default_sustained_samples() -> u32 {
    2
}

/// A threshold rule over a single metric
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdRule {
    /// Optional stable name; used as the rule identity in anomaly keys
    #[serde(default)]
    pub name: Option<String>,
    /// Metric the rule applies to
    pub metric_name: String,
    pub comparator: Comparator,
    pub limit: f64,
    /// Consecutive violating samples required before an anomaly opens
    #[serde(default = "default_sustained_samples")]
    pub sustained_samples: u32,
    /// Minimum time between first and latest violating sample, in seconds
    #[serde(default)]
    pub sustained_for_seconds: u64,
    /// Crossing this limit as well marks the anomaly critical
    #[serde(default)]
    pub critical_limit: Option<f64>,
}

impl ThresholdRule {
    /// Create a rule that requires `sustained_samples` consecutive violations
    pub fn new(
        metric_name: impl Into<String>,
        comparator: Comparator,
        limit: f64,
        sustained_samples: u32,
    ) -> Self {
        Self {
            name: None,
            metric_name: metric_name.into(),
            comparator,
            limit,
            sustained_samples,
            sustained_for_seconds: 0,
            critical_limit: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn sustained_for(mut self, seconds: u64) -> Self {
        self.sustained_for_seconds = seconds;
        self
    }

    pub fn with_critical_limit(mut self, critical_limit: f64) -> Self {
        self.critical_limit = Some(critical_limit);
        self
    }

    /// Human-readable description, e.g. `cpu_usage > 80`
    pub fn describe(&self) -> String {
        format!("{} {} {}", self.metric_name, self.comparator, self.limit)
    }

    /// Identity of anomalies raised by this rule
    pub fn key(&self) -> AnomalyKey {
        let rule = self.name.clone().unwrap_or_else(|| self.describe());
        AnomalyKey::new(self.metric_name.clone(), rule)
    }

    pub fn sustain_window(&self) -> Duration {
        Duration::seconds(self.sustained_for_seconds.min(MAX_WINDOW_SECONDS) as i64)
    }

    pub fn is_violated_by(&self, value: f64) -> bool {
        self.comparator.holds(value, self.limit)
    }

    /// Severity of a violating value
    pub fn severity_for(&self, value: f64) -> Severity {
        match self.critical_limit {
            Some(critical) if self.comparator.holds(value, critical) => Severity::Critical,
            _ => Severity::Warning,
        }
    }

    /// Reject rules that are malformed or that a single sample could satisfy
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metric_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "threshold rule metric_name must not be empty".to_string(),
            ));
        }
        if !self.limit.is_finite() {
            return Err(ConfigError::ValidationError(format!(
                "rule '{}' has a non-finite limit",
                self.describe()
            )));
        }
        if let Some(critical) = self.critical_limit {
            if !critical.is_finite() {
                return Err(ConfigError::ValidationError(format!(
                    "rule '{}' has a non-finite critical_limit",
                    self.describe()
                )));
            }
        }
        if self.sustained_for_seconds > MAX_WINDOW_SECONDS {
            return Err(ConfigError::ValidationError(format!(
                "rule '{}' sustained_for_seconds exceeds {}",
                self.describe(),
                MAX_WINDOW_SECONDS
            )));
        }
        if self.sustained_samples < 2 && self.sustained_for_seconds == 0 {
            return Err(ConfigError::ValidationError(format!(
                "rule '{}' would open on a single sample: set sustained_samples >= 2 or sustained_for_seconds > 0",
                self.describe()
            )));
        }
        Ok(())
    }
}
