use crate::detector::rules::MAX_WINDOW_SECONDS;
use crate::detector::{Comparator, ThresholdRule};
use crate::error::ConfigError;
use crate::remediation::ActionKind;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete agent configuration
///
/// Immutable once loaded; each component receives the section it needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub source: SourceConfig,
    pub rules: Vec<ThresholdRule>,
    pub policy: PolicyConfig,
    pub diagnosis: DiagnosisConfig,
    pub executor: ExecutorConfig,
    pub evidence: EvidenceConfig,
    pub ledger: LedgerConfig,
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Seconds between metric source pulls
    pub sample_interval_seconds: u64,
    /// Seconds an opened incident waits before diagnosis starts, giving a
    /// transient anomaly the chance to self-resolve
    pub settle_seconds: u64,
    /// Upper bound on one incident lifecycle before the watchdog fails it
    pub lifecycle_deadline_seconds: u64,
    /// Time in-flight lifecycles get to finish on shutdown
    pub shutdown_grace_seconds: u64,
    /// Seconds a key stays closed after an incident ends other than by
    /// self-resolution
    pub reopen_cooldown_seconds: u64,
    /// Samples kept per metric for diagnosis context
    pub history_window: usize,
    /// Seconds between self-monitoring summaries
    pub monitor_interval_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sample_interval_seconds: 60,
            settle_seconds: 0,
            lifecycle_deadline_seconds: 600,
            shutdown_grace_seconds: 30,
            reopen_cooldown_seconds: 900,
            history_window: 120,
            monitor_interval_seconds: 300,
        }
    }
}

/// One Prometheus instant query producing one metric
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricQuery {
    pub metric_name: String,
    pub query: String,
    #[serde(default)]
    pub unit: String,
}

impl MetricQuery {
    pub fn new(metric_name: &str, query: &str, unit: &str) -> Self {
        Self {
            metric_name: metric_name.to_string(),
            query: query.to_string(),
            unit: unit.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    pub prometheus_url: String,
    pub query_timeout_seconds: u64,
    pub queries: Vec<MetricQuery>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            prometheus_url: "http://localhost:9090".to_string(),
            query_timeout_seconds: 10,
            queries: vec![
                MetricQuery::new(
                    "cpu_usage",
                    r#"100 - (avg(rate(node_cpu_seconds_total{mode="idle"}[5m])) * 100)"#,
                    "%",
                ),
                MetricQuery::new(
                    "memory_usage",
                    "(1 - (node_memory_MemAvailable_bytes / node_memory_MemTotal_bytes)) * 100",
                    "%",
                ),
                MetricQuery::new(
                    "disk_usage",
                    r#"max((1 - (node_filesystem_avail_bytes{fstype!="tmpfs"} / node_filesystem_size_bytes{fstype!="tmpfs"})) * 100)"#,
                    "%",
                ),
                MetricQuery::new(
                    "network_bytes",
                    r#"sum(rate(node_network_receive_bytes_total{device!="lo"}[5m]) + rate(node_network_transmit_bytes_total{device!="lo"}[5m]))"#,
                    "B/s",
                ),
            ],
        }
    }
}

fn default_rules() -> Vec<ThresholdRule> {
    vec![
        ThresholdRule::new("cpu_usage", Comparator::GreaterThan, 80.0, 2).with_critical_limit(95.0),
        ThresholdRule::new("memory_usage", Comparator::GreaterThan, 85.0, 2)
            .with_critical_limit(95.0),
        ThresholdRule::new("disk_usage", Comparator::GreaterThan, 90.0, 2)
            .with_critical_limit(97.0),
        ThresholdRule::new("network_bytes", Comparator::GreaterThan, 1_000_000.0, 3),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    pub auto_remediation: bool,
    /// Diagnoses below this confidence never trigger an action
    pub minimum_confidence: f64,
    /// Failures of the same action on the same key before it is withheld
    pub max_retry_count: u32,
    pub lookback_seconds: u64,
    /// Action kinds that may run; anything absent is denied
    pub allow_list: Vec<ActionKind>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            auto_remediation: true,
            minimum_confidence: 0.6,
            max_retry_count: 2,
            lookback_seconds: 3600,
            allow_list: vec![
                ActionKind::RestartContainer,
                ActionKind::RestartService,
                ActionKind::ClearDisk,
            ],
        }
    }
}

impl PolicyConfig {
    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lookback_seconds.min(MAX_WINDOW_SECONDS) as i64)
    }
}

/// Reasoning provider selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum AIBackendConfig {
    Ollama {
        endpoint: String,
        model: String,
    },
    /// Any OpenAI-compatible chat completion API
    OpenAI {
        /// Inline key; prefer `api_key_env`
        #[serde(default)]
        api_key: Option<String>,
        /// Environment variable holding the key
        #[serde(default)]
        api_key_env: Option<String>,
        model: String,
        #[serde(default)]
        base_url: Option<String>,
    },
    /// Scripted provider that never suggests an action
    Mock,
}

impl Default for AIBackendConfig {
    fn default() -> Self {
        AIBackendConfig::Ollama {
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiagnosisConfig {
    pub backend: AIBackendConfig,
    pub call_timeout_seconds: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_seconds: u64,
    pub deadline_seconds: u64,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            backend: AIBackendConfig::default(),
            call_timeout_seconds: 60,
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_seconds: 30,
            deadline_seconds: 300,
        }
    }
}

impl DiagnosisConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_seconds),
            deadline: Some(Duration::from_secs(self.deadline_seconds)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub action_timeout_seconds: u64,
    /// Re-check the metric after a successful action
    pub verify_remediation: bool,
    /// Seconds to wait before that re-check
    pub verify_after_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            action_timeout_seconds: 60,
            verify_remediation: true,
            verify_after_seconds: 30,
        }
    }
}

impl ExecutorConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_seconds)
    }

    pub fn verify_after(&self) -> Duration {
        Duration::from_secs(self.verify_after_seconds)
    }
}

/// One diagnostic command whose output is handed to the reasoning provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceCommand {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Keep the last lines of long output instead of the first
    #[serde(default)]
    pub tail: bool,
}

impl EvidenceCommand {
    pub fn new(name: &str, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            tail: false,
        }
    }

    pub fn keeping_tail(mut self) -> Self {
        self.tail = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvidenceConfig {
    pub enabled: bool,
    pub command_timeout_seconds: u64,
    /// Output kept per command, counted in characters
    pub max_chars_per_source: usize,
    /// Trailing lines kept per command
    pub max_lines: usize,
    pub commands: Vec<EvidenceCommand>,
    /// Attach recent logs of running containers
    pub docker_logs: bool,
    pub max_containers: usize,
    pub docker_log_since: String,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command_timeout_seconds: 5,
            max_chars_per_source: 4000,
            max_lines: 50,
            commands: vec![
                EvidenceCommand::new(
                    "journal",
                    "journalctl",
                    &["--since", "10 minutes ago", "--no-pager", "--priority", "warning"],
                )
                .keeping_tail(),
                EvidenceCommand::new("top processes", "ps", &["aux", "--sort=-%cpu"]),
            ],
            docker_logs: true,
            max_containers: 5,
            docker_log_since: "10m".to_string(),
        }
    }
}

impl EvidenceConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    /// Worst case for one gathering: the configured commands, then the
    /// container listing, then the container logs, each phase bounded by
    /// one command timeout
    pub fn budget(&self) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let phases = if self.docker_logs { 3 } else { 1 };
        self.command_timeout() * phases
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: PathBuf,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_seconds: u64,
    pub deadline_seconds: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("incidents.jsonl"),
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_seconds: 5,
            deadline_seconds: 30,
        }
    }
}

impl LedgerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_seconds),
            deadline: Some(Duration::from_secs(self.deadline_seconds)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlertConfig {
    pub rate_limit_per_minute: usize,
    pub max_queue_size: usize,
    /// JSON webhook receiving every notification
    pub webhook_url: Option<String>,
    pub webhook_timeout_seconds: u64,
    /// Slack bot token; `SLACK_BOT_TOKEN` is used when unset
    pub slack_token: Option<String>,
    pub slack_channel: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 60,
            max_queue_size: 100,
            webhook_url: None,
            webhook_timeout_seconds: 10,
            slack_token: None,
            slack_channel: "#alerts".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            source: SourceConfig::default(),
            rules: default_rules(),
            policy: PolicyConfig::default(),
            diagnosis: DiagnosisConfig::default(),
            executor: ExecutorConfig::default(),
            evidence: EvidenceConfig::default(),
            ledger: LedgerConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    ///
    /// # Errors
    ///
    /// `ReadError` when the file cannot be read, `ParseError` for invalid
    /// TOML, `ValidationError` for values out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.agent.sample_interval_seconds == 0 {
            return invalid("agent.sample_interval_seconds must be greater than 0".to_string());
        }
        if self.agent.lifecycle_deadline_seconds == 0 {
            return invalid("agent.lifecycle_deadline_seconds must be greater than 0".to_string());
        }
        if self.agent.reopen_cooldown_seconds > MAX_WINDOW_SECONDS {
            return invalid(format!(
                "agent.reopen_cooldown_seconds must not exceed {}",
                MAX_WINDOW_SECONDS
            ));
        }
        if self.agent.history_window == 0 {
            return invalid("agent.history_window must be greater than 0".to_string());
        }
        if self.agent.monitor_interval_seconds == 0 {
            return invalid("agent.monitor_interval_seconds must be greater than 0".to_string());
        }

        if self.source.prometheus_url.trim().is_empty() {
            return invalid("source.prometheus_url must not be empty".to_string());
        }
        if self.source.queries.is_empty() {
            return invalid("source.queries must contain at least one query".to_string());
        }

        if self.rules.is_empty() {
            return invalid("at least one rule is required".to_string());
        }
        let mut keys = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !keys.insert(rule.key()) {
                return invalid(format!("duplicate rule '{}'", rule.key()));
            }
        }

        let confidence = self.policy.minimum_confidence;
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return invalid(format!(
                "policy.minimum_confidence must be within [0, 1], got {}",
                confidence
            ));
        }
        if self.policy.lookback_seconds > MAX_WINDOW_SECONDS {
            return invalid(format!(
                "policy.lookback_seconds must not exceed {}",
                MAX_WINDOW_SECONDS
            ));
        }
        if self.policy.max_retry_count == 0 {
            return invalid("policy.max_retry_count must be greater than 0".to_string());
        }

        if self.diagnosis.call_timeout_seconds == 0 {
            return invalid("diagnosis.call_timeout_seconds must be greater than 0".to_string());
        }
        if self.diagnosis.max_attempts == 0 {
            return invalid("diagnosis.max_attempts must be greater than 0".to_string());
        }
        match &self.diagnosis.backend {
            AIBackendConfig::Ollama { endpoint, model } => {
                if endpoint.trim().is_empty() || model.trim().is_empty() {
                    return invalid("ollama backend needs an endpoint and a model".to_string());
                }
            }
            AIBackendConfig::OpenAI { model, .. } => {
                if model.trim().is_empty() {
                    return invalid("openai backend needs a model".to_string());
                }
            }
            AIBackendConfig::Mock => {}
        }

        if self.executor.action_timeout_seconds == 0 {
            return invalid("executor.action_timeout_seconds must be greater than 0".to_string());
        }

        if self.evidence.enabled {
            if self.evidence.command_timeout_seconds == 0 {
                return invalid("evidence.command_timeout_seconds must be greater than 0".to_string());
            }
            if self.evidence.max_chars_per_source == 0 || self.evidence.max_lines == 0 {
                return invalid("evidence output limits must be greater than 0".to_string());
            }
            for command in &self.evidence.commands {
                if command.name.trim().is_empty() || command.program.trim().is_empty() {
                    return invalid("evidence commands need a name and a program".to_string());
                }
            }
        }

        // An incident aborted mid-action is charged to the retry budget, but
        // the watchdog should never be what cuts a well-behaved lifecycle short.
        let budget = self.lifecycle_budget();
        if Duration::from_secs(self.agent.lifecycle_deadline_seconds) < budget {
            return invalid(format!(
                "agent.lifecycle_deadline_seconds must be at least {} (settle, evidence, diagnosis deadline and call timeout, action timeout and verification)",
                budget.as_secs()
            ));
        }

        if self.ledger.max_attempts == 0 {
            return invalid("ledger.max_attempts must be greater than 0".to_string());
        }
        if self.ledger.path.as_os_str().is_empty() {
            return invalid("ledger.path must not be empty".to_string());
        }

        if self.alerts.rate_limit_per_minute == 0 {
            return invalid("alerts.rate_limit_per_minute must be greater than 0".to_string());
        }
        if self.alerts.max_queue_size == 0 {
            return invalid("alerts.max_queue_size must be greater than 0".to_string());
        }
        if self.alerts.slack_channel.trim().is_empty() {
            return invalid("alerts.slack_channel must not be empty".to_string());
        }

        Ok(())
    }

    /// Longest a lifecycle can legitimately take with every stage running
    /// into its own bound
    pub fn lifecycle_budget(&self) -> Duration {
        let verification = if self.executor.verify_remediation {
            self.executor.verify_after() + Duration::from_secs(self.source.query_timeout_seconds)
        } else {
            Duration::ZERO
        };
        Duration::from_secs(self.agent.settle_seconds)
            + self.evidence.budget()
            + Duration::from_secs(self.diagnosis.deadline_seconds)
            + self.diagnosis.call_timeout()
            + self.executor.action_timeout()
            + verification
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.agent.sample_interval_seconds)
    }

    pub fn reopen_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.agent.reopen_cooldown_seconds.min(MAX_WINDOW_SECONDS) as i64)
    }
}
