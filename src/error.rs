use thiserror::Error;

/// Errors raised by a metric source when a sampling tick cannot be served
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("Metric source unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to parse metric response: {0}")]
    ParseError(String),
}

/// Errors that make a diagnosis unavailable
///
/// The `Display` output of each variant is the short reason recorded in the
/// incident outcome (`diagnosis failed: <reason>`).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiagnosisError {
    #[error("timeout")]
    Timeout,

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("backend error: {0}")]
    BackendError(String),

    #[error("malformed response: {0}")]
    InvalidResponse(String),

    #[error("http error: {0}")]
    HttpError(String),
}

/// Errors reported by an effector while running a remediation action
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EffectorError {
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("{0}")]
    Failed(String),

    #[error("refused: {0}")]
    Refused(String),
}

/// Errors that can occur while persisting or reading incident history
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger write failed: {0}")]
    WriteFailed(String),

    #[error("Ledger query failed: {0}")]
    QueryFailed(String),

    #[error("Ledger write retries exhausted after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Errors that can occur when sending alerts
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Failed to send notification: {0}")]
    NotificationFailed(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Errors that stop the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Incident history could not be persisted: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal channel closed unexpectedly")]
    ChannelClosed,

    #[error("Agent task failed: {0}")]
    TaskFailed(String),
}
