/// Error types for the agent
pub mod error;

/// Samples, anomaly keys and detector transitions
pub mod events;

/// Bounded retry with exponential backoff
pub mod retry;

/// Self-monitoring of the agent
pub mod monitoring;

/// Configuration management
pub mod config;

/// Metric sources and the periodic sampler
pub mod collectors;

/// Rolling per-metric sample history
pub mod aggregator;

/// Threshold rules and anomaly detection
pub mod detector;

/// Incident model and the live incident registry
pub mod incidents;

/// Diagnosis through reasoning providers
pub mod ai;

/// Remediation policy, executor and effectors
pub mod remediation;

/// Durable incident history
pub mod ledger;

/// Operator notifications
pub mod alerts;

/// The control loop binding everything together
pub mod orchestrator;

// Re-export commonly used types
pub use error::{AgentError, AlertError, ConfigError, DiagnosisError, EffectorError, LedgerError, SourceError};
pub use orchestrator::{Collaborators, Orchestrator};
