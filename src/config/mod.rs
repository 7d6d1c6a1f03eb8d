/// Configuration management
pub mod settings;

pub use settings::{
    AIBackendConfig, AgentConfig, AlertConfig, Config, DiagnosisConfig, EvidenceCommand,
    EvidenceConfig, ExecutorConfig, LedgerConfig, MetricQuery, PolicyConfig, SourceConfig,
};
