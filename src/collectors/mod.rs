/// Metric sources, the periodic sampler and host evidence
pub mod evidence;
pub mod metrics_collector;
pub mod prometheus;
pub mod source;

pub use evidence::{
    CommandEvidence, EvidenceFuture, EvidenceSection, EvidenceSource, MockEvidence,
};
pub use metrics_collector::MetricsCollector;
pub use prometheus::PrometheusSource;
pub use source::{MetricSource, ScriptedSource, SourceFuture};
