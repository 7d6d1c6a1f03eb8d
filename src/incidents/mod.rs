/// Incident model and the per-key incident registry
pub mod incident;
pub mod registry;

pub use incident::{Incident, IncidentState, StateChange, SELF_RESOLVED, SHUTDOWN};
pub use registry::{DedupOutcome, IgnoreReason, IncidentRegistry, LifecycleError};
