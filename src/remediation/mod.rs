/// Remediation actions, policy, executor and effectors
pub mod action;
pub mod effector;
pub mod executor;
pub mod policy;
pub mod verify;

pub use action::{ActionKind, ActionOutcome, ProcessTarget, RemediationAction};
pub use effector::{Effector, MockEffector, SystemEffector};
pub use executor::RemediationExecutor;
pub use policy::{Decision, PolicyVerdict, RemediationPolicy};
pub use verify::{RemediationVerifier, Verification};
