//! Remediation actions and their outcomes
//!
//! `RemediationAction` is a closed set. Every consumer matches it
//! exhaustively, so adding a variant is a compile error at each call site
//! until it is handled.

use crate::events::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Process selector for `kill_process`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessTarget {
    Pid(u32),
    Pattern(String),
}

impl fmt::Display for ProcessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessTarget::Pid(pid) => write!(f, "pid {}", pid),
            ProcessTarget::Pattern(pattern) => write!(f, "pattern '{}'", pattern),
        }
    }
}

/// A single concrete remediation
///
/// Equality covers the full identity (kind and target), which is what retry
/// accounting compares.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemediationAction {
    RestartContainer { name: String },
    RestartService { name: String },
    KillProcess { target: ProcessTarget },
    ClearDisk { path: PathBuf, pattern: String },
    NoAction,
}

/// Target class of an action, used by the operator allow-list
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RestartContainer,
    RestartService,
    KillProcess,
    ClearDisk,
    NoAction,
}

impl RemediationAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            RemediationAction::RestartContainer { .. } => ActionKind::RestartContainer,
            RemediationAction::RestartService { .. } => ActionKind::RestartService,
            RemediationAction::KillProcess { .. } => ActionKind::KillProcess,
            RemediationAction::ClearDisk { .. } => ActionKind::ClearDisk,
            RemediationAction::NoAction => ActionKind::NoAction,
        }
    }

    pub fn is_no_action(&self) -> bool {
        matches!(self, RemediationAction::NoAction)
    }
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemediationAction::RestartContainer { name } => write!(f, "restart_container({})", name),
            RemediationAction::RestartService { name } => write!(f, "restart_service({})", name),
            RemediationAction::KillProcess { target } => write!(f, "kill_process({})", target),
            RemediationAction::ClearDisk { path, pattern } => {
                write!(f, "clear_disk({}, {})", path.display(), pattern)
            }
            RemediationAction::NoAction => f.write_str("no_action"),
        }
    }
}

/// Result of executing one action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionOutcome {
    pub action: RemediationAction,
    pub started_at: Timestamp,
    pub ended_at: Timestamp,
    pub success: bool,
    pub detail: String,
}
