//! Host evidence handed to the reasoning provider alongside the metrics
//!
//! Gathering never fails as a whole: a command that cannot run contributes
//! a section saying so, and every section is cut down to the configured
//! size before it reaches a prompt.

use crate::config::{EvidenceCommand, EvidenceConfig};
use crate::events::Anomaly;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinSet;

pub const TRUNCATED_MARKER: &str = "[truncated]";

/// Output of one diagnostic command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceSection {
    pub source: String,
    pub text: String,
}

impl EvidenceSection {
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
        }
    }
}

pub type EvidenceFuture<'a> = Pin<Box<dyn Future<Output = Vec<EvidenceSection>> + Send + 'a>>;

pub trait EvidenceSource: Send + Sync {
    fn gather<'a>(&'a self, anomaly: &'a Anomaly) -> EvidenceFuture<'a>;

    fn name(&self) -> &str;
}

/// Cut `text` down to `max_lines` lines and `max_chars` characters
///
/// Keeps the end of the text when `keep_tail` is set, the start otherwise,
/// and marks the cut side with [`TRUNCATED_MARKER`].
pub fn bound_output(text: &str, max_lines: usize, max_chars: usize, keep_tail: bool) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let mut truncated = lines.len() > max_lines;
    let kept = if keep_tail {
        &lines[lines.len().saturating_sub(max_lines)..]
    } else {
        &lines[..lines.len().min(max_lines)]
    };

    let mut bounded = kept.join("\n");
    let chars = bounded.chars().count();
    if chars > max_chars {
        truncated = true;
        bounded = if keep_tail {
            bounded.chars().skip(chars - max_chars).collect()
        } else {
            bounded.chars().take(max_chars).collect()
        };
    }

    match (truncated, keep_tail) {
        (false, _) => bounded,
        (true, true) => format!("{}\n{}", TRUNCATED_MARKER, bounded),
        (true, false) => format!("{}\n{}", bounded, TRUNCATED_MARKER),
    }
}

/// Run one command with a timeout, killing it if the timeout fires
///
/// Returns stdout, or stdout and stderr together when `merge_stderr` is set.
async fn capture(
    program: &str,
    args: &[String],
    timeout: Duration,
    merge_stderr: bool,
) -> Result<String, String> {
    debug!("Collecting evidence: {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, output).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(format!("failed to run {}: {}", program, e)),
        Err(_) => return Err(format!("{} timed out after {:?}", program, timeout)),
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !output.status.success() {
        return Err(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        ));
    }

    if merge_stderr && !stderr.trim().is_empty() {
        Ok(format!("{}{}", stdout, stderr))
    } else {
        Ok(stdout)
    }
}

/// Runs the configured diagnostic commands on the local host
///
/// Commands run concurrently, each under `command_timeout`. With
/// `docker_logs` on, the logs of up to `max_containers` running containers
/// are collected afterwards.
pub struct CommandEvidence {
    config: EvidenceConfig,
}

impl CommandEvidence {
    pub fn new(config: EvidenceConfig) -> Self {
        Self { config }
    }

    fn bound(&self, text: &str, keep_tail: bool) -> String {
        bound_output(
            text,
            self.config.max_lines,
            self.config.max_chars_per_source,
            keep_tail,
        )
    }

    async fn run_commands(&self) -> Vec<EvidenceSection> {
        let timeout = self.config.command_timeout();
        let mut tasks = JoinSet::new();
        for (index, command) in self.config.commands.iter().cloned().enumerate() {
            tasks.spawn(async move {
                let result = capture(&command.program, &command.args, timeout, false).await;
                (index, command, result)
            });
        }

        let mut collected: Vec<(usize, EvidenceCommand, Result<String, String>)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => collected.push(entry),
                Err(e) => warn!("Evidence task ended abnormally: {}", e),
            }
        }
        collected.sort_by_key(|(index, _, _)| *index);

        collected
            .into_iter()
            .map(|(_, command, result)| match result {
                Ok(output) => EvidenceSection::new(command.name, self.bound(&output, command.tail)),
                Err(reason) => {
                    debug!("Evidence {} unavailable: {}", command.name, reason);
                    EvidenceSection::new(command.name, format!("unavailable: {}", reason))
                }
            })
            .collect()
    }

    async fn container_logs(&self) -> Vec<EvidenceSection> {
        let timeout = self.config.command_timeout();
        let listing = capture(
            "docker",
            &["ps".to_string(), "--format".to_string(), "{{.Names}}".to_string()],
            timeout,
            false,
        )
        .await;

        let names: Vec<String> = match listing {
            Ok(listing) => listing
                .lines()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .take(self.config.max_containers)
                .map(str::to_string)
                .collect(),
            Err(reason) => {
                debug!("Skipping container logs: {}", reason);
                return Vec::new();
            }
        };

        let mut tasks = JoinSet::new();
        for (index, name) in names.into_iter().enumerate() {
            let args = vec![
                "logs".to_string(),
                "--since".to_string(),
                self.config.docker_log_since.clone(),
                "--tail".to_string(),
                self.config.max_lines.to_string(),
                name.clone(),
            ];
            tasks.spawn(async move {
                let result = capture("docker", &args, timeout, true).await;
                (index, name, result)
            });
        }

        let mut collected = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => collected.push(entry),
                Err(e) => warn!("Container log task ended abnormally: {}", e),
            }
        }
        collected.sort_by_key(|(index, _, _)| *index);

        collected
            .into_iter()
            .map(|(_, name, result)| {
                let text = match result {
                    Ok(output) => self.bound(&output, true),
                    Err(reason) => format!("unavailable: {}", reason),
                };
                EvidenceSection::new(format!("docker logs {}", name), text)
            })
            .collect()
    }
}

impl EvidenceSource for CommandEvidence {
    fn gather<'a>(&'a self, anomaly: &'a Anomaly) -> EvidenceFuture<'a> {
        Box::pin(async move {
            if !self.config.enabled {
                return Vec::new();
            }

            let mut sections = self.run_commands().await;
            if self.config.docker_logs {
                sections.extend(self.container_logs().await);
            }
            debug!(
                "Collected {} evidence sections for {}",
                sections.len(),
                anomaly.key
            );
            sections
        })
    }

    fn name(&self) -> &str {
        "commands"
    }
}

/// Evidence source returning fixed sections
#[derive(Debug, Default)]
pub struct MockEvidence {
    sections: Vec<EvidenceSection>,
    calls: AtomicUsize,
}

impl MockEvidence {
    pub fn new(sections: Vec<EvidenceSection>) -> Self {
        Self {
            sections,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EvidenceSource for MockEvidence {
    fn gather<'a>(&'a self, _anomaly: &'a Anomaly) -> EvidenceFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sections.clone()
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
