//! Effectors: the systems that actually carry out remediation actions

use crate::error::EffectorError;
use crate::remediation::{ProcessTarget, RemediationAction};
use log::{debug, info, warn};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Command;

pub type EffectorFuture<'a> = Pin<Box<dyn Future<Output = Result<String, EffectorError>> + Send + 'a>>;

/// External system able to execute remediation actions
///
/// Each method performs one action and returns a short detail string on
/// success. Callers apply the timeout.
pub trait Effector: Send + Sync {
    fn restart_container<'a>(&'a self, name: &'a str) -> EffectorFuture<'a>;
    fn restart_service<'a>(&'a self, name: &'a str) -> EffectorFuture<'a>;
    fn kill_process<'a>(&'a self, target: &'a ProcessTarget) -> EffectorFuture<'a>;
    fn clear_disk<'a>(&'a self, path: &'a Path, pattern: &'a str) -> EffectorFuture<'a>;
}

/// Process names that are never killed
const PROTECTED_PROCESSES: &[&str] = &["systemd", "kernel", "init", "kthreadd", "sshd"];

/// Directories that are never cleaned, nor anything directly under them
const PROTECTED_DIRECTORIES: &[&str] = &[
    "/", "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/root", "/sbin", "/sys",
    "/usr",
];

/// Container and unit names: alphanumerics plus `_ . - @ :`
fn validate_name(kind: &str, name: &str) -> Result<(), EffectorError> {
    let valid = !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '@' | ':'));
    if valid {
        Ok(())
    } else {
        Err(EffectorError::Refused(format!("invalid {} name '{}'", kind, name)))
    }
}

fn check_process_name(name: &str) -> Result<(), EffectorError> {
    let lowered = name.to_lowercase();
    match PROTECTED_PROCESSES
        .iter()
        .find(|protected| lowered.contains(*protected))
    {
        Some(protected) => Err(EffectorError::Refused(format!(
            "'{}' matches protected process '{}'",
            name, protected
        ))),
        None => Ok(()),
    }
}

/// Check a cleanup target before anything is deleted
///
/// The directory must be absolute, free of `..`, outside the protected
/// system directories, and the pattern must be a plain file-name glob.
fn validate_cleanup_target(path: &Path, pattern: &str) -> Result<(), EffectorError> {
    if !path.is_absolute() {
        return Err(EffectorError::Refused(format!(
            "cleanup path '{}' is not absolute",
            path.display()
        )));
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
    {
        return Err(EffectorError::Refused(format!(
            "cleanup path '{}' contains relative components",
            path.display()
        )));
    }

    let normalized = path.to_string_lossy();
    let normalized = normalized.trim_end_matches('/');
    let normalized = if normalized.is_empty() { "/" } else { normalized };
    if PROTECTED_DIRECTORIES.contains(&normalized) {
        return Err(EffectorError::Refused(format!(
            "cleanup of protected directory '{}'",
            normalized
        )));
    }

    if pattern.trim().is_empty()
        || pattern.contains('/')
        || pattern.contains("..")
        || pattern == "*"
    {
        return Err(EffectorError::Refused(format!(
            "cleanup pattern '{}' must name files, e.g. '*.log.gz'",
            pattern
        )));
    }

    Ok(())
}

/// Delete regular files in `dir` matching `pattern`; returns (files, bytes)
fn remove_matching_files(dir: &Path, pattern: &str) -> Result<(usize, u64), EffectorError> {
    if !dir.is_dir() {
        return Err(EffectorError::Failed(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }

    let full_pattern = dir.join(pattern);
    let full_pattern = full_pattern.to_string_lossy();
    let entries = glob::glob(&full_pattern)
        .map_err(|e| EffectorError::Refused(format!("invalid pattern '{}': {}", pattern, e)))?;

    let mut removed = 0usize;
    let mut freed = 0u64;
    for entry in entries {
        let file: PathBuf = match entry {
            Ok(file) => file,
            Err(e) => {
                warn!("Skipping unreadable cleanup entry: {}", e);
                continue;
            }
        };

        let metadata = match std::fs::symlink_metadata(&file) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Skipping {}: {}", file.display(), e);
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        match std::fs::remove_file(&file) {
            Ok(()) => {
                debug!("Removed {}", file.display());
                removed += 1;
                freed += metadata.len();
            }
            Err(e) => warn!("Failed to remove {}: {}", file.display(), e),
        }
    }

    Ok((removed, freed))
}

/// Effector backed by local commands: docker, systemctl and kill
#[derive(Debug, Default)]
pub struct SystemEffector;

impl SystemEffector {
    pub fn new() -> Self {
        Self
    }

    /// Run a command and return its trimmed stdout, failing on non-zero exit
    async fn run(program: &str, args: &[&str]) -> Result<String, EffectorError> {
        debug!("Running {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EffectorError::Failed(format!("failed to run {}: {}", program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(EffectorError::Failed(format!(
                "{} {} exited with {}: {}",
                program,
                args.join(" "),
                output.status,
                if stderr.is_empty() { stdout } else { stderr }
            )))
        }
    }
}

impl Effector for SystemEffector {
    fn restart_container<'a>(&'a self, name: &'a str) -> EffectorFuture<'a> {
        Box::pin(async move {
            validate_name("container", name)?;
            Self::run("docker", &["restart", name]).await?;

            let running = Self::run("docker", &["inspect", "-f", "{{.State.Running}}", name]).await?;
            if running == "true" {
                info!("Container {} restarted", name);
                Ok(format!("container {} restarted and running", name))
            } else {
                Err(EffectorError::Failed(format!(
                    "container {} not running after restart",
                    name
                )))
            }
        })
    }

    fn restart_service<'a>(&'a self, name: &'a str) -> EffectorFuture<'a> {
        Box::pin(async move {
            validate_name("service", name)?;
            Self::run("systemctl", &["restart", name]).await?;

            match Self::run("systemctl", &["is-active", name]).await {
                Ok(state) if state == "active" => {
                    info!("Service {} restarted", name);
                    Ok(format!("service {} restarted and active", name))
                }
                Ok(state) => Err(EffectorError::Failed(format!(
                    "service {} is {} after restart",
                    name, state
                ))),
                Err(e) => Err(EffectorError::Failed(format!(
                    "service {} not active after restart: {}",
                    name, e
                ))),
            }
        })
    }

    fn kill_process<'a>(&'a self, target: &'a ProcessTarget) -> EffectorFuture<'a> {
        Box::pin(async move {
            match target {
                ProcessTarget::Pid(pid) => {
                    if *pid <= 1 {
                        return Err(EffectorError::Refused(format!("refusing to kill pid {}", pid)));
                    }
                    let pid = pid.to_string();
                    let name = Self::run("ps", &["-p", &pid, "-o", "comm="]).await?;
                    check_process_name(&name)?;
                    Self::run("kill", &["-9", &pid]).await?;
                    info!("Killed process {} ({})", pid, name);
                    Ok(format!("killed pid {} ({})", pid, name))
                }
                ProcessTarget::Pattern(pattern) => {
                    if pattern.trim().is_empty() {
                        return Err(EffectorError::Refused("empty process pattern".to_string()));
                    }
                    check_process_name(pattern)?;
                    Self::run("pkill", &["-9", "-f", pattern.as_str()])
                        .await
                        .map_err(|e| {
                            EffectorError::Failed(format!("no process killed for '{}': {}", pattern, e))
                        })?;
                    info!("Killed processes matching '{}'", pattern);
                    Ok(format!("killed processes matching '{}'", pattern))
                }
            }
        })
    }

    fn clear_disk<'a>(&'a self, path: &'a Path, pattern: &'a str) -> EffectorFuture<'a> {
        Box::pin(async move {
            validate_cleanup_target(path, pattern)?;

            let dir = path.to_path_buf();
            let glob_pattern = pattern.to_string();
            let (removed, freed) =
                tokio::task::spawn_blocking(move || remove_matching_files(&dir, &glob_pattern))
                    .await
                    .map_err(|e| EffectorError::Failed(format!("cleanup task failed: {}", e)))??;

            info!(
                "Removed {} files ({} bytes) matching {} in {}",
                removed,
                freed,
                pattern,
                path.display()
            );
            Ok(format!(
                "removed {} files ({} bytes) matching '{}' in {}",
                removed,
                freed,
                pattern,
                path.display()
            ))
        })
    }
}

/// Effector that records calls instead of touching the system
///
/// Used by tests and by dry runs. Every call is recorded as the action it
/// corresponds to.
#[derive(Debug, Default)]
pub struct MockEffector {
    calls: Arc<Mutex<Vec<RemediationAction>>>,
    failure: Option<String>,
    delay: Option<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockEffector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call with `detail`
    pub fn failing(detail: &str) -> Self {
        Self {
            failure: Some(detail.to_string()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RemediationAction> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    fn record<'a>(&'a self, action: RemediationAction) -> EffectorFuture<'a> {
        Box::pin(async move {
            let description = action.to_string();
            lock(&self.calls).push(action);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            match &self.failure {
                Some(detail) => Err(EffectorError::Failed(detail.clone())),
                None => Ok(format!("{} done", description)),
            }
        })
    }
}

impl Effector for MockEffector {
    fn restart_container<'a>(&'a self, name: &'a str) -> EffectorFuture<'a> {
        self.record(RemediationAction::RestartContainer {
            name: name.to_string(),
        })
    }

    fn restart_service<'a>(&'a self, name: &'a str) -> EffectorFuture<'a> {
        self.record(RemediationAction::RestartService {
            name: name.to_string(),
        })
    }

    fn kill_process<'a>(&'a self, target: &'a ProcessTarget) -> EffectorFuture<'a> {
        self.record(RemediationAction::KillProcess {
            target: target.clone(),
        })
    }

    fn clear_disk<'a>(&'a self, path: &'a Path, pattern: &'a str) -> EffectorFuture<'a> {
        self.record(RemediationAction::ClearDisk {
            path: path.to_path_buf(),
            pattern: pattern.to_string(),
        })
    }
}
