use crate::error::EffectorError;
use crate::monitoring::AgentMonitor;
use crate::remediation::effector::Effector;
use crate::remediation::{ActionOutcome, RemediationAction};
use chrono::Utc;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

/// Runs approved remediation actions against an effector
///
/// Each action maps to exactly one effector call, bounded by
/// `action_timeout`. A timeout counts as failure. Nothing is retried here;
/// repeated failures are handled by the policy's retry budget.
pub struct RemediationExecutor {
    effector: Arc<dyn Effector>,
    action_timeout: Duration,
    monitor: Option<Arc<AgentMonitor>>,
}

impl RemediationExecutor {
    pub fn new(effector: Arc<dyn Effector>, action_timeout: Duration) -> Self {
        Self {
            effector,
            action_timeout,
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<AgentMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Execute one action and report what happened
    pub async fn execute(&self, action: &RemediationAction) -> ActionOutcome {
        let started_at = Utc::now();

        let result = match action {
            RemediationAction::NoAction => Ok("no action taken".to_string()),
            RemediationAction::RestartContainer { name } => {
                self.bounded(self.effector.restart_container(name)).await
            }
            RemediationAction::RestartService { name } => {
                self.bounded(self.effector.restart_service(name)).await
            }
            RemediationAction::KillProcess { target } => {
                self.bounded(self.effector.kill_process(target)).await
            }
            RemediationAction::ClearDisk { path, pattern } => {
                self.bounded(self.effector.clear_disk(path, pattern)).await
            }
        };

        if !action.is_no_action() {
            if let Some(monitor) = &self.monitor {
                monitor.record_action_executed();
            }
        }

        let (success, detail) = match result {
            Ok(detail) => {
                info!("Action {} succeeded: {}", action, detail);
                (true, detail)
            }
            Err(e) => {
                error!("Action {} failed: {}", action, e);
                (false, e.to_string())
            }
        };

        ActionOutcome {
            action: action.clone(),
            started_at,
            ended_at: Utc::now(),
            success,
            detail,
        }
    }

    async fn bounded(
        &self,
        call: crate::remediation::effector::EffectorFuture<'_>,
    ) -> Result<String, EffectorError> {
        match tokio::time::timeout(self.action_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(EffectorError::Timeout(self.action_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remediation::effector::MockEffector;
    use crate::remediation::ProcessTarget;

    fn executor(effector: Arc<MockEffector>, timeout: Duration) -> RemediationExecutor {
        RemediationExecutor::new(effector, timeout)
    }

    #[tokio::test]
    async fn test_each_variant_maps_to_one_call() {
        let effector = Arc::new(MockEffector::new());
        let executor = executor(Arc::clone(&effector), Duration::from_secs(1));

        let actions = vec![
            RemediationAction::RestartContainer {
                name: "web".to_string(),
            },
            RemediationAction::RestartService {
                name: "app".to_string(),
            },
            RemediationAction::KillProcess {
                target: ProcessTarget::Pid(4242),
            },
            RemediationAction::ClearDisk {
                path: "/var/log/app".into(),
                pattern: "*.gz".to_string(),
            },
        ];

        for action in &actions {
            let outcome = executor.execute(action).await;
            assert!(outcome.success);
            assert_eq!(&outcome.action, action);
            assert!(outcome.ended_at >= outcome.started_at);
        }

        assert_eq!(effector.calls(), actions);
    }

    #[tokio::test]
    async fn test_no_action_makes_no_call() {
        let effector = Arc::new(MockEffector::new());
        let monitor = Arc::new(AgentMonitor::new());
        let executor = executor(Arc::clone(&effector), Duration::from_secs(1))
            .with_monitor(Arc::clone(&monitor));

        let outcome = executor.execute(&RemediationAction::NoAction).await;
        assert!(outcome.success);
        assert_eq!(effector.call_count(), 0);
        assert_eq!(monitor.collect_metrics().actions_executed, 0);
    }

    #[tokio::test]
    async fn test_failure_is_reported_with_detail() {
        let effector = Arc::new(MockEffector::failing("unit app.service not found"));
        let executor = executor(Arc::clone(&effector), Duration::from_secs(1));

        let outcome = executor
            .execute(&RemediationAction::RestartService {
                name: "app".to_string(),
            })
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.detail, "unit app.service not found");
        assert_eq!(effector.call_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let effector = Arc::new(MockEffector::new().with_delay(Duration::from_millis(200)));
        let monitor = Arc::new(AgentMonitor::new());
        let executor = executor(Arc::clone(&effector), Duration::from_millis(10))
            .with_monitor(Arc::clone(&monitor));

        let outcome = executor
            .execute(&RemediationAction::RestartContainer {
                name: "web".to_string(),
            })
            .await;
        assert!(!outcome.success);
        assert!(outcome.detail.starts_with("timed out after"));
        assert_eq!(effector.call_count(), 1);
        assert_eq!(monitor.collect_metrics().actions_executed, 1);
    }
}
