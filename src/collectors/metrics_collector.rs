use crate::collectors::MetricSource;
use crate::events::Sample;
use crate::monitoring::AgentMonitor;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Periodic sampler feeding the orchestrator
///
/// Pulls from a [`MetricSource`] on a fixed interval and forwards every
/// sample over a channel. A failed pull is logged and counted, and the tick
/// is skipped.
pub struct MetricsCollector {
    source: Arc<dyn MetricSource>,
    interval: Duration,
    monitor: Option<Arc<AgentMonitor>>,
}

impl MetricsCollector {
    pub fn new(source: Arc<dyn MetricSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<AgentMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Pull once; `None` when the source failed
    pub async fn collect_once(&self) -> Option<Vec<Sample>> {
        match self.source.pull().await {
            Ok(samples) => {
                debug!("Pulled {} samples from {}", samples.len(), self.source.name());
                Some(samples)
            }
            Err(e) => {
                warn!("Skipping sampling tick, {} failed: {}", self.source.name(), e);
                if let Some(monitor) = &self.monitor {
                    monitor.record_source_failure();
                }
                None
            }
        }
    }

    /// Pull once at startup and log whether the source answers
    ///
    /// The readings are returned so they can be fed to the detector like any
    /// other tick.
    pub async fn health_check(&self) -> Option<Vec<Sample>> {
        match self.source.pull().await {
            Ok(samples) => {
                info!(
                    "Metric source {} is healthy ({} metrics available)",
                    self.source.name(),
                    samples.len()
                );
                Some(samples)
            }
            Err(e) => {
                error!(
                    "Metric source {} failed its health check: {}",
                    self.source.name(),
                    e
                );
                None
            }
        }
    }

    /// Run the sampling loop on its own task
    ///
    /// The task ends when `shutdown` flips to `true` (or its sender is
    /// dropped) or when the receiving side of `samples` is gone.
    pub fn spawn(
        self,
        samples: mpsc::Sender<Sample>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Sampling {} every {:?}",
                self.source.name(),
                self.interval
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                if *shutdown.borrow() {
                    break;
                }

                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }

                let Some(batch) = self.collect_once().await else {
                    continue;
                };
                for sample in batch {
                    if samples.send(sample).await.is_err() {
                        debug!("Sample receiver dropped, stopping sampler");
                        return;
                    }
                }
            }

            info!("Sampler stopped");
        })
    }
}
