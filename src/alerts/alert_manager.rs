use crate::alerts::{Alert, Notifier, RateLimiter};
use crate::config::AlertConfig;
use crate::monitoring::AgentMonitor;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Sending half handed to the orchestrator and lifecycle tasks
pub type AlertSender = mpsc::UnboundedSender<Alert>;

/// How often queued alerts are retried while no new alerts arrive
const QUEUE_TICK: Duration = Duration::from_secs(5);

/// Delivers alerts to every configured notifier
///
/// Delivery is rate limited; alerts over the limit wait in a bounded queue.
/// A full queue sheds its oldest routine alert first and only drops an
/// attention-worthy one when nothing else is left. Notifier failures are
/// logged and counted and never reach the sender.
pub struct AlertManager {
    notifiers: Vec<Arc<dyn Notifier>>,
    rate_limiter: RateLimiter,
    alert_queue: VecDeque<Alert>,
    max_queue_size: usize,
    monitor: Option<Arc<AgentMonitor>>,
}

impl AlertManager {
    pub fn new(config: &AlertConfig, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self {
            notifiers,
            rate_limiter: RateLimiter::per_minute(config.rate_limit_per_minute),
            alert_queue: VecDeque::new(),
            max_queue_size: config.max_queue_size,
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<AgentMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Deliver an alert now, or queue it if the rate limit is reached
    pub async fn send_alert(&mut self, alert: Alert) {
        self.process_queue().await;

        if self.alert_queue.is_empty() && self.rate_limiter.can_send() {
            self.deliver(&alert).await;
        } else {
            debug!("Queued alert due to rate limit: {}", alert.summary());
            self.queue_alert(alert);
        }
    }

    /// Deliver queued alerts while the rate limit allows
    ///
    /// Returns the number of alerts delivered.
    pub async fn process_queue(&mut self) -> usize {
        let mut processed = 0;
        while !self.alert_queue.is_empty() && self.rate_limiter.can_send() {
            if let Some(alert) = self.alert_queue.pop_front() {
                self.deliver(&alert).await;
                processed += 1;
            }
        }

        if processed > 0 {
            info!("Delivered {} queued alerts", processed);
        }
        processed
    }

    /// Deliver everything still queued, ignoring the rate limit
    pub async fn flush(&mut self) -> usize {
        let mut flushed = 0;
        while let Some(alert) = self.alert_queue.pop_front() {
            self.deliver(&alert).await;
            flushed += 1;
        }
        flushed
    }

    pub fn queued_alert_count(&self) -> usize {
        self.alert_queue.len()
    }

    /// Consume alerts until every sender is dropped, then flush the queue
    pub async fn run(mut self, mut alerts: mpsc::UnboundedReceiver<Alert>) {
        let mut tick = tokio::time::interval(QUEUE_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = alerts.recv() => match received {
                    Some(alert) => self.send_alert(alert).await,
                    None => break,
                },
                _ = tick.tick() => {
                    self.process_queue().await;
                }
            }
        }

        let flushed = self.flush().await;
        if flushed > 0 {
            info!("Flushed {} queued alerts on shutdown", flushed);
        }
        debug!("Alert manager stopped");
    }

    fn queue_alert(&mut self, alert: Alert) {
        if self.alert_queue.len() >= self.max_queue_size {
            let victim = self
                .alert_queue
                .iter()
                .position(|queued| !queued.needs_attention())
                .unwrap_or(0);
            if let Some(dropped) = self.alert_queue.remove(victim) {
                warn!("Alert queue full, dropping alert: {}", dropped.summary());
            }
        }
        self.alert_queue.push_back(alert);
    }

    async fn deliver(&mut self, alert: &Alert) {
        self.rate_limiter.record();

        for notifier in &self.notifiers {
            let result = notifier.notify(alert).await;
            if let Some(monitor) = &self.monitor {
                monitor.record_notification_result(result.is_ok());
            }
            if let Err(e) = result {
                error!("Notifier {} failed: {}", notifier.name(), e);
            }
        }
    }
}
