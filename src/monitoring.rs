//! Self-monitoring for the agent
//!
//! Tracks how the agent itself is doing: samples processed, metric source
//! failures, incident outcomes, diagnosis latency and notification delivery.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Point-in-time view of the agent's own health
#[derive(Debug, Clone)]
pub struct AgentMetrics {
    pub samples_processed: u64,
    pub source_failures: u64,
    pub incidents_opened: u64,
    pub incidents_resolved: u64,
    pub incidents_failed: u64,
    pub incidents_suppressed: u64,
    pub actions_executed: u64,
    /// Average diagnosis latency in milliseconds over recent calls
    pub avg_diagnosis_latency_ms: f64,
    pub successful_notifications_per_minute: u64,
    pub failed_notifications_per_minute: u64,
    /// Notification success rate as a percentage (0-100)
    pub notification_success_rate: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct NotificationResult {
    success: bool,
    timestamp: DateTime<Utc>,
}

/// Shared counters and rolling windows describing agent health
#[derive(Debug)]
pub struct AgentMonitor {
    samples_processed: AtomicU64,
    source_failures: AtomicU64,
    incidents_opened: AtomicU64,
    incidents_resolved: AtomicU64,
    incidents_failed: AtomicU64,
    incidents_suppressed: AtomicU64,
    actions_executed: AtomicU64,
    /// Recent diagnosis latencies (last 100 calls)
    diagnosis_latencies: Mutex<VecDeque<Duration>>,
    /// Recent notification results (last 1000 notifications)
    notification_results: Mutex<VecDeque<NotificationResult>>,
    max_latency_samples: usize,
    max_notification_samples: usize,
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AgentMonitor {
    pub fn new() -> Self {
        Self {
            samples_processed: AtomicU64::new(0),
            source_failures: AtomicU64::new(0),
            incidents_opened: AtomicU64::new(0),
            incidents_resolved: AtomicU64::new(0),
            incidents_failed: AtomicU64::new(0),
            incidents_suppressed: AtomicU64::new(0),
            actions_executed: AtomicU64::new(0),
            diagnosis_latencies: Mutex::new(VecDeque::new()),
            notification_results: Mutex::new(VecDeque::new()),
            max_latency_samples: 100,
            max_notification_samples: 1000,
        }
    }

    pub fn record_samples_processed(&self, count: u64) {
        self.samples_processed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_source_failure(&self) {
        self.source_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_incident_opened(&self) {
        self.incidents_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a terminal incident
    pub fn record_incident_closed(&self, failed: bool, suppressed: bool) {
        if failed {
            self.incidents_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.incidents_resolved.fetch_add(1, Ordering::Relaxed);
        }
        if suppressed {
            self.incidents_suppressed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_action_executed(&self) {
        self.actions_executed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the latency of one diagnosis provider call
    pub fn record_diagnosis_latency(&self, duration: Duration) {
        debug!("Recording diagnosis latency: {:?}", duration);

        let mut latencies = lock(&self.diagnosis_latencies);
        latencies.push_back(duration);
        while latencies.len() > self.max_latency_samples {
            latencies.pop_front();
        }
    }

    /// Record the result of a notification delivery attempt
    pub fn record_notification_result(&self, success: bool) {
        let mut results = lock(&self.notification_results);
        results.push_back(NotificationResult {
            success,
            timestamp: Utc::now(),
        });
        while results.len() > self.max_notification_samples {
            results.pop_front();
        }
    }

    fn calculate_avg_diagnosis_latency(&self) -> f64 {
        let latencies = lock(&self.diagnosis_latencies);
        if latencies.is_empty() {
            return 0.0;
        }
        let total_ms: f64 = latencies.iter().map(|d| d.as_millis() as f64).sum();
        total_ms / latencies.len() as f64
    }

    fn calculate_notification_success_rate(&self) -> (u64, u64, f64) {
        let one_minute_ago = Utc::now() - chrono::Duration::minutes(1);
        let results = lock(&self.notification_results);

        let recent: Vec<_> = results
            .iter()
            .filter(|result| result.timestamp >= one_minute_ago)
            .collect();

        if recent.is_empty() {
            return (0, 0, 100.0);
        }

        let successful = recent.iter().filter(|r| r.success).count() as u64;
        let failed = recent.len() as u64 - successful;
        let success_rate = (successful as f64 / recent.len() as f64) * 100.0;

        (successful, failed, success_rate)
    }

    /// Snapshot of the current metrics
    pub fn collect_metrics(&self) -> AgentMetrics {
        let (successful, failed, success_rate) = self.calculate_notification_success_rate();

        AgentMetrics {
            samples_processed: self.samples_processed.load(Ordering::Relaxed),
            source_failures: self.source_failures.load(Ordering::Relaxed),
            incidents_opened: self.incidents_opened.load(Ordering::Relaxed),
            incidents_resolved: self.incidents_resolved.load(Ordering::Relaxed),
            incidents_failed: self.incidents_failed.load(Ordering::Relaxed),
            incidents_suppressed: self.incidents_suppressed.load(Ordering::Relaxed),
            actions_executed: self.actions_executed.load(Ordering::Relaxed),
            avg_diagnosis_latency_ms: self.calculate_avg_diagnosis_latency(),
            successful_notifications_per_minute: successful,
            failed_notifications_per_minute: failed,
            notification_success_rate: success_rate,
            timestamp: Utc::now(),
        }
    }

    /// Log a one-line summary and warn about anything that looks unhealthy
    pub fn log_summary(&self) -> AgentMetrics {
        let metrics = self.collect_metrics();

        info!(
            "Agent metrics: samples={}, source_failures={}, incidents opened={} resolved={} failed={} suppressed={}, actions={}, diagnosis_latency={:.1}ms, notification_success={:.1}%",
            metrics.samples_processed,
            metrics.source_failures,
            metrics.incidents_opened,
            metrics.incidents_resolved,
            metrics.incidents_failed,
            metrics.incidents_suppressed,
            metrics.actions_executed,
            metrics.avg_diagnosis_latency_ms,
            metrics.notification_success_rate
        );

        if metrics.avg_diagnosis_latency_ms > 30000.0 {
            warn!(
                "High diagnosis latency detected: {:.1}ms",
                metrics.avg_diagnosis_latency_ms
            );
        }

        if metrics.notification_success_rate < 90.0
            && (metrics.successful_notifications_per_minute
                + metrics.failed_notifications_per_minute)
                > 0
        {
            warn!(
                "Low notification success rate: {:.1}%",
                metrics.notification_success_rate
            );
        }

        metrics
    }
}

/// Measures one diagnosis call and records it on `finish`
pub struct DiagnosisTimer {
    start_time: Instant,
    monitor: Arc<AgentMonitor>,
}

impl DiagnosisTimer {
    pub fn start(monitor: Arc<AgentMonitor>) -> Self {
        Self {
            start_time: Instant::now(),
            monitor,
        }
    }

    pub fn finish(self) {
        self.monitor
            .record_diagnosis_latency(self.start_time.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_monitor_starts_empty() {
        let monitor = AgentMonitor::new();
        let metrics = monitor.collect_metrics();

        assert_eq!(metrics.samples_processed, 0);
        assert_eq!(metrics.incidents_opened, 0);
        assert_eq!(metrics.avg_diagnosis_latency_ms, 0.0);
        assert_eq!(metrics.notification_success_rate, 100.0);
    }

    #[test]
    fn test_diagnosis_latency_average() {
        let monitor = AgentMonitor::new();
        monitor.record_diagnosis_latency(Duration::from_millis(100));
        monitor.record_diagnosis_latency(Duration::from_millis(200));
        monitor.record_diagnosis_latency(Duration::from_millis(300));

        let metrics = monitor.collect_metrics();
        assert!((metrics.avg_diagnosis_latency_ms - 200.0).abs() < 1.0);
    }

    #[test]
    fn test_notification_success_rate() {
        let monitor = AgentMonitor::new();
        monitor.record_notification_result(true);
        monitor.record_notification_result(true);
        monitor.record_notification_result(false);
        monitor.record_notification_result(true);

        let metrics = monitor.collect_metrics();
        assert_eq!(metrics.successful_notifications_per_minute, 3);
        assert_eq!(metrics.failed_notifications_per_minute, 1);
        assert!((metrics.notification_success_rate - 75.0).abs() < 1.0);
    }

    #[test]
    fn test_incident_counters() {
        let monitor = AgentMonitor::new();
        monitor.record_samples_processed(4);
        monitor.record_source_failure();
        monitor.record_incident_opened();
        monitor.record_incident_opened();
        monitor.record_incident_closed(false, true);
        monitor.record_incident_closed(true, false);
        monitor.record_action_executed();

        let metrics = monitor.log_summary();
        assert_eq!(metrics.samples_processed, 4);
        assert_eq!(metrics.source_failures, 1);
        assert_eq!(metrics.incidents_opened, 2);
        assert_eq!(metrics.incidents_resolved, 1);
        assert_eq!(metrics.incidents_failed, 1);
        assert_eq!(metrics.incidents_suppressed, 1);
        assert_eq!(metrics.actions_executed, 1);
    }

    #[test]
    fn test_diagnosis_timer() {
        let monitor = Arc::new(AgentMonitor::new());
        let timer = DiagnosisTimer::start(Arc::clone(&monitor));
        thread::sleep(Duration::from_millis(10));
        timer.finish();

        assert!(monitor.collect_metrics().avg_diagnosis_latency_ms >= 10.0);
    }

    #[test]
    fn test_latency_sample_limit() {
        let monitor = AgentMonitor::new();
        for i in 0..150 {
            monitor.record_diagnosis_latency(Duration::from_millis(i));
        }

        let latencies = monitor.diagnosis_latencies.lock().unwrap();
        assert_eq!(latencies.len(), monitor.max_latency_samples);
        assert!(latencies.front().unwrap().as_millis() >= 50);
    }

    #[test]
    fn test_notification_sample_limit() {
        let monitor = AgentMonitor::new();
        for i in 0..1200 {
            monitor.record_notification_result(i % 2 == 0);
        }

        let results = monitor.notification_results.lock().unwrap();
        assert_eq!(results.len(), monitor.max_notification_samples);
    }
}
