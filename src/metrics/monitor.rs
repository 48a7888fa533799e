//! Periodic queue health monitoring and alerting.
//!
//! On every tick the monitor snapshots each queue's counts, derives
//! throughput and error rate, and compares them against thresholds. Each
//! breach produces one `Alert` whose severity depends only on how far the
//! observed value overshoots its threshold.
//!
//! The monitor only observes. It never touches jobs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pipeline::config::duration_ms;
use crate::pipeline::{AutomationEvent, EventBus};
use crate::scheduler::{PoolStatsBoard, QueueBackend, QueueCounts, QueueError, QueueName};

use super::MetricsCollector;

/// Threshold values that trigger alerts when exceeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Waiting jobs per queue.
    pub queue_size: u64,
    /// Average processing time per job.
    #[serde(with = "duration_ms")]
    pub processing_time: Duration,
    /// failed / (completed + failed).
    pub failure_rate: f64,
    /// Active jobs past the stall window.
    pub stalled_jobs: u64,
    /// Backing store memory in bytes.
    pub memory_usage: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            processing_time: Duration::from_millis(300_000),
            failure_rate: 0.10,
            stalled_jobs: 10,
            memory_usage: 512 * 1024 * 1024,
        }
    }
}

/// Monitoring settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    #[serde(with = "duration_ms")]
    pub metrics_interval: Duration,
    pub thresholds: AlertThresholds,
    /// Alerts kept for `recent_alerts`.
    pub alert_history: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_interval: Duration::from_secs(60),
            thresholds: AlertThresholds::default(),
            alert_history: 100,
        }
    }
}

/// Point-in-time health of one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub queue: QueueName,
    pub counts: QueueCounts,
    /// Jobs completed per minute since the previous snapshot.
    pub throughput_per_min: f64,
    /// Average processing time in milliseconds, 0 when unknown.
    pub avg_processing_ms: f64,
    /// failed / (completed + failed), 0 when nothing finished.
    pub error_rate: f64,
    pub taken_at: DateTime<Utc>,
}

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    QueueSize,
    ProcessingTime,
    FailureRate,
    StalledJobs,
    MemoryUsage,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::QueueSize => "queue_size",
            AlertKind::ProcessingTime => "processing_time",
            AlertKind::FailureRate => "failure_rate",
            AlertKind::StalledJobs => "stalled_jobs",
            AlertKind::MemoryUsage => "memory_usage",
        }
    }
}

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    /// Severity for an observed/threshold overshoot ratio.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio > 3.0 {
            AlertSeverity::Critical
        } else if ratio > 2.0 {
            AlertSeverity::High
        } else if ratio > 1.5 {
            AlertSeverity::Medium
        } else {
            AlertSeverity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A threshold breach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub kind: AlertKind,
    /// `None` for store-wide alerts such as memory usage.
    pub queue: Option<QueueName>,
    pub severity: AlertSeverity,
    pub observed: f64,
    pub threshold: f64,
    pub triggered_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, queue: Option<QueueName>, observed: f64, threshold: f64) -> Self {
        let ratio = if threshold > 0.0 {
            observed / threshold
        } else {
            f64::INFINITY
        };
        Self {
            id: Uuid::new_v4(),
            kind,
            queue,
            severity: AlertSeverity::from_ratio(ratio),
            observed,
            threshold,
            triggered_at: Utc::now(),
        }
    }
}

/// Compares one snapshot against thresholds. Pure; emits nothing.
pub fn evaluate(snapshot: &MetricSnapshot, thresholds: &AlertThresholds) -> Vec<Alert> {
    let queue = Some(snapshot.queue);
    let checks = [
        (
            AlertKind::QueueSize,
            snapshot.counts.waiting as f64,
            thresholds.queue_size as f64,
        ),
        (
            AlertKind::ProcessingTime,
            snapshot.avg_processing_ms,
            thresholds.processing_time.as_millis() as f64,
        ),
        (
            AlertKind::FailureRate,
            snapshot.error_rate,
            thresholds.failure_rate,
        ),
        (
            AlertKind::StalledJobs,
            snapshot.counts.stalled as f64,
            thresholds.stalled_jobs as f64,
        ),
    ];

    checks
        .into_iter()
        .filter(|(_, observed, threshold)| observed > threshold)
        .map(|(kind, observed, threshold)| Alert::new(kind, queue, observed, threshold))
        .collect()
}

/// Error rate over cumulative counts.
pub fn error_rate(counts: &QueueCounts) -> f64 {
    let finished = counts.completed + counts.failed;
    if finished == 0 {
        0.0
    } else {
        counts.failed as f64 / finished as f64
    }
}

#[derive(Default)]
struct MonitorState {
    latest: HashMap<QueueName, MetricSnapshot>,
    previous: HashMap<QueueName, (u64, Instant)>,
    alerts: VecDeque<Alert>,
}

/// Periodic observer of queue health.
pub struct QueueMonitor {
    config: MonitorConfig,
    backend: Arc<dyn QueueBackend>,
    events: EventBus,
    metrics: MetricsCollector,
    pools: Option<PoolStatsBoard>,
    state: Mutex<MonitorState>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueueMonitor {
    pub fn new(config: MonitorConfig, backend: Arc<dyn QueueBackend>, events: EventBus) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            backend,
            events,
            metrics: MetricsCollector::new(),
            pools: None,
            state: Mutex::new(MonitorState::default()),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Uses worker pool statistics for average processing time.
    pub fn with_pool_stats(mut self, pools: PoolStatsBoard) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Takes one snapshot of every queue and raises alerts for breaches.
    ///
    /// Returns the alerts raised by this pass.
    pub async fn collect_once(&self) -> Result<Vec<Alert>, QueueError> {
        let mut raised = Vec::new();

        for queue in QueueName::ALL {
            let counts = self.backend.counts(queue).await?;
            let snapshot = self.snapshot(queue, counts);

            self.metrics
                .update_queue_depth(queue.as_str(), "waiting", counts.waiting);
            self.metrics
                .update_queue_depth(queue.as_str(), "active", counts.active);
            self.metrics
                .update_queue_depth(queue.as_str(), "delayed", counts.delayed);
            self.metrics
                .update_queue_depth(queue.as_str(), "stalled", counts.stalled);

            raised.extend(evaluate(&snapshot, &self.config.thresholds));

            debug!(
                queue = %queue,
                waiting = counts.waiting,
                active = counts.active,
                throughput_per_min = snapshot.throughput_per_min,
                error_rate = snapshot.error_rate,
                "Queue snapshot"
            );
            self.state
                .lock()
                .latest
                .insert(queue, snapshot);
        }

        if let Some(used) = self.backend.memory_usage().await? {
            let threshold = self.config.thresholds.memory_usage;
            if used > threshold {
                raised.push(Alert::new(
                    AlertKind::MemoryUsage,
                    None,
                    used as f64,
                    threshold as f64,
                ));
            }
        }

        for alert in &raised {
            self.emit(alert.clone());
        }
        Ok(raised)
    }

    fn snapshot(&self, queue: QueueName, counts: QueueCounts) -> MetricSnapshot {
        let now = Instant::now();
        let mut state = self.state.lock();

        let throughput_per_min = match state.previous.get(&queue) {
            Some((completed_before, at)) => {
                let minutes = now.duration_since(*at).as_secs_f64() / 60.0;
                if minutes > 0.0 {
                    counts.completed.saturating_sub(*completed_before) as f64 / minutes
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        state.previous.insert(queue, (counts.completed, now));

        let avg_processing_ms = self
            .pools
            .as_ref()
            .map(|pools| pools.get(queue).average_job_duration.as_millis() as f64)
            .unwrap_or(0.0);

        MetricSnapshot {
            queue,
            counts,
            throughput_per_min,
            avg_processing_ms,
            error_rate: error_rate(&counts),
            taken_at: Utc::now(),
        }
    }

    fn emit(&self, alert: Alert) {
        let queue = alert.queue.map(|q| q.as_str()).unwrap_or("store");
        match alert.severity {
            AlertSeverity::Critical | AlertSeverity::High => error!(
                kind = alert.kind.as_str(),
                queue = queue,
                severity = %alert.severity,
                observed = alert.observed,
                threshold = alert.threshold,
                "Alert triggered"
            ),
            AlertSeverity::Medium => warn!(
                kind = alert.kind.as_str(),
                queue = queue,
                severity = %alert.severity,
                observed = alert.observed,
                threshold = alert.threshold,
                "Alert triggered"
            ),
            AlertSeverity::Low => info!(
                kind = alert.kind.as_str(),
                queue = queue,
                severity = %alert.severity,
                observed = alert.observed,
                threshold = alert.threshold,
                "Alert triggered"
            ),
        }

        self.metrics
            .record_alert(alert.kind.as_str(), alert.severity.as_str());

        {
            let mut state = self.state.lock();
            state.alerts.push_back(alert.clone());
            while state.alerts.len() > self.config.alert_history {
                state.alerts.pop_front();
            }
        }

        self.events.publish(AutomationEvent::AlertTriggered(alert));
    }

    /// Starts the periodic collection task. Does nothing if disabled or
    /// already started.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("Queue monitoring disabled");
            return;
        }
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let monitor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = self.config.metrics_interval;

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.collect_once().await {
                            warn!(error = %e, "Failed to collect queue metrics");
                        }
                    }
                }
            }
            debug!("Queue monitor stopped");
        }));
        info!(interval_ms = period.as_millis() as u64, "Queue monitor started");
    }

    /// Stops the periodic task and takes a final snapshot.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = self.shutdown_tx.send(());
            if let Err(e) = handle.await {
                error!(error = %e, "Queue monitor task panicked");
            }
        }
        self.collect_once().await?;
        Ok(())
    }

    /// Latest snapshot of every queue observed so far.
    pub fn latest(&self) -> Vec<MetricSnapshot> {
        let state = self.state.lock();
        QueueName::ALL
            .iter()
            .filter_map(|q| state.latest.get(q).cloned())
            .collect()
    }

    /// Most recent alerts, oldest first.
    pub fn recent_alerts(&self) -> Vec<Alert> {
        let state = self.state.lock();
        state.alerts.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::scheduler::{Job, JobKind, MemoryBackend};

    fn snapshot_with(counts: QueueCounts, avg_processing_ms: f64) -> MetricSnapshot {
        MetricSnapshot {
            queue: QueueName::Standard,
            counts,
            throughput_per_min: 0.0,
            avg_processing_ms,
            error_rate: error_rate(&counts),
            taken_at: Utc::now(),
        }
    }

    #[test]
    fn test_severity_from_ratio() {
        assert_eq!(AlertSeverity::from_ratio(160.0 / 100.0), AlertSeverity::Medium);
        assert_eq!(AlertSeverity::from_ratio(250.0 / 100.0), AlertSeverity::High);
        assert_eq!(AlertSeverity::from_ratio(350.0 / 100.0), AlertSeverity::Critical);
        assert_eq!(AlertSeverity::from_ratio(1.2), AlertSeverity::Low);
        // Boundaries are exclusive.
        assert_eq!(AlertSeverity::from_ratio(1.5), AlertSeverity::Low);
        assert_eq!(AlertSeverity::from_ratio(2.0), AlertSeverity::Medium);
        assert_eq!(AlertSeverity::from_ratio(3.0), AlertSeverity::High);
    }

    #[test]
    fn test_severity_is_monotonic() {
        let mut last = AlertSeverity::Low;
        for step in 0..500 {
            let severity = AlertSeverity::from_ratio(step as f64 / 100.0);
            assert!(severity >= last);
            last = severity;
        }
        assert_eq!(last, AlertSeverity::Critical);
    }

    #[test]
    fn test_evaluate_reports_each_breach() {
        let thresholds = AlertThresholds::default();
        let counts = QueueCounts {
            waiting: 2500,
            completed: 50,
            failed: 50,
            stalled: 11,
            ..Default::default()
        };

        let alerts = evaluate(&snapshot_with(counts, 100.0), &thresholds);
        let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![AlertKind::QueueSize, AlertKind::FailureRate, AlertKind::StalledJobs]
        );

        let size = &alerts[0];
        assert_eq!(size.severity, AlertSeverity::High);
        assert_eq!(size.queue, Some(QueueName::Standard));

        // 0.5 failure rate over 0.10 threshold.
        assert_eq!(alerts[1].severity, AlertSeverity::Critical);
        assert_eq!(alerts[2].severity, AlertSeverity::Low);
    }

    #[test]
    fn test_evaluate_at_threshold_is_quiet() {
        let thresholds = AlertThresholds::default();
        let counts = QueueCounts {
            waiting: 1000,
            stalled: 10,
            ..Default::default()
        };
        assert!(evaluate(&snapshot_with(counts, 300_000.0), &thresholds).is_empty());
    }

    #[tokio::test]
    async fn test_collect_once_publishes_alerts() {
        let backend = Arc::new(MemoryBackend::with_defaults());
        for i in 0..5 {
            let job = Job::new("user-1", format!("p-{}", i), JobKind::Standard, serde_json::Value::Null);
            backend
                .enqueue(QueueName::Standard, job, Duration::ZERO)
                .await
                .unwrap();
        }

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let config = MonitorConfig {
            thresholds: AlertThresholds {
                queue_size: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let monitor = QueueMonitor::new(config, backend, events);

        let alerts = monitor.collect_once().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::QueueSize);
        assert_eq!(alerts[0].severity, AlertSeverity::High);

        match rx.recv().await.unwrap() {
            AutomationEvent::AlertTriggered(alert) => assert_eq!(alert.id, alerts[0].id),
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(monitor.latest().len(), 5);
        assert_eq!(monitor.recent_alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_rate_alert() {
        let backend = Arc::new(MemoryBackend::with_defaults());
        let job = Job::new("user-1", "p", JobKind::Standard, serde_json::Value::Null);
        backend
            .enqueue(QueueName::High, job, Duration::ZERO)
            .await
            .unwrap();
        let job = backend
            .dequeue(QueueName::High, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        backend
            .fail(QueueName::High, job, &JobError::Fatal("form changed".into()))
            .await
            .unwrap();

        let monitor = QueueMonitor::new(MonitorConfig::default(), backend, EventBus::new());
        let alerts = monitor.collect_once().await.unwrap();

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::FailureRate);
        assert_eq!(alerts[0].queue, Some(QueueName::High));
        assert!((alerts[0].observed - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_collection_and_stop() {
        let backend = Arc::new(MemoryBackend::with_defaults());
        let config = MonitorConfig {
            metrics_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let monitor = Arc::new(QueueMonitor::new(config, backend, EventBus::new()));

        monitor.start();
        assert!(monitor.latest().is_empty());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(monitor.latest().len(), 5);

        monitor.stop().await.unwrap();
        assert_eq!(monitor.latest().len(), 5);
    }

    #[test]
    fn test_alert_history_is_bounded() {
        let monitor = QueueMonitor::new(
            MonitorConfig {
                alert_history: 3,
                ..Default::default()
            },
            Arc::new(MemoryBackend::with_defaults()),
            EventBus::new(),
        );
        for _ in 0..5 {
            monitor.emit(Alert::new(AlertKind::QueueSize, None, 2.0, 1.0));
        }
        assert_eq!(monitor.recent_alerts().len(), 3);
    }
}
