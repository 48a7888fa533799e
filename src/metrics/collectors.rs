//! Typed recording helpers for applyflow operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics so call sites pass
//! domain values instead of label strings. Every method is a no-op until
//! `init_metrics()` has run.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, ALERTS_TOTAL, BATCHES_FLUSHED, CHALLENGE_ATTEMPTS, CHALLENGE_DURATION,
    JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH, ROUTED_TOTAL,
};

/// Metrics collector for recording applyflow operational metrics.
///
/// # Example
///
/// ```ignore
/// use applyflow::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_job("standard", "completed", Duration::from_secs(12));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one processed job attempt.
    pub fn record_job(&self, queue: &str, status: &str, duration: Duration) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[queue, status]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[queue])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            queue = queue,
            status = status,
            duration_ms = duration.as_millis() as u64,
            "Recorded job metric"
        );
    }

    /// Record a routing decision.
    pub fn record_route(&self, queue: &str) {
        if let Some(routed) = ROUTED_TOTAL.get() {
            routed.with_label_values(&[queue]).inc();
        }
    }

    /// Record a batch flush.
    pub fn record_batch_flush(&self, trigger: &str, members: usize) {
        if let Some(flushed) = BATCHES_FLUSHED.get() {
            flushed.with_label_values(&[trigger]).inc();
        }

        tracing::trace!(trigger = trigger, members = members, "Recorded batch flush");
    }

    /// Update the depth gauge for one queue state.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue name
    /// * `state` - One of `waiting`, `active`, `delayed`, `stalled`
    /// * `depth` - Current number of jobs in that state
    pub fn update_queue_depth(&self, queue: &str, state: &str, depth: u64) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue, state])
                .set(depth as f64);
        }
    }

    /// Update the count of workers busy with a job on one queue.
    pub fn update_active_workers(&self, queue: &str, count: u64) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.with_label_values(&[queue]).set(count as f64);
        }
    }

    /// Record an alert raised by the monitor.
    pub fn record_alert(&self, kind: &str, severity: &str) {
        if let Some(alerts) = ALERTS_TOTAL.get() {
            alerts.with_label_values(&[kind, severity]).inc();
        }
    }

    /// Record one resolver tier attempt.
    ///
    /// `result` is `success`, `low_confidence`, `failure` or `error`.
    pub fn record_challenge_attempt(&self, tier: &str, result: &str, elapsed: Duration) {
        if let Some(attempts) = CHALLENGE_ATTEMPTS.get() {
            attempts.with_label_values(&[tier, result]).inc();
        }

        if let Some(duration) = CHALLENGE_DURATION.get() {
            duration
                .with_label_values(&[tier])
                .observe(elapsed.as_secs_f64());
        }

        tracing::trace!(
            tier = tier,
            result = result,
            elapsed_ms = elapsed.as_millis() as u64,
            "Recorded challenge attempt"
        );
    }
}
