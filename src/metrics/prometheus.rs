//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by applyflow and provides
//! functions for initializing, registering, and exporting metrics.

use parking_lot::Mutex;
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all applyflow metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Processed job attempts, labeled by queue and status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job processing duration in seconds, labeled by queue.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Jobs per queue and state (waiting, active, delayed, stalled).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Workers currently processing a job, labeled by queue.
pub static ACTIVE_WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Routing decisions, labeled by the chosen queue.
pub static ROUTED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Flushed batches, labeled by what triggered the flush.
pub static BATCHES_FLUSHED: OnceLock<CounterVec> = OnceLock::new();

/// Alerts raised by the monitor, labeled by kind and severity.
pub static ALERTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Resolver tier attempts, labeled by tier and result.
pub static CHALLENGE_ATTEMPTS: OnceLock<CounterVec> = OnceLock::new();

/// Resolver tier latency in seconds, labeled by tier.
pub static CHALLENGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

static INIT_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls are no-ops.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock();
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("applyflow_jobs_total", "Processed job attempts"),
        &["queue", "status"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "applyflow_job_duration_seconds",
            "Job processing duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]),
        &["queue"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("applyflow_queue_depth", "Jobs per queue and state"),
        &["queue", "state"],
    )?;

    let active_workers = GaugeVec::new(
        Opts::new("applyflow_active_workers", "Workers currently processing a job"),
        &["queue"],
    )?;

    let routed_total = CounterVec::new(
        Opts::new("applyflow_routed_total", "Routing decisions per queue"),
        &["queue"],
    )?;

    let batches_flushed = CounterVec::new(
        Opts::new("applyflow_batches_flushed_total", "Flushed batches"),
        &["trigger"],
    )?;

    // Monitoring metrics
    let alerts_total = CounterVec::new(
        Opts::new("applyflow_alerts_total", "Alerts raised by the queue monitor"),
        &["kind", "severity"],
    )?;

    // Challenge metrics
    let challenge_attempts = CounterVec::new(
        Opts::new(
            "applyflow_challenge_attempts_total",
            "Resolver tier attempts",
        ),
        &["tier", "result"],
    )?;

    let challenge_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "applyflow_challenge_duration_seconds",
            "Resolver tier latency in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0]),
        &["tier"],
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(routed_total.clone()))?;
    registry.register(Box::new(batches_flushed.clone()))?;
    registry.register(Box::new(alerts_total.clone()))?;
    registry.register(Box::new(challenge_attempts.clone()))?;
    registry.register(Box::new(challenge_duration.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = ROUTED_TOTAL.set(routed_total);
    let _ = BATCHES_FLUSHED.set(batches_flushed);
    let _ = ALERTS_TOTAL.set(alerts_total);
    let _ = CHALLENGE_ATTEMPTS.set(challenge_attempts);
    let _ = CHALLENGE_DURATION.set(challenge_duration);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem instead.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
