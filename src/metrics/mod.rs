//! Metrics and queue health monitoring.
//!
//! This module provides Prometheus-based metrics for the scheduler and the
//! challenge resolution chain, plus a periodic monitor that raises alerts
//! when queue health crosses configured thresholds.
//!
//! # Example
//!
//! ```ignore
//! use applyflow::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job("high", "completed", std::time::Duration::from_millis(850));
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod monitor;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use monitor::{
    Alert, AlertKind, AlertSeverity, AlertThresholds, MetricSnapshot, MonitorConfig,
    QueueMonitor,
};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, ALERTS_TOTAL, BATCHES_FLUSHED, CHALLENGE_ATTEMPTS, CHALLENGE_DURATION,
    JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH, REGISTRY, ROUTED_TOTAL,
};
