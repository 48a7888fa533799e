//! Configuration for the automation core.
//!
//! Settings come from defaults, a YAML file, or `APPLYFLOW_*` environment
//! variables layered over defaults. Durations are expressed in
//! milliseconds in YAML.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::challenge::{ResolutionConfig, TierKind};
use crate::metrics::MonitorConfig;
use crate::scheduler::{
    BatchingConfig, PriorityThresholds, QueueName, QueueSettings, WorkerPoolConfig,
};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The YAML document could not be parsed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Backing store and worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub redis_url: String,
    /// Prefix for every Redis key.
    pub key_prefix: String,
    /// Total workers shared by the five queues.
    pub global_concurrency: usize,
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Longest a single handler call may run.
    #[serde(with = "duration_ms")]
    pub job_timeout: Duration,
    /// Longest `submit` waits for a job to finish.
    #[serde(with = "duration_ms")]
    pub job_wait_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Active jobs older than this count as stalled.
    #[serde(with = "duration_ms")]
    pub stall_after: Duration,
    /// Per-queue settings. Missing queues get defaults.
    pub settings: HashMap<QueueName, QueueSettings>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "applyflow".to_string(),
            global_concurrency: 20,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(1800),
            job_wait_timeout: Duration::from_secs(1800),
            shutdown_timeout: Duration::from_secs(60),
            stall_after: Duration::from_secs(30),
            settings: QueueSettings::default_map(),
        }
    }
}

/// Load-balanced routing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub load_balancing: bool,
    /// How long a dispatch counts towards a queue's load.
    #[serde(with = "duration_ms")]
    pub decay_window: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            load_balancing: true,
            decay_window: crate::scheduler::router::DEFAULT_DECAY_WINDOW,
        }
    }
}

/// Configuration for the automation core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub queue: QueueConfig,
    pub routing: RoutingConfig,
    pub priority: PriorityThresholds,
    pub batching: BatchingConfig,
    pub monitoring: MonitorConfig,
    pub resolution: ResolutionConfig,
}

impl AutomationConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `APPLYFLOW_REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `APPLYFLOW_KEY_PREFIX`: Redis key prefix (default: applyflow)
    /// - `APPLYFLOW_CONCURRENCY`: Global worker budget (default: 20)
    /// - `APPLYFLOW_JOB_TIMEOUT_SECS`: Handler timeout (default: 1800)
    /// - `APPLYFLOW_JOB_WAIT_TIMEOUT_SECS`: Submit wait timeout (default: 1800)
    /// - `APPLYFLOW_SHUTDOWN_TIMEOUT_SECS`: Per-pool shutdown timeout (default: 60)
    /// - `APPLYFLOW_LOAD_BALANCING`: Load-balanced routing (default: true)
    /// - `APPLYFLOW_BATCHING_ENABLED`: Batch low-priority jobs (default: true)
    /// - `APPLYFLOW_BATCH_SIZE`: Members per batch (default: 50)
    /// - `APPLYFLOW_MAX_BATCH_WAIT_MS`: Batch deadline (default: 30000)
    /// - `APPLYFLOW_MONITORING_ENABLED`: Periodic monitoring (default: true)
    /// - `APPLYFLOW_METRICS_INTERVAL_SECS`: Monitor period (default: 60)
    /// - `APPLYFLOW_RESOLUTION_TIERS`: Comma-separated tier order
    /// - `APPLYFLOW_MANUAL_TIMEOUT_SECS`: Manual tier wait (default: 300)
    /// - `APPLYFLOW_ALLOW_MANUAL`: Allow the manual tier (default: true)
    /// - `APPLYFLOW_CONFIDENCE_THRESHOLD`: Tier confidence gate (default: 0.7)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Overlays variables from `lookup` on defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("APPLYFLOW_REDIS_URL") {
            config.queue.redis_url = val;
        }
        if let Some(val) = lookup("APPLYFLOW_KEY_PREFIX") {
            config.queue.key_prefix = val;
        }
        if let Some(val) = lookup("APPLYFLOW_CONCURRENCY") {
            config.queue.global_concurrency = parse_env_value(&val, "APPLYFLOW_CONCURRENCY")?;
        }
        if let Some(val) = lookup("APPLYFLOW_JOB_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "APPLYFLOW_JOB_TIMEOUT_SECS")?;
            config.queue.job_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("APPLYFLOW_JOB_WAIT_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "APPLYFLOW_JOB_WAIT_TIMEOUT_SECS")?;
            config.queue.job_wait_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("APPLYFLOW_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "APPLYFLOW_SHUTDOWN_TIMEOUT_SECS")?;
            config.queue.shutdown_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("APPLYFLOW_LOAD_BALANCING") {
            config.routing.load_balancing = parse_env_bool(&val, "APPLYFLOW_LOAD_BALANCING")?;
        }

        if let Some(val) = lookup("APPLYFLOW_BATCHING_ENABLED") {
            config.batching.enabled = parse_env_bool(&val, "APPLYFLOW_BATCHING_ENABLED")?;
        }
        if let Some(val) = lookup("APPLYFLOW_BATCH_SIZE") {
            config.batching.batch_size = parse_env_value(&val, "APPLYFLOW_BATCH_SIZE")?;
        }
        if let Some(val) = lookup("APPLYFLOW_MAX_BATCH_WAIT_MS") {
            let ms: u64 = parse_env_value(&val, "APPLYFLOW_MAX_BATCH_WAIT_MS")?;
            config.batching.max_batch_wait = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("APPLYFLOW_MONITORING_ENABLED") {
            config.monitoring.enabled = parse_env_bool(&val, "APPLYFLOW_MONITORING_ENABLED")?;
        }
        if let Some(val) = lookup("APPLYFLOW_METRICS_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "APPLYFLOW_METRICS_INTERVAL_SECS")?;
            config.monitoring.metrics_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("APPLYFLOW_RESOLUTION_TIERS") {
            config.resolution.enabled_tiers = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<TierKind>().map_err(|message| ConfigError::InvalidValue {
                        key: "APPLYFLOW_RESOLUTION_TIERS".to_string(),
                        message,
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(val) = lookup("APPLYFLOW_MANUAL_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "APPLYFLOW_MANUAL_TIMEOUT_SECS")?;
            config.resolution.manual_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("APPLYFLOW_ALLOW_MANUAL") {
            config.resolution.allow_manual = parse_env_bool(&val, "APPLYFLOW_ALLOW_MANUAL")?;
        }
        if let Some(val) = lookup("APPLYFLOW_CONFIDENCE_THRESHOLD") {
            config.resolution.confidence_threshold =
                parse_env_value(&val, "APPLYFLOW_CONFIDENCE_THRESHOLD")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        config.fill_queue_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    fn fill_queue_defaults(&mut self) {
        for queue in QueueName::ALL {
            self.queue
                .settings
                .entry(queue)
                .or_insert_with(|| QueueSettings::defaults_for(queue));
        }
    }

    /// Concurrency share per queue.
    pub fn concurrency_shares(&self) -> HashMap<QueueName, f64> {
        QueueName::ALL
            .iter()
            .map(|q| {
                let share = self
                    .queue
                    .settings
                    .get(q)
                    .map(|s| s.concurrency_share)
                    .unwrap_or(crate::scheduler::worker_pool::UNMAPPED_SHARE);
                (*q, share)
            })
            .collect()
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            poll_interval: self.queue.poll_interval,
            shutdown_timeout: self.queue.shutdown_timeout,
        }
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.queue.global_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "global_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.queue.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.queue.job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than 0".to_string(),
            ));
        }

        for (queue, settings) in &self.queue.settings {
            if !(0.0..=1.0).contains(&settings.concurrency_share) {
                return Err(ConfigError::ValidationFailed(format!(
                    "concurrency_share for {} must be between 0.0 and 1.0",
                    queue
                )));
            }
            if settings.retry.max_attempts == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "max_attempts for {} must be at least 1",
                    queue
                )));
            }
        }

        self.priority
            .validate()
            .map_err(ConfigError::ValidationFailed)?;

        if self.batching.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.batching.success_ratio) {
            return Err(ConfigError::ValidationFailed(
                "success_ratio must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.monitoring.enabled && self.monitoring.metrics_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "metrics_interval must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.monitoring.thresholds.failure_rate) {
            return Err(ConfigError::ValidationFailed(
                "failure_rate threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.resolution.confidence_threshold) {
            return Err(ConfigError::ValidationFailed(
                "confidence_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the global worker budget.
    pub fn with_global_concurrency(mut self, workers: usize) -> Self {
        self.queue.global_concurrency = workers;
        self
    }

    /// Builder method to enable or disable load-balanced routing.
    pub fn with_load_balancing(mut self, enabled: bool) -> Self {
        self.routing.load_balancing = enabled;
        self
    }

    /// Builder method to replace the batching settings.
    pub fn with_batching(mut self, batching: BatchingConfig) -> Self {
        self.batching = batching;
        self
    }

    /// Builder method to replace the monitoring settings.
    pub fn with_monitoring(mut self, monitoring: MonitorConfig) -> Self {
        self.monitoring = monitoring;
        self
    }

    /// Builder method to replace the resolution chain settings.
    pub fn with_resolution(mut self, resolution: ResolutionConfig) -> Self {
        self.resolution = resolution;
        self
    }

    /// Builder method to set the submit wait timeout.
    pub fn with_job_wait_timeout(mut self, timeout: Duration) -> Self {
        self.queue.job_wait_timeout = timeout;
        self
    }

    /// Builder method to set the handler timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.queue.job_timeout = timeout;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AutomationConfig::default();
        assert_eq!(config.queue.global_concurrency, 20);
        assert_eq!(config.queue.redis_url, "redis://localhost:6379");
        assert_eq!(config.queue.key_prefix, "applyflow");
        assert_eq!(config.queue.shutdown_timeout, Duration::from_secs(60));
        assert!(config.routing.load_balancing);
        assert_eq!(config.routing.decay_window, Duration::from_secs(60));
        assert_eq!(config.priority.high, 75);
        assert_eq!(config.batching.batch_size, 50);
        assert_eq!(config.monitoring.metrics_interval, Duration::from_secs(60));
        assert_eq!(config.resolution.manual_timeout, Duration::from_secs(300));
        assert_eq!(config.queue.settings.len(), 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_concurrency_shares() {
        let shares = AutomationConfig::default().concurrency_shares();
        assert!((shares[&QueueName::Immediate] - 0.40).abs() < f64::EPSILON);
        assert!((shares[&QueueName::High] - 0.30).abs() < f64::EPSILON);
        assert!((shares[&QueueName::Standard] - 0.20).abs() < f64::EPSILON);
        assert!((shares[&QueueName::Batch] - 0.05).abs() < f64::EPSILON);
        assert!((shares[&QueueName::Retry] - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = AutomationConfig::from_lookup(lookup_from(&[
            ("APPLYFLOW_CONCURRENCY", "40"),
            ("APPLYFLOW_LOAD_BALANCING", "off"),
            ("APPLYFLOW_BATCH_SIZE", "10"),
            ("APPLYFLOW_MAX_BATCH_WAIT_MS", "5000"),
            ("APPLYFLOW_RESOLUTION_TIERS", "paid_service, manual"),
            ("APPLYFLOW_MANUAL_TIMEOUT_SECS", "90"),
        ]))
        .unwrap();

        assert_eq!(config.queue.global_concurrency, 40);
        assert!(!config.routing.load_balancing);
        assert_eq!(config.batching.batch_size, 10);
        assert_eq!(config.batching.max_batch_wait, Duration::from_secs(5));
        assert_eq!(
            config.resolution.enabled_tiers,
            vec![TierKind::PaidService, TierKind::Manual]
        );
        assert_eq!(config.resolution.manual_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let err = AutomationConfig::from_lookup(lookup_from(&[("APPLYFLOW_CONCURRENCY", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("APPLYFLOW_CONCURRENCY"));

        let err =
            AutomationConfig::from_lookup(lookup_from(&[("APPLYFLOW_RESOLUTION_TIERS", "oracle")]))
                .unwrap_err();
        assert!(err.to_string().contains("oracle"));

        let err = AutomationConfig::from_lookup(lookup_from(&[("APPLYFLOW_CONCURRENCY", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
queue:
  global_concurrency: 8
  settings:
    batch:
      concurrency_share: 0.10
      keep_completed: 10
      keep_failed: 20
      retry:
        max_attempts: 3
        backoff:
          type: fixed
          delay_ms: 1000
routing:
  load_balancing: false
priority:
  high: 80
batching:
  batch_size: 5
  max_batch_wait: 2000
monitoring:
  thresholds:
    queue_size: 50
"#;
        let config = AutomationConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.queue.global_concurrency, 8);
        assert_eq!(config.queue.settings.len(), 5);
        assert_eq!(config.queue.settings[&QueueName::Batch].keep_completed, 10);
        assert_eq!(config.queue.settings[&QueueName::Batch].retry.max_attempts, 3);
        assert_eq!(config.queue.settings[&QueueName::High].retry.max_attempts, 4);
        assert!(!config.routing.load_balancing);
        assert_eq!(config.priority.high, 80);
        assert_eq!(config.priority.critical, 100);
        assert_eq!(config.batching.batch_size, 5);
        assert_eq!(config.batching.max_batch_wait, Duration::from_secs(2));
        assert_eq!(config.monitoring.thresholds.queue_size, 50);
        assert_eq!(config.monitoring.thresholds.stalled_jobs, 10);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "batching:\n  enabled: false\nresolution:\n  allow_manual: false").unwrap();

        let config = AutomationConfig::from_file(file.path()).unwrap();
        assert!(!config.batching.enabled);
        assert!(!config.resolution.allow_manual);
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = AutomationConfig::from_file(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_validation_thresholds_order() {
        let mut config = AutomationConfig::default();
        config.priority.high = 40;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("strictly descending"));
    }

    #[test]
    fn test_validation_zero_batch_size() {
        let mut config = AutomationConfig::default();
        config.batching.batch_size = 0;
        assert!(config.validate().unwrap_err().to_string().contains("batch_size"));
    }

    #[test]
    fn test_validation_share_out_of_range() {
        let mut config = AutomationConfig::default();
        if let Some(settings) = config.queue.settings.get_mut(&QueueName::High) {
            settings.concurrency_share = 1.5;
        }
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("concurrency_share"));
    }

    #[test]
    fn test_validation_confidence_threshold() {
        let mut config = AutomationConfig::default();
        config.resolution.confidence_threshold = 1.2;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("confidence_threshold"));
    }

    #[test]
    fn test_yaml_round_trip_keeps_durations_in_ms() {
        let yaml = serde_yaml::to_string(&AutomationConfig::default()).unwrap();
        assert!(yaml.contains("max_batch_wait: 30000"));
        assert!(yaml.contains("manual_timeout: 300000"));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("1", "test").unwrap());
        assert!(parse_env_bool("yes", "test").unwrap());
        assert!(parse_env_bool("ON", "test").unwrap());

        assert!(!parse_env_bool("false", "test").unwrap());
        assert!(!parse_env_bool("0", "test").unwrap());
        assert!(!parse_env_bool("no", "test").unwrap());
        assert!(!parse_env_bool("off", "test").unwrap());

        assert!(parse_env_bool("invalid", "test").is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "KEY".to_string(),
            message: "bad value".to_string(),
        };
        assert!(err.to_string().contains("KEY"));
        assert!(err.to_string().contains("bad value"));

        let err = ConfigError::ValidationFailed("test failure".to_string());
        assert!(err.to_string().contains("test failure"));
    }
}
