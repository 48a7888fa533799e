//! Error types for applyflow operations.
//!
//! `JobError` is the crate-wide failure taxonomy used by the scheduler,
//! the job processor and the orchestrator. Subsystems that talk to an
//! external collaborator keep their own error enums (`QueueError`,
//! `ConfigError`, `TierError`) and convert into `JobError` at the seams.
//!
//! Retry decisions are made from the taxonomy alone: only transient I/O and
//! rate-limit failures are retryable. Backoff timing is owned by the backing
//! store, never by this crate.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Failure taxonomy for job processing and routing.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobError {
    /// Network failure, timeout or connection reset.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// The target site or a provider throttled us.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Malformed job, unknown queue name or missing handler.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Every enabled resolver tier was attempted and none succeeded.
    #[error("Challenge {challenge_id} unresolved after {attempted} tier(s)")]
    ResolutionExhausted { challenge_id: Uuid, attempted: usize },

    /// Routing or wiring refers to something that is not configured.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Any other handler failure. Not expected to succeed on retry.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl JobError {
    /// Returns whether the backing store should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::TransientIo(_) | JobError::RateLimited(_))
    }

    /// Short machine-readable label, used for metrics and result records.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::TransientIo(_) => "transient_io",
            JobError::RateLimited(_) => "rate_limited",
            JobError::Validation(_) => "validation",
            JobError::ResolutionExhausted { .. } => "resolution_exhausted",
            JobError::Configuration(_) => "configuration",
            JobError::Fatal(_) => "fatal",
        }
    }

    /// Classifies a free-form failure message.
    ///
    /// Rate limiting is checked first so that "429 Too Many Requests (timeout
    /// after retry)" is reported as a rate limit rather than a timeout.
    pub fn classify(message: &str) -> Self {
        if rate_limit_pattern().is_match(message) {
            JobError::RateLimited(message.to_string())
        } else if transient_pattern().is_match(message) {
            JobError::TransientIo(message.to_string())
        } else {
            JobError::Fatal(message.to_string())
        }
    }

    /// Converts an arbitrary handler error into the taxonomy.
    ///
    /// Errors that already are a `JobError` keep their variant.
    pub fn from_handler_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<JobError>() {
            Some(job_err) => job_err.clone(),
            None => Self::classify(&format!("{:#}", err)),
        }
    }
}

fn rate_limit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)rate[\s_-]?limit|too many requests|\b429\b|throttl")
            .expect("rate limit pattern is valid")
    })
}

fn transient_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)network|timed?[\s_-]?out|timeout|econnreset|econnrefused|etimedout|connection (reset|refused|closed|aborted)|socket hang up|broken pipe",
        )
        .expect("transient pattern is valid")
    })
}
