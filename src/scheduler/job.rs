//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Job`: A unit of work submitted by an owner (one job application)
//! - `JobKind`: Which handler family processes the job
//! - `HandlerOutput`: What a handler hands back on success
//! - `JobOutcome`: Timestamped result of one processing attempt
//! - `JobStatus`: Status of a processed attempt

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::challenge::ChallengeContext;
use crate::error::JobError;

use super::queue::QueueName;

/// Highest accepted priority value.
pub const MAX_PRIORITY: u8 = 100;

/// Default priority for jobs that do not specify one.
const DEFAULT_PRIORITY: u8 = 50;

/// Handler family for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// A regular application submission.
    Standard,
    /// An application the owner flagged as urgent.
    Priority,
    /// A synthetic job carrying many standard members.
    Batch,
}

impl JobKind {
    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Standard => "standard",
            JobKind::Priority => "priority",
            JobKind::Batch => "batch",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(JobKind::Standard),
            "priority" => Ok(JobKind::Priority),
            "batch" => Ok(JobKind::Batch),
            other => Err(JobError::Validation(format!("unknown job kind '{}'", other))),
        }
    }
}

/// Scheduling metadata attached to a job.
///
/// Everything except `attempts` and `origin_queue` is fixed at creation.
/// Those two belong to the backing store, which stamps them on delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetadata {
    /// When this job was created.
    pub created_at: DateTime<Utc>,
    /// Priority in `0..=100`; higher values are more urgent.
    pub priority: u8,
    /// Number of delivery attempts made so far.
    #[serde(default)]
    pub attempts: u32,
    /// Queue the job was first enqueued into. Drives its retry policy.
    #[serde(default)]
    pub origin_queue: Option<QueueName>,
}

/// A job representing one unit of work (usually a single application).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: Uuid,
    /// The user the work is performed for.
    pub owner_id: String,
    /// The posting (or other logical entity) this job targets.
    pub logical_job_id: String,
    /// Handler family.
    pub kind: JobKind,
    /// Opaque handler input.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Scheduling metadata.
    pub metadata: JobMetadata,
}

impl Job {
    /// Creates a new job with default priority.
    pub fn new(
        owner_id: impl Into<String>,
        logical_job_id: impl Into<String>,
        kind: JobKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            logical_job_id: logical_job_id.into(),
            kind,
            payload,
            metadata: JobMetadata {
                created_at: Utc::now(),
                priority: DEFAULT_PRIORITY,
                attempts: 0,
                origin_queue: None,
            },
        }
    }

    /// Sets the priority, clamped to `0..=100`.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.metadata.priority = priority.min(MAX_PRIORITY);
        self
    }

    /// Returns the job priority.
    pub fn priority(&self) -> u8 {
        self.metadata.priority
    }

    /// Returns the number of attempts recorded by the backing store.
    pub fn attempts(&self) -> u32 {
        self.metadata.attempts
    }

    /// Checks the minimum schema before a job is accepted.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.owner_id.trim().is_empty() {
            return Err(JobError::Validation(format!(
                "job {} has no owner id",
                self.id
            )));
        }
        if self.logical_job_id.trim().is_empty() {
            return Err(JobError::Validation(format!(
                "job {} has no logical job id",
                self.id
            )));
        }
        if self.metadata.priority > MAX_PRIORITY {
            return Err(JobError::Validation(format!(
                "job {} priority {} exceeds {}",
                self.id, self.metadata.priority, MAX_PRIORITY
            )));
        }
        Ok(())
    }
}

/// What a handler returns when it finishes without error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HandlerOutput {
    /// Structured handler data (application id, screenshots, ...).
    #[serde(default)]
    pub data: serde_json::Value,
    /// Free-form text from the automation run, scanned for confirmations.
    #[serde(default)]
    pub message: Option<String>,
    /// Set when the handler hit an interactive challenge it could not pass.
    #[serde(default)]
    pub challenge: Option<ChallengeContext>,
}

impl HandlerOutput {
    /// Creates an output carrying only data.
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            message: None,
            challenge: None,
        }
    }

    /// Attaches run output text.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Marks the output as blocked by a challenge.
    pub fn with_challenge(mut self, challenge: ChallengeContext) -> Self {
        self.challenge = Some(challenge);
        self
    }
}

/// Status of a processed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Handler finished successfully.
    Completed,
    /// Handler failed; see the outcome's error for classification.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Result of one processing attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOutcome {
    /// ID of the processed job.
    pub job_id: Uuid,
    /// Owner of the processed job.
    pub owner_id: String,
    /// Handler family.
    pub kind: JobKind,
    /// Queue the attempt was pulled from.
    pub queue: QueueName,
    /// Final status of the attempt.
    pub status: JobStatus,
    /// Handler output on success.
    pub output: Option<HandlerOutput>,
    /// Classified error on failure.
    pub error: Option<JobError>,
    /// Whether the handler was cut off by the job timeout.
    #[serde(default)]
    pub timed_out: bool,
    /// 1-based attempt number.
    pub attempt: u32,
    /// When processing started.
    pub started_at: DateTime<Utc>,
    /// When processing finished.
    pub completed_at: DateTime<Utc>,
    /// Time between job creation and processing start.
    pub queued_for: Duration,
    /// Wall-clock processing duration.
    pub duration: Duration,
}

impl JobOutcome {
    /// Returns whether the attempt completed successfully.
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }

    /// Returns whether the failure may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().is_some_and(JobError::is_retryable)
    }

    /// Returns the detected challenge, if any.
    pub fn challenge(&self) -> Option<&ChallengeContext> {
        self.output.as_ref().and_then(|o| o.challenge.as_ref())
    }
}
