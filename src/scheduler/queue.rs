//! Queue partitions and the backing-store contract.
//!
//! The scheduler runs five fixed queues. Each queue is a partition of a
//! backing store that owns delivery, attempt counting and retry scheduling:
//!
//! - `{queue}` waiting list, delivered FIFO
//! - `{queue}` delayed set, promoted to waiting once due
//! - `{queue}` active set, used for stall detection and crash recovery
//! - dead letter entries for jobs that will never be retried
//!
//! A retryable failure with attempts left is rescheduled into the `retry`
//! partition after the origin queue's backoff delay. Everything else is
//! dead-lettered.
//!
//! `MemoryBackend` implements the contract in-process; the Redis
//! implementation lives in `redis_backend`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::JobError;

use super::job::{Job, JobOutcome};

/// Errors that can occur during backing-store operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the store.
    #[error("Queue store connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Queue name is not one of the configured tiers.
    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),
}

impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::UnknownQueue(name) => {
                JobError::Configuration(format!("unknown queue '{}'", name))
            }
            other => JobError::TransientIo(other.to_string()),
        }
    }
}

/// The five scheduling tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Immediate,
    High,
    Standard,
    Batch,
    Retry,
}

impl QueueName {
    /// All queues, in dispatch-preference order.
    pub const ALL: [QueueName; 5] = [
        QueueName::Immediate,
        QueueName::High,
        QueueName::Standard,
        QueueName::Batch,
        QueueName::Retry,
    ];

    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Immediate => "immediate",
            QueueName::High => "high",
            QueueName::Standard => "standard",
            QueueName::Batch => "batch",
            QueueName::Retry => "retry",
        }
    }

    /// Default fraction of the global concurrency budget.
    pub fn default_share(&self) -> f64 {
        match self {
            QueueName::Immediate => 0.40,
            QueueName::High => 0.30,
            QueueName::Standard => 0.20,
            QueueName::Batch => 0.05,
            QueueName::Retry => 0.05,
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueName {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(QueueName::Immediate),
            "high" => Ok(QueueName::High),
            "standard" => Ok(QueueName::Standard),
            "batch" => Ok(QueueName::Batch),
            "retry" => Ok(QueueName::Retry),
            other => Err(QueueError::UnknownQueue(other.to_string())),
        }
    }
}

/// Delay shape between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },
    /// `base_ms * 2^(attempt - 1)`.
    Exponential { base_ms: u64 },
}

/// Store-side retry policy for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total deliveries allowed, including the first.
    pub max_attempts: u32,
    /// Delay shape between deliveries.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Creates a fixed-delay policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
        }
    }

    /// Creates an exponential policy.
    pub fn exponential(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                base_ms: base.as_millis() as u64,
            },
        }
    }

    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { base_ms } => {
                let exp = attempt.saturating_sub(1).min(20);
                Duration::from_millis(base_ms.saturating_mul(1u64 << exp))
            }
        }
    }

    /// Returns whether another delivery is allowed after `attempts`.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Per-queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Fraction of the global concurrency budget for this queue.
    pub concurrency_share: f64,
    /// Completed outcomes retained for inspection.
    pub keep_completed: usize,
    /// Failed jobs retained for inspection.
    pub keep_failed: usize,
    /// Retry policy for jobs that originate in this queue.
    pub retry: RetryPolicy,
}

impl QueueSettings {
    /// Default settings for a queue.
    pub fn defaults_for(queue: QueueName) -> Self {
        let retry = match queue {
            QueueName::Immediate => RetryPolicy::exponential(5, Duration::from_secs(1)),
            QueueName::High => RetryPolicy::exponential(4, Duration::from_secs(2)),
            QueueName::Standard => RetryPolicy::exponential(3, Duration::from_secs(5)),
            QueueName::Batch => RetryPolicy::fixed(2, Duration::from_secs(30)),
            QueueName::Retry => RetryPolicy::fixed(1, Duration::from_secs(60)),
        };
        Self {
            concurrency_share: queue.default_share(),
            keep_completed: 100,
            keep_failed: 500,
            retry,
        }
    }

    /// Default settings for all five queues.
    pub fn default_map() -> HashMap<QueueName, QueueSettings> {
        QueueName::ALL
            .iter()
            .map(|q| (*q, QueueSettings::defaults_for(*q)))
            .collect()
    }
}

/// Job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Jobs ready for delivery.
    pub waiting: u64,
    /// Jobs currently delivered to a worker.
    pub active: u64,
    /// Jobs completed since the store was created.
    pub completed: u64,
    /// Jobs that failed terminally since the store was created.
    pub failed: u64,
    /// Jobs scheduled for later delivery.
    pub delayed: u64,
    /// Active jobs that exceeded the stall window.
    pub stalled: u64,
}

impl QueueCounts {
    /// Returns the number of jobs not yet finished.
    pub fn backlog(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }
}

/// What the store decided after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Another attempt is scheduled.
    Retry {
        /// Attempts made so far.
        attempt: u32,
        /// Delay before the next delivery.
        delay: Duration,
        /// Partition the job was rescheduled into.
        queue: QueueName,
    },
    /// No further attempts will be made.
    DeadLettered {
        /// Attempts made in total.
        attempts: u32,
    },
}

impl RetryDecision {
    /// Returns whether another attempt will be made.
    pub fn will_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

/// Contract of the durable backing store.
///
/// The store is the single source of truth for delivery and attempts:
/// `dequeue` increments the attempt counter of the delivered job, and
/// `fail` decides whether another attempt follows.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Adds a job to a queue, optionally delayed.
    async fn enqueue(&self, queue: QueueName, job: Job, delay: Duration)
        -> Result<(), QueueError>;

    /// Waits up to `timeout` for the next job of a queue.
    ///
    /// Returns `Ok(None)` when the timeout expires or the queue is paused.
    async fn dequeue(&self, queue: QueueName, timeout: Duration)
        -> Result<Option<Job>, QueueError>;

    /// Acknowledges a successfully processed job.
    async fn complete(&self, queue: QueueName, outcome: &JobOutcome) -> Result<(), QueueError>;

    /// Records a failed attempt and schedules a retry when allowed.
    async fn fail(
        &self,
        queue: QueueName,
        job: Job,
        error: &JobError,
    ) -> Result<RetryDecision, QueueError>;

    /// Returns current counts for a queue.
    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError>;

    /// Stops deliveries from a queue. In-flight jobs are unaffected.
    async fn pause(&self, queue: QueueName) -> Result<(), QueueError>;

    /// Resumes deliveries from a queue.
    async fn resume(&self, queue: QueueName) -> Result<(), QueueError>;

    /// Returns whether a queue is paused.
    async fn is_paused(&self, queue: QueueName) -> Result<bool, QueueError>;

    /// Memory used by the store in bytes, when the store can report it.
    async fn memory_usage(&self) -> Result<Option<u64>, QueueError> {
        Ok(None)
    }

    /// Requeues jobs left active by a previous process. Returns the count.
    async fn recover(&self) -> Result<usize, QueueError> {
        Ok(0)
    }

    /// Releases the store connection.
    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Failed job retained for inspection.
#[derive(Debug, Clone)]
pub struct FailedEntry {
    pub job: Job,
    pub error: JobError,
}

#[derive(Default)]
struct Partition {
    waiting: VecDeque<Job>,
    delayed: Vec<(Instant, Job)>,
    active: HashMap<Uuid, Instant>,
    completed: VecDeque<JobOutcome>,
    failed: VecDeque<FailedEntry>,
    completed_total: u64,
    failed_total: u64,
    paused: bool,
}

impl Partition {
    /// Moves due delayed jobs to the waiting list, oldest due first.
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|(ready_at, _)| *ready_at);
        let due = self.delayed.partition_point(|(ready_at, _)| *ready_at <= now);
        for (_, job) in self.delayed.drain(..due) {
            self.waiting.push_back(job);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(ready_at, _)| *ready_at).min()
    }
}

struct Lane {
    state: Mutex<Partition>,
    notify: Notify,
}

/// In-process backing store.
///
/// Suitable for tests and single-process deployments; nothing survives a
/// restart.
pub struct MemoryBackend {
    lanes: HashMap<QueueName, Lane>,
    settings: HashMap<QueueName, QueueSettings>,
    stall_after: Duration,
}

impl MemoryBackend {
    /// Creates a store with the given per-queue settings.
    pub fn new(settings: HashMap<QueueName, QueueSettings>, stall_after: Duration) -> Self {
        let lanes = QueueName::ALL
            .iter()
            .map(|q| {
                (
                    *q,
                    Lane {
                        state: Mutex::new(Partition::default()),
                        notify: Notify::new(),
                    },
                )
            })
            .collect();
        Self {
            lanes,
            settings,
            stall_after,
        }
    }

    /// Creates a store with default settings and a 30s stall window.
    pub fn with_defaults() -> Self {
        Self::new(QueueSettings::default_map(), Duration::from_secs(30))
    }

    fn lane(&self, queue: QueueName) -> &Lane {
        // Every QueueName has a lane; see `new`.
        &self.lanes[&queue]
    }

    fn policy_for(&self, job: &Job, queue: QueueName) -> RetryPolicy {
        let origin = job.metadata.origin_queue.unwrap_or(queue);
        self.settings
            .get(&origin)
            .map(|s| s.retry)
            .unwrap_or_else(|| QueueSettings::defaults_for(origin).retry)
    }

    fn keep_limits(&self, queue: QueueName) -> (usize, usize) {
        self.settings
            .get(&queue)
            .map(|s| (s.keep_completed, s.keep_failed))
            .unwrap_or((100, 500))
    }

    /// Returns the retained failed entries of a queue, newest last.
    pub fn failed_jobs(&self, queue: QueueName) -> Vec<FailedEntry> {
        let state = self.lane(queue).state.lock();
        state.failed.iter().cloned().collect()
    }

    /// Returns the retained completed outcomes of a queue, newest last.
    pub fn completed_outcomes(&self, queue: QueueName) -> Vec<JobOutcome> {
        let state = self.lane(queue).state.lock();
        state.completed.iter().cloned().collect()
    }

    /// Returns the jobs waiting in a queue without removing them.
    pub fn peek_waiting(&self, queue: QueueName) -> Vec<Job> {
        let state = self.lane(queue).state.lock();
        state.waiting.iter().cloned().collect()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn enqueue(
        &self,
        queue: QueueName,
        mut job: Job,
        delay: Duration,
    ) -> Result<(), QueueError> {
        if job.metadata.origin_queue.is_none() {
            job.metadata.origin_queue = Some(queue);
        }
        let lane = self.lane(queue);
        {
            let mut state = lane.state.lock();
            if delay.is_zero() {
                state.waiting.push_back(job);
            } else {
                state.delayed.push((Instant::now() + delay, job));
            }
        }
        lane.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: QueueName,
        timeout: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let lane = self.lane(queue);
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking state so a concurrent
            // enqueue between the check and the wait is not missed.
            let notified = lane.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let next_due = {
                let mut state = lane.state.lock();
                state.promote_due(now);
                if !state.paused {
                    if let Some(mut job) = state.waiting.pop_front() {
                        job.metadata.attempts += 1;
                        state.active.insert(job.id, now);
                        return Ok(Some(job));
                    }
                }
                state.next_due()
            };

            if now >= deadline {
                return Ok(None);
            }
            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn complete(&self, queue: QueueName, outcome: &JobOutcome) -> Result<(), QueueError> {
        let (keep_completed, _) = self.keep_limits(queue);
        let mut state = self.lane(queue).state.lock();
        state.active.remove(&outcome.job_id);
        state.completed_total += 1;
        state.completed.push_back(outcome.clone());
        while state.completed.len() > keep_completed {
            state.completed.pop_front();
        }
        Ok(())
    }

    async fn fail(
        &self,
        queue: QueueName,
        job: Job,
        error: &JobError,
    ) -> Result<RetryDecision, QueueError> {
        let policy = self.policy_for(&job, queue);
        let attempts = job.metadata.attempts;

        {
            let mut state = self.lane(queue).state.lock();
            state.active.remove(&job.id);
        }

        if error.is_retryable() && policy.allows_retry(attempts) {
            let delay = policy.delay_for(attempts);
            self.enqueue(QueueName::Retry, job, delay).await?;
            return Ok(RetryDecision::Retry {
                attempt: attempts,
                delay,
                queue: QueueName::Retry,
            });
        }

        let (_, keep_failed) = self.keep_limits(queue);
        let mut state = self.lane(queue).state.lock();
        state.failed_total += 1;
        state.failed.push_back(FailedEntry {
            job,
            error: error.clone(),
        });
        while state.failed.len() > keep_failed {
            state.failed.pop_front();
        }
        Ok(RetryDecision::DeadLettered { attempts })
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError> {
        let now = Instant::now();
        let mut state = self.lane(queue).state.lock();
        state.promote_due(now);
        let stalled = state
            .active
            .values()
            .filter(|started| now.duration_since(**started) > self.stall_after)
            .count();
        Ok(QueueCounts {
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            completed: state.completed_total,
            failed: state.failed_total,
            delayed: state.delayed.len() as u64,
            stalled: stalled as u64,
        })
    }

    async fn pause(&self, queue: QueueName) -> Result<(), QueueError> {
        let mut state = self.lane(queue).state.lock();
        state.paused = true;
        Ok(())
    }

    async fn resume(&self, queue: QueueName) -> Result<(), QueueError> {
        let lane = self.lane(queue);
        {
            let mut state = lane.state.lock();
            state.paused = false;
        }
        lane.notify.notify_waiters();
        Ok(())
    }

    async fn is_paused(&self, queue: QueueName) -> Result<bool, QueueError> {
        let state = self.lane(queue).state.lock();
        Ok(state.paused)
    }
}
