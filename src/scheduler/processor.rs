//! Job processing.
//!
//! `JobProcessor` dispatches a dequeued job to the handler registered for
//! its kind, bounds it with the job timeout and classifies failures. It
//! never retries on its own: the classified error is handed to the backing
//! store, which decides whether another attempt follows.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::JobError;
use crate::metrics::MetricsCollector;
use crate::pipeline::{AutomationEvent, EventBus};

use super::batching::{BatchPayload, BatchVerdict};
use super::job::{HandlerOutput, Job, JobKind, JobOutcome, JobStatus};
use super::queue::{QueueName, RetryDecision};

/// Kind-specific job handler.
///
/// Handlers drive the browser automation for one application. Any error
/// they return is classified by `JobError::from_handler_error`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<HandlerOutput>;
}

/// Aggregate counters over reported outcomes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingStats {
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub timed_out: u64,
    pub average_duration: Duration,
}

impl ProcessingStats {
    pub fn total(&self) -> u64 {
        self.completed + self.failed
    }
}

#[derive(Default)]
struct SharedStats {
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    timed_out: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedStats {
    fn snapshot(&self) -> ProcessingStats {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let total = completed + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(self.total_duration_ms.load(Ordering::SeqCst) / total)
        } else {
            Duration::ZERO
        };
        ProcessingStats {
            completed,
            failed,
            retried: self.retried.load(Ordering::SeqCst),
            timed_out: self.timed_out.load(Ordering::SeqCst),
            average_duration,
        }
    }
}

#[derive(Debug, Serialize)]
struct MemberResult {
    job_id: Uuid,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JobError>,
}

/// Dispatches jobs to handlers and reports their outcomes.
pub struct JobProcessor {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    events: EventBus,
    metrics: MetricsCollector,
    job_timeout: Duration,
    batch_success_ratio: f64,
    stats: SharedStats,
    waiters: DashMap<Uuid, oneshot::Sender<JobOutcome>>,
}

impl JobProcessor {
    pub fn new(events: EventBus, job_timeout: Duration, batch_success_ratio: f64) -> Self {
        Self {
            handlers: HashMap::new(),
            events,
            metrics: MetricsCollector::new(),
            job_timeout,
            batch_success_ratio,
            stats: SharedStats::default(),
            waiters: DashMap::new(),
        }
    }

    /// Registers the handler for a job kind, replacing any previous one.
    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Builder form of `register`.
    pub fn with_handler(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    /// Returns whether a handler exists for `kind`.
    ///
    /// Batch jobs are processable whenever their members' kinds are.
    pub fn handles(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind) || kind == JobKind::Batch
    }

    /// Registers interest in the final outcome of `job_id`.
    ///
    /// The receiver resolves once, with the attempt that completed the job
    /// or exhausted its retries. Register before enqueueing so no outcome
    /// is missed.
    pub fn watch(&self, job_id: Uuid) -> oneshot::Receiver<JobOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(job_id, tx);
        rx
    }

    /// Drops a waiter registered with `watch`.
    pub fn unwatch(&self, job_id: Uuid) {
        self.waiters.remove(&job_id);
    }

    fn notify_waiter(&self, outcome: &JobOutcome) {
        if let Some((_, tx)) = self.waiters.remove(&outcome.job_id) {
            if tx.send(outcome.clone()).is_err() {
                debug!(job_id = %outcome.job_id, "Outcome waiter went away");
            }
        }
    }

    /// Runs one attempt of `job` pulled from `queue`.
    pub async fn process(&self, queue: QueueName, job: &Job) -> JobOutcome {
        let started_at = Utc::now();
        let start = Instant::now();
        let queued_for = (started_at - job.metadata.created_at)
            .to_std()
            .unwrap_or_default();

        debug!(
            job_id = %job.id,
            queue = %queue,
            kind = %job.kind,
            attempt = job.attempts(),
            "Processing job"
        );

        let (result, timed_out) = match tokio::time::timeout(self.job_timeout, self.run(job)).await
        {
            Ok(result) => (result, false),
            Err(_) => (
                Err(JobError::TransientIo(format!(
                    "job timed out after {}s",
                    self.job_timeout.as_secs()
                ))),
                true,
            ),
        };

        let (status, output, error) = match result {
            Ok(output) => (JobStatus::Completed, Some(output), None),
            Err(e) => (JobStatus::Failed, None, Some(e)),
        };

        JobOutcome {
            job_id: job.id,
            owner_id: job.owner_id.clone(),
            kind: job.kind,
            queue,
            status,
            output,
            error,
            timed_out,
            attempt: job.attempts(),
            started_at,
            completed_at: Utc::now(),
            queued_for,
            duration: start.elapsed(),
        }
    }

    async fn run(&self, job: &Job) -> Result<HandlerOutput, JobError> {
        if job.kind == JobKind::Batch && !self.handlers.contains_key(&JobKind::Batch) {
            return self.run_batch(job).await;
        }

        let handler = self.handlers.get(&job.kind).ok_or_else(|| {
            JobError::Validation(format!("no handler registered for {} jobs", job.kind))
        })?;

        handler
            .handle(job)
            .await
            .map_err(|e| JobError::from_handler_error(&e))
    }

    /// Runs batch members one by one and applies the batch verdict.
    async fn run_batch(&self, job: &Job) -> Result<HandlerOutput, JobError> {
        let payload = BatchPayload::from_job(job)?;
        let total = payload.members.len();
        let mut results = Vec::with_capacity(total);

        for member in &payload.members {
            let result = match self.handlers.get(&member.kind) {
                Some(handler) => match handler.handle(member).await {
                    // A member stopped by a challenge has no one waiting on
                    // it to resolve the challenge.
                    Ok(output) if output.challenge.is_some() => Err(JobError::Fatal(
                        "challenge encountered inside batch".to_string(),
                    )),
                    Ok(_) => Ok(()),
                    Err(e) => Err(JobError::from_handler_error(&e)),
                },
                None => Err(JobError::Validation(format!(
                    "no handler registered for {} jobs",
                    member.kind
                ))),
            };
            results.push(MemberResult {
                job_id: member.id,
                success: result.is_ok(),
                error: result.err(),
            });
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        let verdict = BatchVerdict::evaluate(succeeded, total, self.batch_success_ratio);
        debug!(
            job_id = %job.id,
            succeeded = succeeded,
            total = total,
            success = verdict.success,
            "Batch members processed"
        );

        if let Some(error) = verdict.error() {
            return Err(error);
        }

        Ok(HandlerOutput::new(serde_json::json!({
            "succeeded": succeeded,
            "total": total,
            "members": results,
        })))
    }

    /// Publishes an outcome and records it in stats and metrics.
    ///
    /// `decision` is the backing store's verdict for failed attempts.
    pub fn report(&self, outcome: &JobOutcome, decision: Option<&RetryDecision>) {
        let will_retry = decision.is_some_and(RetryDecision::will_retry);
        let status = match (outcome.status, will_retry) {
            (JobStatus::Completed, _) => "completed",
            (JobStatus::Failed, true) => "retrying",
            (JobStatus::Failed, false) => "failed",
        };
        self.metrics
            .record_job(outcome.queue.as_str(), status, outcome.duration);

        let duration_ms = outcome.duration.as_millis() as u64;
        if outcome.timed_out {
            self.stats.timed_out.fetch_add(1, Ordering::SeqCst);
        }

        if outcome.is_success() {
            self.stats.completed.fetch_add(1, Ordering::SeqCst);
            self.stats
                .total_duration_ms
                .fetch_add(duration_ms, Ordering::SeqCst);
            info!(
                job_id = %outcome.job_id,
                queue = %outcome.queue,
                duration_ms = duration_ms,
                "Job completed"
            );
            self.events.publish(AutomationEvent::JobCompleted {
                outcome: Box::new(outcome.clone()),
            });
            self.notify_waiter(outcome);
            return;
        }

        if will_retry {
            self.stats.retried.fetch_add(1, Ordering::SeqCst);
        } else {
            self.stats.failed.fetch_add(1, Ordering::SeqCst);
            self.stats
                .total_duration_ms
                .fetch_add(duration_ms, Ordering::SeqCst);
        }

        warn!(
            job_id = %outcome.job_id,
            queue = %outcome.queue,
            attempt = outcome.attempt,
            error = ?outcome.error,
            will_retry = will_retry,
            "Job failed"
        );
        self.events.publish(AutomationEvent::JobFailed {
            outcome: Box::new(outcome.clone()),
            will_retry,
        });
        if !will_retry {
            self.notify_waiter(outcome);
        }
    }

    /// Returns aggregate counters.
    pub fn stats(&self) -> ProcessingStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::batching::{BatchKey, FlushTrigger};

    struct StaticHandler {
        fail_with: Option<&'static str>,
    }

    #[async_trait]
    impl JobHandler for StaticHandler {
        async fn handle(&self, job: &Job) -> anyhow::Result<HandlerOutput> {
            match self.fail_with {
                Some(message) => Err(anyhow::anyhow!(message)),
                None => Ok(HandlerOutput::new(serde_json::json!({"job": job.id}))),
            }
        }
    }

    /// Fails jobs whose logical id starts with "bad".
    struct SelectiveHandler;

    #[async_trait]
    impl JobHandler for SelectiveHandler {
        async fn handle(&self, job: &Job) -> anyhow::Result<HandlerOutput> {
            if job.logical_job_id.starts_with("bad") {
                anyhow::bail!("submit button missing");
            }
            Ok(HandlerOutput::default())
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, _job: &Job) -> anyhow::Result<HandlerOutput> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(HandlerOutput::default())
        }
    }

    fn processor() -> JobProcessor {
        JobProcessor::new(EventBus::new(), Duration::from_secs(60), 0.8)
    }

    fn job(kind: JobKind) -> Job {
        Job::new("user-1", "posting-1", kind, serde_json::Value::Null)
    }

    fn batch_job(members: Vec<Job>) -> Job {
        let payload = BatchPayload {
            key: BatchKey::for_job(&members[0]),
            members,
            trigger: FlushTrigger::Size,
        };
        Job::new(
            "user-1",
            "batch",
            JobKind::Batch,
            serde_json::to_value(payload).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_process_success() {
        let processor = processor()
            .with_handler(JobKind::Standard, Arc::new(StaticHandler { fail_with: None }));
        let job = job(JobKind::Standard);

        let outcome = processor.process(QueueName::Standard, &job).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.job_id, job.id);
        assert_eq!(outcome.queue, QueueName::Standard);
        assert!(outcome.output.is_some());
        assert!(outcome.completed_at >= outcome.started_at);
    }

    #[tokio::test]
    async fn test_process_classifies_errors() {
        let processor = processor()
            .with_handler(
                JobKind::Standard,
                Arc::new(StaticHandler {
                    fail_with: Some("net::ERR_CONNECTION_RESET: connection reset"),
                }),
            )
            .with_handler(
                JobKind::Priority,
                Arc::new(StaticHandler {
                    fail_with: Some("form field 'resume' not found"),
                }),
            );

        let outcome = processor
            .process(QueueName::Standard, &job(JobKind::Standard))
            .await;
        assert!(matches!(outcome.error, Some(JobError::TransientIo(_))));
        assert!(outcome.is_retryable());

        let outcome = processor
            .process(QueueName::High, &job(JobKind::Priority))
            .await;
        assert!(matches!(outcome.error, Some(JobError::Fatal(_))));
        assert!(!outcome.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_handler_is_validation_error() {
        let outcome = processor()
            .process(QueueName::Standard, &job(JobKind::Standard))
            .await;
        assert!(matches!(outcome.error, Some(JobError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout_is_transient() {
        let processor = JobProcessor::new(EventBus::new(), Duration::from_secs(5), 0.8)
            .with_handler(JobKind::Standard, Arc::new(SlowHandler));

        let outcome = processor
            .process(QueueName::Standard, &job(JobKind::Standard))
            .await;
        assert!(outcome.timed_out);
        assert!(outcome.is_retryable());
    }

    #[tokio::test]
    async fn test_batch_success_ratio() {
        let processor = processor().with_handler(JobKind::Standard, Arc::new(SelectiveHandler));

        let member = |id: &str| Job::new("user-1", id, JobKind::Standard, serde_json::Value::Null);

        // 4 of 5 succeed: exactly at the 0.8 ratio.
        let members = vec![member("a"), member("b"), member("c"), member("d"), member("bad-1")];
        let outcome = processor.process(QueueName::Batch, &batch_job(members)).await;
        assert!(outcome.is_success());

        // 3 of 5 succeed: fails, not retryable.
        let members = vec![member("a"), member("b"), member("c"), member("bad-1"), member("bad-2")];
        let outcome = processor.process(QueueName::Batch, &batch_job(members)).await;
        assert!(matches!(outcome.error, Some(JobError::Fatal(_))));

        // None succeed: retryable.
        let members = vec![member("bad-1"), member("bad-2")];
        let outcome = processor.process(QueueName::Batch, &batch_job(members)).await;
        assert!(outcome.is_retryable());
    }

    #[tokio::test]
    async fn test_report_publishes_events_and_stats() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let processor = JobProcessor::new(events, Duration::from_secs(60), 0.8).with_handler(
            JobKind::Standard,
            Arc::new(StaticHandler {
                fail_with: Some("ETIMEDOUT"),
            }),
        );

        let outcome = processor
            .process(QueueName::Standard, &job(JobKind::Standard))
            .await;
        let decision = RetryDecision::Retry {
            attempt: 1,
            delay: Duration::from_secs(5),
            queue: QueueName::Retry,
        };
        processor.report(&outcome, Some(&decision));

        match rx.recv().await.unwrap() {
            AutomationEvent::JobFailed { will_retry, .. } => assert!(will_retry),
            other => panic!("unexpected event {:?}", other),
        }

        let stats = processor.stats();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_waiter_receives_final_outcome_only() {
        // One-slot bus with no reader keeps overflowing; waiters do not use it.
        let processor = JobProcessor::new(EventBus::with_capacity(1), Duration::from_secs(60), 0.8)
            .with_handler(
                JobKind::Standard,
                Arc::new(StaticHandler {
                    fail_with: Some("ECONNRESET"),
                }),
            );
        let _lagging = processor.events.subscribe();
        let job = job(JobKind::Standard);
        let mut waiter = processor.watch(job.id);

        let first = processor.process(QueueName::Standard, &job).await;
        let retry = RetryDecision::Retry {
            attempt: 1,
            delay: Duration::from_millis(10),
            queue: QueueName::Retry,
        };
        processor.report(&first, Some(&retry));
        assert!(waiter.try_recv().is_err());

        let last = processor.process(QueueName::Retry, &job).await;
        processor.report(&last, Some(&RetryDecision::DeadLettered { attempts: 2 }));

        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.job_id, job.id);
        assert_eq!(outcome.queue, QueueName::Retry);
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_unwatch_drops_waiter() {
        let processor = processor()
            .with_handler(JobKind::Standard, Arc::new(StaticHandler { fail_with: None }));
        let job = job(JobKind::Standard);
        let waiter = processor.watch(job.id);
        processor.unwatch(job.id);

        let outcome = processor.process(QueueName::Standard, &job).await;
        processor.report(&outcome, None);
        assert!(waiter.await.is_err());
    }
}
