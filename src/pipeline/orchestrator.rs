//! Automation orchestrator tying the scheduler, monitor and resolution
//! chain together.
//!
//! `submit` takes one unit of work through the whole path:
//!
//! 1. Batch-eligible work is handed to the aggregator and returns at once.
//! 2. Everything else is routed, enqueued, and awaited through a per-job
//!    outcome waiter until its final attempt completes or the wait times
//!    out. The event bus only informs observers.
//! 3. If the handler reported a challenge, the resolution chain runs and a
//!    solved challenge is resubmitted once with the solution attached.
//!
//! Job failures are always folded into a [`PipelineResult`]. Only a closed
//! orchestrator or a failing backing store surfaces as `Err`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::challenge::{
    ChallengeKind, ManualInterventionTier, ManualResolutionBroker, ResolutionChain,
    ResolverTier, TierKind,
};
use crate::error::JobError;
use crate::metrics::{init_metrics, QueueMonitor};
use crate::scheduler::{
    allocate_concurrency, Admission, BatchAggregator, HandlerOutput, Job, JobHandler, JobKind,
    JobOutcome, JobProcessor, LoadLedger, MemoryBackend, PoolError, PriorityRouter,
    ProcessingStats, QueueBackend, QueueError, QueueName, RedisBackend, WorkerSet,
};

use super::config::{AutomationConfig, ConfigError};
use super::events::{AutomationEvent, EventBus};
use super::site::{extract_confirmation_number, SiteKind};

/// How many times a job is resubmitted after a solved challenge.
const MAX_CHALLENGE_ROUNDS: usize = 1;

/// Errors that can occur during orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Shutdown has begun; no new work is accepted.
    #[error("Orchestrator is not accepting work")]
    NotAccepting,

    /// The backing store failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A worker pool failed to start or stop.
    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The processor dropped the outcome waiter of a job.
    #[error("Outcome of job {0} was dropped")]
    OutcomeDropped(Uuid),
}

/// Final status of one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Success,
    Failed,
    CaptchaRequired,
    Timeout,
    RateLimited,
    NetworkError,
    /// Held by the aggregator; the batch job reports separately.
    Batched,
}

impl ApplicationStatus {
    /// Status for a failed attempt's error.
    pub fn from_error(error: &JobError, timed_out: bool) -> Self {
        match error {
            JobError::TransientIo(_) if timed_out => ApplicationStatus::Timeout,
            JobError::TransientIo(_) => ApplicationStatus::NetworkError,
            JobError::RateLimited(_) => ApplicationStatus::RateLimited,
            JobError::ResolutionExhausted { .. } => ApplicationStatus::CaptchaRequired,
            _ => ApplicationStatus::Failed,
        }
    }
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApplicationStatus::Success => "success",
            ApplicationStatus::Failed => "failed",
            ApplicationStatus::CaptchaRequired => "captcha_required",
            ApplicationStatus::Timeout => "timeout",
            ApplicationStatus::RateLimited => "rate_limited",
            ApplicationStatus::NetworkError => "network_error",
            ApplicationStatus::Batched => "batched",
        };
        f.write_str(s)
    }
}

/// One unit of work offered to the orchestrator.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub owner_id: String,
    /// Posting identifier.
    pub logical_job_id: String,
    pub kind: JobKind,
    pub priority: Option<u8>,
    pub apply_url: Option<String>,
    pub payload: serde_json::Value,
}

impl WorkItem {
    pub fn new(owner_id: impl Into<String>, logical_job_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            logical_job_id: logical_job_id.into(),
            kind: JobKind::Standard,
            priority: None,
            apply_url: None,
            payload: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_apply_url(mut self, url: impl Into<String>) -> Self {
        self.apply_url = Some(url.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Builds the job, annotating the payload with the apply URL and site.
    fn into_job(self, site: Option<SiteKind>) -> Job {
        let mut payload = self.payload;
        if let serde_json::Value::Object(map) = &mut payload {
            if let Some(url) = &self.apply_url {
                map.insert("apply_url".to_string(), serde_json::json!(url));
            }
            if let Some(site) = site {
                map.insert("site".to_string(), serde_json::json!(site));
            }
        }

        let job = Job::new(self.owner_id, self.logical_job_id, self.kind, payload);
        match self.priority {
            Some(priority) => job.with_priority(priority),
            None => job,
        }
    }
}

/// Elapsed time per pipeline phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub queueing: Duration,
    pub processing: Duration,
    pub challenge_resolution: Duration,
    pub total: Duration,
}

/// What the resolution chain did for a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeSummary {
    pub challenge_id: Uuid,
    pub kind: ChallengeKind,
    pub resolved: bool,
    pub method: Option<TierKind>,
    pub tiers_attempted: Vec<TierKind>,
}

/// Structured result of one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Job id of the last attempt, or of the held job when batched.
    pub job_id: Uuid,
    pub owner_id: String,
    pub logical_job_id: String,
    pub status: ApplicationStatus,
    pub queue: Option<QueueName>,
    pub site: Option<SiteKind>,
    pub attempts: u32,
    pub output: Option<HandlerOutput>,
    pub error: Option<JobError>,
    pub confirmation_number: Option<String>,
    pub challenge: Option<ChallengeSummary>,
    /// Batch key when the job was held for batching.
    pub batch_key: Option<String>,
    pub timings: PhaseTimings,
}

impl PipelineResult {
    fn for_job(job: &Job, site: Option<SiteKind>, status: ApplicationStatus) -> Self {
        Self {
            job_id: job.id,
            owner_id: job.owner_id.clone(),
            logical_job_id: job.logical_job_id.clone(),
            status,
            queue: None,
            site,
            attempts: job.attempts(),
            output: None,
            error: None,
            confirmation_number: None,
            challenge: None,
            batch_key: None,
            timings: PhaseTimings::default(),
        }
    }

    fn rejected(job: &Job, site: Option<SiteKind>, error: JobError) -> Self {
        let mut result = Self::for_job(job, site, ApplicationStatus::Failed);
        result.error = Some(error);
        result
    }

    fn apply_outcome(&mut self, outcome: JobOutcome) {
        self.job_id = outcome.job_id;
        self.queue = Some(outcome.queue);
        self.attempts = outcome.attempt;
        self.status = match &outcome.error {
            None => ApplicationStatus::Success,
            Some(error) => ApplicationStatus::from_error(error, outcome.timed_out),
        };
        self.confirmation_number = outcome.output.as_ref().and_then(confirmation_of);
        self.error = outcome.error;
        self.output = outcome.output;
    }

    pub fn is_success(&self) -> bool {
        self.status == ApplicationStatus::Success
    }
}

fn confirmation_of(output: &HandlerOutput) -> Option<String> {
    output
        .data
        .get("confirmation_number")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| output.message.as_deref().and_then(extract_confirmation_number))
}

/// Builds the follow-up job that carries a challenge solution.
fn resubmission(job: &Job, challenge_id: Uuid, solution: &str) -> Job {
    let answer = serde_json::json!({
        "challenge_id": challenge_id,
        "solution": solution,
    });
    let payload = match job.payload.clone() {
        serde_json::Value::Object(mut map) => {
            map.insert("challenge_solution".to_string(), answer);
            serde_json::Value::Object(map)
        }
        other => serde_json::json!({ "input": other, "challenge_solution": answer }),
    };
    Job::new(
        job.owner_id.clone(),
        job.logical_job_id.clone(),
        job.kind,
        payload,
    )
    .with_priority(job.priority())
}

/// Statistics about orchestrated submissions.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub batched: u64,
    pub challenges_detected: u64,
    pub challenges_resolved: u64,
    /// Average end-to-end duration of awaited submissions.
    pub average_duration: Duration,
    awaited: u64,
}

impl PipelineStats {
    fn record(&mut self, result: &PipelineResult) {
        self.submitted += 1;
        match result.status {
            ApplicationStatus::Batched => {
                self.batched += 1;
                return;
            }
            ApplicationStatus::Success => self.succeeded += 1,
            _ => self.failed += 1,
        }
        if let Some(challenge) = &result.challenge {
            self.challenges_detected += 1;
            if challenge.resolved {
                self.challenges_resolved += 1;
            }
        }

        self.awaited += 1;
        // Incremental average: avg = avg + (new - avg) / n
        let n = self.awaited as f64;
        let old_avg = self.average_duration.as_secs_f64();
        let new_val = result.timings.total.as_secs_f64();
        self.average_duration = Duration::from_secs_f64(old_avg + (new_val - old_avg) / n);
    }
}

/// Builder for [`AutomationOrchestrator`].
pub struct OrchestratorBuilder {
    config: AutomationConfig,
    backend: Option<Arc<dyn QueueBackend>>,
    events: Option<EventBus>,
    handlers: Vec<(JobKind, Arc<dyn JobHandler>)>,
    tiers: Vec<Arc<dyn ResolverTier>>,
    broker: Option<Arc<ManualResolutionBroker>>,
}

impl OrchestratorBuilder {
    /// Uses an existing backing store. Defaults to an in-memory store.
    pub fn backend(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn handler(mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push((kind, handler));
        self
    }

    /// Registers a resolver tier. A manual tier registered here replaces
    /// the built-in one.
    pub fn tier(mut self, tier: Arc<dyn ResolverTier>) -> Self {
        self.tiers.push(tier);
        self
    }

    pub fn broker(mut self, broker: Arc<ManualResolutionBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Wires every component. Nothing runs until `start`.
    pub fn build(self) -> Result<AutomationOrchestrator, OrchestratorError> {
        let config = self.config;
        config.validate()?;

        let events = self.events.unwrap_or_default();
        let backend = self.backend.unwrap_or_else(|| {
            Arc::new(MemoryBackend::new(
                config.queue.settings.clone(),
                config.queue.stall_after,
            ))
        });

        let ledger = Arc::new(LoadLedger::new(config.routing.decay_window));
        let router = PriorityRouter::new(config.priority, config.routing.load_balancing, ledger);

        let mut processor = JobProcessor::new(
            events.clone(),
            config.queue.job_timeout,
            config.batching.success_ratio,
        );
        for (kind, handler) in self.handlers {
            processor.register(kind, handler);
        }
        let processor = Arc::new(processor);

        let allocation =
            allocate_concurrency(config.queue.global_concurrency, &config.concurrency_shares());
        let workers = WorkerSet::new(
            &allocation,
            config.worker_pool_config(),
            Arc::clone(&backend),
            Arc::clone(&processor),
        );

        let aggregator = BatchAggregator::new(
            config.batching.clone(),
            config.priority.high,
            Arc::clone(&backend),
            events.clone(),
        );

        let monitor = Arc::new(
            QueueMonitor::new(config.monitoring.clone(), Arc::clone(&backend), events.clone())
                .with_pool_stats(workers.stats_board()),
        );

        let broker = self.broker.unwrap_or_default();
        let mut chain = ResolutionChain::new(config.resolution.clone(), events.clone());
        chain.register(Arc::new(ManualInterventionTier::new(
            Arc::clone(&broker),
            events.clone(),
            config.resolution.manual_timeout,
        )));
        for tier in self.tiers {
            chain.register(tier);
        }

        Ok(AutomationOrchestrator {
            config,
            backend,
            events,
            router,
            aggregator,
            processor,
            workers: Mutex::new(workers),
            monitor,
            chain,
            broker,
            accepting: AtomicBool::new(true),
            stats: RwLock::new(PipelineStats::default()),
        })
    }
}

/// Coordinates routing, batching, workers, monitoring and challenge
/// resolution.
pub struct AutomationOrchestrator {
    config: AutomationConfig,
    backend: Arc<dyn QueueBackend>,
    events: EventBus,
    router: PriorityRouter,
    aggregator: BatchAggregator,
    processor: Arc<JobProcessor>,
    workers: Mutex<WorkerSet>,
    monitor: Arc<QueueMonitor>,
    chain: ResolutionChain,
    broker: Arc<ManualResolutionBroker>,
    accepting: AtomicBool,
    stats: RwLock<PipelineStats>,
}

impl AutomationOrchestrator {
    pub fn builder(config: AutomationConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            backend: None,
            events: None,
            handlers: Vec::new(),
            tiers: Vec::new(),
            broker: None,
        }
    }

    /// Builder preconfigured with a Redis backing store.
    pub async fn redis_builder(
        config: AutomationConfig,
    ) -> Result<OrchestratorBuilder, OrchestratorError> {
        let backend = RedisBackend::connect(
            &config.queue.redis_url,
            &config.queue.key_prefix,
            config.queue.settings.clone(),
            config.queue.stall_after,
        )
        .await?;
        Ok(Self::builder(config).backend(Arc::new(backend)))
    }

    /// Starts worker pools and the monitor.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        if let Err(e) = init_metrics() {
            warn!(error = %e, "Failed to register metrics");
        }

        let mut workers = self.workers.lock().await;
        workers.start_all().await?;
        let allocation = workers.allocation();
        drop(workers);

        self.monitor.start();
        info!(
            immediate = allocation.get(&QueueName::Immediate).copied().unwrap_or(0),
            high = allocation.get(&QueueName::High).copied().unwrap_or(0),
            standard = allocation.get(&QueueName::Standard).copied().unwrap_or(0),
            batch = allocation.get(&QueueName::Batch).copied().unwrap_or(0),
            retry = allocation.get(&QueueName::Retry).copied().unwrap_or(0),
            "Automation orchestrator started"
        );
        Ok(())
    }

    /// Submits one unit of work and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns `NotAccepting` after shutdown began, and `Queue` when the
    /// backing store fails. Every job failure is a `PipelineResult`.
    pub async fn submit(&self, item: WorkItem) -> Result<PipelineResult, OrchestratorError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(OrchestratorError::NotAccepting);
        }

        let start = Instant::now();
        let site = item.apply_url.as_deref().map(SiteKind::detect);
        let job = item.into_job(site);

        let validated = job.validate().and_then(|()| {
            if self.processor.handles(job.kind) {
                Ok(())
            } else {
                Err(JobError::Validation(format!(
                    "no handler registered for {} jobs",
                    job.kind
                )))
            }
        });
        if let Err(e) = validated {
            warn!(job_id = %job.id, error = %e, "Rejected invalid job");
            let result = PipelineResult::rejected(&job, site, e);
            self.stats.write().await.record(&result);
            return Ok(result);
        }

        let (held_id, logical_job_id) = (job.id, job.logical_job_id.clone());
        let job = match self.aggregator.admit(job).await? {
            Admission::Direct(job) => job,
            Admission::Batched { key, pending, .. } => {
                debug!(job_id = %held_id, key = %key, pending = pending, "Job admitted to batch");
                let mut result = PipelineResult {
                    job_id: held_id,
                    owner_id: key.owner_id.clone(),
                    logical_job_id,
                    status: ApplicationStatus::Batched,
                    queue: Some(QueueName::Batch),
                    site,
                    attempts: 0,
                    output: None,
                    error: None,
                    confirmation_number: None,
                    challenge: None,
                    batch_key: Some(key.to_string()),
                    timings: PhaseTimings::default(),
                };
                result.timings.total = start.elapsed();
                self.stats.write().await.record(&result);
                return Ok(result);
            }
        };

        let mut result = self.run(job, site).await?;
        result.timings.total = start.elapsed();

        info!(
            job_id = %result.job_id,
            owner_id = %result.owner_id,
            status = %result.status,
            total_ms = result.timings.total.as_millis() as u64,
            "Submission finished"
        );
        self.stats.write().await.record(&result);
        Ok(result)
    }

    async fn run(
        &self,
        mut job: Job,
        site: Option<SiteKind>,
    ) -> Result<PipelineResult, OrchestratorError> {
        let mut result = PipelineResult::for_job(&job, site, ApplicationStatus::Failed);
        let mut rounds = 0;

        loop {
            let queue = match self.router.route(&job) {
                Ok(queue) => queue,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Routing failed");
                    result.error = Some(e);
                    return Ok(result);
                }
            };
            let waiter = self.processor.watch(job.id);
            if let Err(e) = self.enqueue(queue, job.clone()).await {
                self.processor.unwatch(job.id);
                return Err(e);
            }

            let Some(outcome) = self.await_outcome(waiter, job.id).await? else {
                warn!(job_id = %job.id, queue = %queue, "Timed out waiting for job");
                result.job_id = job.id;
                result.queue = Some(queue);
                result.status = ApplicationStatus::Timeout;
                result.error = Some(JobError::TransientIo(format!(
                    "no outcome within {:?}",
                    self.config.queue.job_wait_timeout
                )));
                return Ok(result);
            };

            result.timings.queueing += outcome.queued_for;
            result.timings.processing += outcome.duration;
            let challenge = outcome.challenge().cloned();
            result.apply_outcome(outcome);

            let Some(challenge) = challenge else {
                return Ok(result);
            };
            if rounds >= MAX_CHALLENGE_ROUNDS {
                warn!(
                    job_id = %job.id,
                    challenge_id = %challenge.id,
                    "Challenge persisted after resubmission"
                );
                result.status = ApplicationStatus::CaptchaRequired;
                return Ok(result);
            }

            let report = self.chain.resolve(&challenge).await;
            result.timings.challenge_resolution += report.elapsed;
            result.challenge = Some(ChallengeSummary {
                challenge_id: challenge.id,
                kind: challenge.kind,
                resolved: report.is_resolved(),
                method: report.outcome.method,
                tiers_attempted: report.attempted_tiers(),
            });

            let solution = report.outcome.solution.clone();
            match (report.into_result(), solution) {
                (Ok(_), Some(solution)) => {
                    rounds += 1;
                    info!(
                        job_id = %job.id,
                        challenge_id = %challenge.id,
                        "Resubmitting job with challenge solution"
                    );
                    job = resubmission(&job, challenge.id, &solution);
                }
                (Ok(_), None) => {
                    result.status = ApplicationStatus::CaptchaRequired;
                    return Ok(result);
                }
                (Err(e), _) => {
                    result.status = ApplicationStatus::CaptchaRequired;
                    result.error = Some(e);
                    return Ok(result);
                }
            }
        }
    }

    async fn enqueue(&self, queue: QueueName, job: Job) -> Result<(), OrchestratorError> {
        let (job_id, owner_id, kind, priority) =
            (job.id, job.owner_id.clone(), job.kind, job.priority());
        self.backend.enqueue(queue, job, Duration::ZERO).await?;
        self.events.publish(AutomationEvent::JobAdded {
            job_id,
            owner_id,
            kind,
            queue,
            priority,
        });
        debug!(job_id = %job_id, queue = %queue, priority = priority, "Job enqueued");
        Ok(())
    }

    /// Waits for the final attempt of `job_id`. `None` on wait timeout.
    async fn await_outcome(
        &self,
        waiter: oneshot::Receiver<JobOutcome>,
        job_id: Uuid,
    ) -> Result<Option<JobOutcome>, OrchestratorError> {
        match tokio::time::timeout(self.config.queue.job_wait_timeout, waiter).await {
            Ok(Ok(outcome)) => Ok(Some(outcome)),
            Ok(Err(_)) => Err(OrchestratorError::OutcomeDropped(job_id)),
            Err(_) => {
                self.processor.unwatch(job_id);
                Ok(None)
            }
        }
    }

    /// Stops dequeues from a queue.
    pub async fn pause(&self, queue: QueueName) -> Result<(), OrchestratorError> {
        self.workers.lock().await.pause(queue).await?;
        Ok(())
    }

    /// Resumes dequeues from a queue.
    pub async fn resume(&self, queue: QueueName) -> Result<(), OrchestratorError> {
        self.workers.lock().await.resume(queue).await?;
        Ok(())
    }

    /// Forwards a human-provided solution to a waiting manual tier.
    pub fn provide_solution(&self, request_id: Uuid, solution: impl Into<String>) -> bool {
        self.broker.provide_solution(request_id, solution)
    }

    /// Stops accepting work, flushes pending batches, stops the worker
    /// pools, takes a final monitor snapshot and closes the backing store.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down automation orchestrator");

        let flushed = self.aggregator.flush_all().await;
        if flushed > 0 {
            info!(batches = flushed, "Flushed pending batches");
        }

        let pools = self.workers.lock().await.shutdown_all().await;
        if let Err(e) = &pools {
            error!(error = %e, "Worker pools did not stop cleanly");
        }

        if let Err(e) = self.monitor.stop().await {
            warn!(error = %e, "Final metrics snapshot failed");
        }

        self.backend.close().await?;
        info!("Automation orchestrator stopped");
        pools.map_err(OrchestratorError::from)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AutomationEvent> {
        self.events.subscribe()
    }

    pub fn broker(&self) -> &Arc<ManualResolutionBroker> {
        &self.broker
    }

    pub fn monitor(&self) -> &Arc<QueueMonitor> {
        &self.monitor
    }

    pub fn router(&self) -> &PriorityRouter {
        &self.router
    }

    pub fn aggregator(&self) -> &BatchAggregator {
        &self.aggregator
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn config(&self) -> &AutomationConfig {
        &self.config
    }

    pub async fn allocation(&self) -> HashMap<QueueName, usize> {
        self.workers.lock().await.allocation()
    }

    pub async fn stats(&self) -> PipelineStats {
        self.stats.read().await.clone()
    }

    pub fn processing_stats(&self) -> ProcessingStats {
        self.processor.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeContext;

    #[test]
    fn test_status_from_error() {
        assert_eq!(
            ApplicationStatus::from_error(&JobError::TransientIo("reset".into()), false),
            ApplicationStatus::NetworkError
        );
        assert_eq!(
            ApplicationStatus::from_error(&JobError::TransientIo("slow".into()), true),
            ApplicationStatus::Timeout
        );
        assert_eq!(
            ApplicationStatus::from_error(&JobError::RateLimited("429".into()), false),
            ApplicationStatus::RateLimited
        );
        assert_eq!(
            ApplicationStatus::from_error(
                &JobError::ResolutionExhausted {
                    challenge_id: Uuid::new_v4(),
                    attempted: 2
                },
                false
            ),
            ApplicationStatus::CaptchaRequired
        );
        assert_eq!(
            ApplicationStatus::from_error(&JobError::Fatal("form changed".into()), false),
            ApplicationStatus::Failed
        );
    }

    #[test]
    fn test_work_item_annotates_payload() {
        let site = Some(SiteKind::Greenhouse);
        let job = WorkItem::new("user-1", "posting-9")
            .with_priority(80)
            .with_apply_url("https://boards.greenhouse.io/acme/jobs/9")
            .into_job(site);

        assert_eq!(job.priority(), 80);
        assert_eq!(job.payload["site"], "greenhouse");
        assert_eq!(job.payload["apply_url"], "https://boards.greenhouse.io/acme/jobs/9");
    }

    #[test]
    fn test_resubmission_carries_solution() {
        let job = Job::new("user-1", "posting-9", JobKind::Priority, serde_json::json!({"a": 1}))
            .with_priority(90);
        let challenge = ChallengeContext::new(ChallengeKind::Text, job.id, "user-1", vec![]);

        let next = resubmission(&job, challenge.id, "x7k2p");
        assert_ne!(next.id, job.id);
        assert_eq!(next.priority(), 90);
        assert_eq!(next.kind, JobKind::Priority);
        assert_eq!(next.payload["a"], 1);
        assert_eq!(next.payload["challenge_solution"]["solution"], "x7k2p");

        let wrapped = resubmission(
            &Job::new("u", "p", JobKind::Standard, serde_json::json!("raw")),
            challenge.id,
            "s",
        );
        assert_eq!(wrapped.payload["input"], "raw");
    }

    #[test]
    fn test_confirmation_prefers_structured_data() {
        let output = HandlerOutput::new(serde_json::json!({"confirmation_number": "LV-001234"}))
            .with_message("Reference: ZZ99999999");
        assert_eq!(confirmation_of(&output).as_deref(), Some("LV-001234"));

        let output = HandlerOutput::new(serde_json::Value::Null)
            .with_message("Your confirmation number is GH-88231X");
        assert_eq!(confirmation_of(&output).as_deref(), Some("GH-88231X"));
    }

    #[test]
    fn test_stats_record() {
        let job = Job::new("u", "p", JobKind::Standard, serde_json::Value::Null);
        let mut stats = PipelineStats::default();

        let mut ok = PipelineResult::for_job(&job, None, ApplicationStatus::Success);
        ok.timings.total = Duration::from_secs(2);
        stats.record(&ok);

        let mut failed = PipelineResult::for_job(&job, None, ApplicationStatus::CaptchaRequired);
        failed.timings.total = Duration::from_secs(4);
        failed.challenge = Some(ChallengeSummary {
            challenge_id: Uuid::new_v4(),
            kind: ChallengeKind::Recaptcha,
            resolved: false,
            method: None,
            tiers_attempted: vec![TierKind::PaidService],
        });
        stats.record(&failed);

        stats.record(&PipelineResult::for_job(&job, None, ApplicationStatus::Batched));

        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.batched, 1);
        assert_eq!(stats.challenges_detected, 1);
        assert_eq!(stats.challenges_resolved, 0);
        assert_eq!(stats.average_duration, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_refused() {
        let config = AutomationConfig::default();
        let orchestrator = AutomationOrchestrator::builder(config).build().unwrap();
        orchestrator.shutdown().await.unwrap();

        let err = orchestrator
            .submit(WorkItem::new("user-1", "posting-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotAccepting));
    }

    #[tokio::test]
    async fn test_invalid_work_is_a_failed_result() {
        let orchestrator = AutomationOrchestrator::builder(AutomationConfig::default())
            .build()
            .unwrap();

        let result = orchestrator
            .submit(WorkItem::new("", "posting-1").with_priority(90))
            .await
            .unwrap();
        assert_eq!(result.status, ApplicationStatus::Failed);
        assert!(matches!(result.error, Some(JobError::Validation(_))));
    }

    struct NoopHandler;

    #[async_trait::async_trait]
    impl JobHandler for NoopHandler {
        async fn handle(&self, _job: &Job) -> anyhow::Result<HandlerOutput> {
            Ok(HandlerOutput::default())
        }
    }

    #[tokio::test]
    async fn test_unhandled_kind_is_rejected_before_enqueue() {
        let backend = Arc::new(MemoryBackend::new(
            crate::scheduler::QueueSettings::default_map(),
            Duration::from_secs(30),
        ));
        let orchestrator = AutomationOrchestrator::builder(AutomationConfig::default())
            .backend(backend.clone())
            .handler(JobKind::Standard, Arc::new(NoopHandler))
            .build()
            .unwrap();

        let result = orchestrator
            .submit(
                WorkItem::new("user-1", "posting-1")
                    .with_kind(JobKind::Priority)
                    .with_priority(90),
            )
            .await
            .unwrap();
        assert_eq!(result.status, ApplicationStatus::Failed);
        assert!(matches!(result.error, Some(JobError::Validation(_))));

        for queue in QueueName::ALL {
            assert_eq!(backend.counts(queue).await.unwrap().waiting, 0);
        }
    }
}
