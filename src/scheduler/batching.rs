//! Size- and time-triggered batching of low-priority work.
//!
//! Batch-eligible jobs accumulate in a pending batch keyed by owner and job
//! kind. A pending batch is flushed exactly once: when it reaches the batch
//! size, when its max-wait timer fires, or on shutdown. Flushing removes the
//! batch from the pending map under the same shard lock that appends take,
//! so a later admission always starts a fresh batch.
//!
//! A flush turns the members into one synthetic `JobKind::Batch` job on the
//! `batch` queue. Its priority is the lowest member priority and its payload
//! is a serialized `BatchPayload`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::JobError;
use crate::metrics::MetricsCollector;
use crate::pipeline::config::duration_ms;
use crate::pipeline::{AutomationEvent, EventBus};

use super::job::{Job, JobKind};
use super::queue::{QueueBackend, QueueError, QueueName};

/// Batching settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Whether eligible jobs are batched at all.
    pub enabled: bool,
    /// Member count that triggers an immediate flush.
    pub batch_size: usize,
    /// Enqueue delay applied to the flushed batch job.
    #[serde(with = "duration_ms")]
    pub batch_delay: Duration,
    /// Longest a pending batch waits for more members.
    #[serde(with = "duration_ms")]
    pub max_batch_wait: Duration,
    /// Fraction of members that must succeed for the batch to succeed.
    pub success_ratio: f64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 50,
            batch_delay: Duration::ZERO,
            max_batch_wait: Duration::from_secs(30),
            success_ratio: 0.8,
        }
    }
}

/// What caused a pending batch to be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    /// The batch reached the configured size.
    Size,
    /// The max-wait timer fired.
    Timeout,
    /// The aggregator was drained on shutdown.
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timeout => "timeout",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Grouping identity of a pending batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchKey {
    pub owner_id: String,
    pub kind: JobKind,
}

impl BatchKey {
    /// Key a job accumulates under.
    pub fn for_job(job: &Job) -> Self {
        Self {
            owner_id: job.owner_id.clone(),
            kind: job.kind,
        }
    }
}

impl std::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.owner_id, self.kind)
    }
}

/// Payload of a synthetic batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPayload {
    pub key: BatchKey,
    pub members: Vec<Job>,
    pub trigger: FlushTrigger,
}

impl BatchPayload {
    /// Decodes the payload of a batch job.
    pub fn from_job(job: &Job) -> Result<Self, JobError> {
        serde_json::from_value(job.payload.clone()).map_err(|e| {
            JobError::Validation(format!("job {} has no valid batch payload: {}", job.id, e))
        })
    }
}

/// Result of offering a job to the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Not batch-eligible; route it normally.
    Direct(Job),
    /// Held in a pending batch.
    Batched {
        key: BatchKey,
        /// Members in the batch after this admission.
        pending: usize,
        /// Batch job id if this admission triggered a flush.
        flushed: Option<Uuid>,
    },
}

/// Batch-level verdict over member results.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchVerdict {
    pub succeeded: usize,
    pub total: usize,
    pub success: bool,
    /// Only a batch in which no member succeeded is worth retrying.
    pub retryable: bool,
}

impl BatchVerdict {
    pub fn evaluate(succeeded: usize, total: usize, success_ratio: f64) -> Self {
        let ratio = if total == 0 {
            1.0
        } else {
            succeeded as f64 / total as f64
        };
        let success = ratio >= success_ratio;
        Self {
            succeeded,
            total,
            success,
            retryable: !success && succeeded == 0,
        }
    }

    /// Error the batch job fails with, if it fails.
    pub fn error(&self) -> Option<JobError> {
        if self.success {
            return None;
        }
        let message = format!(
            "{} of {} batch members succeeded",
            self.succeeded, self.total
        );
        Some(if self.retryable {
            JobError::TransientIo(message)
        } else {
            JobError::Fatal(message)
        })
    }
}

struct PendingBatch {
    generation: u64,
    members: Vec<Job>,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    config: BatchingConfig,
    high_threshold: u8,
    pending: DashMap<BatchKey, PendingBatch>,
    backend: Arc<dyn QueueBackend>,
    events: EventBus,
    metrics: MetricsCollector,
    generation: AtomicU64,
}

/// Buffers batch-eligible jobs by key.
#[derive(Clone)]
pub struct BatchAggregator {
    inner: Arc<Inner>,
}

impl BatchAggregator {
    /// Creates an aggregator that flushes into `backend`.
    ///
    /// `high_threshold` is the priority at or above which jobs are never
    /// batched.
    pub fn new(
        config: BatchingConfig,
        high_threshold: u8,
        backend: Arc<dyn QueueBackend>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                high_threshold,
                pending: DashMap::new(),
                backend,
                events,
                metrics: MetricsCollector::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Returns whether `job` would be held for batching.
    pub fn is_eligible(&self, job: &Job) -> bool {
        self.inner.config.enabled
            && job.kind == JobKind::Standard
            && job.priority() < self.inner.high_threshold
    }

    /// Offers a job to the aggregator.
    ///
    /// # Errors
    ///
    /// Returns the backing-store error if a size-triggered flush could not
    /// be enqueued. The members of that batch are lost.
    pub async fn admit(&self, job: Job) -> Result<Admission, QueueError> {
        if !self.is_eligible(&job) {
            return Ok(Admission::Direct(job));
        }

        let key = BatchKey::for_job(&job);
        let batch_size = self.inner.config.batch_size.max(1);

        let (pending, ready) = match self.inner.pending.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().members.push(job);
                let len = occupied.get().members.len();
                if len >= batch_size {
                    let batch = occupied.remove();
                    if let Some(timer) = batch.timer {
                        timer.abort();
                    }
                    (len, Some(batch.members))
                } else {
                    (len, None)
                }
            }
            Entry::Vacant(vacant) => {
                if batch_size == 1 {
                    (1, Some(vec![job]))
                } else {
                    let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                    let timer = spawn_timer(
                        Arc::downgrade(&self.inner),
                        key.clone(),
                        generation,
                        self.inner.config.max_batch_wait,
                    );
                    vacant.insert(PendingBatch {
                        generation,
                        members: vec![job],
                        timer: Some(timer),
                    });
                    (1, None)
                }
            }
        };

        let flushed = match ready {
            Some(members) => Some(
                self.inner
                    .flush(key.clone(), members, FlushTrigger::Size)
                    .await?,
            ),
            None => {
                debug!(key = %key, pending = pending, "Job held for batching");
                None
            }
        };

        Ok(Admission::Batched {
            key,
            pending,
            flushed,
        })
    }

    /// Flushes every pending batch. Returns the number of batch jobs created.
    pub async fn flush_all(&self) -> usize {
        let keys: Vec<BatchKey> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut flushed = 0;
        for key in keys {
            let Some((key, batch)) = self.inner.pending.remove(&key) else {
                continue;
            };
            if let Some(timer) = batch.timer {
                timer.abort();
            }
            match self
                .inner
                .flush(key.clone(), batch.members, FlushTrigger::Shutdown)
                .await
            {
                Ok(_) => flushed += 1,
                Err(e) => error!(key = %key, error = %e, "Failed to flush batch on shutdown"),
            }
        }
        flushed
    }

    /// Members currently pending under `key`.
    pub fn pending_count(&self, key: &BatchKey) -> usize {
        self.inner
            .pending
            .get(key)
            .map(|batch| batch.members.len())
            .unwrap_or(0)
    }

    /// Number of pending batches.
    pub fn pending_batches(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn config(&self) -> &BatchingConfig {
        &self.inner.config
    }
}

impl Inner {
    async fn flush(
        &self,
        key: BatchKey,
        members: Vec<Job>,
        trigger: FlushTrigger,
    ) -> Result<Uuid, QueueError> {
        let priority = members.iter().map(Job::priority).min().unwrap_or(0);
        let count = members.len();
        let payload = BatchPayload {
            key: key.clone(),
            members,
            trigger,
        };

        let job = Job::new(
            key.owner_id.clone(),
            format!("batch:{}", key),
            JobKind::Batch,
            serde_json::to_value(&payload)?,
        )
        .with_priority(priority);
        let batch_job_id = job.id;

        self.backend
            .enqueue(QueueName::Batch, job, self.config.batch_delay)
            .await?;

        self.metrics.record_batch_flush(trigger.as_str(), count);
        self.events.publish(AutomationEvent::BatchFlushed {
            batch_job_id,
            key: key.to_string(),
            members: count,
            trigger,
        });
        self.events.publish(AutomationEvent::JobAdded {
            job_id: batch_job_id,
            owner_id: key.owner_id.clone(),
            kind: JobKind::Batch,
            queue: QueueName::Batch,
            priority,
        });

        info!(
            key = %key,
            batch_job_id = %batch_job_id,
            members = count,
            trigger = %trigger,
            "Flushed batch"
        );
        Ok(batch_job_id)
    }
}

/// Fires the max-wait flush for one generation of a pending batch.
///
/// The timer only holds a weak reference, so dropping the aggregator
/// cancels outstanding flushes.
fn spawn_timer(
    inner: Weak<Inner>,
    key: BatchKey,
    generation: u64,
    wait: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(wait).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        // A size flush may already have taken this generation, and a newer
        // batch may have started under the same key.
        let Some((key, batch)) = inner
            .pending
            .remove_if(&key, |_, batch| batch.generation == generation)
        else {
            return;
        };

        if let Err(e) = inner
            .flush(key.clone(), batch.members, FlushTrigger::Timeout)
            .await
        {
            error!(key = %key, error = %e, "Failed to flush batch on timeout");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::queue::MemoryBackend;

    fn standard_job(owner: &str, priority: u8) -> Job {
        Job::new(owner, "posting", JobKind::Standard, serde_json::Value::Null)
            .with_priority(priority)
    }

    fn aggregator(batch_size: usize, backend: Arc<MemoryBackend>) -> (BatchAggregator, EventBus) {
        let events = EventBus::new();
        let config = BatchingConfig {
            batch_size,
            ..Default::default()
        };
        (
            BatchAggregator::new(config, 75, backend, events.clone()),
            events,
        )
    }

    fn batch_payloads(backend: &MemoryBackend) -> Vec<BatchPayload> {
        backend
            .peek_waiting(QueueName::Batch)
            .iter()
            .map(|job| BatchPayload::from_job(job).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_ineligible_jobs_pass_through() {
        let backend = Arc::new(MemoryBackend::with_defaults());
        let (agg, _) = aggregator(2, backend);

        let urgent = standard_job("user-1", 80);
        assert_eq!(
            agg.admit(urgent.clone()).await.unwrap(),
            Admission::Direct(urgent)
        );

        let flagged =
            Job::new("user-1", "posting", JobKind::Priority, serde_json::Value::Null).with_priority(10);
        assert!(matches!(
            agg.admit(flagged).await.unwrap(),
            Admission::Direct(_)
        ));
        assert_eq!(agg.pending_batches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_flush_then_new_batch() {
        let backend = Arc::new(MemoryBackend::with_defaults());
        let (agg, _) = aggregator(2, backend.clone());

        let jobs: Vec<Job> = (0..3).map(|_| standard_job("user-1", 10)).collect();

        let first = agg.admit(jobs[0].clone()).await.unwrap();
        assert!(matches!(
            first,
            Admission::Batched {
                pending: 1,
                flushed: None,
                ..
            }
        ));

        let second = agg.admit(jobs[1].clone()).await.unwrap();
        let Admission::Batched {
            pending: 2,
            flushed: Some(batch_id),
            ..
        } = second
        else {
            panic!("second admission should flush, got {:?}", second);
        };

        let waiting = backend.peek_waiting(QueueName::Batch);
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, batch_id);
        assert_eq!(waiting[0].kind, JobKind::Batch);
        assert_eq!(waiting[0].priority(), 10);

        let payload = BatchPayload::from_job(&waiting[0]).unwrap();
        assert_eq!(payload.members.len(), 2);
        assert_eq!(payload.members[0].id, jobs[0].id);
        assert_eq!(payload.members[1].id, jobs[1].id);
        assert_eq!(payload.trigger, FlushTrigger::Size);

        agg.admit(jobs[2].clone()).await.unwrap();
        let key = BatchKey::for_job(&jobs[2]);
        assert_eq!(agg.pending_count(&key), 1);

        // The first batch's timer was cancelled; only the new one fires.
        tokio::time::sleep(Duration::from_secs(31)).await;
        let payloads = batch_payloads(&backend);
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1].members.len(), 1);
        assert_eq!(payloads[1].members[0].id, jobs[2].id);
        assert_eq!(payloads[1].trigger, FlushTrigger::Timeout);
        assert_eq!(agg.pending_count(&key), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(batch_payloads(&backend).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_flush_uses_min_priority() {
        let backend = Arc::new(MemoryBackend::with_defaults());
        let (agg, events) = aggregator(50, backend.clone());
        let mut rx = events.subscribe();

        agg.admit(standard_job("user-1", 40)).await.unwrap();
        agg.admit(standard_job("user-1", 12)).await.unwrap();
        agg.admit(standard_job("user-2", 5)).await.unwrap();
        assert_eq!(agg.pending_batches(), 2);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(backend.peek_waiting(QueueName::Batch).is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let waiting = backend.peek_waiting(QueueName::Batch);
        assert_eq!(waiting.len(), 2);
        let user1 = waiting
            .iter()
            .find(|job| job.owner_id == "user-1")
            .expect("user-1 batch");
        assert_eq!(user1.priority(), 12);

        let mut flushed = 0;
        while let Ok(event) = rx.try_recv() {
            if let AutomationEvent::BatchFlushed { trigger, .. } = event {
                assert_eq!(trigger, FlushTrigger::Timeout);
                flushed += 1;
            }
        }
        assert_eq!(flushed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_on_shutdown() {
        let backend = Arc::new(MemoryBackend::with_defaults());
        let (agg, _) = aggregator(50, backend.clone());

        agg.admit(standard_job("user-1", 10)).await.unwrap();
        agg.admit(standard_job("user-2", 10)).await.unwrap();

        assert_eq!(agg.flush_all().await, 2);
        assert_eq!(agg.pending_batches(), 0);

        // Timers were cancelled with their batches.
        tokio::time::sleep(Duration::from_secs(60)).await;
        let payloads = batch_payloads(&backend);
        assert_eq!(payloads.len(), 2);
        assert!(payloads
            .iter()
            .all(|p| p.trigger == FlushTrigger::Shutdown));
    }

    #[tokio::test]
    async fn test_batching_disabled() {
        let backend = Arc::new(MemoryBackend::with_defaults());
        let config = BatchingConfig {
            enabled: false,
            ..Default::default()
        };
        let agg = BatchAggregator::new(config, 75, backend, EventBus::new());
        assert!(matches!(
            agg.admit(standard_job("user-1", 10)).await.unwrap(),
            Admission::Direct(_)
        ));
    }

    #[test]
    fn test_batch_verdict() {
        let verdict = BatchVerdict::evaluate(8, 10, 0.8);
        assert!(verdict.success);
        assert!(verdict.error().is_none());

        let verdict = BatchVerdict::evaluate(7, 10, 0.8);
        assert!(!verdict.success);
        assert!(!verdict.retryable);
        assert!(matches!(verdict.error(), Some(JobError::Fatal(_))));

        let verdict = BatchVerdict::evaluate(0, 10, 0.8);
        assert!(verdict.retryable);
        assert!(matches!(verdict.error(), Some(JobError::TransientIo(_))));
    }

    #[test]
    fn test_batch_key_display() {
        let key = BatchKey::for_job(&standard_job("user-9", 10));
        assert_eq!(key.to_string(), "user-9:standard");
    }
}
