//! Per-queue worker pools.
//!
//! Each of the five queues gets its own pool of consumers sized from a
//! share of the global concurrency budget. Workers in a pool pull from
//! their queue's partition of the backing store and run independently;
//! nothing is ordered across queues.
//!
//! # Features
//!
//! - Concurrency allocation by queue share
//! - Graceful shutdown with broadcast channel
//! - Pause/resume per queue, leaving in-flight jobs alone
//! - Pool statistics tracking

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::MetricsCollector;

use super::job::Job;
use super::processor::JobProcessor;
use super::queue::{QueueBackend, QueueError, QueueName};

/// Share used for a queue missing from the share map.
pub const UNMAPPED_SHARE: f64 = 0.10;

/// Errors that can occur in the worker pools.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Backing store operation failed.
    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool for queue '{0}' is already running")]
    AlreadyRunning(QueueName),

    /// Pool is not running.
    #[error("Pool for queue '{0}' is not running")]
    NotRunning(QueueName),

    /// Shutdown timed out.
    #[error("Shutdown of queue '{queue}' timed out after {timeout:?}")]
    ShutdownTimeout { queue: QueueName, timeout: Duration },
}

/// Splits `global` workers across queues.
///
/// Each queue gets `floor(global * share)`; queues absent from `shares`
/// get `UNMAPPED_SHARE`.
pub fn allocate_concurrency(
    global: usize,
    shares: &HashMap<QueueName, f64>,
) -> HashMap<QueueName, usize> {
    QueueName::ALL
        .iter()
        .map(|queue| {
            let share = shares.get(queue).copied().unwrap_or(UNMAPPED_SHARE);
            let workers = (global as f64 * share.max(0.0)).floor() as usize;
            (*queue, workers)
        })
        .collect()
}

/// Configuration shared by all pools.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// How long one dequeue waits before re-checking for shutdown.
    pub poll_interval: Duration,
    /// Timeout for graceful shutdown of one pool.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

/// Statistics about one pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Attempts that completed successfully.
    pub jobs_completed: u64,
    /// Attempts that failed (including ones that will be retried).
    pub jobs_failed: u64,
    /// Average attempt duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of attempts processed.
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Default)]
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) -> u64 {
        self.active_workers.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn decrement_active(&self) -> u64 {
        self.active_workers.fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            average_job_duration: average_duration,
        }
    }
}

/// Read-only view of every pool's statistics.
///
/// Cloned into the monitor so it can observe throughput without holding
/// the worker set.
#[derive(Clone)]
pub struct PoolStatsBoard {
    pools: Arc<HashMap<QueueName, (usize, Arc<SharedPoolStats>)>>,
}

impl PoolStatsBoard {
    /// Statistics of one queue's pool.
    pub fn get(&self, queue: QueueName) -> PoolStats {
        self.pools
            .get(&queue)
            .map(|(workers, stats)| stats.to_pool_stats(*workers))
            .unwrap_or_default()
    }

    /// Statistics of every pool.
    pub fn all(&self) -> Vec<(QueueName, PoolStats)> {
        QueueName::ALL.iter().map(|q| (*q, self.get(*q))).collect()
    }
}

/// Pool of workers consuming one queue.
pub struct WorkerPool {
    queue: QueueName,
    num_workers: usize,
    config: WorkerPoolConfig,
    backend: Arc<dyn QueueBackend>,
    processor: Arc<JobProcessor>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        queue: QueueName,
        num_workers: usize,
        config: WorkerPoolConfig,
        backend: Arc<dyn QueueBackend>,
        processor: Arc<JobProcessor>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            queue,
            num_workers,
            config,
            backend,
            processor,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns the pool's workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning(self.queue));
        }

        for i in 0..self.num_workers {
            let worker = Worker {
                id: format!("{}-worker-{}", self.queue, i),
                queue: self.queue,
                backend: Arc::clone(&self.backend),
                processor: Arc::clone(&self.processor),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(queue = %self.queue, num_workers = self.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish their current job before stopping.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout. Remaining workers are aborted.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning(self.queue));
        }

        debug!(queue = %self.queue, "Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let queue = self.queue;
        let handles: Vec<JoinHandle<()>> = self.worker_handles.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let shutdown_future = async move {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(queue = %queue, error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!(queue = %self.queue, "Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                Err(PoolError::ShutdownTimeout {
                    queue: self.queue,
                    timeout: self.config.shutdown_timeout,
                })
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }
}

/// A single worker that processes jobs from one queue.
struct Worker {
    id: String,
    queue: QueueName,
    backend: Arc<dyn QueueBackend>,
    processor: Arc<JobProcessor>,
    shutdown_rx: broadcast::Receiver<()>,
    /// Longest a single dequeue waits.
    poll_interval: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Continuously polls for jobs and processes them until a shutdown
    /// signal is received.
    async fn run(mut self) {
        debug!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    debug!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    // We missed some signals, but since it's shutdown, just check again
                    continue;
                }
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.backend.dequeue(self.queue, self.poll_interval).await {
                Ok(Some(job)) => {
                    self.process_job(job).await;
                }
                Ok(None) => {
                    // Paused or empty; the dequeue already waited poll_interval
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }

    /// Processes a single job and hands the result to the store.
    async fn process_job(&self, job: Job) {
        let job_id = job.id;
        let active = self.stats.increment_active();
        self.metrics
            .update_active_workers(self.queue.as_str(), active);

        let outcome = self.processor.process(self.queue, &job).await;

        let active = self.stats.decrement_active();
        self.metrics
            .update_active_workers(self.queue.as_str(), active);

        match &outcome.error {
            None => {
                self.stats.record_completion(outcome.duration);
                if let Err(e) = self.backend.complete(self.queue, &outcome).await {
                    error!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        error = %e,
                        "Failed to mark job complete"
                    );
                }
                self.processor.report(&outcome, None);
            }
            Some(job_error) => {
                self.stats.record_failure(outcome.duration);
                match self.backend.fail(self.queue, job, job_error).await {
                    Ok(decision) => self.processor.report(&outcome, Some(&decision)),
                    Err(e) => {
                        // The store never saw the failure; the job stays
                        // active until recovery picks it up.
                        warn!(
                            worker_id = %self.id,
                            job_id = %job_id,
                            error = %e,
                            "Failed to record job failure"
                        );
                        self.processor.report(&outcome, None);
                    }
                }
            }
        }
    }
}

/// The five per-queue pools.
pub struct WorkerSet {
    pools: Vec<WorkerPool>,
    backend: Arc<dyn QueueBackend>,
    board: PoolStatsBoard,
}

impl WorkerSet {
    /// Builds one pool per queue from the allocation.
    pub fn new(
        allocation: &HashMap<QueueName, usize>,
        config: WorkerPoolConfig,
        backend: Arc<dyn QueueBackend>,
        processor: Arc<JobProcessor>,
    ) -> Self {
        let pools: Vec<WorkerPool> = QueueName::ALL
            .iter()
            .map(|queue| {
                WorkerPool::new(
                    *queue,
                    allocation.get(queue).copied().unwrap_or(0),
                    config.clone(),
                    Arc::clone(&backend),
                    Arc::clone(&processor),
                )
            })
            .collect();

        let board = PoolStatsBoard {
            pools: Arc::new(
                pools
                    .iter()
                    .map(|pool| (pool.queue, (pool.num_workers, Arc::clone(&pool.stats))))
                    .collect(),
            ),
        };

        Self {
            pools,
            backend,
            board,
        }
    }

    /// Recovers interrupted jobs, then starts every pool.
    pub async fn start_all(&mut self) -> Result<(), PoolError> {
        match self.backend.recover().await {
            Ok(recovered) if recovered > 0 => {
                info!(recovered = recovered, "Recovered jobs from active lists");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to recover active jobs");
            }
        }

        for pool in &mut self.pools {
            if pool.num_workers() == 0 {
                warn!(queue = %pool.queue(), "Queue has no workers allocated");
            }
            pool.start()?;
        }
        Ok(())
    }

    /// Stops every pool concurrently. Returns the first error, if any.
    pub async fn shutdown_all(&mut self) -> Result<(), PoolError> {
        let results = futures::future::join_all(
            self.pools
                .iter_mut()
                .filter(|pool| pool.is_running())
                .map(|pool| pool.shutdown()),
        )
        .await;

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                error!(error = %e, "Worker pool did not stop cleanly");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stops new dequeues from `queue`. In-flight jobs continue.
    pub async fn pause(&self, queue: QueueName) -> Result<(), PoolError> {
        self.backend.pause(queue).await?;
        info!(queue = %queue, "Queue paused");
        Ok(())
    }

    /// Resumes dequeues from `queue`.
    pub async fn resume(&self, queue: QueueName) -> Result<(), PoolError> {
        self.backend.resume(queue).await?;
        info!(queue = %queue, "Queue resumed");
        Ok(())
    }

    /// Workers per queue.
    pub fn allocation(&self) -> HashMap<QueueName, usize> {
        self.pools
            .iter()
            .map(|pool| (pool.queue(), pool.num_workers()))
            .collect()
    }

    pub fn stats_board(&self) -> PoolStatsBoard {
        self.board.clone()
    }

    pub fn is_running(&self) -> bool {
        self.pools.iter().any(WorkerPool::is_running)
    }
}
