//! Priority scheduling over five queues.
//!
//! This module provides the job scheduling layer:
//!
//! - **PriorityRouter**: maps a job's priority to a queue, with soft load balancing
//! - **BatchAggregator**: groups low-priority jobs into batch jobs by size or time
//! - **QueueBackend**: backing-store contract, in memory or on Redis
//! - **WorkerSet**: one worker pool per queue, sized by concurrency share
//! - **JobProcessor**: dispatches jobs to handlers and classifies failures
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ Orchestrator │
//!                      └──────┬───────┘
//!                             │
//!              ┌──────────────┴──────────────┐
//!              ▼                             ▼
//!       ┌─────────────┐              ┌──────────────┐
//!       │   Router    │              │  Aggregator  │
//!       └──────┬──────┘              └──────┬───────┘
//!              │                            │
//!   ┌──────────┼──────────┬─────────┐       │
//!   ▼          ▼          ▼         ▼       ▼
//! immediate   high     standard   retry   batch     (backing store)
//!   │          │          │         │       │
//!   └──────────┴────┬─────┴─────────┴───────┘
//!                   ▼
//!             ┌───────────┐
//!             │ Processor │
//!             └───────────┘
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic dequeue**: the Redis store uses BRPOPLPUSH to move jobs to an active list
//! - **Crash recovery**: active jobs are requeued when the worker set starts
//! - **Store-owned retries**: attempts and backoff are decided by the backing store
//! - **Graceful shutdown**: workers finish their current job before stopping

pub mod batching;
pub mod job;
pub mod processor;
pub mod queue;
pub mod redis_backend;
pub mod router;
pub mod worker_pool;

pub use batching::{
    Admission, BatchAggregator, BatchKey, BatchPayload, BatchVerdict, BatchingConfig,
    FlushTrigger,
};
pub use job::{HandlerOutput, Job, JobKind, JobMetadata, JobOutcome, JobStatus, MAX_PRIORITY};
pub use processor::{JobHandler, JobProcessor, ProcessingStats};
pub use queue::{
    Backoff, FailedEntry, MemoryBackend, QueueBackend, QueueCounts, QueueError, QueueName,
    QueueSettings, RetryDecision, RetryPolicy,
};
pub use redis_backend::RedisBackend;
pub use router::{LoadLedger, PriorityRouter, PriorityThresholds};
pub use worker_pool::{
    allocate_concurrency, PoolError, PoolStats, PoolStatsBoard, WorkerPool, WorkerPoolConfig,
    WorkerSet,
};
