//! Priority routing with soft load balancing.
//!
//! A job's priority selects an eligible set of queues. With load balancing
//! enabled the router picks the eligible queue with the lowest recent
//! dispatch count; otherwise it applies the static tier mapping.
//!
//! Load is tracked by `LoadLedger` as a per-queue list of dispatch instants.
//! An entry counts toward the load until the decay window has passed, so
//! every dispatch is counted once and forgotten once, and the load can
//! never go negative.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::JobError;
use crate::metrics::MetricsCollector;

use super::job::{Job, JobKind};
use super::queue::QueueName;

/// Default decay window for load entries.
pub const DEFAULT_DECAY_WINDOW: Duration = Duration::from_secs(60);

/// Priority cut-offs used for routing and batch eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityThresholds {
    pub critical: u8,
    pub high: u8,
    pub normal: u8,
    pub low: u8,
    pub batch: u8,
}

impl Default for PriorityThresholds {
    fn default() -> Self {
        Self {
            critical: 100,
            high: 75,
            normal: 50,
            low: 25,
            batch: 10,
        }
    }
}

impl PriorityThresholds {
    /// Queues a job of this priority may be routed to, in preference order.
    pub fn eligible_queues(&self, priority: u8) -> &'static [QueueName] {
        if priority >= self.critical {
            &[QueueName::Immediate]
        } else if priority >= self.high {
            &[QueueName::Immediate, QueueName::High]
        } else {
            &[QueueName::High, QueueName::Standard]
        }
    }

    /// Fixed tier mapping used when load balancing is off.
    pub fn static_queue(&self, priority: u8, kind: JobKind) -> QueueName {
        if priority >= self.critical {
            QueueName::Immediate
        } else if priority >= self.high {
            QueueName::High
        } else if kind == JobKind::Batch {
            QueueName::Batch
        } else {
            QueueName::Standard
        }
    }

    /// Checks that the cut-offs are strictly descending.
    pub fn validate(&self) -> Result<(), String> {
        let ordered = [self.critical, self.high, self.normal, self.low, self.batch];
        if ordered.windows(2).all(|pair| pair[0] > pair[1]) {
            Ok(())
        } else {
            Err(format!(
                "priority thresholds must be strictly descending, got {:?}",
                ordered
            ))
        }
    }
}

/// Decaying per-queue dispatch counter.
#[derive(Debug)]
pub struct LoadLedger {
    entries: DashMap<QueueName, VecDeque<Instant>>,
    window: Duration,
}

impl LoadLedger {
    /// Creates a ledger whose entries expire after `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            window,
        }
    }

    /// Returns the decay window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Counts one dispatch to `queue`.
    pub fn record(&self, queue: QueueName) {
        let now = Instant::now();
        let mut entry = self.entries.entry(queue).or_default();
        expire(&mut entry, now, self.window);
        entry.push_back(now);
    }

    /// Dispatches to `queue` still inside the decay window.
    pub fn load(&self, queue: QueueName) -> usize {
        let now = Instant::now();
        match self.entries.get_mut(&queue) {
            Some(mut entry) => {
                expire(&mut entry, now, self.window);
                entry.len()
            }
            None => 0,
        }
    }

    /// Current load of every queue.
    pub fn snapshot(&self) -> Vec<(QueueName, usize)> {
        QueueName::ALL.iter().map(|q| (*q, self.load(*q))).collect()
    }
}

impl Default for LoadLedger {
    fn default() -> Self {
        Self::new(DEFAULT_DECAY_WINDOW)
    }
}

fn expire(entries: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = entries.front() {
        if now.duration_since(*oldest) >= window {
            entries.pop_front();
        } else {
            break;
        }
    }
}

/// Maps jobs to queues.
pub struct PriorityRouter {
    thresholds: PriorityThresholds,
    load_balancing: bool,
    ledger: Arc<LoadLedger>,
    available: HashSet<QueueName>,
    metrics: MetricsCollector,
}

impl PriorityRouter {
    /// Creates a router over all five queues.
    pub fn new(thresholds: PriorityThresholds, load_balancing: bool, ledger: Arc<LoadLedger>) -> Self {
        Self {
            thresholds,
            load_balancing,
            ledger,
            available: QueueName::ALL.into_iter().collect(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Restricts routing to the given queues.
    pub fn with_available_queues(mut self, queues: impl IntoIterator<Item = QueueName>) -> Self {
        self.available = queues.into_iter().collect();
        self
    }

    /// Returns the thresholds in use.
    pub fn thresholds(&self) -> &PriorityThresholds {
        &self.thresholds
    }

    /// Returns the shared ledger.
    pub fn ledger(&self) -> &Arc<LoadLedger> {
        &self.ledger
    }

    /// Picks the queue for `job` and counts the dispatch.
    ///
    /// # Errors
    ///
    /// Returns `JobError::Configuration` if the chosen queue is not one
    /// this router may dispatch to.
    pub fn route(&self, job: &Job) -> Result<QueueName, JobError> {
        let queue = self.choose(job);

        if !self.available.contains(&queue) {
            return Err(JobError::Configuration(format!(
                "queue '{}' selected for job {} is not configured",
                queue, job.id
            )));
        }

        self.ledger.record(queue);
        self.metrics.record_route(queue.as_str());
        debug!(
            job_id = %job.id,
            priority = job.priority(),
            queue = %queue,
            load_balanced = self.load_balancing,
            "Routed job"
        );
        Ok(queue)
    }

    /// Chooses a queue without recording a dispatch.
    pub fn choose(&self, job: &Job) -> QueueName {
        if !self.load_balancing {
            return self.thresholds.static_queue(job.priority(), job.kind);
        }

        let eligible = self.thresholds.eligible_queues(job.priority());
        let mut best = eligible[0];
        let mut best_load = self.ledger.load(best);
        for queue in &eligible[1..] {
            let load = self.ledger.load(*queue);
            // Strictly lower wins, so ties keep the earlier queue.
            if load < best_load {
                best = *queue;
                best_load = load;
            }
        }
        best
    }
}
