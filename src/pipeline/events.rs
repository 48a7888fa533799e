//! Automation events.
//!
//! Components publish on an injected `EventBus` instead of registering
//! callbacks on each other. Subscribers that lag behind lose the oldest
//! events; nothing in the scheduler depends on an event being observed.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::challenge::{ChallengeKind, TierKind};
use crate::metrics::Alert;
use crate::scheduler::{FlushTrigger, JobKind, JobOutcome, QueueName};

/// Events emitted by the scheduler, monitor and resolution chain.
#[derive(Debug, Clone, PartialEq)]
pub enum AutomationEvent {
    /// A job was placed on a queue.
    JobAdded {
        job_id: Uuid,
        owner_id: String,
        kind: JobKind,
        queue: QueueName,
        priority: u8,
    },
    /// A job attempt finished successfully.
    JobCompleted { outcome: Box<JobOutcome> },
    /// A job attempt failed.
    JobFailed {
        outcome: Box<JobOutcome>,
        /// Whether the backing store scheduled another attempt.
        will_retry: bool,
    },
    /// The monitor observed a threshold breach.
    AlertTriggered(Alert),
    /// A challenge entered the resolution chain.
    ChallengeDetected {
        challenge_id: Uuid,
        job_id: Uuid,
        kind: ChallengeKind,
    },
    /// The resolution chain finished for a challenge.
    ChallengeResolved {
        challenge_id: Uuid,
        job_id: Uuid,
        success: bool,
        method: Option<TierKind>,
        attempts: usize,
        elapsed: Duration,
    },
    /// The manual tier is waiting for a human to supply a solution.
    ManualInterventionRequired {
        request_id: Uuid,
        challenge_id: Uuid,
        job_id: Uuid,
        owner_id: String,
        kind: ChallengeKind,
        page_url: Option<String>,
        timeout: Duration,
    },
    /// A pending batch was turned into a batch job.
    BatchFlushed {
        batch_job_id: Uuid,
        key: String,
        members: usize,
        trigger: FlushTrigger,
    },
}

impl AutomationEvent {
    /// Returns the event name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobAdded { .. } => "job-added",
            Self::JobCompleted { .. } => "job-completed",
            Self::JobFailed { .. } => "job-failed",
            Self::AlertTriggered(_) => "alert-triggered",
            Self::ChallengeDetected { .. } => "challenge-detected",
            Self::ChallengeResolved { .. } => "challenge-resolved",
            Self::ManualInterventionRequired { .. } => "manual-intervention-required",
            Self::BatchFlushed { .. } => "batch-flushed",
        }
    }

    /// Returns the job this event concerns, if any.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            Self::JobAdded { job_id, .. }
            | Self::ChallengeDetected { job_id, .. }
            | Self::ChallengeResolved { job_id, .. }
            | Self::ManualInterventionRequired { job_id, .. } => Some(*job_id),
            Self::JobCompleted { outcome } | Self::JobFailed { outcome, .. } => {
                Some(outcome.job_id)
            }
            Self::BatchFlushed { batch_job_id, .. } => Some(*batch_job_id),
            Self::AlertTriggered(_) => None,
        }
    }
}

/// Default channel capacity for automation events.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcaster for automation events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AutomationEvent>,
}

impl EventBus {
    /// Create a new bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new bus with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<AutomationEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream. Lagged gaps surface as stream errors.
    pub fn subscribe_stream(&self) -> BroadcastStream<AutomationEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Publish an event.
    ///
    /// Returns the number of receivers that received the event, 0 if there
    /// are no active subscribers.
    pub fn publish(&self, event: AutomationEvent) -> usize {
        tracing::trace!(event = event.name(), job_id = ?event.job_id(), "Publishing event");
        self.sender.send(event).unwrap_or(0)
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
