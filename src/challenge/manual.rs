//! Human-in-the-loop resolution.
//!
//! The manual tier announces a request on the event bus and waits for a
//! solution to arrive through the broker. A request is live only while its
//! tier is waiting: once the wait times out the request is dropped and a
//! late solution is refused.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::tier::{ResolverTier, TierError};
use super::types::{ChallengeContext, ResolutionOutcome, TierKind};
use crate::pipeline::{AutomationEvent, EventBus};

struct PendingRequest {
    challenge_id: Uuid,
    requested_at: DateTime<Utc>,
    reply: oneshot::Sender<String>,
}

/// Routes externally provided solutions to waiting manual tiers.
#[derive(Default)]
pub struct ManualResolutionBroker {
    pending: DashMap<Uuid, PendingRequest>,
}

impl ManualResolutionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, request_id: Uuid, challenge_id: Uuid) -> oneshot::Receiver<String> {
        let (reply, rx) = oneshot::channel();
        self.pending.insert(
            request_id,
            PendingRequest {
                challenge_id,
                requested_at: Utc::now(),
                reply,
            },
        );
        rx
    }

    fn withdraw(&self, request_id: Uuid) {
        self.pending.remove(&request_id);
    }

    /// Delivers a solution for a pending request.
    ///
    /// Returns `false` when the request is unknown or already settled.
    pub fn provide_solution(&self, request_id: Uuid, solution: impl Into<String>) -> bool {
        match self.pending.remove(&request_id) {
            Some((_, request)) => {
                let accepted = request.reply.send(solution.into()).is_ok();
                debug!(
                    request_id = %request_id,
                    challenge_id = %request.challenge_id,
                    accepted,
                    "Manual solution delivered"
                );
                accepted
            }
            None => {
                debug!(request_id = %request_id, "Ignoring solution for unknown request");
                false
            }
        }
    }

    /// Requests currently waiting for a human, oldest first.
    pub fn pending_requests(&self) -> Vec<(Uuid, Uuid, DateTime<Utc>)> {
        let mut requests: Vec<_> = self
            .pending
            .iter()
            .map(|entry| (*entry.key(), entry.challenge_id, entry.requested_at))
            .collect();
        requests.sort_by_key(|(_, _, at)| *at);
        requests
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Tier that waits for a human to solve the challenge.
pub struct ManualInterventionTier {
    broker: Arc<ManualResolutionBroker>,
    events: EventBus,
    timeout: Duration,
}

impl ManualInterventionTier {
    pub fn new(broker: Arc<ManualResolutionBroker>, events: EventBus, timeout: Duration) -> Self {
        Self {
            broker,
            events,
            timeout,
        }
    }
}

#[async_trait]
impl ResolverTier for ManualInterventionTier {
    fn kind(&self) -> TierKind {
        TierKind::Manual
    }

    async fn attempt(&self, challenge: &ChallengeContext) -> Result<ResolutionOutcome, TierError> {
        let request_id = Uuid::new_v4();
        let rx = self.broker.register(request_id, challenge.id);
        let start = Instant::now();

        info!(
            request_id = %request_id,
            challenge_id = %challenge.id,
            job_id = %challenge.job_id,
            timeout_ms = self.timeout.as_millis() as u64,
            "Waiting for manual challenge resolution"
        );
        self.events
            .publish(AutomationEvent::ManualInterventionRequired {
                request_id,
                challenge_id: challenge.id,
                job_id: challenge.job_id,
                owner_id: challenge.owner_id.clone(),
                kind: challenge.kind,
                page_url: challenge.page_url.clone(),
                timeout: self.timeout,
            });

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(solution)) => Ok(ResolutionOutcome::solved(TierKind::Manual, solution, 1.0)
                .with_elapsed(start.elapsed())),
            Ok(Err(_)) => {
                self.broker.withdraw(request_id);
                Err(TierError::Cancelled)
            }
            Err(_) => {
                self.broker.withdraw(request_id);
                warn!(
                    request_id = %request_id,
                    challenge_id = %challenge.id,
                    "Manual resolution timed out"
                );
                Ok(ResolutionOutcome::failed(
                    TierKind::Manual,
                    format!("no solution within {:?}", self.timeout),
                )
                .with_elapsed(start.elapsed()))
            }
        }
    }
}
