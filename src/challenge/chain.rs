//! Ordered fallback over resolver tiers.
//!
//! The chain walks the configured tier order and stops at the first tier
//! that succeeds with confidence above the threshold. It never compares
//! outcomes across tiers. Tier errors are logged and skipped; only the
//! exhaustion of every eligible tier is reported to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::tier::{ResolverTier, TierConfig, TierError};
use super::types::{ChallengeContext, ResolutionOutcome, TierKind};
use crate::error::JobError;
use crate::metrics::MetricsCollector;
use crate::pipeline::config::duration_ms;
use crate::pipeline::{AutomationEvent, EventBus};

/// Resolution chain settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Tiers to try, in order.
    pub enabled_tiers: Vec<TierKind>,
    /// Per-tier provider settings.
    pub tiers: HashMap<TierKind, TierConfig>,
    /// How long the manual tier waits for a human.
    #[serde(with = "duration_ms")]
    pub manual_timeout: Duration,
    pub allow_manual: bool,
    /// Outcomes must exceed this confidence to end the chain.
    pub confidence_threshold: f64,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            enabled_tiers: TierKind::DEFAULT_ORDER.to_vec(),
            tiers: HashMap::new(),
            manual_timeout: Duration::from_secs(300),
            allow_manual: true,
            confidence_threshold: 0.7,
        }
    }
}

impl ResolutionConfig {
    /// Whether configuration allows a tier at all.
    pub fn is_enabled(&self, kind: TierKind) -> bool {
        if kind == TierKind::Manual && !self.allow_manual {
            return false;
        }
        self.enabled_tiers.contains(&kind) && self.tiers.get(&kind).map_or(true, |t| t.enabled)
    }

    /// Upper bound for one attempt of a tier.
    ///
    /// `None` for the manual tier, whose wait is bounded by
    /// `manual_timeout`.
    pub fn attempt_timeout(&self, kind: TierKind) -> Option<Duration> {
        if kind == TierKind::Manual {
            return None;
        }
        Some(
            self.tiers
                .get(&kind)
                .map_or_else(|| TierConfig::default().timeout, |t| t.timeout),
        )
    }
}

/// Record of one tier invocation.
#[derive(Debug, Clone)]
pub struct TierAttempt {
    pub tier: TierKind,
    /// `None` when the tier returned an error.
    pub outcome: Option<ResolutionOutcome>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// Everything the chain did for one challenge.
#[derive(Debug, Clone)]
pub struct ChainReport {
    pub challenge_id: Uuid,
    pub job_id: Uuid,
    /// Winning tier outcome, or the exhausted outcome.
    pub outcome: ResolutionOutcome,
    pub attempts: Vec<TierAttempt>,
    pub elapsed: Duration,
}

impl ChainReport {
    pub fn is_resolved(&self) -> bool {
        self.outcome.success
    }

    /// Tiers invoked, in order.
    pub fn attempted_tiers(&self) -> Vec<TierKind> {
        self.attempts.iter().map(|a| a.tier).collect()
    }

    /// Converts an exhausted chain into `JobError::ResolutionExhausted`.
    pub fn into_result(self) -> Result<ResolutionOutcome, JobError> {
        if self.outcome.success {
            Ok(self.outcome)
        } else {
            Err(JobError::ResolutionExhausted {
                challenge_id: self.challenge_id,
                attempted: self.attempts.len(),
            })
        }
    }
}

/// Ordered set of resolver tiers gated by configuration.
pub struct ResolutionChain {
    config: ResolutionConfig,
    tiers: HashMap<TierKind, Arc<dyn ResolverTier>>,
    events: EventBus,
    metrics: MetricsCollector,
}

impl ResolutionChain {
    pub fn new(config: ResolutionConfig, events: EventBus) -> Self {
        Self {
            config,
            tiers: HashMap::new(),
            events,
            metrics: MetricsCollector::new(),
        }
    }

    /// Registers a tier implementation, replacing any earlier one of the
    /// same kind.
    pub fn register(&mut self, tier: Arc<dyn ResolverTier>) {
        let kind = tier.kind();
        if self.tiers.insert(kind, tier).is_some() {
            debug!(tier = %kind, "Replaced resolver tier");
        }
    }

    pub fn with_tier(mut self, tier: Arc<dyn ResolverTier>) -> Self {
        self.register(tier);
        self
    }

    pub fn config(&self) -> &ResolutionConfig {
        &self.config
    }

    /// Tiers that would be tried for a challenge, in order.
    ///
    /// A tier listed more than once keeps its first position.
    pub fn eligible_tiers(&self, challenge: &ChallengeContext) -> Vec<TierKind> {
        let mut eligible: Vec<TierKind> = Vec::with_capacity(self.config.enabled_tiers.len());
        for kind in &self.config.enabled_tiers {
            if eligible.contains(kind)
                || !self.config.is_enabled(*kind)
                || !kind.handles(challenge.kind)
            {
                continue;
            }
            if self
                .tiers
                .get(kind)
                .is_some_and(|tier| tier.accepts(challenge))
            {
                eligible.push(*kind);
            }
        }
        eligible
    }

    /// Runs the chain for one challenge.
    pub async fn resolve(&self, challenge: &ChallengeContext) -> ChainReport {
        let start = Instant::now();
        let threshold = self.config.confidence_threshold;
        let eligible = self.eligible_tiers(challenge);

        info!(
            challenge_id = %challenge.id,
            job_id = %challenge.job_id,
            kind = %challenge.kind,
            tiers = eligible.len(),
            "Resolving challenge"
        );
        self.events.publish(AutomationEvent::ChallengeDetected {
            challenge_id: challenge.id,
            job_id: challenge.job_id,
            kind: challenge.kind,
        });

        let mut attempts = Vec::with_capacity(eligible.len());
        let mut resolved = None;

        for kind in eligible {
            let Some(tier) = self.tiers.get(&kind) else {
                continue;
            };
            let tier_start = Instant::now();
            let result = match self.config.attempt_timeout(kind) {
                Some(limit) => tokio::time::timeout(limit, tier.attempt(challenge))
                    .await
                    .unwrap_or(Err(TierError::Timeout(limit))),
                None => tier.attempt(challenge).await,
            };
            let elapsed = tier_start.elapsed();

            match result {
                Ok(outcome) => {
                    let confident = outcome.is_confident(threshold);
                    let label = if confident {
                        "solved"
                    } else if outcome.success {
                        "low_confidence"
                    } else {
                        "failed"
                    };
                    self.metrics
                        .record_challenge_attempt(kind.as_str(), label, elapsed);
                    debug!(
                        challenge_id = %challenge.id,
                        tier = %kind,
                        success = outcome.success,
                        confidence = outcome.confidence,
                        "Tier finished"
                    );

                    let outcome = if outcome.elapsed.is_zero() {
                        outcome.with_elapsed(elapsed)
                    } else {
                        outcome
                    };
                    attempts.push(TierAttempt {
                        tier: kind,
                        outcome: Some(outcome.clone()),
                        error: None,
                        elapsed,
                    });

                    if confident {
                        resolved = Some(outcome);
                        break;
                    }
                }
                Err(e) => {
                    self.metrics
                        .record_challenge_attempt(kind.as_str(), "error", elapsed);
                    warn!(
                        challenge_id = %challenge.id,
                        tier = %kind,
                        error = %e,
                        "Resolver tier failed, trying next tier"
                    );
                    attempts.push(TierAttempt {
                        tier: kind,
                        outcome: None,
                        error: Some(e.to_string()),
                        elapsed,
                    });
                }
            }
        }

        let elapsed = start.elapsed();
        let outcome = match resolved {
            Some(outcome) => {
                info!(
                    challenge_id = %challenge.id,
                    tier = ?outcome.method,
                    confidence = outcome.confidence,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Challenge resolved"
                );
                outcome
            }
            None => {
                warn!(
                    challenge_id = %challenge.id,
                    job_id = %challenge.job_id,
                    attempted = attempts.len(),
                    "All resolution tiers exhausted"
                );
                ResolutionOutcome::exhausted(elapsed)
            }
        };

        self.events.publish(AutomationEvent::ChallengeResolved {
            challenge_id: challenge.id,
            job_id: challenge.job_id,
            success: outcome.success,
            method: outcome.method,
            attempts: attempts.len(),
            elapsed,
        });

        ChainReport {
            challenge_id: challenge.id,
            job_id: challenge.job_id,
            outcome,
            attempts,
            elapsed,
        }
    }
}
