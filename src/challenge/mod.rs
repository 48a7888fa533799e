//! Tiered challenge resolution.
//!
//! When a handler reports a challenge, the orchestrator hands it to a
//! [`ResolutionChain`], which tries each enabled [`ResolverTier`] in
//! configured order:
//!
//! ```text
//! vision ─► ocr ─► paid_service ─► behavioral ─► manual
//!   │        │          │              │            │
//!   └────────┴──────────┴──────┬───────┴────────────┘
//!                              ▼
//!               first success with confidence > 0.7
//!                   or an exhausted outcome
//! ```
//!
//! Vision and OCR only see text and image challenges. The manual tier
//! waits for a human through the [`ManualResolutionBroker`].

pub mod chain;
pub mod manual;
pub mod tier;
pub mod types;

pub use chain::{ChainReport, ResolutionChain, ResolutionConfig, TierAttempt};
pub use manual::{ManualInterventionTier, ManualResolutionBroker};
pub use tier::{ResolverTier, TierConfig, TierError};
pub use types::{ChallengeContext, ChallengeKind, ResolutionOutcome, TierKind};
