//! applyflow: job-application automation core.
//!
//! This library schedules job applications across five priority queues,
//! batches low-priority work, watches queue health and resolves
//! challenges (captchas and similar) through ordered resolver tiers.

// Core modules
pub mod challenge;
pub mod cli;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;

pub use error::JobError;
pub use pipeline::{
    AutomationConfig, AutomationOrchestrator, OrchestratorError, PipelineResult, WorkItem,
};
