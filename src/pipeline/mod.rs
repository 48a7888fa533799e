//! Automation pipeline glue.
//!
//! This module wires the scheduler, the queue monitor and the challenge
//! resolution chain into one service.
//!
//! # Architecture
//!
//! The pipeline consists of several components:
//!
//! - **Orchestrator**: accepts work, waits for outcomes, resolves challenges
//! - **Config**: configuration for every component, from YAML or environment
//! - **Events**: the publish/subscribe bus every component reports on
//! - **Site**: applicant tracking system detection and confirmation extraction
//!
//! # Pipeline Flow
//!
//! 1. **Admission**: low-priority standard work is held by the batch aggregator
//! 2. **Routing**: other work is routed to one of five queues by priority and load
//! 3. **Processing**: a worker pool runs the kind-specific handler
//! 4. **Resolution**: a reported challenge goes through the resolver tiers
//! 5. **Result**: the outcome is folded into a `PipelineResult` with phase timings
//!
//! # Example
//!
//! ```rust,ignore
//! use applyflow::pipeline::{AutomationConfig, AutomationOrchestrator, WorkItem};
//! use applyflow::scheduler::JobKind;
//!
//! let orchestrator = AutomationOrchestrator::builder(AutomationConfig::from_env()?)
//!     .handler(JobKind::Standard, Arc::new(MyBrowserHandler::new()))
//!     .handler(JobKind::Priority, Arc::new(MyBrowserHandler::new()))
//!     .build()?;
//! orchestrator.start().await?;
//!
//! let result = orchestrator
//!     .submit(
//!         WorkItem::new("user-42", "posting-7118562")
//!             .with_priority(80)
//!             .with_apply_url("https://job-boards.greenhouse.io/acme/jobs/7118562"),
//!     )
//!     .await?;
//! println!("{} {:?}", result.status, result.confirmation_number);
//!
//! orchestrator.shutdown().await?;
//! ```

pub mod config;
pub mod events;
pub mod orchestrator;
pub mod site;

pub use config::{AutomationConfig, ConfigError, QueueConfig, RoutingConfig};
pub use events::{AutomationEvent, EventBus};
pub use orchestrator::{
    ApplicationStatus, AutomationOrchestrator, ChallengeSummary, OrchestratorBuilder,
    OrchestratorError, PhaseTimings, PipelineResult, PipelineStats, WorkItem,
};
pub use site::{extract_confirmation_number, SiteKind};
