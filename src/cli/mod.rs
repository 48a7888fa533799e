//! Command-line interface for applyflow.
//!
//! Provides commands for allocation planning, routing previews, site
//! detection and queue inspection.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
