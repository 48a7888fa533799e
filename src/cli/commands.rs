//! CLI command definitions for applyflow.
//!
//! The commands inspect configuration and queue state. Running the
//! automation itself requires handlers, which embedding applications
//! register on the orchestrator.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::metrics::{Alert, MetricSnapshot, QueueMonitor};
use crate::pipeline::{extract_confirmation_number, AutomationConfig, EventBus, SiteKind};
use crate::scheduler::{
    allocate_concurrency, Job, JobKind, LoadLedger, PriorityRouter, QueueName, RedisBackend,
};

/// Job-application automation core.
#[derive(Parser)]
#[command(name = "applyflow")]
#[command(about = "Inspect and plan applyflow scheduling")]
#[command(version)]
#[command(
    long_about = "applyflow schedules job applications across five priority queues, batches low-priority work, monitors queue health and resolves challenges through ordered resolver tiers.\n\nExample usage:\n  applyflow plan --config applyflow.yaml\n  applyflow route --priority 80 --count 4\n  applyflow inspect --redis-url redis://localhost:6379"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// YAML configuration file. Environment variables are used when absent.
    #[arg(short, long, global = true, env = "APPLYFLOW_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Print worker allocation, thresholds and batching settings.
    Plan(PlanArgs),

    /// Show which queue a job of a given priority is routed to.
    Route(RouteArgs),

    /// Classify a job URL by applicant tracking system.
    #[command(name = "detect-site")]
    DetectSite(DetectSiteArgs),

    /// Snapshot every queue in Redis and evaluate alert thresholds.
    Inspect(InspectArgs),

    /// Print the effective configuration as YAML.
    Config,
}

/// Arguments for `applyflow plan`.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Override the global worker budget.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `applyflow route`.
#[derive(Parser, Debug)]
pub struct RouteArgs {
    /// Job priority (0-100).
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub priority: u8,

    /// Job kind (standard, priority, batch).
    #[arg(short, long, default_value = "standard")]
    pub kind: String,

    /// Use the static priority mapping instead of load balancing.
    #[arg(long = "static")]
    pub static_routing: bool,

    /// Route this many identical jobs to show load spreading.
    #[arg(short = 'n', long, default_value = "1")]
    pub count: usize,
}

/// Arguments for `applyflow detect-site`.
#[derive(Parser, Debug)]
pub struct DetectSiteArgs {
    /// Job posting or apply URL.
    pub url: String,

    /// Page text to scan for a confirmation number.
    #[arg(long)]
    pub text: Option<String>,
}

/// Arguments for `applyflow inspect`.
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Redis URL. Defaults to the configured one.
    #[arg(long, env = "APPLYFLOW_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Redis key prefix. Defaults to the configured one.
    #[arg(long)]
    pub prefix: Option<String>,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// This is a convenience function that parses CLI args and runs the command.
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Plan(args) => run_plan_command(&config, args),
        Commands::Route(args) => run_route_command(&config, args),
        Commands::DetectSite(args) => {
            run_detect_site_command(args);
            Ok(())
        }
        Commands::Inspect(args) => run_inspect_command(&config, args).await,
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<AutomationConfig> {
    match path {
        Some(path) => AutomationConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path)),
        None => AutomationConfig::from_env().context("invalid APPLYFLOW_* environment"),
    }
}

#[derive(Debug, Serialize)]
struct PlanReport {
    global_concurrency: usize,
    workers: BTreeMap<QueueName, usize>,
    thresholds: crate::scheduler::PriorityThresholds,
    load_balancing: bool,
    batching: crate::scheduler::BatchingConfig,
}

fn build_plan(config: &AutomationConfig, workers: Option<usize>) -> PlanReport {
    let global = workers.unwrap_or(config.queue.global_concurrency);
    let allocation = allocate_concurrency(global, &config.concurrency_shares());
    PlanReport {
        global_concurrency: global,
        workers: allocation.into_iter().collect(),
        thresholds: config.priority,
        load_balancing: config.routing.load_balancing,
        batching: config.batching.clone(),
    }
}

fn run_plan_command(config: &AutomationConfig, args: PlanArgs) -> anyhow::Result<()> {
    let plan = build_plan(config, args.workers);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("=== Worker Allocation ({} total) ===", plan.global_concurrency);
    for (queue, workers) in &plan.workers {
        println!("{:<10} {:>4}", queue.as_str(), workers);
    }
    let unused = plan.global_concurrency - plan.workers.values().sum::<usize>().min(plan.global_concurrency);
    if unused > 0 {
        println!("{:<10} {:>4}", "(unused)", unused);
    }

    let t = &plan.thresholds;
    println!("\n=== Priority Thresholds ===");
    println!(
        "critical={} high={} normal={} low={} batch={}",
        t.critical, t.high, t.normal, t.low, t.batch
    );
    println!(
        "routing: {}",
        if plan.load_balancing {
            "load balanced"
        } else {
            "static"
        }
    );

    let b = &plan.batching;
    println!("\n=== Batching ===");
    if b.enabled {
        println!(
            "size={} max_wait={:?} delay={:?} success_ratio={}",
            b.batch_size, b.max_batch_wait, b.batch_delay, b.success_ratio
        );
    } else {
        println!("disabled");
    }
    Ok(())
}

/// Routes `count` identical jobs and returns the chosen queues with the
/// resulting load per queue.
fn route_jobs(
    config: &AutomationConfig,
    priority: u8,
    kind: JobKind,
    static_routing: bool,
    count: usize,
) -> anyhow::Result<(Vec<QueueName>, Vec<(QueueName, usize)>)> {
    let ledger = Arc::new(LoadLedger::new(config.routing.decay_window));
    let router = PriorityRouter::new(
        config.priority,
        config.routing.load_balancing && !static_routing,
        Arc::clone(&ledger),
    );

    let routed = (0..count.max(1))
        .map(|i| {
            let job = Job::new("cli", format!("route-{}", i), kind, serde_json::Value::Null)
                .with_priority(priority);
            router.route(&job).map_err(anyhow::Error::from)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok((routed, ledger.snapshot()))
}

fn run_route_command(config: &AutomationConfig, args: RouteArgs) -> anyhow::Result<()> {
    let kind: JobKind = args.kind.parse()?;
    let (routed, load) =
        route_jobs(config, args.priority, kind, args.static_routing, args.count)?;

    let eligible: Vec<&str> = config
        .priority
        .eligible_queues(args.priority)
        .iter()
        .map(QueueName::as_str)
        .collect();
    println!("eligible: {}", eligible.join(", "));

    for (i, queue) in routed.iter().enumerate() {
        println!("job {:>3} -> {}", i + 1, queue);
    }

    let load: Vec<String> = load
        .iter()
        .filter(|(_, n)| *n > 0)
        .map(|(queue, n)| format!("{}={}", queue, n))
        .collect();
    println!("load: {}", load.join(" "));
    Ok(())
}

fn run_detect_site_command(args: DetectSiteArgs) {
    println!("{}", SiteKind::detect(&args.url));
    if let Some(text) = args.text {
        match extract_confirmation_number(&text) {
            Some(number) => println!("confirmation: {}", number),
            None => println!("confirmation: none"),
        }
    }
}

#[derive(Debug, Serialize)]
struct InspectReport {
    snapshots: Vec<MetricSnapshot>,
    alerts: Vec<Alert>,
}

async fn run_inspect_command(config: &AutomationConfig, args: InspectArgs) -> anyhow::Result<()> {
    let url = args.redis_url.as_deref().unwrap_or(&config.queue.redis_url);
    let prefix = args.prefix.as_deref().unwrap_or(&config.queue.key_prefix);
    info!(url = %url, prefix = %prefix, "Inspecting queues");

    let backend = RedisBackend::connect(
        url,
        prefix,
        config.queue.settings.clone(),
        config.queue.stall_after,
    )
    .await
    .with_context(|| format!("failed to connect to {}", url))?;

    let monitor = QueueMonitor::new(config.monitoring.clone(), Arc::new(backend), EventBus::new());
    let alerts = monitor.collect_once().await?;
    let report = InspectReport {
        snapshots: monitor.latest(),
        alerts,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_route_command_options() {
        let cli = Cli::try_parse_from([
            "applyflow", "route", "--priority", "80", "--kind", "priority", "--static", "-n", "3",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Route(args) => {
                assert_eq!(args.priority, 80);
                assert_eq!(args.kind, "priority");
                assert!(args.static_routing);
                assert_eq!(args.count, 3);
            }
            _ => panic!("Expected Route command"),
        }
    }

    #[test]
    fn test_route_rejects_out_of_range_priority() {
        assert!(Cli::try_parse_from(["applyflow", "route", "--priority", "101"]).is_err());
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["applyflow", "plan", "--config", "applyflow.yaml", "--json"])
            .expect("should parse");
        assert_eq!(cli.config.as_deref(), Some("applyflow.yaml"));
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Plan(args) => assert!(args.json),
            _ => panic!("Expected Plan command"),
        }
    }

    #[test]
    fn test_detect_site_command() {
        let cli = Cli::try_parse_from(["applyflow", "detect-site", "https://jobs.lever.co/acme/1"])
            .expect("should parse");
        match cli.command {
            Commands::DetectSite(args) => {
                assert_eq!(SiteKind::detect(&args.url), SiteKind::Lever);
                assert!(args.text.is_none());
            }
            _ => panic!("Expected DetectSite command"),
        }
    }

    #[test]
    fn test_build_plan_default_allocation() {
        let plan = build_plan(&AutomationConfig::default(), None);
        assert_eq!(plan.global_concurrency, 20);
        assert_eq!(plan.workers[&QueueName::Immediate], 8);
        assert_eq!(plan.workers[&QueueName::High], 6);
        assert_eq!(plan.workers[&QueueName::Standard], 4);
        assert_eq!(plan.workers[&QueueName::Batch], 1);
        assert_eq!(plan.workers[&QueueName::Retry], 1);

        let plan = build_plan(&AutomationConfig::default(), Some(10));
        assert_eq!(plan.workers[&QueueName::Batch], 0);
    }

    #[test]
    fn test_route_jobs_spreads_load() {
        let config = AutomationConfig::default();

        let (routed, load) = route_jobs(&config, 80, JobKind::Standard, false, 4).unwrap();
        assert_eq!(
            routed,
            vec![
                QueueName::Immediate,
                QueueName::High,
                QueueName::Immediate,
                QueueName::High
            ]
        );
        assert!(load.contains(&(QueueName::Immediate, 2)));
        assert!(load.contains(&(QueueName::High, 2)));
        assert!(load.contains(&(QueueName::Standard, 0)));

        let (routed, _) = route_jobs(&config, 80, JobKind::Standard, true, 3).unwrap();
        assert!(routed.iter().all(|q| *q == QueueName::High));

        let (routed, _) = route_jobs(&config, 100, JobKind::Standard, false, 2).unwrap();
        assert!(routed.iter().all(|q| *q == QueueName::Immediate));
    }
}
