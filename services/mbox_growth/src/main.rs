//! Broadcast mailbox growth/shrink stress run
//!
//! Usage:
//!   mbox-growth
//!   mbox-growth --config config/mbox_growth.toml --log-level debug
//!   mbox-growth --iterations 2 --max-groups 10 --report target/mbox_growth.json
//!
//! Exits 0 when every iteration completed, 1 on failure or when the
//! watchdog fires.

use anyhow::{bail, Context, Result};
use clap::Parser;
use mailbox_actors::{run_scenario, ActorSystem, RuntimeConfig, ScenarioReport, SystemStats};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mbox-growth")]
#[command(about = "Grow and shrink a broadcast mailbox through cooperative actor groups")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Override scenario.iterations
    #[arg(long)]
    iterations: Option<u32>,

    /// Override scenario.max_live_groups
    #[arg(long)]
    max_groups: Option<usize>,

    /// Override scenario.time_limit_secs
    #[arg(long)]
    time_limit: Option<u64>,

    /// Write the scenario report as JSON
    #[arg(long)]
    report: Option<PathBuf>,
}

/// JSON document written by `--report`
#[derive(Serialize)]
struct RunOutput<'a> {
    report: &'a ScenarioReport,
    metrics: &'a SystemStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting mailbox growth run");
    run(args).await.map_err(|e| {
        error!("Mailbox growth run failed: {:#}", e);
        e
    })
}

async fn run(args: Args) -> Result<()> {
    let mut config =
        RuntimeConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(iterations) = args.iterations {
        config.scenario.iterations = iterations;
    }
    if let Some(max_groups) = args.max_groups {
        config.scenario.max_live_groups = max_groups;
    }
    if let Some(time_limit) = args.time_limit {
        config.scenario.time_limit_secs = time_limit;
    }
    config.validate().context("Invalid command line override")?;

    info!(
        iterations = config.scenario.iterations,
        max_live_groups = config.scenario.max_live_groups,
        initial_group_size = config.scenario.initial_group_size,
        peak_actors = config.scenario.peak_actors().unwrap_or_default(),
        time_limit_secs = config.scenario.time_limit_secs,
        "Scenario configured"
    );

    let system = ActorSystem::with_policy(config.system.clone(), config.mailbox);
    let time_limit = config.scenario.time_limit();

    let scenario = run_scenario(&system, config.scenario.clone());
    let report = match tokio::time::timeout(time_limit, scenario).await {
        Ok(result) => result.context("Growth/shrink scenario failed")?,
        Err(_) => bail!(
            "mbox_growth hung: not finished within {}s ({} groups and {} actors still live)",
            time_limit.as_secs(),
            system.live_group_count(),
            system.live_actor_count()
        ),
    };

    let stats = system.metrics().get_stats();
    info!(
        iterations = report.iterations_completed,
        barriers = report.barriers.len(),
        peak_subscribers = report.peak_subscribers,
        actors_spawned = stats.actors_spawned,
        deliveries = stats.deliveries,
        index_switches_up = stats.index_switches_up,
        index_switches_down = stats.index_switches_down,
        elapsed_ms = report.elapsed_ms,
        "Mailbox growth run complete"
    );

    if let Some(path) = &args.report {
        let document = RunOutput {
            report: &report,
            metrics: &stats,
        };
        let contents = serde_json::to_string_pretty(&document).context("Failed to encode report")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    Ok(())
}

fn init_logging(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_overrides() {
        let args = Args::parse_from([
            "mbox-growth",
            "--iterations",
            "2",
            "--max-groups",
            "4",
            "--time-limit",
            "30",
            "--report",
            "out.json",
        ]);
        assert_eq!(args.iterations, Some(2));
        assert_eq!(args.max_groups, Some(4));
        assert_eq!(args.time_limit, Some(30));
        assert_eq!(args.log_level, "info");
        assert!(args.config.is_none());
    }
}
