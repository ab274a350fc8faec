//! Resharding simulation runner.
//!
//! Runs complete resharding operations on a simulated cluster, one per seed,
//! and checks every recorded document history and effect log afterwards.
//! Simulated time is paused, so a run takes as long as its computation.
//!
//! ```bash
//! # One fault-free run.
//! reshard-sim --seed 42
//!
//! # A hundred consecutive seeds with store faults, unreachable donors and
//! # leadership flaps.
//! reshard-sim --seed 1000 --seeds 100 --faults --log-level warn
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use reshard_tests::scenarios::faults;
use reshard_tests::{ClusterConfig, PropertyChecker, SimulatedCluster};

/// Resharding simulation runner.
#[derive(Parser, Debug)]
#[command(name = "reshard-sim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// First seed to run.
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Number of consecutive seeds to run.
    #[arg(long, default_value = "1")]
    seeds: u64,

    /// Number of shards in the cluster.
    #[arg(long, default_value = "3")]
    shards: usize,

    /// Number of donor shards (the first shards).
    #[arg(long, default_value = "2")]
    donors: usize,

    /// Number of recipient shards (the last shards).
    #[arg(long, default_value = "2")]
    recipients: usize,

    /// Inject store faults, unreachable donors and leadership flaps.
    #[arg(long)]
    faults: bool,

    /// Give up on a run after this many coordinator steps.
    #[arg(long, default_value = "5000")]
    max_steps: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

/// How one seed ended.
#[derive(Debug)]
struct SeedReport {
    seed: u64,
    passed: bool,
}

async fn run_seed(args: &Args, seed: u64) -> Result<SeedReport, Box<dyn std::error::Error>> {
    let mut config =
        ClusterConfig::new(seed).with_shards(args.shards, args.donors, args.recipients);
    if args.faults {
        config = faults::everything(config);
    }

    let mut cluster = SimulatedCluster::start(config).await?;
    let outcome = cluster.run_to_completion(args.max_steps).await?;

    let mut checker = PropertyChecker::new();
    checker.check_cluster(&cluster);
    for violation in checker.violations() {
        error!(seed, violation = %violation, "Property violated");
    }
    cluster.shutdown().await;

    let passed = outcome.finished && checker.is_ok();
    info!(
        seed,
        final_state = %outcome.final_state,
        finished = outcome.finished,
        steps = outcome.steps,
        flaps = outcome.flaps,
        versions_checked = checker.versions_checked(),
        passed,
        "Seed finished"
    );
    Ok(SeedReport { seed, passed })
}

#[tokio::main(flavor = "current_thread", start_paused = true)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(
        seed = args.seed,
        seeds = args.seeds,
        shards = args.shards,
        donors = args.donors,
        recipients = args.recipients,
        faults = args.faults,
        "Starting resharding simulation"
    );

    let mut failed = Vec::new();
    for seed in args.seed..args.seed.saturating_add(args.seeds) {
        let report = run_seed(&args, seed).await?;
        if !report.passed {
            failed.push(report.seed);
        }
    }

    if failed.is_empty() {
        info!(seeds = args.seeds, "All seeds passed");
        Ok(())
    } else {
        error!(failed = ?failed, "Some seeds failed");
        Err(format!("{} of {} seeds failed: {:?}", failed.len(), args.seeds, failed).into())
    }
}
