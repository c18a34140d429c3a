//! Simulation driver binary.
//!
//! Loads a properties configuration, runs the configured range of
//! simulations (in parallel across runs), merges their logs, flushes the
//! CSV reports, and prints the attack summary with the whitepaper
//! comparison.

use std::{
    path::PathBuf,
    process,
    time::{SystemTime, UNIX_EPOCH},
};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use attack_sim::{
    analysis::AttackMetrics,
    config::Config,
    report::Reporter,
    simulation::{SimulationBuilder, SimulationGroup},
};

#[derive(Parser, Debug)]
#[command(
    name = "driver",
    version,
    about = "Discrete-event double-spending attack simulator"
)]
struct Args {
    /// Path to the properties configuration file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Directory for the CSV report files
    #[arg(long, default_value = "./reports")]
    output: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the whitepaper probability tables before running
    #[arg(long)]
    whitepaper: bool,
}

fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);

    if let Err(exit_code) = run(args) {
        process::exit(exit_code);
    }
}

fn run(args: Args) -> Result<(), i32> {
    if args.whitepaper {
        println!("{}", attack_sim::analysis::whitepaper_report());
    }

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err}");
            return Err(1);
        }
    };

    let (first, last) = config.simulation_range();
    info!(
        config = %args.config.display(),
        simulations = last - first + 1,
        honest = config.num_honest_nodes,
        malicious = config.num_malicious_nodes,
        terminate_at = config.terminate_at,
        "starting simulations"
    );

    let builder = SimulationBuilder::from_config(&config);
    let outputs = match SimulationGroup::new(builder).runs(first, last).run_all()
    {
        Ok(outputs) => outputs,
        Err(err) => {
            error!("simulation setup error: {err}");
            return Err(1);
        }
    };

    let mut merged_reports = Reporter::new(config.flags);
    let mut merged_metrics = AttackMetrics::default();
    for output in outputs {
        info!(
            sim_id = output.sim_id,
            events = output.events_dispatched,
            final_time = output.final_time,
            "simulation finished"
        );
        merged_reports.absorb(output.reporter);
        merged_metrics.absorb(output.metrics);
    }

    let run_id = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    match merged_reports.flush_all(&args.output, &run_id.to_string()) {
        Ok(written) => {
            for path in written {
                info!(path = %path.display(), "report written");
            }
        }
        Err(err) => {
            error!("failed to write reports: {err}");
            return Err(1);
        }
    }

    if merged_metrics.attempts() > 0 {
        println!("{}", merged_metrics.summary());
    }

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
