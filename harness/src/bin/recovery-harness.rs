use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::instrument;

use harness::config::HarnessConfig;
use harness::runner::{FailurePolicy, RunReport, ScenarioRunner, StdinOperator};
use harness::scenario::{Scenario, ScenarioContext};
use harness::service::RemoteServiceAdmin;
use harness::session::SessionQueryClient;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "recovery-harness",
    version,
    about = "Drive filesystem clients and the metadata service through session recovery scenarios",
    long_about = "`recovery-harness` restarts, fails over and partitions the metadata service while two \
client mounts do I/O, and checks that client sessions recover within the configured timeouts.

EXAMPLE:
    # Run every scenario described by the config file
    recovery-harness --config harness.json --summary

    # Run one scenario and wait for an operator when it fails
    recovery-harness --config harness.json --test-name stale_caps --interactive-on-error -v

Note: scenarios restart the service and kill client mounts. Never point this at a production cluster."
)]
struct Args {
    /// JSON file describing the service host, the clients and run options
    #[arg(long, short = 'c', value_name = "PATH", required_unless_present = "list")]
    config: Option<std::path::PathBuf>,

    /// Run a single scenario, overriding `test_name` from the config file
    #[arg(long, value_name = "NAME", help_heading = "Scenario selection")]
    test_name: Option<Scenario>,

    /// List scenario names and exit
    #[arg(long, help_heading = "Scenario selection")]
    list: bool,

    /// On failure, suspend for inspection before tearing down and continue with the next scenario
    #[arg(long, help_heading = "Scenario selection")]
    interactive_on_error: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Output")]
    quiet: bool,

    /// Write DEBUG level logs to this file regardless of verbosity
    #[arg(long, value_name = "PATH", help_heading = "Output")]
    debug_log_file: Option<String>,

    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,
}

#[instrument]
async fn async_main(args: Args, config: HarnessConfig) -> Result<RunReport> {
    let scenarios = config.selected_scenarios(args.test_name)?;
    let service_executor = config.service.host.executor(config.wait_timeout());
    let admin = Arc::new(RemoteServiceAdmin::new(
        service_executor.clone(),
        config.service.commands.clone(),
    ));
    let service = SessionQueryClient::new(admin).with_poll_interval(config.poll_interval()?);
    let (mount_a, mount_b) = config.build_mounts()?;
    let mut ctx = ScenarioContext::new(service, mount_a, mount_b)
        .await
        .context("preflight checks failed")?
        .with_restart_grace(config.restart_grace());
    tracing::info!("service timeouts: {:?}", ctx.timeouts);

    let thrasher = match &config.thrash_pool_snaps {
        Some(thrash_config) => {
            let thrasher = thrash::SnapThrasher::new(thrash_config.clone())?;
            let pool_admin = Arc::new(thrash::RemotePoolAdmin::new(service_executor));
            Some(thrash::spawn(thrasher, pool_admin))
        }
        None => None,
    };

    let policy = if args.interactive_on_error || config.interactive_on_error {
        FailurePolicy::PauseForInspection
    } else {
        FailurePolicy::Abort
    };
    let runner = ScenarioRunner::new(policy).with_operator(Arc::new(StdinOperator));
    let report = runner.run(&mut ctx, &scenarios).await;

    if let Some(handle) = thrasher {
        // the scenarios are done, so a thrasher failure must not hide their outcome
        match handle.stop().await {
            Ok(thrasher) => tracing::info!(
                "pool snapshot thrasher stopped with {} live snaps",
                thrasher.live_snaps().len()
            ),
            Err(error) => tracing::error!("stopping pool snapshot thrasher: {:#}", error),
        }
    }
    Ok(report.into_result()?)
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.list {
        for scenario in Scenario::all() {
            println!("{scenario}");
        }
        return Ok(());
    }
    let config = match &args.config {
        Some(path) => match HarnessConfig::load(path) {
            Ok(config) => config,
            Err(error) => {
                if !args.quiet {
                    eprintln!("{error:#}");
                }
                std::process::exit(1);
            }
        },
        None => anyhow::bail!("--config is required"),
    };
    let func = {
        let args = args.clone();
        || async_main(args, config)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: 0,
    };
    let tracing = common::TracingConfig {
        debug_log_file: args.debug_log_file.clone(),
        trace_identifier: "recovery-harness".to_string(),
    };
    let res = common::run(output, runtime, tracing, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
