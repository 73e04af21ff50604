#[macro_use]
extern crate async_trait;

mod args;
mod gocompat;
mod operation;
pub(crate) mod stats;

#[cfg(test)]
mod args_test;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use device_bench::configuration::Configuration;
use device_bench::gateway::cql::{CqlGateway, CqlOptions};
use device_bench::gateway::memory::InMemoryGateway;
use device_bench::gateway::StorageGateway;
use device_bench::payload::new_rng;
use device_bench::report::scan_and_report;
use device_bench::run::RunController;
use device_bench::schema::ensure_schema;
use device_bench::sharded_stats::Stats as _;

use crate::args::{DeviceBenchArgs, Mode, ParseResult, StoreKind};
use crate::operation::synthetic_qualifiers;
use crate::operation::write::{WriteConfig, WriteOperation};
use crate::stats::{new_sharded_stats, ShardedStats, StatsPrinter};

// Exit code of Go programs for invalid flags
const FLAG_ERROR_EXIT_CODE: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = match args::parse_device_bench_args(std::env::args(), true) {
        Some(ParseResult::Config(args)) => args,
        Some(ParseResult::VersionDisplayed) | Some(ParseResult::HelpDisplayed) => return Ok(()),
        Some(ParseResult::NoModeSelected) => {
            println!("{}", args::USAGE_HINT);
            return Ok(());
        }
        None => std::process::exit(FLAG_ERROR_EXIT_CODE),
    };

    args.print_configuration();

    let gateway = connect(&args)
        .await
        .context("Failed to connect to the store")?;

    match args.mode {
        Mode::Write => run_writes(&args, gateway).await,
        Mode::Read => {
            let limit = usize::try_from(args.limit).unwrap_or(usize::MAX);
            scan_and_report(
                gateway.as_ref(),
                &args.target,
                &args.prefix,
                limit,
                &mut std::io::stdout(),
            )
            .await
            .context("Failed to read rows")?;
            Ok(())
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn connect(args: &DeviceBenchArgs) -> Result<Arc<dyn StorageGateway>> {
    match args.store {
        StoreKind::Memory => Ok(Arc::new(InMemoryGateway::new())),
        StoreKind::Cql => {
            let options = CqlOptions {
                nodes: args.nodes.clone(),
                replication_factor: args.replication_factor,
                consistency: args.consistency_level,
                timeout: args.timeout,
            };
            let gateway =
                CqlGateway::connect(&args.target.project, &args.target.instance, &options).await?;
            Ok(Arc::new(gateway))
        }
    }
}

async fn run_writes(args: &DeviceBenchArgs, gateway: Arc<dyn StorageGateway>) -> Result<()> {
    ensure_schema(gateway.as_ref(), &args.target)
        .await
        .context("Failed to prepare the schema")?;

    let stats = Arc::new(new_sharded_stats(args.measure_latency));
    let run_config = prepare(args, gateway, Arc::clone(&stats));

    let mut combined_stats = stats.create();

    let (ctrl, run_finished) = device_bench::run::run(run_config);
    let ctrl = Arc::new(ctrl);

    // Don't care about the leaking task, it won't prevent the runtime
    // from being stopped.
    tokio::task::spawn(stop_on_signal(Arc::clone(&ctrl)));

    let printer = StatsPrinter::new(args.measure_latency);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    futures::pin_mut!(run_finished);

    // Skip the first tick, which is immediate
    ticker.tick().await;

    printer.print_header(&mut std::io::stdout())?;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let partial_stats = stats.get_combined_and_clear();
                printer.print_partial(&partial_stats, &mut std::io::stdout())?;
                combined_stats.combine(&partial_stats);
            }
            result = &mut run_finished => {
                let partial_stats = stats.get_combined_and_clear();
                combined_stats.combine(&partial_stats);
                printer.print_final(&combined_stats, &mut std::io::stdout())?;
                return result.context("The write run failed");
            }
        }
    }
}

fn prepare(
    args: &DeviceBenchArgs,
    gateway: Arc<dyn StorageGateway>,
    stats: Arc<ShardedStats>,
) -> Configuration {
    let write_config = WriteConfig {
        qualifiers: synthetic_qualifiers(args.columns),
        payload: args.payload,
        devices: args.devices,
    };
    let operation = WriteOperation::new(
        gateway,
        args.target.clone(),
        stats,
        write_config,
        new_rng(args.seed),
    );
    tracing::info!(
        first_device = operation.device_base(),
        devices = args.devices,
        "writing device readings",
    );

    Configuration {
        max_duration: (!args.duration.is_zero()).then_some(args.duration),
        max_operations: (args.operations > 0).then_some(args.operations),
        concurrency: args.workers,
        rate_limit_per_second: (args.max_rate > 0).then(|| args.max_rate as f64),
        max_errors: args.max_errors,
        operation: Arc::new(operation),
    }
}

async fn stop_on_signal(runner: Arc<RunController>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::info!("stopping, press Ctrl-C again to abort in-flight writes");
    runner.ask_to_stop();

    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    runner.abort();
}
