//! The binary entry point for the dagflow demo application.

mod pipeline;
mod platform;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use dagflow_config::{CliArgs, Config};
use dagflow_core::{Generator, Scheduler, SchedulerConfig};

use pipeline::{LineSource, Printer, WordCount};

/// dagflow demo: counts words per line of a text file.
#[derive(Parser, Debug)]
#[command(name = "dagflow-demo")]
struct DemoArgs {
    /// Input file to read lines from.
    input: PathBuf,

    #[command(flatten)]
    common: CliArgs,
}

fn main() -> ExitCode {
    let args = DemoArgs::parse();

    let dirs = match args
        .common
        .config
        .as_ref()
        .map(|root| Ok(platform::PlatformDirs::resolve_with_root(root)))
        .unwrap_or_else(platform::PlatformDirs::resolve)
    {
        Ok(dirs) => dirs,
        Err(e) => {
            eprintln!("failed to resolve platform directories: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut config = match Config::load_or_create(&dirs.config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    config.apply_cli_overrides(&args.common);

    dagflow_log::init_logging(Some(&dirs.log_dir), cfg!(debug_assertions), Some(&config));

    let source = match LineSource::open(&args.input) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("failed to open {}: {e}", args.input.display());
            return ExitCode::FAILURE;
        }
    };

    let scheduler_config = SchedulerConfig {
        max_workers: config.scheduler.max_workers,
        memory_threshold_mb: config.scheduler.memory_threshold_mb,
        completion_timeout: Duration::from_millis(config.scheduler.completion_timeout_ms),
        external_wait_interval: Duration::from_millis(config.scheduler.external_wait_interval_ms),
    };

    let generators: Vec<Box<dyn Generator<Payload = String>>> = vec![
        Box::new(source),
        Box::new(WordCount::new()),
        Box::new(Printer::new()),
    ];
    let mut scheduler = match Scheduler::new(generators, scheduler_config) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            eprintln!("failed to build pipeline: {e}");
            return ExitCode::FAILURE;
        }
    };

    for result in scheduler.run() {
        match result {
            Ok(line) => println!("{line}"),
            Err(e) => {
                tracing::error!(error = %e, "pipeline run failed");
                eprintln!("pipeline run failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}
