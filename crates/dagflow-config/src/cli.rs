//! Command-line argument parsing for the dagflow demo binary.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// dagflow command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "dagflow", about = "Chunk-streaming dataflow scheduler demo")]
pub struct CliArgs {
    /// Number of worker threads per pool.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Resident-set-size threshold in megabytes before source throttling.
    #[arg(long)]
    pub memory_threshold_mb: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(w) = args.workers {
            self.scheduler.max_workers = w;
        }
        if let Some(mb) = args.memory_threshold_mb {
            self.scheduler.memory_threshold_mb = mb;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
