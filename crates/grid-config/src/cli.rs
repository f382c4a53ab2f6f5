//! Command-line argument parsing for the grid driver.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Grid driver command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "grid-driver", about = "Job grid driver")]
pub struct CliArgs {
    /// Channel server port; may be repeated to listen on several ports.
    #[arg(long = "port")]
    pub ports: Vec<u16>,

    /// Recovery (heartbeat) server port.
    #[arg(long)]
    pub recovery_port: Option<u16>,

    /// Disable the recovery server.
    #[arg(long)]
    pub no_recovery: bool,

    /// Interval between reaper cycles, in milliseconds.
    #[arg(long)]
    pub reaper_interval_ms: Option<u64>,

    /// Transition worker pool size.
    #[arg(long)]
    pub pool_size: Option<usize>,

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
        if !args.ports.is_empty() {
            self.nio.ports = args.ports.clone();
        }
        if let Some(port) = args.recovery_port {
            self.recovery.port = port;
        }
        if args.no_recovery {
            self.recovery.enabled = false;
        }
        if let Some(interval) = args.reaper_interval_ms {
            self.recovery.reaper_run_interval_ms = interval;
        }
        if let Some(size) = args.pool_size {
            self.nio.transition_pool_size = size;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
