//! Configuration system for the job grid driver and nodes.
//!
//! Settings persist to disk as RON files. Supports CLI overrides via clap,
//! hot-reload detection, and forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{CONFIG_FILE_NAME, Config, DebugConfig, NioConfig, RecoveryConfig};
pub use error::ConfigError;
