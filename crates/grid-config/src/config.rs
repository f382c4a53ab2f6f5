//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level grid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Non-blocking channel server settings.
    pub nio: NioConfig,
    /// Heartbeat and connection reaper settings.
    pub recovery: RecoveryConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Settings for the readiness-driven channel servers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NioConfig {
    /// Ports the driver listens on for channel connections.
    pub ports: Vec<u16>,
    /// Worker threads executing state transitions (0 = one per CPU).
    pub transition_pool_size: usize,
    /// Readiness wait timeout in milliseconds (0 = wait until woken).
    pub select_timeout_ms: u64,
    /// Largest accepted message payload in bytes.
    pub max_payload_size: u32,
    /// Socket send/receive buffer size in bytes.
    pub socket_buffer_size: usize,
}

/// Heartbeat recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Whether the recovery server runs at all.
    pub enabled: bool,
    /// Host the recovery server binds to (driver) or connects to (node).
    pub host: String,
    /// Recovery server port.
    pub port: u16,
    /// Read attempts per heartbeat reply before the peer is declared dead.
    pub max_retries: u32,
    /// Timeout of each read attempt in milliseconds.
    pub read_timeout_ms: u64,
    /// Concurrent heartbeat checks per reaper cycle (0 = one per CPU).
    pub reaper_pool_size: usize,
    /// Interval between reaper cycles in milliseconds.
    pub reaper_run_interval_ms: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NioConfig {
    fn default() -> Self {
        Self {
            ports: vec![11111],
            transition_pool_size: 0,
            select_timeout_ms: 0,
            max_payload_size: 1_048_576,
            socket_buffer_size: 32 * 1024,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 22222,
            max_retries: 3,
            read_timeout_ms: 6000,
            reaper_pool_size: 0,
            reaper_run_interval_ms: 60_000,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Derived values ---

impl NioConfig {
    /// Readiness wait timeout, `None` when the loop should block until woken.
    pub fn select_timeout(&self) -> Option<Duration> {
        (self.select_timeout_ms > 0).then(|| Duration::from_millis(self.select_timeout_ms))
    }
}

impl RecoveryConfig {
    /// Timeout of a single heartbeat read attempt.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Period of the reaper cycle.
    pub fn reaper_run_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_run_interval_ms)
    }
}

// --- Load / Save / Reload ---

/// File name of the persisted config inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.ron";

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(io_error(path))?;
    ron::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl Config {
    /// Load `config.ron` from `config_dir`, writing the defaults there first
    /// if it does not exist.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            return Ok(config);
        }
        let config = read_file(&config_path)?;
        log::info!("Loaded config from {}", config_path.display());
        Ok(config)
    }

    /// Write the config to `config_dir/config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(io_error(config_dir))?;
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .enumerate_arrays(false);
        let serialized = ron::ser::to_string_pretty(self, pretty)?;

        let config_path = config_dir.join(CONFIG_FILE_NAME);
        std::fs::write(&config_path, serialized).map_err(io_error(&config_path))
    }

    /// Re-read the file; `Some` only if its content differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let reloaded = read_file(&config_dir.join(CONFIG_FILE_NAME))?;
        if reloaded == *self {
            return Ok(None);
        }
        log::info!("Config reloaded with changes");
        Ok(Some(reloaded))
    }
}
