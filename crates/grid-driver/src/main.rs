//! Job grid driver: the channel server nodes and clients connect to, plus the
//! recovery server watching their heartbeats.
//!
//! Run with: `cargo run -p grid-driver -- --port 11111 --recovery-port 22222`

mod peer_protocol;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use grid_config::{CliArgs, Config};
use grid_nio::{FrameConfig, Reactor, ReactorConfig};
use grid_recovery::{
    HeartbeatConfig, HeartbeatEvent, ReaperConfig, ReaperListener, RecoveryServer,
    RecoveryServerConfig,
};
use tracing::{error, info, warn};

use peer_protocol::PeerProtocol;

/// Logs every change of the monitored population.
struct LoggingListener;

impl ReaperListener for LoggingListener {
    fn connection_added(&self, event: &HeartbeatEvent) {
        info!(
            "Monitoring {} at {:?}",
            event.uuid.as_deref().unwrap_or("?"),
            event.peer_addr
        );
    }

    fn connection_failed(&self, event: &HeartbeatEvent) {
        warn!(
            "Lost {} at {:?}",
            event.uuid.as_deref().unwrap_or("unidentified peer"),
            event.peer_addr
        );
    }
}

fn config_dir(args: &CliArgs) -> PathBuf {
    args.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("job-grid")
    })
}

/// Defaults plus command-line overrides, used before the config file is read.
fn startup_config(args: &CliArgs) -> Config {
    let mut config = Config::default();
    config.apply_cli_overrides(args);
    config
}

fn reactor_config(config: &Config) -> ReactorConfig {
    ReactorConfig {
        name: "driver".to_string(),
        bind_addrs: config
            .nio
            .ports
            .iter()
            .map(|&port| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
            .collect(),
        pool_size: config.nio.transition_pool_size,
        select_timeout: config.nio.select_timeout(),
        socket_buffer_size: (config.nio.socket_buffer_size > 0)
            .then_some(config.nio.socket_buffer_size),
        frame: FrameConfig {
            max_payload_size: config.nio.max_payload_size,
        },
    }
}

fn recovery_config(config: &Config) -> Result<RecoveryServerConfig, String> {
    let recovery = &config.recovery;
    let host: IpAddr = recovery
        .host
        .parse()
        .map_err(|e| format!("invalid recovery host {:?}: {e}", recovery.host))?;
    Ok(RecoveryServerConfig {
        bind_addr: SocketAddr::new(host, recovery.port),
        heartbeat: HeartbeatConfig {
            max_retries: recovery.max_retries,
            read_timeout: recovery.read_timeout(),
        },
        reaper: ReaperConfig {
            pool_size: recovery.reaper_pool_size,
            run_interval: recovery.reaper_run_interval(),
        },
    })
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    let config_dir = config_dir(&args);

    // Logging starts from defaults plus CLI overrides, before the file is read.
    let startup = startup_config(&args);
    grid_log::init_logging(
        dirs::data_local_dir().map(|d| d.join("job-grid").join("logs")).as_deref(),
        cfg!(debug_assertions),
        Some(&startup),
    );
    info!("Job grid driver starting, config in {}", config_dir.display());

    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            warn!("Using default config: {e}");
            Config::default()
        }
    };
    config.apply_cli_overrides(&args);
    if config.debug.log_level != startup.debug.log_level {
        info!(
            "Log level {:?} from {} takes effect on restart with --log-level",
            config.debug.log_level,
            config_dir.display()
        );
    }

    let mut reactor = match Reactor::new(reactor_config(&config), PeerProtocol::default()) {
        Ok(reactor) => reactor,
        Err(e) => {
            error!("Failed to create channel server: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = reactor.start() {
        error!("Failed to start channel server: {e}");
        std::process::exit(1);
    }
    info!("Channel server listening on {:?}", reactor.local_addrs());

    let recovery = if config.recovery.enabled {
        let server_config = match recovery_config(&config) {
            Ok(server_config) => server_config,
            Err(e) => {
                error!("{e}");
                reactor.stop();
                std::process::exit(1);
            }
        };
        let server = Arc::new(RecoveryServer::new(server_config));
        server.reaper().add_listener(Arc::new(LoggingListener));
        let running = Arc::clone(&server);
        let task = tokio::spawn(async move {
            if let Err(e) = running.run().await {
                error!("Recovery server failed: {e}");
            }
        });
        Some((server, task))
    } else {
        info!("Recovery server disabled");
        None
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for Ctrl-C: {e}");
    }
    info!("Shutting down");

    if let Some((server, task)) = recovery {
        server.close();
        if let Err(e) = task.await {
            error!("Recovery server task failed: {e}");
        }
    }
    reactor.stop();
    info!(
        "Driver stopped; {} channels identified",
        reactor.protocol().identified_count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reactor_config_from_defaults() {
        let config = Config::default();
        let reactor = reactor_config(&config);
        assert_eq!(reactor.bind_addrs, ["0.0.0.0:11111".parse::<SocketAddr>().unwrap()]);
        assert_eq!(reactor.socket_buffer_size, Some(32 * 1024));
        assert_eq!(reactor.frame.max_payload_size, 1_048_576);
        assert!(reactor.select_timeout.is_none());
    }

    #[test]
    fn test_recovery_config_from_defaults() {
        let server = recovery_config(&Config::default()).unwrap();
        assert_eq!(server.bind_addr, "0.0.0.0:22222".parse::<SocketAddr>().unwrap());
        assert_eq!(server.heartbeat.max_retries, 3);
        assert_eq!(server.reaper.run_interval.as_millis(), 60_000);
    }

    #[test]
    fn test_startup_config_takes_cli_log_level() {
        let args = CliArgs::parse_from(["grid-driver", "--log-level", "trace"]);
        assert_eq!(startup_config(&args).debug.log_level, "trace");

        let args = CliArgs::parse_from(["grid-driver"]);
        assert_eq!(startup_config(&args), Config::default());
    }

    #[test]
    fn test_invalid_recovery_host_is_rejected() {
        let mut config = Config::default();
        config.recovery.host = "not-an-ip".to_string();
        assert!(recovery_config(&config).is_err());
    }
}
