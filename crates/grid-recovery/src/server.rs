//! The driver's recovery server: accepts heartbeat sockets and hands them to
//! the reaper.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::connection::{HeartbeatConfig, HeartbeatConnection};
use crate::error::RecoveryError;
use crate::reaper::{Reaper, ReaperConfig};

/// Pause after a failed accept, so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for [`RecoveryServer`].
#[derive(Debug, Clone)]
pub struct RecoveryServerConfig {
    /// Address to bind to. Default: `0.0.0.0:22222`.
    pub bind_addr: SocketAddr,
    /// Read policy of every accepted connection.
    pub heartbeat: HeartbeatConfig,
    /// Reaper pool and interval.
    pub reaper: ReaperConfig,
}

impl Default for RecoveryServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 22222)),
            heartbeat: HeartbeatConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

/// Accept loop of the heartbeat port.
pub struct RecoveryServer {
    config: RecoveryServerConfig,
    reaper: Arc<Reaper>,
    shutdown_tx: watch::Sender<bool>,
}

impl RecoveryServer {
    /// Create a server and its reaper.
    pub fn new(config: RecoveryServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            reaper: Arc::new(Reaper::new(config.reaper.clone())),
            config,
            shutdown_tx,
        }
    }

    /// The reaper monitoring accepted connections; register listeners here.
    pub fn reaper(&self) -> &Arc<Reaper> {
        &self.reaper
    }

    /// Bind the configured address and run until [`close`](Self::close).
    pub async fn run(&self) -> Result<(), RecoveryError> {
        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RecoveryError::Bind { addr, source })?;
        tracing::info!("Recovery server listening on {addr}");
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), RecoveryError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let reaper_task = self.reaper.start();
        let mut checks = JoinSet::new();

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                result = listener.accept() => {
                    while checks.try_join_next().is_some() {}
                    match result {
                        Ok((stream, peer_addr)) => {
                            tracing::debug!("Heartbeat connection accepted from {peer_addr}");
                            let reaper = Arc::clone(&self.reaper);
                            let config = self.config.heartbeat.clone();
                            checks.spawn(async move {
                                match HeartbeatConnection::new(stream, config) {
                                    Ok(connection) => {
                                        reaper.check_new_connection(Arc::new(connection)).await;
                                    }
                                    Err(e) => tracing::warn!(
                                        "Rejected heartbeat socket from {peer_addr}: {e}"
                                    ),
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!("Recovery server accept failed: {e}");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        tracing::info!("Recovery server shutting down");
        checks.shutdown().await;
        self.reaper.close();
        if let Err(e) = reaper_task.await {
            tracing::error!("Reaper task failed: {e}");
        }
        Ok(())
    }

    /// Stop accepting, stop the reaper and close every connection.
    pub fn close(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ReconnectConfig;
    use crate::connection::tests::fast_config;
    use crate::listener::{HeartbeatEvent, ReaperListener};
    use crate::responder::{HeartbeatResponder, ResponderConfig};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Events {
        added: Mutex<Vec<Option<String>>>,
        failed: Mutex<Vec<Option<String>>>,
    }

    impl ReaperListener for Events {
        fn connection_added(&self, event: &HeartbeatEvent) {
            self.added.lock().unwrap().push(event.uuid.clone());
        }

        fn connection_failed(&self, event: &HeartbeatEvent) {
            self.failed.lock().unwrap().push(event.uuid.clone());
        }
    }

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn responder(server_addr: SocketAddr, uuid: &str) -> Arc<HeartbeatResponder> {
        Arc::new(HeartbeatResponder::new(ResponderConfig {
            server_addr,
            uuid: uuid.to_string(),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_attempts: 3,
                ..Default::default()
            },
            idle_timeout: None,
        }))
    }

    async fn start_server() -> (Arc<RecoveryServer>, SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(RecoveryServer::new(RecoveryServerConfig {
            bind_addr: addr,
            heartbeat: fast_config(),
            reaper: ReaperConfig {
                pool_size: 2,
                run_interval: Duration::from_millis(30),
            },
        }));
        let running = Arc::clone(&server);
        let task = tokio::spawn(async move {
            running.run_with_listener(listener).await.unwrap();
        });
        (server, addr, task)
    }

    #[tokio::test]
    async fn test_responder_is_monitored_then_evicted() {
        let (server, addr, task) = start_server().await;
        let events = Arc::new(Events::default());
        server.reaper().add_listener(events.clone());

        let node = responder(addr, "node-9");
        let running = Arc::clone(&node);
        let node_task = tokio::spawn(async move { running.run().await });

        wait_until("registration", || server.reaper().connections().len() == 1).await;
        assert_eq!(
            server.reaper().connections()[0].uuid().as_deref(),
            Some("node-9")
        );
        assert_eq!(*events.added.lock().unwrap(), [Some("node-9".to_string())]);

        node.close();
        assert!(node_task.await.unwrap().is_ok());
        wait_until("eviction", || server.reaper().connections().is_empty()).await;
        assert_eq!(*events.failed.lock().unwrap(), [Some("node-9".to_string())]);

        server.close();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_disconnects_monitored_peers() {
        let (server, addr, task) = start_server().await;
        let node = responder(addr, "node-1");
        let running = Arc::clone(&node);
        let node_task = tokio::spawn(async move { running.run().await });

        wait_until("registration", || server.reaper().connections().len() == 1).await;
        server.close();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        // The responder sees the driver go away.
        let result = tokio::time::timeout(Duration::from_secs(5), node_task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = RecoveryServer::new(RecoveryServerConfig {
            bind_addr: taken.local_addr().unwrap(),
            ..Default::default()
        });
        assert!(matches!(
            server.run().await,
            Err(RecoveryError::Bind { .. })
        ));
    }
}
