//! Periodic sweep over every monitored heartbeat connection.
//!
//! Each cycle snapshots the registry, runs all connections concurrently on a
//! bounded pool, waits for every check to finish and only then evaluates the
//! verdicts one by one. The registry lock is held to copy or mutate the list,
//! never while a check runs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::connection::HeartbeatConnection;
use crate::listener::{HeartbeatEvent, ReaperListener};

/// Reaper settings.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Checks running at the same time; 0 means one per CPU.
    pub pool_size: usize,
    /// Time between two cycles. Default: 60 s.
    pub run_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            pool_size: 0,
            run_interval: Duration::from_millis(60_000),
        }
    }
}

/// Registry of heartbeat connections and the timer that checks them.
pub struct Reaper {
    config: ReaperConfig,
    connections: Mutex<Vec<Arc<HeartbeatConnection>>>,
    listeners: RwLock<Vec<Arc<dyn ReaperListener>>>,
    permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl Reaper {
    /// Create an idle reaper; nothing runs until [`start`](Self::start).
    pub fn new(config: ReaperConfig) -> Self {
        let pool_size = if config.pool_size == 0 {
            num_cpus::get()
        } else {
            config.pool_size
        };
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            connections: Mutex::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            permits: Arc::new(Semaphore::new(pool_size)),
            shutdown_tx,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Vec<Arc<HeartbeatConnection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection to the steady-state registry.
    pub fn add_connection(&self, connection: Arc<HeartbeatConnection>) {
        self.registry().push(connection);
    }

    /// Remove a connection; returns whether it was registered.
    pub fn remove_connection(&self, connection: &Arc<HeartbeatConnection>) -> bool {
        let mut registry = self.registry();
        let before = registry.len();
        registry.retain(|c| !Arc::ptr_eq(c, connection));
        registry.len() != before
    }

    /// Snapshot of the registry.
    pub fn connections(&self) -> Vec<Arc<HeartbeatConnection>> {
        self.registry().clone()
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: Arc<dyn ReaperListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Unregister a listener; returns whether it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn ReaperListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    fn notify(&self, event: &HeartbeatEvent, added: bool) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if added {
                listener.connection_added(event);
            } else {
                listener.connection_failed(event);
            }
        }
    }

    /// Run one exchange on `connection` within the pool's bound.
    async fn run_bounded(permits: Arc<Semaphore>, connection: Arc<HeartbeatConnection>) {
        // A closed semaphore means the reaper is shutting down; the check
        // still runs so its verdict is accurate.
        let _permit = permits.acquire_owned().await;
        connection.run().await;
    }

    /// Check every registered connection once and evict the failed ones.
    pub async fn run_cycle(&self) {
        let snapshot = self.connections();
        if snapshot.is_empty() {
            return;
        }

        let mut checks = JoinSet::new();
        for connection in &snapshot {
            checks.spawn(Self::run_bounded(
                Arc::clone(&self.permits),
                Arc::clone(connection),
            ));
        }
        while let Some(result) = checks.join_next().await {
            if let Err(e) = result {
                tracing::error!("Heartbeat check task failed: {e}");
            }
        }

        let mut failed = 0;
        for connection in &snapshot {
            if !self.evaluate(connection) {
                failed += 1;
            }
        }
        tracing::debug!(
            "Reaper cycle checked {} connections, evicted {failed}",
            snapshot.len()
        );
    }

    /// Act on the verdict of the last run; returns whether the connection is alive.
    fn evaluate(&self, connection: &Arc<HeartbeatConnection>) -> bool {
        if !connection.is_ok() {
            self.remove_connection(connection);
            connection.close();
            tracing::info!("Heartbeat connection {connection:?} evicted");
            self.notify(&HeartbeatEvent::of(connection), false);
            return false;
        }
        if !connection.is_initialized() {
            connection.set_initialized();
            self.notify(&HeartbeatEvent::of(connection), true);
        }
        true
    }

    /// Run a freshly accepted connection immediately and register it if it
    /// passed. Returns whether it was registered.
    pub async fn check_new_connection(&self, connection: Arc<HeartbeatConnection>) -> bool {
        Self::run_bounded(Arc::clone(&self.permits), Arc::clone(&connection)).await;
        if !self.evaluate(&connection) {
            return false;
        }
        if *self.shutdown_tx.borrow() {
            connection.close();
            return false;
        }
        tracing::info!("Monitoring heartbeat connection {connection:?}");
        self.add_connection(connection);
        true
    }

    /// Spawn the interval loop on the current runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let reaper = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reaper.config.run_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => reaper.run_cycle().await,
                    _ = shutdown_rx.changed() => {}
                }
            }
            tracing::debug!("Reaper stopped");
        })
    }

    /// Stop the interval loop and close every registered connection.
    pub fn close(&self) {
        self.shutdown_tx.send_replace(true);
        self.permits.close();
        let connections = std::mem::take(&mut *self.registry());
        for connection in connections {
            connection.close();
        }
    }
}
