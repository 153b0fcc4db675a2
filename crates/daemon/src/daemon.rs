//! Daemon startup and task supervision for OnAir
//!
//! Wires the shared connection pool into every component, spawns the
//! background loops and the HTTP API, and tears everything down on signal.

use crate::api::{run_api_server, ApiState, SkipGate};
use crate::cache_daemon::CacheDaemon;
use crate::config::{Config, ConfigError};
use crate::executor::CommandExecutor;
use crate::history::{HistoryStore, HistoryTracker};
use crate::intro::{CommandSynthesizer, IntroCache, IntroTrigger, INTRO_CACHE_FILE};
use crate::metadata::current_timestamp_ms;
use crate::metrics::{new_shared_metrics, SharedMetrics};
use crate::pool::{ConnectionPool, PoolSettings};
use crate::snapshot::SnapshotStore;
use crate::startup::{run_startup_checks, StartupError};
use crate::status::{StatusError, StreamStatusClient};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long background tasks get to finish after shutdown is signalled
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Stream status client could not be built
    #[error("Stream status client error: {0}")]
    Status(#[from] StatusError),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Shared metrics state
    pub metrics: SharedMetrics,
    /// The single connection pool every component borrows from
    pool: Arc<ConnectionPool>,
    executor: CommandExecutor,
    snapshots: SnapshotStore,
    history: Arc<HistoryStore>,
    status: Option<StreamStatusClient>,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file
    /// 2. Apply environment overrides
    /// 3. Run startup checks
    /// 4. Build the pool and every component on top of it
    ///
    /// # Arguments
    /// * `config_path` - Path to the config.toml file
    ///
    /// # Returns
    /// * `Ok(Daemon)` - Daemon initialized successfully
    /// * `Err(DaemonError)` - Initialization failed
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        // Step 1 & 2: Load config from file and apply environment overrides
        let config = Config::load(config_path)?;
        Self::with_config(config)
    }

    /// Initialize the daemon with an existing configuration, running startup checks
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        // Step 3: Startup checks
        run_startup_checks(&config)?;
        Self::new_without_checks(config)
    }

    /// Initialize the daemon without running startup checks
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        // Step 4: Components, all sharing one pool
        let pool = Arc::new(ConnectionPool::new(PoolSettings::from_config(
            &config.control,
            &config.pool,
        )));
        let executor = CommandExecutor::new(pool.clone());
        let snapshots = SnapshotStore::from_config(&config.cache);
        let history = Arc::new(HistoryStore::from_config(&config.cache.dir, &config.history));
        let status = StreamStatusClient::from_config(&config.stream_status)?;

        Ok(Self {
            config,
            metrics: new_shared_metrics(),
            pool,
            executor,
            snapshots,
            history,
            status,
        })
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Handler state for the HTTP API
    pub fn api_state(&self) -> ApiState {
        ApiState {
            snapshots: self.snapshots.clone(),
            history: self.history.clone(),
            metrics: self.metrics.clone(),
            executor: self.executor.clone(),
            skip_gate: Arc::new(SkipGate::new(Duration::from_secs(
                self.config.server.skip_min_interval_secs,
            ))),
            skip_command: self.config.control.skip_command.clone(),
            read_timeout: self.config.control.read_timeout(),
        }
    }

    /// Start the metadata cache poller
    pub fn start_cache_daemon(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let daemon = CacheDaemon::new(
            self.executor.clone(),
            self.status.clone(),
            self.snapshots.clone(),
            self.config.control.clone(),
            self.config.cache.clone(),
            self.metrics.clone(),
        );
        tokio::spawn(daemon.run(shutdown))
    }

    /// Start the play history tracker
    pub fn start_history_tracker(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let tracker = HistoryTracker::new(
            self.history.clone(),
            self.snapshots.clone(),
            self.metrics.clone(),
            Duration::from_secs(self.config.history.poll_interval_secs),
        );
        tokio::spawn(tracker.run(shutdown))
    }

    /// Start the intro trigger, if enabled
    pub fn start_intro_trigger(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let intro = &self.config.intro;
        if !intro.enabled {
            info!("intro generation disabled");
            return None;
        }

        let cache = IntroCache::load(
            self.config.cache.dir.join(INTRO_CACHE_FILE),
            Duration::from_secs(intro.validity_secs),
        );
        let trigger = IntroTrigger::new(
            self.snapshots.clone(),
            cache,
            Arc::new(CommandSynthesizer::from_config(intro)),
            self.executor.clone(),
            intro.clone(),
            self.config.control.read_timeout(),
            self.metrics.clone(),
        );
        Some(tokio::spawn(trigger.run(shutdown)))
    }

    /// Start the metrics update task
    ///
    /// Periodically copies pool statistics into the shared metrics.
    pub fn start_metrics_updater(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }

                let stats = pool.stats().await;
                let mut snapshot = metrics.write().await;
                snapshot.pool = stats;
                snapshot.timestamp_unix_ms = current_timestamp_ms();
            }
        })
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(self) -> Result<(), DaemonError> {
        self.run_until(shutdown_signal()).await
    }

    /// Run every background task and the API until `stop` resolves
    ///
    /// # Returns
    /// * `Ok(())` - Clean shutdown
    /// * `Err(DaemonError::Server)` - The API server failed before `stop`
    pub async fn run_until<F>(self, stop: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles = vec![
            self.start_cache_daemon(shutdown_rx.clone()),
            self.start_history_tracker(shutdown_rx.clone()),
            self.start_metrics_updater(shutdown_rx.clone()),
        ];
        handles.extend(self.start_intro_trigger(shutdown_rx.clone()));

        let state = self.api_state();
        let bind = self.config.server.bind.clone();
        let api_shutdown = shutdown_rx.clone();
        let mut api = tokio::spawn(async move { run_api_server(state, &bind, api_shutdown).await });
        info!(
            control = %self.config.control.address(),
            cache_dir = %self.config.cache.dir.display(),
            "daemon running"
        );

        let early_exit = tokio::select! {
            _ = stop => None,
            result = &mut api => Some(result),
        };

        info!("shutting down");
        let _ = shutdown_tx.send(true);

        let outcome = match early_exit {
            None => {
                match tokio::time::timeout(SHUTDOWN_GRACE, &mut api).await {
                    Ok(Ok(Err(e))) => warn!(error = %e, "API server stopped with error"),
                    Ok(Err(e)) => warn!(error = %e, "API server task failed"),
                    Ok(Ok(Ok(()))) => {}
                    Err(_) => {
                        warn!("API server did not stop in time");
                        api.abort();
                    }
                }
                Ok(())
            }
            Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(e))) => Err(DaemonError::Server(e.to_string())),
            Some(Err(e)) => Err(DaemonError::Server(format!("API server task failed: {}", e))),
        };

        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("background task did not stop in time");
                abort.abort();
            }
        }
        self.pool.shutdown().await;

        if let Err(e) = &outcome {
            error!(error = %e, "daemon stopped");
        } else {
            info!("daemon stopped");
        }
        outcome
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockControlServer;
    use tempfile::TempDir;

    fn create_test_config(server: &MockControlServer, dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.control.host = server.host();
        config.control.port = server.port();
        config.control.greeting_timeout_ms = 10;
        config.control.read_timeout_ms = 500;
        config.pool.min_interval_ms = 0;
        config.cache.dir = dir.path().to_path_buf();
        config.cache.poll_interval_secs = 1;
        config.stream_status.url = None;
        config.server.bind = "127.0.0.1:0".to_string();
        config
    }

    #[tokio::test]
    async fn test_daemon_initialization_without_checks() {
        let server = MockControlServer::start().await;
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&server, &dir);

        let daemon = Daemon::new_without_checks(config.clone()).unwrap();
        assert_eq!(daemon.config, config);
        assert_eq!(daemon.pool().settings().address, server.address());
        assert_eq!(daemon.pool().stats().await.open, 0);

        let metrics = daemon.metrics.read().await;
        assert_eq!(metrics.poll.cycles, 0);
        assert_eq!(metrics.skips_sent, 0);
    }

    #[tokio::test]
    async fn test_daemon_with_config_runs_checks() {
        let server = MockControlServer::start().await;
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(&server, &dir);
        config.intro.enabled = true;
        config.intro.output_dir = dir.path().join("intros");
        config.intro.command = "onair-no-such-program-xyz".to_string();

        let err = Daemon::with_config(config).err().unwrap();
        assert!(matches!(err, DaemonError::Startup(_)));
    }

    #[tokio::test]
    async fn test_run_until_writes_snapshot_and_stops() {
        let server = MockControlServer::builder()
            .respond("radio.metadata", "--- 1 ---\ntitle=\"Song A\"\nartist=\"Artist A\"")
            .respond("radio.queue", "")
            .start()
            .await;
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new_without_checks(create_test_config(&server, &dir)).unwrap();
        let snapshots = daemon.snapshots().clone();
        let metrics = daemon.metrics();
        let pool = daemon.pool().clone();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn(daemon.run_until(async {
            let _ = stop_rx.await;
        }));

        let mut current = None;
        for _ in 0..100 {
            current = snapshots.read_now_playing().and_then(|f| f.current);
            if current.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(current.unwrap().title, "Song A");

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(metrics.read().await.poll.succeeded >= 1);
        assert_eq!(pool.stats().await.idle, 0);
    }

    #[tokio::test]
    async fn test_run_until_reports_bind_failure() {
        let server = MockControlServer::start().await;
        let dir = TempDir::new().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = create_test_config(&server, &dir);
        config.server.bind = taken.local_addr().unwrap().to_string();

        let daemon = Daemon::new_without_checks(config).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            daemon.run_until(std::future::pending::<()>()),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(DaemonError::Server(_))));
    }
}
