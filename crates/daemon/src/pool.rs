//! Connection pool for the playout engine's control socket.
//!
//! The control socket serves one client at a time and degrades badly under
//! connection storms, so every caller goes through this pool:
//!
//! - a semaphore bounds the number of open connections,
//! - a global rate gate spaces out granted acquisitions,
//! - a circuit breaker stops connection attempts after repeated failures,
//! - connections are health-checked on release and reused while healthy.

use crate::config::{ControlConfig, PoolConfig};
use crate::protocol::{decode_response, encode_command, is_sentinel};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// Upper bound on greeting reads so a chatty socket cannot stall connection setup.
const MAX_GREETING_READS: usize = 16;

/// Errors surfaced by [`ConnectionPool::acquire`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every slot stayed busy for the whole acquire wait.
    #[error("Pool exhausted: no control connection available within {0:?}")]
    Exhausted(Duration),

    /// Too many consecutive connection failures; the socket is not being tried.
    #[error("Circuit open after {failures} consecutive connection failures")]
    CircuitOpen { failures: u32 },

    /// TCP connect or greeting failed.
    #[error("Failed to connect to control socket {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// TCP connect did not complete in time.
    #[error("Timed out connecting to control socket {0}")]
    ConnectTimeout(String),

    /// The pool has been shut down.
    #[error("Connection pool is shut down")]
    Closed,
}

/// Errors from a single request/response exchange on one connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("No complete response within {0:?}")]
    Timeout(Duration),

    #[error("Control socket closed the connection")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Pool tunables, resolved from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    /// `host:port` of the control socket
    pub address: String,
    pub max_connections: usize,
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    /// Read timeout used for health probes
    pub read_timeout: Duration,
    pub greeting_timeout: Duration,
    pub min_interval: Duration,
    pub failure_threshold: u32,
    pub circuit_cooldown: Duration,
    pub probe_command: String,
}

impl PoolSettings {
    pub fn from_config(control: &ControlConfig, pool: &PoolConfig) -> Self {
        Self {
            address: control.address(),
            max_connections: pool.max_connections.max(1) as usize,
            acquire_timeout: Duration::from_secs(pool.acquire_timeout_secs),
            connect_timeout: control.connect_timeout(),
            read_timeout: control.read_timeout(),
            greeting_timeout: control.greeting_timeout(),
            min_interval: Duration::from_millis(pool.min_interval_ms),
            failure_threshold: pool.failure_threshold.max(1),
            circuit_cooldown: Duration::from_secs(pool.circuit_cooldown_secs),
            probe_command: control.probe_command.clone(),
        }
    }
}

/// Point-in-time view of the pool for observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PoolStats {
    pub max_connections: usize,
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    pub consecutive_failures: u32,
    pub circuit_open: bool,
    pub total_created: u64,
}

/// One buffered connection to the control socket.
pub struct PooledConnection {
    stream: BufStream<TcpStream>,
    created_at: Instant,
    last_used: Instant,
    healthy: bool,
}

impl PooledConnection {
    fn new(stream: TcpStream) -> Self {
        let now = Instant::now();
        Self {
            stream: BufStream::new(stream),
            created_at: now,
            last_used: now,
            healthy: true,
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Flag the connection so the pool closes it instead of reusing it.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Write one command line.
    pub async fn send(&mut self, command: &str) -> Result<(), ConnectionError> {
        self.last_used = Instant::now();
        let result = async {
            self.stream.write_all(&encode_command(command)).await?;
            self.stream.flush().await
        }
        .await;

        if let Err(e) = result {
            self.healthy = false;
            return Err(ConnectionError::Io(e));
        }
        Ok(())
    }

    /// Read lines until the sentinel, bounded by `limit`.
    ///
    /// Any failure leaves the stream at an unknown position, so the connection
    /// is marked unhealthy.
    pub async fn read_response(&mut self, limit: Duration) -> Result<Vec<String>, ConnectionError> {
        let stream = &mut self.stream;
        let read = async {
            let mut raw = Vec::new();
            loop {
                let mut line = Vec::new();
                let n = stream.read_until(b'\n', &mut line).await?;
                if n == 0 {
                    return Err(ConnectionError::Closed);
                }
                let done = is_sentinel(&String::from_utf8_lossy(&line));
                raw.extend_from_slice(&line);
                if done {
                    return Ok(decode_response(&raw));
                }
            }
        };

        let result = match timeout(limit, read).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(limit)),
        };

        self.last_used = Instant::now();
        if result.is_err() {
            self.healthy = false;
        }
        result
    }

    /// Send a command and read its full response.
    pub async fn round_trip(
        &mut self,
        command: &str,
        limit: Duration,
    ) -> Result<Vec<String>, ConnectionError> {
        self.send(command).await?;
        self.read_response(limit).await
    }

    /// Discard any banner the control socket writes on connect.
    async fn drain_greeting(&mut self, wait: Duration) -> io::Result<()> {
        let mut buf = [0u8; 512];
        for _ in 0..MAX_GREETING_READS {
            match timeout(wait, self.stream.read(&mut buf)).await {
                Err(_) => return Ok(()),
                Ok(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "control socket closed during greeting",
                    ))
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Global minimum spacing between granted acquisitions.
///
/// The lock is held across the sleep, so checking the last grant and recording
/// the new one happen as one step and queued callers are released one at a time.
pub struct RateLimiter {
    min_interval: Duration,
    last_grant: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_grant: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the interval since the previous grant has elapsed, then grant.
    ///
    /// Returns the instant the grant was recorded.
    pub async fn wait_turn(&self) -> Instant {
        let mut last = self.last_grant.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                sleep_until(ready_at).await;
            }
        }
        let granted = Instant::now();
        *last = Some(granted);
        granted
    }
}

/// Circuit breaker state plus the idle set, guarded together.
struct PoolState {
    idle: Vec<PooledConnection>,
    consecutive_failures: u32,
    circuit_opened_at: Option<Instant>,
    trial_in_flight: bool,
    closed: bool,
}

/// A checked-out connection. Hand it back with [`ConnectionPool::release`];
/// dropping it instead closes the connection and frees the slot.
pub struct Lease<'a> {
    pool: &'a ConnectionPool,
    conn: Option<PooledConnection>,
    _permit: OwnedSemaphorePermit,
    granted_at: Instant,
}

impl Lease<'_> {
    /// When the rate gate granted this acquisition.
    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }

    pub fn connection(&mut self) -> &mut PooledConnection {
        self.conn
            .as_mut()
            .expect("lease holds its connection until released")
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.pool.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Bounded, rate-limited pool of control-socket connections.
pub struct ConnectionPool {
    settings: PoolSettings,
    slots: Arc<Semaphore>,
    state: Mutex<PoolState>,
    limiter: RateLimiter,
    open: AtomicUsize,
    total_created: AtomicU64,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings) -> Self {
        let max = settings.max_connections.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max)),
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(max),
                consecutive_failures: 0,
                circuit_opened_at: None,
                trial_in_flight: false,
                closed: false,
            }),
            limiter: RateLimiter::new(settings.min_interval),
            open: AtomicUsize::new(0),
            total_created: AtomicU64::new(0),
            settings,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Check out a connection.
    ///
    /// Waits for a free slot (bounded by the acquire timeout), then for the
    /// rate gate, then reuses an idle connection or opens a new one.
    ///
    /// # Errors
    /// * `PoolError::CircuitOpen` - immediately, while the breaker is open
    /// * `PoolError::Exhausted` - no slot freed up within the acquire timeout
    /// * `PoolError::Connect` / `PoolError::ConnectTimeout` - a new connection failed
    /// * `PoolError::Closed` - the pool was shut down
    pub async fn acquire(&self) -> Result<Lease<'_>, PoolError> {
        let trial = self.admit().await?;

        let permit = match timeout(
            self.settings.acquire_timeout,
            self.slots.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                self.abandon_trial(trial).await;
                return Err(PoolError::Closed);
            }
            Err(_) => {
                self.abandon_trial(trial).await;
                warn!(
                    address = %self.settings.address,
                    wait = ?self.settings.acquire_timeout,
                    "control connection pool exhausted"
                );
                return Err(PoolError::Exhausted(self.settings.acquire_timeout));
            }
        };

        let granted_at = self.limiter.wait_turn().await;

        let idle = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(PoolError::Closed);
            }
            state.idle.pop()
        };

        let conn = match idle {
            Some(conn) => {
                if trial {
                    self.record_success().await;
                }
                conn
            }
            None => self.open_connection().await?,
        };

        Ok(Lease {
            pool: self,
            conn: Some(conn),
            _permit: permit,
            granted_at,
        })
    }

    /// Return a connection. Healthy connections that answer the probe go back
    /// to the idle set; anything else is closed.
    pub async fn release(&self, mut lease: Lease<'_>) {
        let Some(mut conn) = lease.conn.take() else {
            return;
        };

        if self.state.lock().await.closed || !conn.is_healthy() {
            self.discard(conn);
            return;
        }

        match conn
            .round_trip(&self.settings.probe_command, self.settings.read_timeout)
            .await
        {
            Ok(_) => {
                let mut state = self.state.lock().await;
                if state.closed {
                    drop(state);
                    self.discard(conn);
                } else {
                    state.idle.push(conn);
                }
            }
            Err(e) => {
                debug!(error = %e, "control connection failed health probe, closing");
                self.discard(conn);
            }
        }
        // The slot frees when `lease` drops, after the connection is back in the idle set.
    }

    /// Close idle connections and refuse further acquisitions.
    ///
    /// Leases still checked out are closed when released; no further commands
    /// are sent on them.
    pub async fn shutdown(&self) {
        let idle = {
            let mut state = self.state.lock().await;
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        let closed = idle.len();
        for conn in idle {
            self.discard(conn);
        }
        self.slots.close();
        info!(closed_idle = closed, "control connection pool shut down");
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let max = self.settings.max_connections;
        PoolStats {
            max_connections: max,
            open: self.open.load(Ordering::SeqCst),
            idle: state.idle.len(),
            in_use: max.saturating_sub(self.slots.available_permits()),
            consecutive_failures: state.consecutive_failures,
            circuit_open: state.consecutive_failures >= self.settings.failure_threshold,
            total_created: self.total_created.load(Ordering::SeqCst),
        }
    }

    /// Circuit breaker gate. Returns true when this caller is the half-open trial.
    async fn admit(&self) -> Result<bool, PoolError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(PoolError::Closed);
        }
        if state.consecutive_failures < self.settings.failure_threshold {
            return Ok(false);
        }

        let cooled_down = state
            .circuit_opened_at
            .map(|opened| opened.elapsed() >= self.settings.circuit_cooldown)
            .unwrap_or(true);
        if cooled_down && !state.trial_in_flight {
            state.trial_in_flight = true;
            debug!("circuit half-open, allowing one trial connection");
            return Ok(true);
        }

        Err(PoolError::CircuitOpen {
            failures: state.consecutive_failures,
        })
    }

    async fn abandon_trial(&self, trial: bool) {
        if trial {
            self.state.lock().await.trial_in_flight = false;
        }
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;
        if state.consecutive_failures >= self.settings.failure_threshold {
            info!("control socket reachable again, circuit closed");
        }
        state.consecutive_failures = 0;
        state.circuit_opened_at = None;
        state.trial_in_flight = false;
    }

    async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures += 1;
        state.trial_in_flight = false;
        if state.consecutive_failures >= self.settings.failure_threshold {
            state.circuit_opened_at = Some(Instant::now());
            warn!(
                failures = state.consecutive_failures,
                cooldown = ?self.settings.circuit_cooldown,
                "control socket circuit open"
            );
        }
    }

    async fn open_connection(&self) -> Result<PooledConnection, PoolError> {
        let address = self.settings.address.clone();

        let stream = match timeout(self.settings.connect_timeout, TcpStream::connect(&address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                self.record_failure().await;
                return Err(PoolError::Connect { address, source });
            }
            Err(_) => {
                self.record_failure().await;
                return Err(PoolError::ConnectTimeout(address));
            }
        };
        let _ = stream.set_nodelay(true);

        let mut conn = PooledConnection::new(stream);
        if let Err(source) = conn.drain_greeting(self.settings.greeting_timeout).await {
            self.record_failure().await;
            return Err(PoolError::Connect { address, source });
        }

        self.record_success().await;
        self.open.fetch_add(1, Ordering::SeqCst);
        self.total_created.fetch_add(1, Ordering::SeqCst);
        debug!(address = %address, "opened control connection");
        Ok(conn)
    }

    fn discard(&self, conn: PooledConnection) {
        drop(conn);
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}
