//! Command execution over pooled control-socket connections.
//!
//! Every exchange with the control socket goes through [`CommandExecutor`]:
//! it acquires a lease, runs one or more commands in order, and always hands
//! the connection back to the pool, healthy or not.

use crate::pool::{ConnectionError, ConnectionPool, PoolError};
use crate::protocol::is_error_reply;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from [`CommandExecutor::execute`].
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Could not get a control connection: {0}")]
    Pool(#[from] PoolError),

    #[error("Control socket rejected command: {0}")]
    Rejected(String),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Control connection failed: {0}")]
    Connection(ConnectionError),
}

/// Per-command failure recorded inside a [`BatchResult`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The control socket answered with an `ERROR` reply.
    #[error("Control socket rejected command: {0}")]
    Rejected(String),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Control connection failed: {0}")]
    Connection(String),

    /// An earlier command in the batch broke the connection; this one was never sent.
    #[error("Not sent: connection lost earlier in the batch")]
    ConnectionLost,
}

impl From<CommandError> for ExecError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Rejected(reply) => ExecError::Rejected(reply),
            CommandError::Timeout(limit) => ExecError::Timeout(limit),
            CommandError::Connection(message) => ExecError::Connection(ConnectionError::Io(
                std::io::Error::new(std::io::ErrorKind::Other, message),
            )),
            CommandError::ConnectionLost => ExecError::Connection(ConnectionError::Closed),
        }
    }
}

/// Outcome of one command in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: String,
    pub result: Result<Vec<String>, CommandError>,
}

/// Outcomes of a batch, one per input command, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchResult {
    pub outcomes: Vec<CommandOutcome>,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Result<Vec<String>, CommandError>> {
        self.outcomes.get(index).map(|outcome| &outcome.result)
    }

    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.result.is_ok())
    }

    /// Move out the per-command results, dropping the command strings.
    pub fn into_results(self) -> Vec<Result<Vec<String>, CommandError>> {
        self.outcomes.into_iter().map(|outcome| outcome.result).collect()
    }
}

/// Runs commands against the control socket through the shared pool.
#[derive(Clone)]
pub struct CommandExecutor {
    pool: Arc<ConnectionPool>,
}

impl CommandExecutor {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Run one command and return its response lines.
    ///
    /// # Arguments
    /// * `command` - Command text, without terminator
    /// * `limit` - Read timeout for the response
    ///
    /// # Returns
    /// * `Ok(lines)` - Response lines with the sentinel stripped
    /// * `Err(ExecError)` - Acquisition failed, the command was rejected, or the
    ///   connection failed
    pub async fn execute(&self, command: &str, limit: Duration) -> Result<Vec<String>, ExecError> {
        let mut batch = self.execute_batch(&[command], limit).await?;
        match batch.outcomes.pop() {
            Some(outcome) => outcome.result.map_err(ExecError::from),
            None => Err(ExecError::Connection(ConnectionError::Closed)),
        }
    }

    /// Run several commands on one connection, strictly in order.
    ///
    /// A rejected command is recorded and the batch continues. A timeout or
    /// I/O error leaves the stream position unknown, so the failing command
    /// records the error and every later command is marked
    /// [`CommandError::ConnectionLost`] without being sent.
    ///
    /// # Returns
    /// * `Ok(BatchResult)` - Exactly one outcome per command, in input order
    /// * `Err(ExecError::Pool)` - No connection could be acquired; nothing was sent
    pub async fn execute_batch<S: AsRef<str>>(
        &self,
        commands: &[S],
        limit: Duration,
    ) -> Result<BatchResult, ExecError> {
        let mut lease = self.pool.acquire().await?;
        let mut outcomes = Vec::with_capacity(commands.len());
        let mut lost = false;

        for command in commands {
            let command = command.as_ref();
            if lost {
                outcomes.push(CommandOutcome {
                    command: command.to_string(),
                    result: Err(CommandError::ConnectionLost),
                });
                continue;
            }

            let result = match lease.connection().round_trip(command, limit).await {
                Ok(lines) if is_error_reply(&lines) => {
                    let reply = lines.join("\n");
                    debug!(command, reply = %reply, "control socket rejected command");
                    Err(CommandError::Rejected(reply))
                }
                Ok(lines) => Ok(lines),
                Err(ConnectionError::Timeout(waited)) => {
                    warn!(command, ?waited, "control command timed out");
                    lost = true;
                    Err(CommandError::Timeout(waited))
                }
                Err(e) => {
                    warn!(command, error = %e, "control connection failed mid-batch");
                    lost = true;
                    Err(CommandError::Connection(e.to_string()))
                }
            };

            outcomes.push(CommandOutcome {
                command: command.to_string(),
                result,
            });
        }

        self.pool.release(lease).await;
        Ok(BatchResult { outcomes })
    }
}
