//! OnAir station control plane
//!
//! Background service that talks to the playout engine's control socket
//! through one shared connection pool, caches now-playing and up-next
//! snapshots, records play history, triggers DJ intros and serves it all
//! over HTTP.

pub mod api;
pub mod cache_daemon;
pub mod daemon;
pub mod executor;
pub mod history;
pub mod intro;
pub mod metadata;
pub mod metrics;
pub mod persist;
pub mod pool;
pub mod protocol;
pub mod snapshot;
pub mod startup;
pub mod status;

#[cfg(test)]
mod test_support;

pub use onair_config as config;
pub use onair_config::Config;
pub use api::{create_api_router, run_api_server, ApiState, ServerError, SkipGate};
pub use cache_daemon::{CacheDaemon, PollError, PollOutcome};
pub use daemon::{shutdown_signal, Daemon, DaemonError};
pub use executor::{BatchResult, CommandError, CommandExecutor, ExecError};
pub use history::{HistoryEntry, HistoryStore, HistoryTracker};
pub use intro::{CommandSynthesizer, IntroState, IntroStatus, IntroTrigger, Synthesizer};
pub use metadata::{TrackMetadata, TrackSource};
pub use metrics::{new_shared_metrics, MetricsSnapshot, PollMetrics, SharedMetrics};
pub use pool::{ConnectionPool, PoolError, PoolSettings, PoolStats};
pub use snapshot::{NowPlayingView, SnapshotStore, UpNextView};
pub use startup::{run_startup_checks, StartupError};
pub use status::StreamStatusClient;
