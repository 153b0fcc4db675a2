//! Metrics module for the station control plane
//!
//! Counters for the cache poll loop, connection pool statistics and intro
//! trigger status, shared between tasks and served as JSON on `/metrics`.

use crate::intro::IntroStatus;
use crate::pool::PoolStats;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cache daemon poll loop counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PollMetrics {
    pub cycles: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub consecutive_failures: u64,
    pub track_changes: u64,
    pub self_heals: u64,
    pub last_success_ms: i64,
    pub last_error: Option<String>,
}

impl PollMetrics {
    pub fn record_success(&mut self, now_ms: i64, track_changed: bool, self_healed: bool) {
        self.cycles += 1;
        self.succeeded += 1;
        self.consecutive_failures = 0;
        self.last_success_ms = now_ms;
        self.last_error = None;
        if track_changed {
            self.track_changes += 1;
        }
        if self_healed {
            self.self_heals += 1;
        }
    }

    pub fn record_failure(&mut self, error: String) {
        self.cycles += 1;
        self.failed += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error);
    }
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub poll: PollMetrics,
    pub pool: PoolStats,
    pub history_entries: usize,
    pub skips_sent: u64,
    pub intro: IntroStatus,
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}
