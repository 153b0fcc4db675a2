//! Metadata cache daemon.
//!
//! The only component that polls the control socket on a schedule. Each cycle
//! it reads the engine's metadata sections, reconciles them against the public
//! stream status, stamps track changes, and rewrites the snapshot files.

use crate::config::{CacheConfig, ControlConfig};
use crate::executor::{CommandError, CommandExecutor, ExecError};
use crate::metadata::{
    current_timestamp_ms, parse_queue, reconcile, TrackChangeDetector, TrackMetadata,
};
use crate::metrics::SharedMetrics;
use crate::protocol::parse_metadata;
use crate::snapshot::{SnapshotError, SnapshotStore};
use crate::status::StreamStatusClient;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Why a poll cycle produced no new snapshot
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Metadata command failed: {0}")]
    Metadata(#[from] ExecError),

    #[error("Failed to write snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// What one successful poll cycle did
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub current: Option<TrackMetadata>,
    pub track_changed: bool,
    pub queue_written: bool,
    pub self_heal_sent: bool,
}

pub struct CacheDaemon {
    executor: CommandExecutor,
    status: Option<StreamStatusClient>,
    snapshots: SnapshotStore,
    control: ControlConfig,
    cache: CacheConfig,
    metrics: SharedMetrics,
    detector: TrackChangeDetector,
    cycle: u64,
    /// Set once the corrective skip has been sent for the current stuck episode.
    self_heal_fired: bool,
}

impl CacheDaemon {
    pub fn new(
        executor: CommandExecutor,
        status: Option<StreamStatusClient>,
        snapshots: SnapshotStore,
        control: ControlConfig,
        cache: CacheConfig,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            executor,
            status,
            snapshots,
            control,
            cache,
            metrics,
            detector: TrackChangeDetector::new(),
            cycle: 0,
            self_heal_fired: false,
        }
    }

    /// Run one poll cycle.
    ///
    /// On error nothing is written and the previous snapshot stays in place.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, PollError> {
        let queue_due = self.cycle % u64::from(self.cache.queue_every.max(1)) == 0;
        self.cycle += 1;
        let limit = self.control.read_timeout();

        // Step 1: Metadata, plus the queue on the slower cadence, on one connection
        let (metadata_lines, queue_lines) = if queue_due {
            let batch = self
                .executor
                .execute_batch(
                    &[
                        self.control.metadata_command.as_str(),
                        self.control.queue_command.as_str(),
                    ],
                    limit,
                )
                .await?;
            let mut results = batch.into_results().into_iter();
            let metadata = results
                .next()
                .unwrap_or(Err(CommandError::ConnectionLost))
                .map_err(ExecError::from)?;
            let queue = match results.next() {
                Some(Ok(lines)) => Some(lines),
                Some(Err(e)) => {
                    warn!(error = %e, "queue command failed, keeping previous up-next snapshot");
                    None
                }
                None => None,
            };
            (metadata, queue)
        } else {
            (
                self.executor
                    .execute(&self.control.metadata_command, limit)
                    .await?,
                None,
            )
        };

        // Step 2: Sections from the control socket
        let sections = parse_metadata(&metadata_lines);

        // Step 3: Ground truth from the stream status, when reachable
        let status = match &self.status {
            Some(client) => match client.now_playing().await {
                Ok(status) => status,
                Err(e) => {
                    debug!(error = %e, "stream status unavailable");
                    None
                }
            },
            None => None,
        };
        let reconciled = reconcile(&sections, status.as_deref());

        // Steps 4 and 5: Track change and artwork
        let now = current_timestamp_ms();
        let mut track_changed = false;
        let current = reconciled.current.clone().map(|track| {
            let mut track = track.with_artwork(&self.cache.artwork_base_url);
            track_changed = self.detector.observe(&mut track, now);
            track
        });
        if track_changed {
            if let Some(track) = &current {
                info!(
                    artist = %track.artist,
                    title = %track.title,
                    source = ?track.source,
                    "track changed"
                );
            }
        }

        // Step 6: Self-heal a stuck voice-over, once per episode; a failed
        // skip is retried on the next cycle
        let mut self_heal_sent = false;
        if reconciled.voice_over_stuck() {
            if !self.self_heal_fired {
                warn!(
                    command = %self.control.voiceover_skip_command,
                    "stream reports a voice-over the engine has moved past, sending skip"
                );
                match self
                    .executor
                    .execute(&self.control.voiceover_skip_command, limit)
                    .await
                {
                    Ok(_) => {
                        self.self_heal_fired = true;
                        self_heal_sent = true;
                    }
                    Err(e) => warn!(error = %e, "voice-over skip failed"),
                }
            }
        } else {
            self.self_heal_fired = false;
        }

        // Step 7: Snapshots
        self.snapshots.write_now_playing(current.as_ref(), now)?;
        let queue_written = match queue_lines {
            Some(lines) => {
                let upcoming: Vec<TrackMetadata> = parse_queue(&lines)
                    .into_iter()
                    .map(|track| track.with_artwork(&self.cache.artwork_base_url))
                    .collect();
                self.snapshots.write_up_next(&upcoming, now)?;
                true
            }
            None => false,
        };

        Ok(PollOutcome {
            current,
            track_changed,
            queue_written,
            self_heal_sent,
        })
    }

    /// Poll until `shutdown` flips to true. Failures are logged and retried on
    /// the next tick.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.cache.poll_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.cache.poll_interval_secs,
            queue_every = self.cache.queue_every,
            "cache daemon started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            match self.poll_once().await {
                Ok(outcome) => {
                    let mut metrics = self.metrics.write().await;
                    metrics.poll.record_success(
                        current_timestamp_ms(),
                        outcome.track_changed,
                        outcome.self_heal_sent,
                    );
                }
                Err(e) => {
                    warn!(error = %e, "cache poll failed, keeping previous snapshot");
                    self.metrics.write().await.poll.record_failure(e.to_string());
                }
            }
        }

        info!("cache daemon stopped");
    }
}
