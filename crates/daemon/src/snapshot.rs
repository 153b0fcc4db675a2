//! Cache snapshot files.
//!
//! The cache daemon is the only writer. Everything else (HTTP API, history
//! tracker, intro trigger) reads these files and must degrade to placeholder
//! data when they are missing, corrupt, or stale.

use crate::config::CacheConfig;
use crate::metadata::TrackMetadata;
use crate::persist::{load_json, write_json_atomic, PersistError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const NOW_PLAYING_FILE: &str = "now_playing.json";
pub const UP_NEXT_FILE: &str = "up_next.json";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to write snapshot: {0}")]
    Persist(#[from] PersistError),
}

/// Contents of `now_playing.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NowPlayingFile {
    pub current: Option<TrackMetadata>,
    /// Epoch milliseconds of the poll that produced this file
    pub cached_at: i64,
}

/// Contents of `up_next.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpNextFile {
    #[serde(default)]
    pub upcoming: Vec<TrackMetadata>,
    pub cached_at: i64,
}

/// Combined logical snapshot of both files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub current: Option<TrackMetadata>,
    pub upcoming: Vec<TrackMetadata>,
    pub cached_at: i64,
}

/// What readers get for the current track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NowPlayingView {
    pub track: TrackMetadata,
    pub stale: bool,
    /// Zero when no snapshot has ever been written.
    pub cached_at: i64,
}

/// What readers get for the upcoming queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpNextView {
    pub upcoming: Vec<TrackMetadata>,
    pub stale: bool,
    pub cached_at: i64,
}

/// True when a snapshot written at `cached_at` is older than `stale_after`.
pub fn is_stale(cached_at: i64, now_ms: i64, stale_after: Duration) -> bool {
    now_ms.saturating_sub(cached_at) > stale_after.as_millis() as i64
}

/// Reads and writes the snapshot files in the cache directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    stale_after: Duration,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(&config.dir, Duration::from_secs(config.stale_after_secs))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn now_playing_path(&self) -> PathBuf {
        self.dir.join(NOW_PLAYING_FILE)
    }

    pub fn up_next_path(&self) -> PathBuf {
        self.dir.join(UP_NEXT_FILE)
    }

    pub fn write_now_playing(
        &self,
        current: Option<&TrackMetadata>,
        cached_at: i64,
    ) -> Result<(), SnapshotError> {
        let file = NowPlayingFile {
            current: current.cloned(),
            cached_at,
        };
        write_json_atomic(&self.now_playing_path(), &file)?;
        Ok(())
    }

    pub fn write_up_next(
        &self,
        upcoming: &[TrackMetadata],
        cached_at: i64,
    ) -> Result<(), SnapshotError> {
        let file = UpNextFile {
            upcoming: upcoming.to_vec(),
            cached_at,
        };
        write_json_atomic(&self.up_next_path(), &file)?;
        Ok(())
    }

    /// Raw `now_playing.json`; `None` if missing or unreadable.
    pub fn read_now_playing(&self) -> Option<NowPlayingFile> {
        read_or_warn(&self.now_playing_path())
    }

    /// Raw `up_next.json`; `None` if missing or unreadable.
    pub fn read_up_next(&self) -> Option<UpNextFile> {
        read_or_warn(&self.up_next_path())
    }

    /// Current track for readers. Missing, empty, or stale snapshots yield the
    /// placeholder track.
    pub fn now_playing_view(&self, now_ms: i64) -> NowPlayingView {
        match self.read_now_playing() {
            Some(file) => {
                let stale = is_stale(file.cached_at, now_ms, self.stale_after);
                let track = match file.current {
                    Some(track) if !stale => track,
                    _ => TrackMetadata::placeholder(),
                };
                NowPlayingView {
                    track,
                    stale,
                    cached_at: file.cached_at,
                }
            }
            None => NowPlayingView {
                track: TrackMetadata::placeholder(),
                stale: true,
                cached_at: 0,
            },
        }
    }

    /// Upcoming queue for readers. Stale queues are still returned, flagged.
    pub fn up_next_view(&self, now_ms: i64) -> UpNextView {
        match self.read_up_next() {
            Some(file) => UpNextView {
                stale: is_stale(file.cached_at, now_ms, self.stale_after),
                upcoming: file.upcoming,
                cached_at: file.cached_at,
            },
            None => UpNextView {
                upcoming: Vec::new(),
                stale: true,
                cached_at: 0,
            },
        }
    }

    /// Both files merged; `cached_at` is that of the current-track file.
    pub fn snapshot(&self) -> CacheSnapshot {
        let now_playing = self.read_now_playing();
        let up_next = self.read_up_next();
        CacheSnapshot {
            cached_at: now_playing.as_ref().map(|f| f.cached_at).unwrap_or(0),
            current: now_playing.and_then(|f| f.current),
            upcoming: up_next.map(|f| f.upcoming).unwrap_or_default(),
        }
    }
}

fn read_or_warn<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match load_json(path) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "ignoring unreadable snapshot");
            None
        }
    }
}
