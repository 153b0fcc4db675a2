//! Play history.
//!
//! [`HistoryStore`] keeps a bounded, newest-first list of song and DJ events on
//! disk and refuses near-duplicate entries: the same track within the song
//! window, or the same DJ text within the DJ window. [`HistoryTracker`] feeds
//! it from the now-playing snapshot.

use crate::config::HistoryConfig;
use crate::metadata::{current_timestamp_ms, stem_artist_title, TrackMetadata, UNKNOWN};
use crate::metrics::SharedMetrics;
use crate::persist::{load_json, write_json_atomic, PersistError};
use crate::snapshot::SnapshotStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const HISTORY_FILE: &str = "history.json";

/// Timestamps below this are taken to be seconds rather than milliseconds.
const SECONDS_CUTOFF: i64 = 10_000_000_000;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Failed to persist history: {0}")]
    Persist(#[from] PersistError),
}

/// One history record, tagged by `"type"` on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEntry {
    Song {
        time: i64,
        #[serde(default)]
        title: String,
        #[serde(default)]
        artist: String,
        #[serde(default)]
        album: String,
        #[serde(default)]
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artwork_url: Option<String>,
    },
    Dj {
        time: i64,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_url: Option<String>,
    },
}

impl HistoryEntry {
    pub fn song(track: &TrackMetadata, time: i64) -> Self {
        HistoryEntry::Song {
            time,
            title: track.title.clone(),
            artist: track.artist.clone(),
            album: track.album.clone(),
            filename: track.filename.clone(),
            artwork_url: track.artwork_url.clone(),
        }
    }

    pub fn dj(text: &str, audio_url: Option<String>, time: i64) -> Self {
        HistoryEntry::Dj {
            time,
            text: text.to_string(),
            audio_url,
        }
    }

    pub fn time(&self) -> i64 {
        match self {
            HistoryEntry::Song { time, .. } | HistoryEntry::Dj { time, .. } => *time,
        }
    }

    fn set_time(&mut self, value: i64) {
        match self {
            HistoryEntry::Song { time, .. } | HistoryEntry::Dj { time, .. } => *time = value,
        }
    }

    pub fn is_song(&self) -> bool {
        matches!(self, HistoryEntry::Song { .. })
    }

    /// Whether `other` is the same event for dedup purposes.
    ///
    /// Songs match on a shared non-empty filename, or on title, artist and
    /// album together (case-insensitive). DJ entries match on text. Entries of
    /// different types never match.
    pub fn same_identity(&self, other: &HistoryEntry) -> bool {
        let eq = |a: &str, b: &str| a.trim().to_lowercase() == b.trim().to_lowercase();
        match (self, other) {
            (
                HistoryEntry::Song {
                    title,
                    artist,
                    album,
                    filename,
                    ..
                },
                HistoryEntry::Song {
                    title: other_title,
                    artist: other_artist,
                    album: other_album,
                    filename: other_filename,
                    ..
                },
            ) => {
                (!filename.trim().is_empty() && filename.trim() == other_filename.trim())
                    || (eq(title, other_title) && eq(artist, other_artist) && eq(album, other_album))
            }
            (HistoryEntry::Dj { text, .. }, HistoryEntry::Dj { text: other_text, .. }) => {
                eq(text, other_text)
            }
            _ => false,
        }
    }

    /// Fill missing artist/title from the file stem, then fall back to Unknown.
    fn fill_from_filename(&mut self) {
        if let HistoryEntry::Song {
            title,
            artist,
            filename,
            ..
        } = self
        {
            let missing = |s: &str| s.trim().is_empty() || s == UNKNOWN;
            if (missing(title.as_str()) || missing(artist.as_str())) && !filename.is_empty() {
                let (stem_artist, stem_title) = stem_artist_title(filename);
                if missing(artist.as_str()) {
                    *artist = stem_artist;
                }
                if missing(title.as_str()) {
                    *title = stem_title;
                }
            }
            if artist.trim().is_empty() {
                *artist = UNKNOWN.to_string();
            }
            if title.trim().is_empty() {
                *title = UNKNOWN.to_string();
            }
        }
    }
}

/// Convert a timestamp to epoch milliseconds; values that look like seconds
/// are scaled up.
pub fn normalize_time(time: i64) -> i64 {
    if time < SECONDS_CUTOFF {
        time.saturating_mul(1000)
    } else {
        time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// An entry with the same identity already exists inside the dedup window.
    Duplicate,
    /// The store is full and every stored entry is newer; nothing was written.
    TooOld,
}

/// Bounded, deduplicated, newest-first history persisted to one JSON file.
pub struct HistoryStore {
    path: PathBuf,
    max_entries: usize,
    song_window_ms: i64,
    dj_window_ms: i64,
    entries: Mutex<Vec<HistoryEntry>>,
}

impl HistoryStore {
    /// Open the store at `path`. A missing or unreadable file starts empty.
    pub fn open(
        path: impl Into<PathBuf>,
        max_entries: usize,
        song_window: Duration,
        dj_window: Duration,
    ) -> Self {
        let path = path.into();
        let mut entries: Vec<HistoryEntry> = match load_json(&path) {
            Ok(Some(entries)) => entries,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "history unreadable, starting empty");
                Vec::new()
            }
        };
        entries.sort_by(|a, b| b.time().cmp(&a.time()));
        entries.truncate(max_entries);

        Self {
            path,
            max_entries,
            song_window_ms: song_window.as_millis() as i64,
            dj_window_ms: dj_window.as_millis() as i64,
            entries: Mutex::new(entries),
        }
    }

    pub fn from_config(cache_dir: &Path, config: &HistoryConfig) -> Self {
        Self::open(
            cache_dir.join(HISTORY_FILE),
            config.max_entries,
            Duration::from_secs(config.song_dedup_secs),
            Duration::from_secs(config.dj_dedup_secs),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an event.
    ///
    /// Times are normalized to milliseconds and song identities are completed
    /// from the filename before the dedup check. The file is rewritten on every
    /// insert; on write failure the in-memory list is left unchanged.
    ///
    /// # Returns
    /// * `Ok(AddOutcome::Added)` - Inserted and persisted
    /// * `Ok(AddOutcome::Duplicate)` - Same identity within the dedup window
    /// * `Ok(AddOutcome::TooOld)` - Store is full and every entry is newer
    /// * `Err(HistoryError)` - Persisting failed
    pub fn add(&self, mut entry: HistoryEntry) -> Result<AddOutcome, HistoryError> {
        entry.set_time(normalize_time(entry.time()));
        entry.fill_from_filename();

        let window = if entry.is_song() {
            self.song_window_ms
        } else {
            self.dj_window_ms
        };
        let mut entries = self.lock();
        let duplicate = entries.iter().any(|existing| {
            existing.same_identity(&entry) && (existing.time() - entry.time()).abs() < window
        });
        if duplicate {
            debug!(time = entry.time(), "history entry inside dedup window, skipped");
            return Ok(AddOutcome::Duplicate);
        }

        let position = entries
            .iter()
            .position(|existing| existing.time() < entry.time())
            .unwrap_or(entries.len());
        if position >= self.max_entries {
            debug!(time = entry.time(), "history entry older than a full store, skipped");
            return Ok(AddOutcome::TooOld);
        }

        let mut updated = entries.clone();
        updated.insert(position, entry);
        updated.truncate(self.max_entries);

        write_json_atomic(&self.path, &updated)?;
        *entries = updated;
        Ok(AddOutcome::Added)
    }

    /// Up to `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        self.lock().iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<HistoryEntry>> {
        // The list is only ever replaced wholesale, so a poisoned guard is still consistent.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Records the now-playing track in the history whenever it changes.
pub struct HistoryTracker {
    store: Arc<HistoryStore>,
    snapshots: SnapshotStore,
    metrics: SharedMetrics,
    interval: Duration,
    last_started_at: Option<i64>,
}

impl HistoryTracker {
    pub fn new(
        store: Arc<HistoryStore>,
        snapshots: SnapshotStore,
        metrics: SharedMetrics,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            snapshots,
            metrics,
            interval,
            last_started_at: None,
        }
    }

    /// Check the snapshot once.
    ///
    /// # Returns
    /// * `Ok(None)` - Nothing new on air, or no usable snapshot
    /// * `Ok(Some(outcome))` - A new track was offered to the store
    pub fn observe(&mut self) -> Result<Option<AddOutcome>, HistoryError> {
        let Some(track) = self.snapshots.read_now_playing().and_then(|file| file.current) else {
            return Ok(None);
        };
        if track.started_at == 0 || self.last_started_at == Some(track.started_at) {
            return Ok(None);
        }

        let entry = if track.is_voice_over() {
            let audio_url = Some(track.filename.clone()).filter(|f| !f.is_empty());
            HistoryEntry::dj(&track.title, audio_url, track.started_at)
        } else {
            HistoryEntry::song(&track, track.started_at)
        };

        let outcome = self.store.add(entry)?;
        self.last_started_at = Some(track.started_at);
        if outcome == AddOutcome::Added {
            info!(artist = %track.artist, title = %track.title, "recorded in history");
        }
        Ok(Some(outcome))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.observe() {
                warn!(error = %e, "failed to record history entry");
            }
            let mut metrics = self.metrics.write().await;
            metrics.history_entries = self.store.len();
            metrics.timestamp_unix_ms = current_timestamp_ms();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::TrackSource;
    use crate::metrics::new_shared_metrics;
    use proptest::prelude::*;
    use tempfile::TempDir;

    const T0: i64 = 1_700_000_000_000;

    fn store_in(dir: &TempDir, max_entries: usize) -> HistoryStore {
        HistoryStore::open(
            dir.path().join(HISTORY_FILE),
            max_entries,
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
    }

    fn song(artist: &str, title: &str, time: i64) -> HistoryEntry {
        HistoryEntry::Song {
            time,
            title: title.to_string(),
            artist: artist.to_string(),
            album: String::new(),
            filename: String::new(),
            artwork_url: None,
        }
    }

    #[test]
    fn test_normalize_time() {
        assert_eq!(normalize_time(1_700_000_000), 1_700_000_000_000);
        assert_eq!(normalize_time(T0), T0);
        assert_eq!(normalize_time(0), 0);
    }

    #[test]
    fn test_song_dedup_window() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 100);

        assert_eq!(store.add(song("A", "One", T0)).unwrap(), AddOutcome::Added);
        // Same track, 59 s later, different case: duplicate.
        assert_eq!(
            store.add(song("a", "ONE", T0 + 59_000)).unwrap(),
            AddOutcome::Duplicate
        );
        // 61 s later: a replay, recorded.
        assert_eq!(
            store.add(song("A", "One", T0 + 61_000)).unwrap(),
            AddOutcome::Added
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_dj_window_is_shorter_and_types_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 100);

        assert_eq!(
            store.add(HistoryEntry::dj("Up next", None, T0)).unwrap(),
            AddOutcome::Added
        );
        assert_eq!(
            store.add(HistoryEntry::dj("Up next", None, T0 + 4_000)).unwrap(),
            AddOutcome::Duplicate
        );
        assert_eq!(
            store.add(HistoryEntry::dj("Up next", None, T0 + 6_000)).unwrap(),
            AddOutcome::Added
        );
        assert_eq!(
            store.add(song("Up next", "", T0)).unwrap(),
            AddOutcome::Added
        );
    }

    #[test]
    fn test_seconds_input_is_normalized_before_dedup() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 100);

        store.add(song("A", "One", T0)).unwrap();
        assert_eq!(
            store.add(song("A", "One", T0 / 1000 + 10)).unwrap(),
            AddOutcome::Duplicate
        );
    }

    #[test]
    fn test_identity_from_filename_stem() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 100);

        let entry = HistoryEntry::Song {
            time: T0,
            title: String::new(),
            artist: String::new(),
            album: String::new(),
            filename: "/music/Radiohead - Lucky.mp3".to_string(),
            artwork_url: None,
        };
        store.add(entry).unwrap();
        assert_eq!(
            store.add(song("Radiohead", "Lucky", T0 + 1_000)).unwrap(),
            AddOutcome::Duplicate
        );
        match &store.recent(1)[0] {
            HistoryEntry::Song { artist, title, .. } => {
                assert_eq!(artist, "Radiohead");
                assert_eq!(title, "Lucky");
            }
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn test_bounded_newest_first_and_persisted() {
        let dir = TempDir::new().unwrap();
        {
            let store = store_in(&dir, 3);
            for i in 0..5 {
                store
                    .add(song("A", &format!("Song {}", i), T0 + i * 120_000))
                    .unwrap();
            }
            // Out-of-order insert lands in time order.
            store.add(song("B", "Late", T0 + 450_000)).unwrap();
        }

        let reopened = store_in(&dir, 3);
        let times: Vec<i64> = reopened.recent(10).iter().map(|e| e.time()).collect();
        assert_eq!(times, vec![T0 + 480_000, T0 + 450_000, T0 + 360_000]);
    }

    fn recording(album: &str, filename: &str, time: i64) -> HistoryEntry {
        HistoryEntry::Song {
            time,
            title: "Creep".to_string(),
            artist: "Radiohead".to_string(),
            album: album.to_string(),
            filename: filename.to_string(),
            artwork_url: None,
        }
    }

    #[test]
    fn test_other_recording_of_same_song_is_recorded() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 100);

        assert_eq!(
            store.add(recording("Pablo Honey", "/m/a.mp3", T0)).unwrap(),
            AddOutcome::Added
        );
        assert_eq!(
            store
                .add(recording("Live at Glastonbury", "/m/b.mp3", T0 + 10_000))
                .unwrap(),
            AddOutcome::Added
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_same_filename_is_duplicate_even_with_other_tags() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 100);

        store.add(recording("Pablo Honey", "/m/a.mp3", T0)).unwrap();
        assert_eq!(
            store.add(recording("", "/m/a.mp3", T0 + 10_000)).unwrap(),
            AddOutcome::Duplicate
        );
    }

    #[test]
    fn test_same_title_artist_album_is_duplicate_across_files() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 100);

        store.add(recording("Pablo Honey", "/m/a.mp3", T0)).unwrap();
        assert_eq!(
            store
                .add(recording("PABLO HONEY", "/other/a-copy.mp3", T0 + 10_000))
                .unwrap(),
            AddOutcome::Duplicate
        );
    }

    #[test]
    fn test_entry_older_than_full_store_is_not_written() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 2);
        store.add(song("A", "One", T0 + 120_000)).unwrap();
        store.add(song("A", "Two", T0 + 240_000)).unwrap();
        let path = dir.path().join(HISTORY_FILE);
        let before = std::fs::read(&path).unwrap();

        assert_eq!(store.add(song("A", "Ancient", T0)).unwrap(), AddOutcome::TooOld);
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(HISTORY_FILE), b"not json").unwrap();
        let store = store_in(&dir, 10);
        assert!(store.is_empty());
        assert_eq!(store.add(song("A", "B", T0)).unwrap(), AddOutcome::Added);
    }

    #[test]
    fn test_entry_json_is_type_tagged() {
        let json = serde_json::to_value(HistoryEntry::dj("Hello", None, T0)).unwrap();
        assert_eq!(json["type"], "dj");
        assert_eq!(json["text"], "Hello");
        let json = serde_json::to_value(song("A", "B", T0)).unwrap();
        assert_eq!(json["type"], "song");
    }

    #[test]
    fn test_tracker_records_each_new_track_once() {
        let dir = TempDir::new().unwrap();
        let snapshots = SnapshotStore::new(dir.path(), Duration::from_secs(30));
        let store = Arc::new(store_in(&dir, 100));
        let mut tracker = HistoryTracker::new(
            store.clone(),
            snapshots.clone(),
            new_shared_metrics(),
            Duration::from_secs(5),
        );

        assert_eq!(tracker.observe().unwrap(), None);

        let mut track = TrackMetadata::new("Artist A", "Song A", TrackSource::Validated);
        track.started_at = T0;
        snapshots.write_now_playing(Some(&track), T0).unwrap();
        assert_eq!(tracker.observe().unwrap(), Some(AddOutcome::Added));
        assert_eq!(tracker.observe().unwrap(), None);

        let mut intro = TrackMetadata::new("AI DJ", "DJ Intro", TrackSource::ControlSocket);
        intro.started_at = T0 + 200_000;
        intro.filename = "/var/lib/onair/intros/x.mp3".to_string();
        snapshots.write_now_playing(Some(&intro), T0 + 200_000).unwrap();
        assert_eq!(tracker.observe().unwrap(), Some(AddOutcome::Added));

        let recent = store.recent(10);
        assert_eq!(recent.len(), 2);
        assert!(matches!(
            &recent[0],
            HistoryEntry::Dj { audio_url: Some(url), .. } if url.ends_with("x.mp3")
        ));
    }

    // Within the dedup window at most one entry per identity survives, no
    // matter how the offers are interleaved.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_no_duplicates_inside_window(
            offers in prop::collection::vec((0u8..3, 0i64..300), 1..40)
        ) {
            let dir = TempDir::new().unwrap();
            let store = store_in(&dir, 1_000);
            for (track, offset_secs) in &offers {
                let entry = song("Artist", &format!("Track {}", track), T0 + offset_secs * 1000);
                store.add(entry).unwrap();
            }

            let entries = store.recent(1_000);
            for (i, a) in entries.iter().enumerate() {
                for b in entries.iter().skip(i + 1) {
                    if a.same_identity(b) {
                        prop_assert!((a.time() - b.time()).abs() >= 60_000);
                    }
                }
            }
        }
    }
}
