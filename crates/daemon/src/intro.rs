//! DJ intro generation.
//!
//! Watches the snapshots for the next real song and, when there is enough time
//! left in the current one, has an external text-to-speech tool synthesize a
//! short spoken intro for it and enqueues the result on the playout engine.
//! Intros are cached per (artist, title) so replays reuse the same audio.
//!
//! State machine per eligibility window (one window per current track):
//!
//! ```text
//! Idle -> Eligible -> Generating -> Cached
//!                               \-> Failed
//! ```

use crate::config::IntroConfig;
use crate::executor::{CommandExecutor, ExecError};
use crate::metadata::{
    current_timestamp_ms, TrackMetadata, UNKNOWN, VOICEOVER_ARTIST, VOICEOVER_TITLE,
};
use crate::metrics::SharedMetrics;
use crate::persist::{load_json, write_json_atomic, PersistError};
use crate::snapshot::SnapshotStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const INTRO_CACHE_FILE: &str = "intro_cache.json";

/// Error type for intro generation
#[derive(Debug, Error)]
pub enum IntroError {
    /// Synthesizer process could not be started
    #[error("Failed to start intro synthesizer: {0}")]
    Spawn(#[from] std::io::Error),

    /// Synthesizer exited with non-zero status
    #[error("Intro synthesizer failed with exit code: {0}")]
    Failed(i32),

    /// Synthesizer was terminated by signal
    #[error("Intro synthesizer was terminated by signal")]
    Terminated,

    #[error("Intro synthesizer did not finish within {0:?}")]
    Timeout(Duration),

    /// Synthesizer reported success but wrote nothing
    #[error("Intro synthesizer produced no file at {0}")]
    MissingOutput(PathBuf),

    #[error("Failed to save intro cache: {0}")]
    Persist(#[from] PersistError),

    #[error("Failed to enqueue intro: {0}")]
    Enqueue(#[from] ExecError),
}

/// Cache key for an intro: lower-cased `artist|title`.
pub fn intro_key(artist: &str, title: &str) -> String {
    format!("{}|{}", artist.trim().to_lowercase(), title.trim().to_lowercase())
}

/// One cached intro
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntroCacheEntry {
    pub file_path: PathBuf,
    /// Epoch milliseconds at which the audio was synthesized
    pub timestamp: i64,
    #[serde(default)]
    pub play_count: u32,
    #[serde(default)]
    pub last_played: i64,
}

/// Persistent map of synthesized intros.
pub struct IntroCache {
    path: PathBuf,
    validity: Duration,
    entries: HashMap<String, IntroCacheEntry>,
}

impl IntroCache {
    /// Load the cache file; a missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>, validity: Duration) -> Self {
        let path = path.into();
        let entries = match load_json(&path) {
            Ok(Some(entries)) => entries,
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(error = %e, "intro cache unreadable, starting empty");
                HashMap::new()
            }
        };
        Self {
            path,
            validity,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry for (artist, title) if its file still exists and it is
    /// younger than the validity period.
    pub fn get_valid(&self, artist: &str, title: &str, now_ms: i64) -> Option<&IntroCacheEntry> {
        let validity = i64::try_from(self.validity.as_millis()).unwrap_or(i64::MAX);
        self.entries
            .get(&intro_key(artist, title))
            .filter(|entry| {
                now_ms.saturating_sub(entry.timestamp) < validity && entry.file_path.is_file()
            })
    }

    pub fn insert(
        &mut self,
        artist: &str,
        title: &str,
        file_path: PathBuf,
        now_ms: i64,
    ) -> Result<(), PersistError> {
        self.entries.insert(
            intro_key(artist, title),
            IntroCacheEntry {
                file_path,
                timestamp: now_ms,
                play_count: 0,
                last_played: 0,
            },
        );
        self.save()
    }

    pub fn mark_played(&mut self, artist: &str, title: &str, now_ms: i64) -> Result<(), PersistError> {
        if let Some(entry) = self.entries.get_mut(&intro_key(artist, title)) {
            entry.play_count += 1;
            entry.last_played = now_ms;
        }
        self.save()
    }

    /// Drop entries that are expired or whose file is gone.
    pub fn prune(&mut self, now_ms: i64) -> usize {
        let validity = i64::try_from(self.validity.as_millis()).unwrap_or(i64::MAX);
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            now_ms.saturating_sub(entry.timestamp) < validity && entry.file_path.is_file()
        });
        before - self.entries.len()
    }

    fn save(&self) -> Result<(), PersistError> {
        write_json_atomic(&self.path, &self.entries)
    }
}

/// Trigger state, published in the metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntroState {
    #[default]
    Idle,
    Eligible,
    Generating,
    Cached,
    Failed,
}

/// Observable trigger status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntroStatus {
    pub state: IntroState,
    /// `"Artist - Title"` of the track the last attempt was for
    pub target: Option<String>,
    pub last_error: Option<String>,
    pub generated: u64,
    pub reused: u64,
    pub failures: u64,
    pub last_attempt_ms: i64,
}

/// Why no intro is generated right now
#[derive(Debug, Clone, PartialEq)]
pub enum Ineligible {
    NoUpcoming,
    MissingIdentity,
    /// A valid intro already exists
    Cached(PathBuf),
    CoolingDown,
    NotEnoughTime,
}

/// The song an intro would be generated for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroTarget {
    pub artist: String,
    pub title: String,
}

/// Produces intro audio for a song.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Write spoken intro audio for (artist, title) to `output`.
    async fn synthesize(&self, artist: &str, title: &str, output: &Path) -> Result<(), IntroError>;
}

/// Build the synthesizer command
///
/// # Arguments
/// * `program` - Text-to-speech tool to run
/// * `artist` / `title` - Song being introduced
/// * `output` - Where the tool must write the audio file
pub fn build_intro_command(program: &str, artist: &str, title: &str, output: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("--artist").arg(artist);
    cmd.arg("--title").arg(title);
    cmd.arg("--output").arg(output);
    cmd.kill_on_drop(true);
    cmd
}

/// Runs an external text-to-speech tool as a subprocess.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    program: String,
    timeout: Duration,
}

impl CommandSynthesizer {
    pub fn new(program: &str, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &IntroConfig) -> Self {
        Self::new(&config.command, Duration::from_secs(config.timeout_secs))
    }
}

#[async_trait]
impl Synthesizer for CommandSynthesizer {
    async fn synthesize(&self, artist: &str, title: &str, output: &Path) -> Result<(), IntroError> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut cmd = build_intro_command(&self.program, artist, title, output);
        let status = match tokio::time::timeout(self.timeout, cmd.status()).await {
            Ok(status) => status?,
            Err(_) => return Err(IntroError::Timeout(self.timeout)),
        };

        if !status.success() {
            return match status.code() {
                Some(code) => Err(IntroError::Failed(code)),
                None => Err(IntroError::Terminated),
            };
        }
        if !output.is_file() {
            return Err(IntroError::MissingOutput(output.to_path_buf()));
        }
        Ok(())
    }
}

/// File name for a new intro: `<artist>-<title>-<ms>.mp3`, filesystem safe.
/// Whole seconds to milliseconds, saturating on absurd config values.
fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000)
}

fn intro_file_name(target: &IntroTarget, now_ms: i64) -> String {
    let safe: String = format!("{}-{}", target.artist, target.title)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{}-{}.mp3", safe.to_lowercase(), now_ms)
}

/// Control command that enqueues `path` as a voice-over item.
pub fn enqueue_command(push_command: &str, path: &Path) -> String {
    format!(
        "{} annotate:artist=\"{}\",title=\"{}\":{}",
        push_command,
        VOICEOVER_ARTIST,
        VOICEOVER_TITLE,
        path.display()
    )
}

/// Decides when to generate intros and drives the synthesizer.
pub struct IntroTrigger {
    snapshots: SnapshotStore,
    cache: IntroCache,
    synthesizer: Arc<dyn Synthesizer>,
    executor: CommandExecutor,
    config: IntroConfig,
    read_timeout: Duration,
    metrics: SharedMetrics,
    status: IntroStatus,
    last_attempt_ms: Option<i64>,
    /// `started_at` of the current track the state belongs to
    window: Option<i64>,
    /// Intro keys already queued during this window
    queued: Vec<String>,
}

impl IntroTrigger {
    pub fn new(
        snapshots: SnapshotStore,
        cache: IntroCache,
        synthesizer: Arc<dyn Synthesizer>,
        executor: CommandExecutor,
        config: IntroConfig,
        read_timeout: Duration,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            snapshots,
            cache,
            synthesizer,
            executor,
            config,
            read_timeout,
            metrics,
            status: IntroStatus::default(),
            last_attempt_ms: None,
            window: None,
            queued: Vec::new(),
        }
    }

    pub fn status(&self) -> &IntroStatus {
        &self.status
    }

    /// Milliseconds left in `current` at `now_ms`, using the assumed track
    /// length when the engine did not report a duration.
    pub fn remaining_ms(&self, current: &TrackMetadata, now_ms: i64) -> i64 {
        let duration_ms = current
            .duration_secs
            .map(|secs| (secs * 1000.0) as i64)
            .unwrap_or_else(|| secs_to_ms(self.config.assumed_track_secs));
        current.started_at.saturating_add(duration_ms).saturating_sub(now_ms)
    }

    /// Check the four eligibility conditions, in order.
    ///
    /// 1. The next song has a known artist and title
    /// 2. No valid cached intro exists for it
    /// 3. The cooldown since the last attempt has passed
    /// 4. Enough of the current track remains to synthesize in time
    pub fn evaluate(
        &self,
        current: Option<&TrackMetadata>,
        next: Option<&TrackMetadata>,
        now_ms: i64,
    ) -> Result<IntroTarget, Ineligible> {
        let next = next.ok_or(Ineligible::NoUpcoming)?;
        if next.artist == UNKNOWN || next.title == UNKNOWN {
            return Err(Ineligible::MissingIdentity);
        }

        if let Some(entry) = self.cache.get_valid(&next.artist, &next.title, now_ms) {
            return Err(Ineligible::Cached(entry.file_path.clone()));
        }

        if let Some(last) = self.last_attempt_ms {
            if now_ms - last < secs_to_ms(self.config.cooldown_secs) {
                return Err(Ineligible::CoolingDown);
            }
        }

        if !self.enough_time(current, now_ms) {
            return Err(Ineligible::NotEnoughTime);
        }

        Ok(IntroTarget {
            artist: next.artist.clone(),
            title: next.title.clone(),
        })
    }

    fn enough_time(&self, current: Option<&TrackMetadata>, now_ms: i64) -> bool {
        match current {
            Some(current) if current.started_at > 0 => {
                self.remaining_ms(current, now_ms) > secs_to_ms(self.config.min_remaining_secs)
            }
            _ => false,
        }
    }

    /// One pass over the snapshots. Returns the resulting state.
    pub async fn tick(&mut self, now_ms: i64) -> IntroState {
        let current = self
            .snapshots
            .read_now_playing()
            .and_then(|file| file.current);
        let next = self.snapshots.read_up_next().and_then(|file| {
            file.upcoming
                .into_iter()
                .find(|track| !track.is_voice_over())
        });

        // A new current track opens a new window. Queued intros stay
        // remembered until their song leaves the head of the queue.
        let window = current.as_ref().map(|track| track.started_at);
        if window != self.window {
            self.window = window;
            let waiting = next.as_ref().map(|track| intro_key(&track.artist, &track.title));
            self.queued.retain(|key| Some(key) == waiting.as_ref());
            self.status.state = IntroState::Idle;
        }

        if current.as_ref().is_some_and(|track| track.is_voice_over()) {
            debug!("voice-over on air, no intro this pass");
            self.publish().await;
            return self.status.state;
        }

        match self.evaluate(current.as_ref(), next.as_ref(), now_ms) {
            Ok(target) => {
                self.status.state = IntroState::Eligible;
                self.generate(target, now_ms).await;
            }
            Err(Ineligible::Cached(path)) => {
                if let Some(next) = &next {
                    if self.enough_time(current.as_ref(), now_ms) {
                        self.reuse(next, &path, now_ms).await;
                    }
                }
            }
            Err(reason) => debug!(?reason, "no intro this pass"),
        }

        self.publish().await;
        self.status.state
    }

    async fn generate(&mut self, target: IntroTarget, now_ms: i64) {
        self.last_attempt_ms = Some(now_ms);
        self.status.last_attempt_ms = now_ms;
        self.status.target = Some(format!("{} - {}", target.artist, target.title));
        self.status.state = IntroState::Generating;
        self.publish().await;

        let output = self
            .config
            .output_dir
            .join(intro_file_name(&target, now_ms));
        info!(artist = %target.artist, title = %target.title, "generating intro");

        let result = match self
            .synthesizer
            .synthesize(&target.artist, &target.title, &output)
            .await
        {
            Ok(()) => self
                .cache
                .insert(&target.artist, &target.title, output.clone(), now_ms)
                .map_err(IntroError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.status.state = IntroState::Cached;
                self.status.generated += 1;
                self.status.last_error = None;
                if let Err(e) = self.enqueue(&target.artist, &target.title, &output, now_ms).await {
                    warn!(error = %e, "intro generated but could not be queued");
                    self.status.last_error = Some(e.to_string());
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    artist = %target.artist,
                    title = %target.title,
                    "intro generation failed"
                );
                self.status.state = IntroState::Failed;
                self.status.failures += 1;
                self.status.last_error = Some(e.to_string());
            }
        }
    }

    async fn reuse(&mut self, next: &TrackMetadata, path: &Path, now_ms: i64) {
        let key = intro_key(&next.artist, &next.title);
        if self.queued.contains(&key) {
            return;
        }
        match self.enqueue(&next.artist, &next.title, path, now_ms).await {
            Ok(()) => {
                self.status.reused += 1;
                debug!(artist = %next.artist, title = %next.title, "queued cached intro");
            }
            Err(e) => warn!(error = %e, "could not queue cached intro"),
        }
    }

    async fn enqueue(
        &mut self,
        artist: &str,
        title: &str,
        path: &Path,
        now_ms: i64,
    ) -> Result<(), IntroError> {
        let command = enqueue_command(&self.config.push_command, path);
        self.executor.execute(&command, self.read_timeout).await?;
        self.queued.push(intro_key(artist, title));
        self.cache.mark_played(artist, title, now_ms)?;
        Ok(())
    }

    async fn publish(&self) {
        self.metrics.write().await.intro = self.status.clone();
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let pruned = self.cache.prune(current_timestamp_ms());
        if pruned > 0 {
            debug!(pruned, "dropped expired intros");
        }
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(cached = self.cache.len(), "intro trigger started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            self.tick(current_timestamp_ms()).await;
        }
    }
}
