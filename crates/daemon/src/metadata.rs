//! Track metadata model and the reconciliation rules that turn control-socket
//! sections and the public stream status into one authoritative current track.

use crate::protocol::{parse_section_header, parse_sections, Section};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Artist reported for system voice-over items (DJ intros).
pub const VOICEOVER_ARTIST: &str = "AI DJ";

/// Title reported for system voice-over items.
pub const VOICEOVER_TITLE: &str = "DJ Intro";

/// Stand-in for any missing title or artist.
pub const UNKNOWN: &str = "Unknown";

/// Where a [`TrackMetadata`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    /// Control socket only; the stream status was unavailable.
    #[default]
    ControlSocket,
    /// Control socket and stream status agree.
    Validated,
    /// Synthesized from the stream status string alone.
    StreamStatus,
    /// The only candidate section was a voice-over item.
    VoiceOver,
    /// No data; readers show this instead of blocking.
    Placeholder,
}

/// One track as published in the cache snapshots.
///
/// `title` and `artist` are never empty; they fall back to [`UNKNOWN`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_url: Option<String>,
    /// Epoch milliseconds at which this track was first observed
    #[serde(default)]
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub source: TrackSource,
}

/// Identity used for track-change detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackKey {
    pub artist: String,
    pub title: String,
    pub filename: String,
}

fn or_unknown(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        UNKNOWN.to_string()
    } else {
        value.to_string()
    }
}

fn field(section: &Section, key: &str) -> String {
    section
        .get(key)
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

impl TrackMetadata {
    pub fn new(artist: &str, title: &str, source: TrackSource) -> Self {
        Self {
            title: or_unknown(title),
            artist: or_unknown(artist),
            album: String::new(),
            filename: String::new(),
            genre: String::new(),
            date: String::new(),
            artwork_url: None,
            started_at: 0,
            duration_secs: None,
            source,
        }
    }

    /// Shown when there is no usable data at all.
    pub fn placeholder() -> Self {
        Self::new(UNKNOWN, UNKNOWN, TrackSource::Placeholder)
    }

    /// Build from one control-socket metadata section.
    pub fn from_section(section: &Section, source: TrackSource) -> Self {
        let duration_secs = section
            .get("duration")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0);

        Self {
            album: field(section, "album"),
            filename: normalize_filename(&field(section, "filename")),
            genre: field(section, "genre"),
            date: field(section, "date"),
            duration_secs,
            ..Self::new(&field(section, "artist"), &field(section, "title"), source)
        }
    }

    /// Build from a bare file path, taking artist and title from the file stem.
    pub fn from_path(path: &str, source: TrackSource) -> Self {
        let filename = normalize_filename(path);
        let (artist, title) = stem_artist_title(&filename);
        Self {
            filename,
            ..Self::new(&artist, &title, source)
        }
    }

    pub fn key(&self) -> TrackKey {
        TrackKey {
            artist: self.artist.clone(),
            title: self.title.clone(),
            filename: self.filename.clone(),
        }
    }

    pub fn is_voice_over(&self) -> bool {
        is_voice_over_pair(&self.artist, &self.title)
    }

    /// Case-insensitive artist/title comparison.
    pub fn matches(&self, artist: &str, title: &str) -> bool {
        same_text(&self.artist, artist) && same_text(&self.title, title)
    }

    /// Fill in `artwork_url` from the filename, if there is one.
    pub fn with_artwork(mut self, base_url: &str) -> Self {
        self.artwork_url = artwork_url(base_url, &self.filename);
        self
    }
}

fn same_text(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Returns true for the system voice-over artist/title pair.
pub fn is_voice_over_pair(artist: &str, title: &str) -> bool {
    artist.trim() == VOICEOVER_ARTIST && title.trim() == VOICEOVER_TITLE
}

pub fn section_is_voice_over(section: &Section) -> bool {
    is_voice_over_pair(&field(section, "artist"), &field(section, "title"))
}

/// The section chosen as "currently playing".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentSection {
    pub number: u32,
    /// True when no real song was found and the fallback section was used.
    pub voice_over: bool,
}

/// Pick the currently playing section.
///
/// Scans from the highest-numbered section down to the first one that is not
/// a voice-over item. If every section is a voice-over, falls back to the
/// lowest-numbered section and flags it.
///
/// This ordering assumption about the engine's metadata command is the part
/// most likely to need adjusting for a different playout engine.
pub fn select_current_section(sections: &BTreeMap<u32, Section>) -> Option<CurrentSection> {
    if let Some((number, _)) = sections
        .iter()
        .rev()
        .find(|(_, section)| !section_is_voice_over(section))
    {
        return Some(CurrentSection {
            number: *number,
            voice_over: false,
        });
    }

    sections.keys().next().map(|number| CurrentSection {
        number: *number,
        voice_over: true,
    })
}

/// Split a stream-status string of the form `"Artist - Title"`.
///
/// Without a separator the whole string is the title and the artist is unknown.
pub fn split_artist_title(text: &str) -> (String, String) {
    match text.split_once(" - ") {
        Some((artist, title)) => (or_unknown(artist), or_unknown(title)),
        None => (UNKNOWN.to_string(), or_unknown(text)),
    }
}

/// Derive artist and title from a file name such as `/music/Artist - Title.mp3`.
pub fn stem_artist_title(filename: &str) -> (String, String) {
    let stem = Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    split_artist_title(&stem)
}

/// Strip a URI scheme (`file://`, `http://`, ...) so only the path remains.
///
/// `file://` URIs are percent-decoded into a local path.
pub fn normalize_filename(raw: &str) -> String {
    let raw = raw.trim();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return raw.to_string();
    };

    let is_scheme = !scheme.is_empty()
        && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !is_scheme {
        return raw.to_string();
    }

    if scheme.eq_ignore_ascii_case("file") {
        if let Some(path) = url::Url::parse(raw)
            .ok()
            .and_then(|u| u.to_file_path().ok())
        {
            return path.to_string_lossy().into_owned();
        }
    }
    rest.to_string()
}

/// Artwork endpoint for a track file: `<base>?file=<urlencoded filename>`.
pub fn artwork_url(base_url: &str, filename: &str) -> Option<String> {
    if filename.is_empty() {
        return None;
    }
    let encoded: String = url::form_urlencoded::byte_serialize(filename.as_bytes()).collect();
    Some(format!("{}?file={}", base_url, encoded))
}

/// Result of reconciling both metadata sources for one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub current: Option<TrackMetadata>,
    /// The stream status reported the voice-over sentinel.
    pub status_voice_over: bool,
}

impl Reconciled {
    /// The status claims a voice-over is on air while the engine has moved on
    /// to a real song.
    pub fn voice_over_stuck(&self) -> bool {
        self.status_voice_over
            && self
                .current
                .as_ref()
                .map(|track| !track.is_voice_over() && track.source != TrackSource::VoiceOver)
                .unwrap_or(false)
    }
}

/// Reconcile control-socket sections against the stream-status string.
///
/// * No status: the control-socket pick stands.
/// * Status agrees (case-insensitive): the pick is marked validated.
/// * Status disagrees: the status wins; a matching section supplies richer
///   metadata, otherwise a minimal track is synthesized from the status.
/// * Status reports the voice-over sentinel: the pick stands and the result
///   is flagged so the caller can detect a stuck voice-over.
pub fn reconcile(sections: &BTreeMap<u32, Section>, status: Option<&str>) -> Reconciled {
    let socket_pick = select_current_section(sections).and_then(|pick| {
        let source = if pick.voice_over {
            TrackSource::VoiceOver
        } else {
            TrackSource::ControlSocket
        };
        sections
            .get(&pick.number)
            .map(|section| TrackMetadata::from_section(section, source))
    });

    let Some(status) = status.map(str::trim).filter(|s| !s.is_empty()) else {
        return Reconciled {
            current: socket_pick,
            status_voice_over: false,
        };
    };

    let (artist, title) = split_artist_title(status);
    if is_voice_over_pair(&artist, &title) {
        return Reconciled {
            current: socket_pick,
            status_voice_over: true,
        };
    }

    let current = match socket_pick {
        Some(mut track) if track.matches(&artist, &title) => {
            track.source = TrackSource::Validated;
            track
        }
        _ => sections
            .values()
            .filter(|section| !section_is_voice_over(section))
            .map(|section| TrackMetadata::from_section(section, TrackSource::Validated))
            .find(|track| track.matches(&artist, &title))
            .unwrap_or_else(|| TrackMetadata::new(&artist, &title, TrackSource::StreamStatus)),
    };

    Reconciled {
        current: Some(current),
        status_voice_over: false,
    }
}

/// Parse the queue command's response into upcoming tracks.
///
/// Sectioned responses are read like the metadata command. Otherwise each
/// line is a request path, optionally prefixed by a `[status]` tag.
pub fn parse_queue<S: AsRef<str>>(lines: &[S]) -> Vec<TrackMetadata> {
    let sectioned = lines
        .iter()
        .any(|line| parse_section_header(line.as_ref()).is_some());

    if sectioned {
        return parse_sections(lines)
            .values()
            .filter(|section| !section.is_empty())
            .map(|section| {
                let source = if section_is_voice_over(section) {
                    TrackSource::VoiceOver
                } else {
                    TrackSource::ControlSocket
                };
                TrackMetadata::from_section(section, source)
            })
            .collect();
    }

    lines
        .iter()
        .filter_map(|line| {
            let line = line.as_ref().trim();
            let path = match line.strip_prefix('[') {
                Some(rest) => rest.split_once(']').map(|(_, path)| path.trim())?,
                None => line,
            };
            if path.is_empty() {
                None
            } else {
                Some(TrackMetadata::from_path(path, TrackSource::ControlSocket))
            }
        })
        .collect()
}

/// Assigns `started_at` and reports when the current track changes.
#[derive(Debug, Default)]
pub struct TrackChangeDetector {
    last_key: Option<TrackKey>,
    started_at: i64,
}

impl TrackChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation of `track` at `now_ms`.
    ///
    /// Sets `track.started_at` to the time the current key was first seen and
    /// returns true if the key differs from the previous observation.
    pub fn observe(&mut self, track: &mut TrackMetadata, now_ms: i64) -> bool {
        let key = track.key();
        let changed = self.last_key.as_ref() != Some(&key);
        if changed {
            self.last_key = Some(key);
            self.started_at = now_ms;
        }
        track.started_at = self.started_at;
        changed
    }
}

/// Current time as Unix epoch milliseconds.
pub fn current_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_sections;
    use proptest::prelude::*;

    fn sections(text: &str) -> BTreeMap<u32, Section> {
        let lines: Vec<&str> = text.lines().collect();
        parse_sections(&lines)
    }

    #[test]
    fn test_missing_fields_default_to_unknown() {
        let track = TrackMetadata::from_section(&Section::new(), TrackSource::ControlSocket);
        assert_eq!(track.title, UNKNOWN);
        assert_eq!(track.artist, UNKNOWN);
        let track = TrackMetadata::new("  ", "", TrackSource::StreamStatus);
        assert_eq!(track.artist, UNKNOWN);
        assert_eq!(track.title, UNKNOWN);
    }

    #[test]
    fn test_select_current_skips_voice_over_from_the_top() {
        let parsed = sections(
            "--- 1 ---\ntitle=\"Song A\"\nartist=\"Artist A\"\n\
             --- 2 ---\ntitle=\"Song B\"\nartist=\"Artist B\"\n\
             --- 3 ---\ntitle=\"DJ Intro\"\nartist=\"AI DJ\"",
        );
        assert_eq!(
            select_current_section(&parsed),
            Some(CurrentSection {
                number: 2,
                voice_over: false
            })
        );
    }

    #[test]
    fn test_select_current_falls_back_to_lowest_section() {
        let parsed = sections(
            "--- 0 ---\ntitle=\"DJ Intro\"\nartist=\"AI DJ\"\n\
             --- 4 ---\ntitle=\"DJ Intro\"\nartist=\"AI DJ\"",
        );
        assert_eq!(
            select_current_section(&parsed),
            Some(CurrentSection {
                number: 0,
                voice_over: true
            })
        );
        assert_eq!(select_current_section(&BTreeMap::new()), None);
    }

    #[test]
    fn test_reconcile_validates_agreeing_sources() {
        let parsed = sections("--- 1 ---\ntitle=\"Song A\"\nartist=\"Artist A\"");
        let result = reconcile(&parsed, Some("Artist A - Song A"));
        let current = result.current.unwrap();
        assert_eq!(current.title, "Song A");
        assert_eq!(current.artist, "Artist A");
        assert_eq!(current.source, TrackSource::Validated);
        assert!(!result.status_voice_over);
    }

    #[test]
    fn test_reconcile_comparison_ignores_case() {
        let parsed = sections("--- 1 ---\ntitle=\"Karma Police\"\nartist=\"Radiohead\"");
        let current = reconcile(&parsed, Some("RADIOHEAD - karma police"))
            .current
            .unwrap();
        assert_eq!(current.title, "Karma Police");
        assert_eq!(current.source, TrackSource::Validated);
    }

    #[test]
    fn test_reconcile_prefers_status_and_borrows_matching_section() {
        let parsed = sections(
            "--- 1 ---\ntitle=\"Song A\"\nartist=\"Artist A\"\nalbum=\"First\"\n\
             --- 2 ---\ntitle=\"Song B\"\nartist=\"Artist B\"\nalbum=\"Second\"",
        );
        // Socket pick is section 2, but the stream is actually airing Song A.
        let current = reconcile(&parsed, Some("Artist A - Song A")).current.unwrap();
        assert_eq!(current.title, "Song A");
        assert_eq!(current.album, "First");
        assert_eq!(current.source, TrackSource::Validated);
    }

    #[test]
    fn test_reconcile_synthesizes_from_status_when_nothing_matches() {
        let parsed = sections("--- 1 ---\ntitle=\"Song A\"\nartist=\"Artist A\"");
        let current = reconcile(&parsed, Some("Someone Else - Other Song"))
            .current
            .unwrap();
        assert_eq!(current.artist, "Someone Else");
        assert_eq!(current.title, "Other Song");
        assert_eq!(current.album, "");
        assert_eq!(current.source, TrackSource::StreamStatus);
    }

    #[test]
    fn test_reconcile_without_status_keeps_socket_pick() {
        let parsed = sections("--- 1 ---\ntitle=\"Song A\"\nartist=\"Artist A\"");
        let result = reconcile(&parsed, None);
        assert_eq!(result.current.unwrap().source, TrackSource::ControlSocket);

        let result = reconcile(&BTreeMap::new(), None);
        assert_eq!(result.current, None);
    }

    #[test]
    fn test_voice_over_status_over_real_song_is_stuck() {
        let parsed = sections("--- 1 ---\ntitle=\"Song A\"\nartist=\"Artist A\"");
        let result = reconcile(&parsed, Some("AI DJ - DJ Intro"));
        assert!(result.status_voice_over);
        assert!(result.voice_over_stuck());
        assert_eq!(result.current.unwrap().title, "Song A");

        // Engine also on the voice-over: not stuck, it is just airing.
        let parsed = sections("--- 1 ---\ntitle=\"DJ Intro\"\nartist=\"AI DJ\"");
        let result = reconcile(&parsed, Some("AI DJ - DJ Intro"));
        assert!(!result.voice_over_stuck());
    }

    #[test]
    fn test_normalize_filename_strips_scheme() {
        assert_eq!(normalize_filename("/music/a.mp3"), "/music/a.mp3");
        assert_eq!(
            normalize_filename("file:///music/Artist%20A%20-%20Song.mp3"),
            "/music/Artist A - Song.mp3"
        );
        assert_eq!(
            normalize_filename("http://host/stream/a.mp3"),
            "host/stream/a.mp3"
        );
        // Not a scheme: left untouched.
        assert_eq!(normalize_filename("/odd/dir ://x"), "/odd/dir ://x");
    }

    #[test]
    fn test_artwork_url_encodes_filename() {
        assert_eq!(
            artwork_url("/artwork", "/music/A & B - Song.mp3"),
            Some("/artwork?file=%2Fmusic%2FA+%26+B+-+Song.mp3".to_string())
        );
        assert_eq!(artwork_url("/artwork", ""), None);
    }

    #[test]
    fn test_split_and_stem() {
        assert_eq!(
            split_artist_title("Artist A - Song - Live"),
            ("Artist A".to_string(), "Song - Live".to_string())
        );
        assert_eq!(
            split_artist_title("Just A Title"),
            (UNKNOWN.to_string(), "Just A Title".to_string())
        );
        assert_eq!(
            stem_artist_title("/music/Radiohead - Lucky.flac"),
            ("Radiohead".to_string(), "Lucky".to_string())
        );
    }

    #[test]
    fn test_parse_queue_plain_lines_with_status_prefix() {
        let queue = parse_queue(&[
            "[ready] /music/Artist B - Song B.mp3",
            "/music/Artist C - Song C.mp3",
            "[playing]",
            "",
        ]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].artist, "Artist B");
        assert_eq!(queue[0].title, "Song B");
        assert_eq!(queue[0].filename, "/music/Artist B - Song B.mp3");
        assert_eq!(queue[1].title, "Song C");
    }

    #[test]
    fn test_parse_queue_sectioned() {
        let queue = parse_queue(&[
            "--- 1 ---",
            "title=\"Next\"",
            "artist=\"Band\"",
            "duration=\"200.5\"",
            "--- 2 ---",
            "title=\"DJ Intro\"",
            "artist=\"AI DJ\"",
        ]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].duration_secs, Some(200.5));
        assert_eq!(queue[1].source, TrackSource::VoiceOver);
    }

    #[test]
    fn test_track_source_serializes_snake_case() {
        let json = serde_json::to_string(&TrackSource::StreamStatus).unwrap();
        assert_eq!(json, "\"stream_status\"");
    }

    fn key_strategy() -> impl Strategy<Value = (u8, u8, u8)> {
        (0u8..2, 0u8..2, 0u8..2)
    }

    // started_at moves exactly when the (artist, title, filename) key differs
    // from the previous observation, and is stable otherwise.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_started_at_changes_iff_key_changes(
            keys in prop::collection::vec(key_strategy(), 1..30)
        ) {
            let mut detector = TrackChangeDetector::new();
            let mut previous: Option<(u8, u8, u8)> = None;
            let mut previous_started = 0i64;

            for (i, (a, t, f)) in keys.iter().copied().enumerate() {
                let now = 1_000 + i as i64 * 3_000;
                let mut track = TrackMetadata::new(
                    &format!("artist{}", a),
                    &format!("title{}", t),
                    TrackSource::ControlSocket,
                );
                track.filename = format!("/music/{}.mp3", f);

                let changed = detector.observe(&mut track, now);
                let expected_change = previous != Some((a, t, f));
                prop_assert_eq!(changed, expected_change);
                if expected_change {
                    prop_assert_eq!(track.started_at, now);
                } else {
                    prop_assert_eq!(track.started_at, previous_started);
                }

                previous = Some((a, t, f));
                previous_started = track.started_at;
            }
        }
    }
}
