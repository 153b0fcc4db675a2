//! OnAir Dashboard TUI
//!
//! Terminal "now playing" view for the station. Reads everything from the
//! daemon HTTP API (default http://127.0.0.1:7878, override with `ONAIR_API`)
//! and never touches the control socket itself.

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Gauge, Paragraph, Row, Table, Wrap},
    Frame, Terminal,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    io::{self, Stdout},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

const DEFAULT_API_URL: &str = "http://127.0.0.1:7878";
const POLL_INTERVAL_MS: u64 = 1000;
const HISTORY_LIMIT: usize = 20;
const MAX_EVENT_LOG_ENTRIES: usize = 100;

// ============================================================================
// Data Models (mirroring daemon API types)
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Track {
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NowPlaying {
    pub track: Track,
    pub stale: bool,
    pub cached_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpNext {
    #[serde(default)]
    pub upcoming: Vec<Track>,
    pub stale: bool,
    pub cached_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEntry {
    Song {
        time: i64,
        title: String,
        artist: String,
    },
    Dj {
        time: i64,
        text: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollMetrics {
    pub cycles: u64,
    pub failed: u64,
    pub consecutive_failures: u64,
    pub track_changes: u64,
    pub self_heals: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolStats {
    pub max_connections: usize,
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    pub circuit_open: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IntroStatus {
    pub state: String,
    pub target: Option<String>,
    pub generated: u64,
    pub reused: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub poll: PollMetrics,
    pub pool: PoolStats,
    pub history_entries: usize,
    pub skips_sent: u64,
    pub intro: IntroStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct SkipResponse {
    ok: bool,
    message: String,
}

// ============================================================================
// App State
// ============================================================================

/// Main application state for the TUI dashboard
pub struct App {
    base_url: String,
    pub now_playing: Option<NowPlaying>,
    pub up_next: Option<UpNext>,
    pub history: Vec<HistoryEntry>,
    pub metrics: Option<MetricsSnapshot>,
    pub event_log: VecDeque<String>,
    pub connected: bool,
    client: reqwest::Client,
}

impl App {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            now_playing: None,
            up_next: None,
            history: Vec::new(),
            metrics: None,
            event_log: VecDeque::with_capacity(MAX_EVENT_LOG_ENTRIES),
            connected: false,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Add an event to the log
    pub fn log_event(&mut self, event: String) {
        if self.event_log.len() >= MAX_EVENT_LOG_ENTRIES {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event);
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, String> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP error: {}", response.status()));
        }
        response.json::<T>().await.map_err(|e| format!("JSON parse error: {}", e))
    }

    /// Refresh every panel from the daemon API
    pub async fn refresh(&mut self) {
        let result = async {
            let now_playing: NowPlaying = self.get_json("/now-playing").await?;
            let up_next: UpNext = self.get_json("/up-next").await?;
            let history: Vec<HistoryEntry> = self
                .get_json(&format!("/history?limit={}", HISTORY_LIMIT))
                .await?;
            let metrics: MetricsSnapshot = self.get_json("/metrics").await?;
            Ok::<_, String>((now_playing, up_next, history, metrics))
        }
        .await;

        match result {
            Ok((now_playing, up_next, history, metrics)) => {
                if !self.connected {
                    self.log_event("Connected to daemon".to_string());
                }
                if let Some(previous) = &self.now_playing {
                    if previous.track.started_at != now_playing.track.started_at {
                        self.log_event(format!(
                            "Now playing: {} - {}",
                            now_playing.track.artist, now_playing.track.title
                        ));
                    }
                }
                self.now_playing = Some(now_playing);
                self.up_next = Some(up_next);
                self.history = history;
                self.metrics = Some(metrics);
                self.connected = true;
            }
            Err(e) => {
                if self.connected {
                    self.log_event(format!("Connection lost: {}", e));
                }
                self.connected = false;
            }
        }
    }

    /// Ask the daemon to skip the current track
    pub async fn skip(&mut self) {
        let message = match self
            .client
            .post(format!("{}/skip", self.base_url))
            .send()
            .await
        {
            Ok(response) => match response.json::<SkipResponse>().await {
                Ok(reply) if reply.ok => "Skip sent".to_string(),
                Ok(reply) => format!("Skip refused: {}", reply.message),
                Err(e) => format!("Skip failed: {}", e),
            },
            Err(e) => format!("Skip failed: {}", e),
        };
        self.log_event(message);
    }
}

// ============================================================================
// Terminal Setup/Teardown
// ============================================================================

/// Initialize the terminal for TUI rendering
fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restore terminal to normal state
fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

// ============================================================================
// Widget Rendering
// ============================================================================

/// Render the current track with an elapsed/length gauge
fn render_now_playing(f: &mut Frame, area: Rect, app: &App, now_ms: i64) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(4), Constraint::Length(3)])
        .split(area);

    let title = match (&app.now_playing, app.connected) {
        (_, false) => " Now Playing (Disconnected) ",
        (Some(np), true) if np.stale => " Now Playing (Stale) ",
        _ => " Now Playing ",
    };

    let lines = match &app.now_playing {
        Some(np) => vec![
            Line::from(Span::styled(
                np.track.title.clone(),
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            )),
            Line::from(np.track.artist.clone()),
            Line::from(Span::styled(
                format!("{}  [{}]", np.track.album, np.track.source),
                Style::default().fg(Color::Gray),
            )),
        ],
        None => vec![Line::from("Waiting for daemon...")],
    };
    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(title))
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, chunks[0]);

    let (ratio, label) = match app.now_playing.as_ref().map(|np| &np.track) {
        Some(track) if track.started_at > 0 => {
            let elapsed = ((now_ms - track.started_at).max(0) as f64) / 1000.0;
            match track.duration_secs {
                Some(total) if total > 0.0 => (
                    progress_ratio(elapsed, total),
                    format!("{} / {}", format_clock(elapsed), format_clock(total)),
                ),
                _ => (0.0, format_clock(elapsed)),
            }
        }
        _ => (0.0, "--:--".to_string()),
    };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" Progress "))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(ratio)
        .label(label);
    f.render_widget(gauge, chunks[1]);
}

/// Render the upcoming queue
fn render_up_next(f: &mut Frame, area: Rect, app: &App) {
    let header_cells = ["#", "Artist", "Title"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells).height(1).bottom_margin(1);

    let rows: Vec<Row> = app
        .up_next
        .as_ref()
        .map(|up| {
            up.upcoming
                .iter()
                .enumerate()
                .map(|(i, track)| {
                    Row::new(vec![
                        Cell::from(format!("{}", i + 1)),
                        Cell::from(track.artist.clone()),
                        Cell::from(track.title.clone()),
                    ])
                })
                .collect()
        })
        .unwrap_or_default();

    let widths = [
        Constraint::Length(3),
        Constraint::Percentage(40),
        Constraint::Percentage(55),
    ];
    let title = match &app.up_next {
        Some(up) if up.stale => " Up Next (Stale) ",
        _ => " Up Next ",
    };

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(table, area);
}

/// Render recent play history, newest first
fn render_history(f: &mut Frame, area: Rect, app: &App) {
    let lines: Vec<Line> = app
        .history
        .iter()
        .take(area.height.saturating_sub(2) as usize)
        .map(|entry| match entry {
            HistoryEntry::Song {
                time,
                title,
                artist,
            } => Line::from(format!("{}  {} - {}", format_time_of_day(*time), artist, title)),
            HistoryEntry::Dj { time, text } => Line::from(Span::styled(
                format!("{}  DJ: {}", format_time_of_day(*time), text),
                Style::default().fg(Color::Magenta),
            )),
        })
        .collect();

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(" History "))
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

/// Render event log
fn render_event_log(f: &mut Frame, area: Rect, app: &App) {
    let events: Vec<Line> = app
        .event_log
        .iter()
        .rev()
        .take(area.height.saturating_sub(2) as usize)
        .map(|e| Line::from(e.as_str()))
        .collect();

    let paragraph = Paragraph::new(events)
        .block(Block::default().borders(Borders::ALL).title(" Event Log "))
        .wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

/// Render status bar with pool and poll counters
fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let paragraph = Paragraph::new(status_line(app.metrics.as_ref()))
        .style(Style::default().fg(Color::White).bg(Color::DarkGray));
    f.render_widget(paragraph, area);
}

fn status_line(metrics: Option<&MetricsSnapshot>) -> String {
    match metrics {
        Some(m) => format!(
            " Pool: {}/{} in use{} | Polls: {} ({} failed) | Changes: {} | Heals: {} | Intro: {} | 's' skip, 'q' quit ",
            m.pool.in_use,
            m.pool.max_connections,
            if m.pool.circuit_open { " [CIRCUIT OPEN]" } else { "" },
            m.poll.cycles,
            m.poll.failed,
            m.poll.track_changes,
            m.poll.self_heals,
            if m.intro.state.is_empty() { "-" } else { m.intro.state.as_str() },
        ),
        None => " Connecting to daemon... | Press 'q' to quit ".to_string(),
    }
}

/// Fraction of the track played, clamped to [0, 1]
fn progress_ratio(elapsed_secs: f64, total_secs: f64) -> f64 {
    if total_secs <= 0.0 {
        return 0.0;
    }
    (elapsed_secs / total_secs).clamp(0.0, 1.0)
}

/// Format seconds as `m:ss`, or `h:mm:ss` past an hour
fn format_clock(secs: f64) -> String {
    let total_secs = secs.max(0.0) as u64;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

/// UTC `HH:MM` of an epoch-millisecond timestamp
fn format_time_of_day(ms: i64) -> String {
    let secs_of_day = ms.div_euclid(1000).rem_euclid(86_400);
    format!("{:02}:{:02}", secs_of_day / 3600, (secs_of_day % 3600) / 60)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Main UI Layout
// ============================================================================

/// Render the complete UI layout
fn ui(f: &mut Frame, app: &App) {
    let size = f.area();

    // Main layout: status bar at bottom, rest for content
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(size);

    // Content area: left (now playing + up next), right (history + events)
    let content_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(main_chunks[0]);

    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(9), Constraint::Min(0)])
        .split(content_chunks[0]);

    let right_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(65), Constraint::Percentage(35)])
        .split(content_chunks[1]);

    render_now_playing(f, left_chunks[0], app, now_ms());
    render_up_next(f, left_chunks[1], app);
    render_history(f, right_chunks[0], app);
    render_event_log(f, right_chunks[1], app);
    render_status_bar(f, main_chunks[1], app);
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> io::Result<()> {
    let base_url = std::env::var("ONAIR_API").unwrap_or_else(|_| DEFAULT_API_URL.to_string());

    // Initialize terminal
    let mut terminal = setup_terminal()?;

    let mut app = App::new(&base_url);
    app.log_event(format!("OnAir dashboard started ({})", base_url));

    let result = run_app(&mut terminal, &mut app).await;

    // Restore terminal
    restore_terminal(&mut terminal)?;

    result
}

/// Main application loop
async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
) -> io::Result<()> {
    let poll_interval = Duration::from_millis(POLL_INTERVAL_MS);
    let mut last_fetch: Option<Instant> = None;

    loop {
        if last_fetch.map_or(true, |t| t.elapsed() >= poll_interval) {
            app.refresh().await;
            last_fetch = Some(Instant::now());
        }

        terminal.draw(|f| ui(f, app))?;

        // Short timeout keeps the progress gauge moving
        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => {
                            return Ok(());
                        }
                        KeyCode::Char('s') => {
                            app.skip().await;
                            last_fetch = None;
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
