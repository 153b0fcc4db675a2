//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but cannot be used
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Control socket of the playout engine and the commands sent to it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlConfig {
    #[serde(default = "default_control_host")]
    pub host: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-command read timeout in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// How long to wait for banner bytes after connecting
    #[serde(default = "default_greeting_timeout_ms")]
    pub greeting_timeout_ms: u64,
    /// Sectioned metadata query for the main output
    #[serde(default = "default_metadata_command")]
    pub metadata_command: String,
    /// Upcoming-queue query
    #[serde(default = "default_queue_command")]
    pub queue_command: String,
    /// Skips the current track on the main output
    #[serde(default = "default_skip_command")]
    pub skip_command: String,
    /// Flushes a voice-over that is stuck on air
    #[serde(default = "default_voiceover_skip_command")]
    pub voiceover_skip_command: String,
    /// Lightweight round-trip used for connection health checks
    #[serde(default = "default_probe_command")]
    pub probe_command: String,
}

fn default_control_host() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    1234
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    5000
}

fn default_greeting_timeout_ms() -> u64 {
    150
}

fn default_metadata_command() -> String {
    "radio.metadata".to_string()
}

fn default_queue_command() -> String {
    "radio.queue".to_string()
}

fn default_skip_command() -> String {
    "radio.skip".to_string()
}

fn default_voiceover_skip_command() -> String {
    "dj_queue.skip".to_string()
}

fn default_probe_command() -> String {
    "uptime".to_string()
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: default_control_host(),
            port: default_control_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            greeting_timeout_ms: default_greeting_timeout_ms(),
            metadata_command: default_metadata_command(),
            queue_command: default_queue_command(),
            skip_command: default_skip_command(),
            voiceover_skip_command: default_voiceover_skip_command(),
            probe_command: default_probe_command(),
        }
    }
}

impl ControlConfig {
    /// `host:port` of the control socket
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn greeting_timeout(&self) -> Duration {
        Duration::from_millis(self.greeting_timeout_ms)
    }
}

/// Connection pool limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Maximum simultaneously open control connections (default 2)
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long `acquire` waits for a free slot (default 30s)
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Minimum spacing between granted acquisitions, any caller (default 250ms)
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Consecutive connect failures before the circuit opens (default 3)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing one trial connection
    #[serde(default = "default_circuit_cooldown_secs")]
    pub circuit_cooldown_secs: u64,
}

fn default_max_connections() -> u32 {
    2
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_min_interval_ms() -> u64 {
    250
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_circuit_cooldown_secs() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            min_interval_ms: default_min_interval_ms(),
            failure_threshold: default_failure_threshold(),
            circuit_cooldown_secs: default_circuit_cooldown_secs(),
        }
    }
}

/// Snapshot cache written by the metadata daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Directory holding every JSON artifact (snapshots, history, intro cache)
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Polling period of the metadata daemon (default 3s)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// The upcoming queue is refreshed every Nth cycle (default 5)
    #[serde(default = "default_queue_every")]
    pub queue_every: u32,
    /// Snapshots older than this are reported as stale (default 30s)
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Prefix for artwork URLs derived from track filenames
    #[serde(default = "default_artwork_base_url")]
    pub artwork_base_url: String,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/onair")
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_queue_every() -> u32 {
    5
}

fn default_stale_after_secs() -> u64 {
    30
}

fn default_artwork_base_url() -> String {
    "/artwork".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            poll_interval_secs: default_poll_interval_secs(),
            queue_every: default_queue_every(),
            stale_after_secs: default_stale_after_secs(),
            artwork_base_url: default_artwork_base_url(),
        }
    }
}

/// Public stream-status endpoint used as a second source of truth
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamStatusConfig {
    /// Icecast-style `status-json.xsl` URL; `None` disables reconciliation
    #[serde(default = "default_stream_status_url")]
    pub url: Option<String>,
    /// Mount point to pick when the server lists several sources
    #[serde(default)]
    pub mount: Option<String>,
    #[serde(default = "default_stream_status_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_stream_status_url() -> Option<String> {
    Some("http://127.0.0.1:8000/status-json.xsl".to_string())
}

fn default_stream_status_timeout_ms() -> u64 {
    2000
}

impl Default for StreamStatusConfig {
    fn default() -> Self {
        Self {
            url: default_stream_status_url(),
            mount: None,
            timeout_ms: default_stream_status_timeout_ms(),
        }
    }
}

/// Play history retention and dedup windows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_song_dedup_secs")]
    pub song_dedup_secs: u64,
    #[serde(default = "default_dj_dedup_secs")]
    pub dj_dedup_secs: u64,
    /// How often the tracker re-reads the now-playing snapshot
    #[serde(default = "default_history_poll_secs")]
    pub poll_interval_secs: u64,
}

fn default_max_entries() -> usize {
    100
}

fn default_song_dedup_secs() -> u64 {
    60
}

fn default_dj_dedup_secs() -> u64 {
    5
}

fn default_history_poll_secs() -> u64 {
    5
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            song_dedup_secs: default_song_dedup_secs(),
            dj_dedup_secs: default_dj_dedup_secs(),
            poll_interval_secs: default_history_poll_secs(),
        }
    }
}

/// DJ intro generation trigger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntroConfig {
    /// Intro generation is opt-in (default false)
    #[serde(default)]
    pub enabled: bool,
    /// External text-to-speech program
    #[serde(default = "default_intro_command")]
    pub command: String,
    /// Where synthesized clips are written
    #[serde(default = "default_intro_output_dir")]
    pub output_dir: PathBuf,
    /// Cached intros are reused for this long (default 24h)
    #[serde(default = "default_validity_secs")]
    pub validity_secs: u64,
    /// Minimum spacing between generation attempts (default 60s)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Current track must have at least this much left (default 90s)
    #[serde(default = "default_min_remaining_secs")]
    pub min_remaining_secs: u64,
    /// Track length assumed when the control socket reports none
    #[serde(default = "default_assumed_track_secs")]
    pub assumed_track_secs: u64,
    /// Upper bound on one synthesis run (default 300s)
    #[serde(default = "default_intro_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_intro_poll_secs")]
    pub poll_interval_secs: u64,
    /// Pushes a file onto the voice-over queue
    #[serde(default = "default_push_command")]
    pub push_command: String,
}

fn default_intro_command() -> String {
    "onair-tts".to_string()
}

fn default_intro_output_dir() -> PathBuf {
    PathBuf::from("/var/lib/onair/intros")
}

fn default_validity_secs() -> u64 {
    86_400
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_min_remaining_secs() -> u64 {
    90
}

fn default_assumed_track_secs() -> u64 {
    210
}

fn default_intro_timeout_secs() -> u64 {
    300
}

fn default_intro_poll_secs() -> u64 {
    10
}

fn default_push_command() -> String {
    "dj_queue.push".to_string()
}

impl Default for IntroConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_intro_command(),
            output_dir: default_intro_output_dir(),
            validity_secs: default_validity_secs(),
            cooldown_secs: default_cooldown_secs(),
            min_remaining_secs: default_min_remaining_secs(),
            assumed_track_secs: default_assumed_track_secs(),
            timeout_secs: default_intro_timeout_secs(),
            poll_interval_secs: default_intro_poll_secs(),
            push_command: default_push_command(),
        }
    }
}

/// HTTP API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Minimum spacing between listener-triggered skips
    #[serde(default = "default_skip_min_interval_secs")]
    pub skip_min_interval_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_skip_min_interval_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            skip_min_interval_secs: default_skip_min_interval_secs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub stream_status: StreamStatusConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub intro: IntroConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ONAIR_CONTROL_HOST -> control.host
    /// - ONAIR_CONTROL_PORT -> control.port
    /// - ONAIR_POOL_MAX_CONNECTIONS -> pool.max_connections
    /// - ONAIR_POOL_MIN_INTERVAL_MS -> pool.min_interval_ms
    /// - ONAIR_CACHE_DIR -> cache.dir
    /// - ONAIR_STREAM_STATUS_URL -> stream_status.url (empty string disables it)
    /// - ONAIR_INTRO_ENABLED -> intro.enabled
    /// - ONAIR_SERVER_BIND -> server.bind
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("ONAIR_CONTROL_HOST") {
            if !val.trim().is_empty() {
                self.control.host = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("ONAIR_CONTROL_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.control.port = port;
            }
        }

        if let Ok(val) = env::var("ONAIR_POOL_MAX_CONNECTIONS") {
            if let Ok(max) = val.parse::<u32>() {
                self.pool.max_connections = max;
            }
        }

        if let Ok(val) = env::var("ONAIR_POOL_MIN_INTERVAL_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.pool.min_interval_ms = ms;
            }
        }

        if let Ok(val) = env::var("ONAIR_CACHE_DIR") {
            if !val.trim().is_empty() {
                self.cache.dir = PathBuf::from(val.trim());
            }
        }

        if let Ok(val) = env::var("ONAIR_STREAM_STATUS_URL") {
            let val = val.trim();
            self.stream_status.url = if val.is_empty() {
                None
            } else {
                Some(val.to_string())
            };
        }

        if let Ok(val) = env::var("ONAIR_INTRO_ENABLED") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.intro.enabled = true,
                "false" | "0" | "no" => self.intro.enabled = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("ONAIR_SERVER_BIND") {
            if !val.trim().is_empty() {
                self.server.bind = val.trim().to_string();
            }
        }
    }

    /// Reject values the daemon cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_connections must be at least 1".to_string(),
            ));
        }
        if self.cache.queue_every == 0 {
            return Err(ConfigError::Invalid(
                "cache.queue_every must be at least 1".to_string(),
            ));
        }
        if self.cache.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.history.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "history.max_entries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration back to TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("ONAIR_CONTROL_HOST");
        env::remove_var("ONAIR_CONTROL_PORT");
        env::remove_var("ONAIR_POOL_MAX_CONNECTIONS");
        env::remove_var("ONAIR_POOL_MIN_INTERVAL_MS");
        env::remove_var("ONAIR_CACHE_DIR");
        env::remove_var("ONAIR_STREAM_STATUS_URL");
        env::remove_var("ONAIR_INTRO_ENABLED");
        env::remove_var("ONAIR_SERVER_BIND");
    }

    // Any TOML document that sets the pool, cache and intro tunables parses
    // back into exactly those values.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            port in 1u16..=u16::MAX,
            max_connections in 1u32..32,
            min_interval_ms in 0u64..10_000,
            poll_interval_secs in 1u64..60,
            queue_every in 1u32..20,
            song_dedup_secs in 0u64..600,
            intro_enabled in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[control]
port = {}

[pool]
max_connections = {}
min_interval_ms = {}

[cache]
poll_interval_secs = {}
queue_every = {}

[history]
song_dedup_secs = {}

[intro]
enabled = {}
"#,
                port,
                max_connections,
                min_interval_ms,
                poll_interval_secs,
                queue_every,
                song_dedup_secs,
                intro_enabled
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.control.port, port);
            prop_assert_eq!(config.pool.max_connections, max_connections);
            prop_assert_eq!(config.pool.min_interval_ms, min_interval_ms);
            prop_assert_eq!(config.cache.poll_interval_secs, poll_interval_secs);
            prop_assert_eq!(config.cache.queue_every, queue_every);
            prop_assert_eq!(config.history.song_dedup_secs, song_dedup_secs);
            prop_assert_eq!(config.intro.enabled, intro_enabled);
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_env_overrides_control_port(
            initial_port in 1u16..10_000,
            override_port in 1u16..=u16::MAX,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[control]\nport = {}\n", initial_port);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("ONAIR_CONTROL_PORT", override_port.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.control.port, override_port);
        }

        #[test]
        fn prop_env_overrides_pool_limits(
            override_max in 1u32..64,
            override_interval in 0u64..5_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::default();

            env::set_var("ONAIR_POOL_MAX_CONNECTIONS", override_max.to_string());
            env::set_var("ONAIR_POOL_MIN_INTERVAL_MS", override_interval.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.pool.max_connections, override_max);
            prop_assert_eq!(config.pool.min_interval_ms, override_interval);
        }

        #[test]
        fn prop_env_overrides_intro_enabled(
            initial in proptest::bool::ANY,
            override_enabled in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[intro]\nenabled = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("ONAIR_INTRO_ENABLED", override_enabled.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.intro.enabled, override_enabled);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.control.address(), "127.0.0.1:1234");
        assert_eq!(config.control.metadata_command, "radio.metadata");
        assert_eq!(config.pool.max_connections, 2);
        assert_eq!(config.pool.acquire_timeout_secs, 30);
        assert_eq!(config.pool.failure_threshold, 3);
        assert_eq!(config.cache.poll_interval_secs, 3);
        assert_eq!(config.cache.queue_every, 5);
        assert_eq!(config.cache.stale_after_secs, 30);
        assert_eq!(config.history.song_dedup_secs, 60);
        assert_eq!(config.history.dj_dedup_secs, 5);
        assert_eq!(config.intro.validity_secs, 86_400);
        assert_eq!(config.intro.cooldown_secs, 60);
        assert_eq!(config.intro.min_remaining_secs, 90);
        assert!(!config.intro.enabled);
        assert_eq!(config.server.bind, "127.0.0.1:7878");
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[control]
host = "playout.local"

[stream_status]
mount = "/live"
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.control.host, "playout.local");
        assert_eq!(config.control.port, 1234); // default
        assert_eq!(config.stream_status.mount.as_deref(), Some("/live"));
        assert!(config.stream_status.url.is_some()); // default
        assert_eq!(config.pool.min_interval_ms, 250); // default
    }

    #[test]
    fn test_empty_stream_status_url_env_disables_reconciliation() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("ONAIR_STREAM_STATUS_URL", "");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.stream_status.url, None);
    }

    #[test]
    fn test_invalid_env_bool_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        config.intro.enabled = true;
        env::set_var("ONAIR_INTRO_ENABLED", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(config.intro.enabled);
    }

    #[test]
    fn test_validate_rejects_zero_connections() {
        let config = Config::parse_toml("[pool]\nmax_connections = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let config = Config::default();
        let rendered = config.to_toml_string().unwrap();
        let parsed = Config::parse_toml(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
