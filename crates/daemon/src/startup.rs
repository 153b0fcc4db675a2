//! Startup checks for the OnAir daemon
//!
//! Preflight checks run before any background task is spawned:
//! - The cache directory exists and is writable
//! - The intro synthesizer runs, when intro generation is enabled
//! - The control socket answers a probe command (warning only)

use crate::config::Config;
use crate::protocol::{encode_batch, is_sentinel};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Cache directory {path} is not writable: {reason}")]
    CacheDirUnwritable { path: String, reason: String },

    #[error("Intro command not available: {0}")]
    IntroCommandUnavailable(String),

    #[error("Control socket unreachable: {0}")]
    ControlUnreachable(String),
}

/// Create `dir` if needed and prove a file can be written and removed in it.
pub fn check_dir_writable(dir: &Path) -> Result<(), StartupError> {
    let unwritable = |reason: String| StartupError::CacheDirUnwritable {
        path: dir.display().to_string(),
        reason,
    };

    fs::create_dir_all(dir).map_err(|e| unwritable(e.to_string()))?;
    let probe = dir.join(format!(".onair-probe-{}", std::process::id()));
    fs::write(&probe, b"ok").map_err(|e| unwritable(e.to_string()))?;
    fs::remove_file(&probe).map_err(|e| unwritable(e.to_string()))?;
    Ok(())
}

/// Check the intro synthesizer by running `<program> --version`
///
/// Any exit status counts as available; only a spawn failure is fatal,
/// since small TTS wrappers often reject unknown flags.
pub fn check_intro_command_available(program: &str) -> Result<(), StartupError> {
    Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|_| ())
        .map_err(|e| {
            StartupError::IntroCommandUnavailable(format!(
                "{} --version failed; is it installed and in PATH? Error: {}",
                program, e
            ))
        })
}

/// Run a one-shot probe session against the control socket
///
/// Connects, sends `probe` followed by the disconnect directive and waits for
/// one complete response.
pub fn check_control_reachable(
    address: &str,
    probe: &str,
    timeout: Duration,
) -> Result<(), StartupError> {
    let unreachable = |detail: String| StartupError::ControlUnreachable(detail);
    let addrs = address
        .to_socket_addrs()
        .map_err(|e| unreachable(format!("{}: {}", address, e)))?;

    let mut last_error = format!("{}: no addresses resolved", address);
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return probe_session(stream, probe, timeout).map_err(unreachable),
            Err(e) => last_error = format!("{}: {}", addr, e),
        }
    }
    Err(unreachable(last_error))
}

fn probe_session(mut stream: TcpStream, probe: &str, timeout: Duration) -> Result<(), String> {
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|_| stream.set_write_timeout(Some(timeout)))
        .and_then(|_| stream.write_all(&encode_batch(&[probe])))
        .map_err(|e| format!("probe not sent: {}", e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return Err(format!("connection closed before `{}` answered", probe)),
            Ok(_) if is_sentinel(&line) => return Ok(()),
            Ok(_) => continue,
            Err(e) => return Err(format!("no answer to `{}`: {}", probe, e)),
        }
    }
}

/// Run all startup checks in order
///
/// 1. Cache directory writable
/// 2. Intro output directory writable and synthesizer present (if enabled)
/// 3. Control socket answers a probe
///
/// The playout engine may come up after the daemon, so an unreachable
/// control socket is logged and tolerated; the pool's circuit breaker
/// handles it from there.
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    // Step 1: Cache directory
    check_dir_writable(&cfg.cache.dir)?;

    // Step 2: Intro generation prerequisites
    if cfg.intro.enabled {
        check_dir_writable(&cfg.intro.output_dir)?;
        check_intro_command_available(&cfg.intro.command)?;
    }

    // Step 3: Control socket
    match check_control_reachable(
        &cfg.control.address(),
        &cfg.control.probe_command,
        cfg.control.connect_timeout(),
    ) {
        Ok(()) => info!(address = %cfg.control.address(), "control socket reachable"),
        Err(e) => warn!(error = %e, "continuing without control socket"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dir_writable_creates_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("nested").join("cache");
        check_dir_writable(&dir).unwrap();
        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn test_dir_writable_rejects_file_path() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();

        let err = check_dir_writable(&file).unwrap_err();
        assert!(matches!(err, StartupError::CacheDirUnwritable { .. }));
    }

    #[test]
    fn test_missing_intro_command() {
        let err = check_intro_command_available("onair-no-such-program-xyz").unwrap_err();
        assert!(err.to_string().contains("onair-no-such-program-xyz"));
    }

    #[cfg(unix)]
    #[test]
    fn test_intro_command_nonzero_exit_still_available() {
        assert!(check_intro_command_available("false").is_ok());
    }

    /// Answers `uptime` once, then closes on the disconnect directive.
    fn one_shot_server(reply: &'static str) -> (String, std::thread::JoinHandle<Vec<String>>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut received = Vec::new();
            for line in BufReader::new(stream).lines() {
                let line = line.unwrap();
                if line == "quit" {
                    received.push(line);
                    break;
                }
                writer.write_all(reply.as_bytes()).unwrap();
                received.push(line);
            }
            received
        });
        (address, handle)
    }

    #[test]
    fn test_control_one_shot_session() {
        let (address, server) = one_shot_server("0d 00h 10m 00s\nEND\n");
        assert!(check_control_reachable(&address, "uptime", Duration::from_secs(2)).is_ok());
        assert_eq!(server.join().unwrap(), vec!["uptime", "quit"]);
    }

    #[test]
    fn test_control_reply_without_sentinel_fails() {
        let (address, server) = one_shot_server("half a reply\n");
        let err = check_control_reachable(&address, "uptime", Duration::from_secs(2)).unwrap_err();
        assert!(err.to_string().contains("closed before"));
        server.join().unwrap();
    }

    #[test]
    fn test_control_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(check_control_reachable(&address, "uptime", Duration::from_millis(500)).is_err());
    }

    #[test]
    fn test_startup_tolerates_unreachable_control() {
        let tmp = TempDir::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut cfg = Config::default();
        cfg.cache.dir = tmp.path().join("cache");
        cfg.control.host = "127.0.0.1".to_string();
        cfg.control.port = port;
        cfg.control.connect_timeout_ms = 200;

        assert!(run_startup_checks(&cfg).is_ok());
    }

    #[test]
    fn test_startup_fails_when_intro_program_missing() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.cache.dir = tmp.path().join("cache");
        cfg.intro.enabled = true;
        cfg.intro.output_dir = tmp.path().join("intros");
        cfg.intro.command = "onair-no-such-program-xyz".to_string();

        let err = run_startup_checks(&cfg).unwrap_err();
        assert!(matches!(err, StartupError::IntroCommandUnavailable(_)));
    }
}
