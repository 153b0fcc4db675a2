//! CLI entry point for the OnAir station daemon
//!
//! Parses command line arguments, sets up logging and starts the daemon.

use clap::Parser;
use onair::{Config, Daemon, DaemonError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// OnAir - control plane for an automated internet radio station
#[derive(Parser, Debug)]
#[command(name = "onair-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (cache dir, intro command, control socket). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Print the effective configuration (file + environment) and exit
    #[arg(long, default_value = "false")]
    print_config: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("onair=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_daemon(args: &Args) -> Result<Daemon, DaemonError> {
    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(Config::load(&args.config)?)
    } else {
        Daemon::new(&args.config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    if args.print_config {
        return match Config::load(&args.config).and_then(|config| config.to_toml_string()) {
            Ok(text) => {
                println!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "failed to load configuration");
                ExitCode::FAILURE
            }
        };
    }

    info!(config = %args.config.display(), "OnAir daemon starting");

    let daemon = match build_daemon(&args) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    info!(
        api = %daemon.config.server.bind,
        max_connections = daemon.config.pool.max_connections,
        intro = daemon.config.intro.enabled,
        "daemon initialized"
    );

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "daemon error");
            ExitCode::FAILURE
        }
    }
}
