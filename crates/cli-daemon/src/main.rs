//! CLI entry point for the task daemon
//!
//! Parses command line arguments, sets up logging and starts the daemon.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use taskd::{Config, Daemon};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Task daemon - queued downloads and transcodes driven by external tools
#[derive(Parser, Debug)]
#[command(name = "taskd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; a missing file means defaults
    #[arg(short, long, default_value = "taskd.toml")]
    config: PathBuf,

    /// Skip startup checks (encoder and fetch tool). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!(config = %args.config.display(), "Task daemon starting");

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    let base_dir = args
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    config.resolve_paths(base_dir);

    let daemon = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Ok(Daemon::new_without_checks(config))
    } else {
        Daemon::new(config)
    };

    match daemon {
        Ok(daemon) => {
            info!(
                state_dir = %daemon.config.paths.state_dir.display(),
                fetch = %daemon.config.tools.fetch.display(),
                encoder = %daemon.config.tools.encoder.display(),
                "Daemon initialized"
            );

            if let Err(e) = Arc::new(daemon).run_with_server().await {
                error!(error = %e, "Daemon error");
                return ExitCode::FAILURE;
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize daemon");
            ExitCode::FAILURE
        }
    }
}
