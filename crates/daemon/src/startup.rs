//! Startup checks for the task daemon
//!
//! Preflight checks run before any task is recovered or started:
//! - the encoder answers `-version` (its version is parsed and logged)
//! - the fetch tool can be spawned

use crate::config::Config;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("Fetch tool not available: {0}")]
    FetchToolUnavailable(String),
}

/// Parse the encoder's `-version` output and extract the major version number
///
/// Handles both release (`ffmpeg version 7.1 ...`) and git builds
/// (`ffmpeg version n8.0-12-gabcdef ...`).
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version = version_string(version_output)?;
    let version = version.trim_start_matches('n');
    version.split(|c| c == '.' || c == '-').next()?.parse().ok()
}

/// The raw version token following `ffmpeg version`.
pub fn version_string(version_output: &str) -> Option<String> {
    let line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?
        .to_lowercase();

    line.split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()
        .map(str::to_string)
}

/// Verify the encoder runs and log which version it is.
///
/// Returns the major version when it could be parsed. An unparseable version
/// line is logged but tolerated, since builds label themselves inconsistently.
pub fn check_encoder_available(encoder: &Path) -> Result<Option<u32>, StartupError> {
    let output = Command::new(encoder)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            StartupError::EncoderUnavailable(format!(
                "{} -version failed; is it installed and in PATH? Error: {}",
                encoder.display(),
                e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} -version exited with {}",
            encoder.display(),
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    match version_string(&stdout) {
        Some(version) => {
            info!(encoder = %encoder.display(), %version, "Encoder available");
        }
        None => warn!(
            encoder = %encoder.display(),
            first_line = stdout.lines().next().unwrap_or("(empty)"),
            "Could not parse encoder version"
        ),
    }
    Ok(parse_ffmpeg_version(&stdout))
}

/// Verify the fetch tool can be spawned.
///
/// Only a spawn failure counts; the tool's `--help` exit code varies.
pub fn check_fetch_tool(fetch_tool: &Path) -> Result<(), StartupError> {
    let status = Command::new(fetch_tool)
        .arg("--help")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| {
            StartupError::FetchToolUnavailable(format!(
                "failed to run {}: {}",
                fetch_tool.display(),
                e
            ))
        })?;

    info!(tool = %fetch_tool.display(), %status, "Fetch tool available");
    Ok(())
}

/// Run all startup checks in order
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_encoder_available(&cfg.tools.encoder)?;
    check_fetch_tool(&cfg.tools.fetch)?;
    Ok(())
}
