//! Status lines of the peer-to-peer fetch tool.
//!
//! The tool periodically prints a line such as
//! `1m2.5s: 1 torrents, 1 infos, 12.3 MB/1.5 GB ready, upload 0 B, download 512 KB/s`.

use super::size::parse_size;
use super::{format_eta, is_error_line, ProgressMeter, ProgressUpdate, StreamKind, Transfer};
use regex::Regex;
use std::sync::OnceLock;
use tracing::trace;

static STATUS_RE: OnceLock<Regex> = OnceLock::new();

fn status_regex() -> &'static Regex {
    STATUS_RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?:(\d+)m)?(\d+(?:\.\d+)?)s: (\d+) torrents, (\d+) infos, ",
            r"(\d+(?:\.\d+)?\s*\w+)/(\d+(?:\.\d+)?\s*\w+) ready, ",
            r"upload (\d+(?:\.\d+)?\s*\w+), download (\d+(?:\.\d+)?\s*\w+)/s",
        ))
        .expect("valid regex")
    })
}

/// One parsed status line.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadSample {
    pub elapsed_secs: f64,
    pub torrents: u32,
    pub infos: u32,
    pub downloaded: u64,
    pub total: u64,
    pub uploaded: u64,
    /// Current download rate in bytes per second.
    pub rate: u64,
    /// Rate as printed by the tool, e.g. "512 KB/s".
    pub rate_text: String,
}

impl DownloadSample {
    /// Completion fraction; unknown until the tool knows the total size.
    pub fn fraction(&self) -> Option<f64> {
        if self.total > 0 {
            Some((self.downloaded as f64 / self.total as f64).min(1.0))
        } else {
            None
        }
    }

    /// Remaining time at the current rate.
    pub fn eta(&self) -> Option<String> {
        if self.total == 0 || self.rate == 0 {
            return None;
        }
        let remaining = self.total.saturating_sub(self.downloaded);
        Some(format_eta(remaining as f64 / self.rate as f64))
    }
}

/// Parse one status line; anything else yields `None`.
pub fn parse_download_line(line: &str) -> Option<DownloadSample> {
    let caps = status_regex().captures(line)?;

    let minutes: f64 = caps
        .get(1)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0.0);
    let seconds: f64 = caps[2].parse().ok()?;

    Some(DownloadSample {
        elapsed_secs: minutes * 60.0 + seconds,
        torrents: caps[3].parse().ok()?,
        infos: caps[4].parse().ok()?,
        downloaded: parse_size(&caps[5])?,
        total: parse_size(&caps[6])?,
        uploaded: parse_size(&caps[7])?,
        rate: parse_size(&caps[8])?,
        rate_text: format!("{}/s", caps[8].trim()),
    })
}

/// Meter for the download domain.
#[derive(Debug, Default)]
pub struct DownloadMeter {
    lines: u64,
}

impl DownloadMeter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressMeter for DownloadMeter {
    fn observe(&mut self, stream: StreamKind, line: &str) -> Option<ProgressUpdate> {
        self.lines += 1;

        if let Some(sample) = parse_download_line(line) {
            return Some(ProgressUpdate {
                progress: sample.fraction(),
                speed: Some(sample.rate_text.clone()),
                eta: sample.eta(),
                error: None,
                transfer: Some(Transfer {
                    done: sample.downloaded,
                    total: sample.total,
                    uploaded: sample.uploaded,
                    elapsed_secs: sample.elapsed_secs,
                    torrents: sample.torrents,
                    infos: sample.infos,
                }),
            });
        }

        if stream == StreamKind::Stderr && is_error_line(line) {
            return Some(ProgressUpdate::error(line));
        }

        trace!(%stream, line, "Ignoring fetch tool output");
        None
    }

    fn lines_observed(&self) -> u64 {
        self.lines
    }
}
