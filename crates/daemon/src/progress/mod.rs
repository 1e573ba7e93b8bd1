//! Progress extraction from child-process output.
//!
//! Each domain has a meter that turns one line of tool output into an
//! optional partial update. Lines matching no known grammar are dropped.

pub mod download;
pub mod size;
pub mod transcode;

pub use download::{parse_download_line, DownloadMeter, DownloadSample};
pub use size::parse_size;
pub use transcode::{parse_duration_line, parse_progress_line, ProgressKey, TranscodeMeter};

/// Which pipe of the child a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Transfer counters reported by the fetch tool.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Transfer {
    pub done: u64,
    pub total: u64,
    pub uploaded: u64,
    /// Time the tool has been running, in seconds.
    pub elapsed_secs: f64,
    pub torrents: u32,
    pub infos: u32,
}

/// Partial task update derived from one output line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressUpdate {
    /// New completion fraction, if the line moved it.
    pub progress: Option<f64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    /// Error text reported by the tool; does not change the status.
    pub error: Option<String>,
    pub transfer: Option<Transfer>,
}

impl ProgressUpdate {
    pub fn is_empty(&self) -> bool {
        self.progress.is_none()
            && self.speed.is_none()
            && self.eta.is_none()
            && self.error.is_none()
            && self.transfer.is_none()
    }

    fn error(line: &str) -> Self {
        Self {
            error: Some(line.trim().to_string()),
            ..Default::default()
        }
    }
}

/// Stateful per-task line interpreter.
pub trait ProgressMeter: Send {
    /// Feed one line; returns the update to persist, if any.
    fn observe(&mut self, stream: StreamKind, line: &str) -> Option<ProgressUpdate>;

    /// Number of non-empty lines seen so far.
    fn lines_observed(&self) -> u64;
}

/// Diagnostic lines the tools use for failures.
pub fn is_error_line(line: &str) -> bool {
    line.contains("Error") || line.contains("error")
}

/// Render a remaining-time estimate as `HH:MM:SS`.
pub fn format_eta(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.round() as u64
    } else {
        0
    };
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(0.0), "00:00:00");
        assert_eq!(format_eta(59.6), "00:01:00");
        assert_eq!(format_eta(3725.0), "01:02:05");
        assert_eq!(format_eta(100.0 * 3600.0), "100:00:00");
        assert_eq!(format_eta(f64::INFINITY), "00:00:00");
        assert_eq!(format_eta(-5.0), "00:00:00");
    }

    #[test]
    fn test_error_keyword() {
        assert!(is_error_line("Error while decoding stream #0:0"));
        assert!(is_error_line("[h264 @ 0x55] decode error"));
        assert!(!is_error_line("frame=  120 fps= 30"));
    }

    #[test]
    fn test_empty_update() {
        assert!(ProgressUpdate::default().is_empty());
        assert!(!ProgressUpdate::error("boom").is_empty());
    }
}
