//! Encoder output: keyed `-progress` blocks on stdout, banner on stderr.
//!
//! The fraction uses three tiers in priority order: elapsed/total once the
//! input duration is known, a frame-count heuristic, and a fixed increment
//! per observed line. Estimates stay below the configured ceiling until the
//! encoder prints `progress=end`.

use super::{format_eta, is_error_line, ProgressMeter, ProgressUpdate, StreamKind};
use crate::config::ProgressPolicy;
use regex::Regex;
use std::sync::OnceLock;
use tracing::trace;

static DURATION_RE: OnceLock<Regex> = OnceLock::new();

fn duration_regex() -> &'static Regex {
    DURATION_RE
        .get_or_init(|| Regex::new(r"Duration: (\d+):(\d+):(\d+(?:\.\d+)?)").expect("valid regex"))
}

/// One recognised `key=value` line of the progress block.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressKey {
    /// Output timestamp in seconds.
    OutTime(f64),
    Frame(u64),
    /// Encoding speed as printed, e.g. "4.62x".
    Speed(String),
    /// `progress=end`
    End,
    /// `progress=continue`
    Continue,
}

/// Parse `HH:MM:SS(.frac)` into seconds.
///
/// Negative clocks, printed at stream start (`-00:00:00.023`), are rejected.
pub fn parse_clock(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.starts_with('-') {
        return None;
    }
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || [hours, minutes, seconds].iter().any(|v| v.is_sign_negative()) {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parse one stdout line of the progress block.
pub fn parse_progress_line(line: &str) -> Option<ProgressKey> {
    let (key, value) = line.trim().split_once('=')?;
    let value = value.trim();
    match key.trim() {
        "out_time" => parse_clock(value).map(ProgressKey::OutTime),
        "frame" => value.parse().ok().map(ProgressKey::Frame),
        "speed" if value != "N/A" && !value.is_empty() => Some(ProgressKey::Speed(value.to_string())),
        "progress" if value == "end" => Some(ProgressKey::End),
        "progress" if value == "continue" => Some(ProgressKey::Continue),
        _ => None,
    }
}

/// Total input duration from the `Duration:` banner line, in seconds.
pub fn parse_duration_line(line: &str) -> Option<f64> {
    let caps = duration_regex().captures(line)?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Numeric multiplier of a speed string ("4.62x" -> 4.62).
fn speed_factor(speed: &str) -> Option<f64> {
    speed
        .trim()
        .trim_end_matches('x')
        .trim()
        .parse()
        .ok()
        .filter(|f: &f64| f.is_finite() && *f > 0.0)
}

/// Meter for the transcode domain.
#[derive(Debug)]
pub struct TranscodeMeter {
    policy: ProgressPolicy,
    total_duration: Option<f64>,
    current_time: f64,
    frame: u64,
    speed: Option<f64>,
    estimate: f64,
    committed: f64,
    lines: u64,
}

impl TranscodeMeter {
    pub fn new(policy: ProgressPolicy) -> Self {
        Self {
            policy,
            total_duration: None,
            current_time: 0.0,
            frame: 0,
            speed: None,
            estimate: 0.0,
            committed: 0.0,
            lines: 0,
        }
    }

    pub fn total_duration(&self) -> Option<f64> {
        self.total_duration
    }

    /// Last fraction handed out for persistence.
    pub fn committed(&self) -> f64 {
        self.committed
    }

    fn time_fraction(&self) -> Option<f64> {
        match self.total_duration {
            Some(total) if total > 0.0 && self.current_time > 0.0 => {
                Some(self.current_time.min(total) / total)
            }
            _ => None,
        }
    }

    fn next_estimate(&self) -> f64 {
        let ceiling = self.policy.ceiling;
        let raw = if let Some(fraction) = self.time_fraction() {
            fraction
        } else if self.frame > 0 && self.policy.frame_scale > 0.0 {
            self.frame as f64 / self.policy.frame_scale
        } else {
            self.estimate + self.policy.fallback_increment
        };
        raw.clamp(0.0, ceiling)
    }

    fn eta(&self) -> Option<String> {
        let total = self.total_duration?;
        let speed = self.speed?;
        if self.current_time <= 0.0 {
            return None;
        }
        Some(format_eta((total - self.current_time).max(0.0) / speed))
    }

    fn commit(&mut self, fraction: f64) -> ProgressUpdate {
        self.committed = fraction;
        ProgressUpdate {
            progress: Some(fraction),
            eta: self.eta(),
            ..Default::default()
        }
    }

    fn observe_stdout(&mut self, line: &str) -> Option<ProgressUpdate> {
        let key = match parse_progress_line(line) {
            Some(key) => key,
            None => {
                trace!(line, "Ignoring encoder progress line");
                return None;
            }
        };

        let mut speed_text = None;
        match key {
            ProgressKey::OutTime(seconds) => self.current_time = seconds,
            ProgressKey::Frame(frame) => self.frame = frame,
            ProgressKey::Speed(speed) => {
                self.speed = speed_factor(&speed).or(self.speed);
                speed_text = Some(speed);
            }
            ProgressKey::End => {
                self.estimate = 1.0;
                let mut update = self.commit(1.0);
                update.eta = None;
                return Some(update);
            }
            ProgressKey::Continue => {}
        }

        let mut update = ProgressUpdate {
            speed: speed_text,
            ..Default::default()
        };

        if self.committed < 1.0 {
            self.estimate = self.estimate.max(self.next_estimate());
            if self.estimate > self.committed + self.policy.min_commit_delta {
                let committed = self.commit(self.estimate);
                update.progress = committed.progress;
                update.eta = committed.eta;
            }
        }

        if update.is_empty() {
            None
        } else {
            Some(update)
        }
    }

    fn observe_stderr(&mut self, line: &str) -> Option<ProgressUpdate> {
        if is_error_line(line) {
            return Some(ProgressUpdate::error(line));
        }

        if self.total_duration.is_none() {
            if let Some(total) = parse_duration_line(line) {
                self.total_duration = Some(total);
                if self.committed < 1.0 {
                    if let Some(fraction) = self.time_fraction() {
                        let fraction = fraction.min(self.policy.ceiling);
                        if fraction > self.committed {
                            self.estimate = self.estimate.max(fraction);
                            return Some(self.commit(self.estimate));
                        }
                    }
                }
                return None;
            }
        }

        trace!(line, "Ignoring encoder diagnostic line");
        None
    }
}

impl ProgressMeter for TranscodeMeter {
    fn observe(&mut self, stream: StreamKind, line: &str) -> Option<ProgressUpdate> {
        self.lines += 1;
        match stream {
            StreamKind::Stdout => self.observe_stdout(line),
            StreamKind::Stderr => self.observe_stderr(line),
        }
    }

    fn lines_observed(&self) -> u64 {
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn meter() -> TranscodeMeter {
        TranscodeMeter::new(ProgressPolicy::default())
    }

    #[test]
    fn test_parse_clock_rejects_negative_times() {
        assert_eq!(parse_clock("01:02:03.5"), Some(3723.5));
        assert_eq!(parse_clock(" 00:00:00 "), Some(0.0));
        assert_eq!(parse_clock("-00:00:00.023"), None);
        assert_eq!(parse_clock("00:-0:01"), None);
        assert_eq!(parse_clock("00:00:-1"), None);
        assert_eq!(parse_clock("00:01"), None);
    }

    #[test]
    fn test_parse_progress_keys() {
        assert_eq!(
            parse_progress_line("out_time=00:00:55.138417"),
            Some(ProgressKey::OutTime(55.138417))
        );
        assert_eq!(parse_progress_line("frame=48"), Some(ProgressKey::Frame(48)));
        assert_eq!(
            parse_progress_line("speed=4.62x"),
            Some(ProgressKey::Speed("4.62x".to_string()))
        );
        assert_eq!(parse_progress_line("progress=end"), Some(ProgressKey::End));
        assert_eq!(
            parse_progress_line("progress=continue"),
            Some(ProgressKey::Continue)
        );
        assert_eq!(parse_progress_line("out_time_us=55138417"), None);
        assert_eq!(parse_progress_line("out_time=N/A"), None);
        assert_eq!(parse_progress_line("out_time=-00:00:00.023"), None);
        assert_eq!(parse_progress_line("speed=N/A"), None);
        assert_eq!(parse_progress_line("bitrate=1234.5kbits/s"), None);
        assert_eq!(parse_progress_line("no separator"), None);
    }

    #[test]
    fn test_parse_duration_banner() {
        let line = "  Duration: 01:02:03.50, start: 0.000000, bitrate: 4500 kb/s";
        assert_eq!(parse_duration_line(line), Some(3723.5));
        assert_eq!(parse_duration_line("  Duration: N/A, bitrate: N/A"), None);
    }

    #[test]
    fn test_time_tier() {
        let mut m = meter();
        assert!(m
            .observe(StreamKind::Stderr, "  Duration: 00:01:40.00, start: 0.0")
            .is_none());
        assert_eq!(m.total_duration(), Some(100.0));

        m.observe(StreamKind::Stdout, "speed=2x");
        let update = m
            .observe(StreamKind::Stdout, "out_time=00:00:25.000000")
            .unwrap();
        assert_eq!(update.progress, Some(0.25));
        // 75 s of media left at 2x
        assert_eq!(update.eta.as_deref(), Some("00:00:38"));
    }

    #[test]
    fn test_time_tier_is_capped_below_one() {
        let mut m = meter();
        m.observe(StreamKind::Stderr, "Duration: 00:00:10.00");
        let update = m.observe(StreamKind::Stdout, "out_time=00:00:12.0").unwrap();
        assert_eq!(update.progress, Some(0.99));
    }

    #[test]
    fn test_duration_after_out_time_commits() {
        let mut m = meter();
        m.observe(StreamKind::Stdout, "out_time=00:00:30.0");
        let update = m
            .observe(StreamKind::Stderr, "Duration: 00:01:00.00, start")
            .unwrap();
        assert_eq!(update.progress, Some(0.5));
    }

    #[test]
    fn test_frame_tier() {
        let mut m = meter();
        let update = m.observe(StreamKind::Stdout, "frame=5000").unwrap();
        assert_eq!(update.progress, Some(0.05));

        let update = m.observe(StreamKind::Stdout, "frame=500000").unwrap();
        assert_eq!(update.progress, Some(0.99));
    }

    #[test]
    fn test_fallback_tier_eventually_moves() {
        let mut m = meter();
        let mut moved = None;
        for i in 0..10 {
            if let Some(update) = m.observe(StreamKind::Stdout, "progress=continue") {
                moved = Some((i, update));
                break;
            }
        }
        let (i, update) = moved.expect("fallback increment should commit");
        assert!(i >= 4);
        assert!(update.progress.unwrap() > 0.004);
    }

    #[test]
    fn test_small_changes_are_not_committed() {
        let mut m = meter();
        m.observe(StreamKind::Stderr, "Duration: 00:16:40.00");
        assert!(m.observe(StreamKind::Stdout, "out_time=00:00:10.0").is_some());
        // 0.01 -> 0.012 is below the commit delta
        assert!(m.observe(StreamKind::Stdout, "out_time=00:00:12.0").is_none());
        assert!((m.committed() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_end_marker_sets_one() {
        let mut m = meter();
        m.observe(StreamKind::Stdout, "frame=10");
        let update = m.observe(StreamKind::Stdout, "progress=end").unwrap();
        assert_eq!(update.progress, Some(1.0));
        assert_eq!(m.committed(), 1.0);

        // Nothing moves after the end marker.
        assert!(m.observe(StreamKind::Stdout, "frame=20").is_none());
    }

    #[test]
    fn test_speed_is_reported_immediately() {
        let mut m = meter();
        m.observe(StreamKind::Stdout, "frame=5000");
        let update = m.observe(StreamKind::Stdout, "speed=1.5x").unwrap();
        assert_eq!(update.speed.as_deref(), Some("1.5x"));
        assert_eq!(update.progress, None);
    }

    #[test]
    fn test_error_lines_do_not_move_progress() {
        let mut m = meter();
        let update = m
            .observe(StreamKind::Stderr, "Error while decoding stream #0:1")
            .unwrap();
        assert_eq!(update.error.as_deref(), Some("Error while decoding stream #0:1"));
        assert_eq!(update.progress, None);
        assert_eq!(m.committed(), 0.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Committed fractions stay within [0, ceiling] and never decrease until the end marker.
        #[test]
        fn prop_committed_fraction_is_bounded(
            frames in proptest::collection::vec(0u64..1_000_000, 1..30),
            times in proptest::collection::vec(0.0f64..500.0, 1..30),
            duration in proptest::option::of(1.0f64..400.0),
        ) {
            let mut m = meter();
            if let Some(d) = duration {
                m.observe(StreamKind::Stderr, &format!("Duration: 00:00:{:09.6}", d.min(59.0)));
            }
            let mut last = 0.0;
            for (frame, time) in frames.iter().zip(times.iter()) {
                let lines = [
                    format!("frame={}", frame),
                    format!("out_time=00:{:02}:{:09.6}", (*time / 60.0) as u32, time % 60.0),
                    "progress=continue".to_string(),
                ];
                for line in lines.iter() {
                    if let Some(update) = m.observe(StreamKind::Stdout, line) {
                        if let Some(p) = update.progress {
                            prop_assert!((0.0..=0.99).contains(&p));
                            prop_assert!(p >= last);
                            last = p;
                        }
                    }
                }
            }
        }
    }
}
