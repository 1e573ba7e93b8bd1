//! Unit-aware size strings ("12.3 MB", "512 KB", "0").

use regex::Regex;
use std::sync::OnceLock;

static SIZE_RE: OnceLock<Regex> = OnceLock::new();

fn size_regex() -> &'static Regex {
    SIZE_RE.get_or_init(|| {
        Regex::new(r"^(\d+(?:\.\d+)?)([KkMmGgTtPp]?)(?:[Ii])?([Bb]?)$").expect("valid regex")
    })
}

/// Parse a magnitude with an optional binary unit into a byte count.
///
/// Units are 1024-based: B, KB, MB, GB, TB, PB (also K, M, ..., and KiB
/// style). Whitespace anywhere in the input is ignored. A bare number is a
/// byte count.
pub fn parse_size(text: &str) -> Option<u64> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let caps = size_regex().captures(&compact)?;

    let value: f64 = caps[1].parse().ok()?;
    let exponent = match caps[2].to_ascii_uppercase().as_str() {
        "" => 0,
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        _ => return None,
    };

    Some((value * 1024f64.powi(exponent)) as u64)
}
