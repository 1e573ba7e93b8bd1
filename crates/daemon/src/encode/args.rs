//! Encoder argument construction.
//!
//! Builds the final argument vector for a transcode from the selected
//! [`EncodePlan`]. The acceleration flag must precede the input file.

use super::selector::EncodePlan;
use crate::config::EncoderConfig;
use crate::task::TranscodeJob;
use std::ffi::OsString;

/// Named resolution presets.
const RESOLUTION_PRESETS: &[(&str, &str)] = &[
    ("2160p", "3840x2160"),
    ("1440p", "2560x1440"),
    ("1080p", "1920x1080"),
    ("720p", "1280x720"),
    ("480p", "854x480"),
    ("360p", "640x360"),
    ("240p", "426x240"),
];

/// Pixel dimensions for a resolution request.
///
/// Presets map to `WxH`, "original" or empty means no override, anything
/// else is passed through verbatim.
pub fn resolution_dimensions(resolution: &str) -> Option<String> {
    let resolution = resolution.trim();
    if resolution.is_empty() || resolution.eq_ignore_ascii_case("original") {
        return None;
    }
    let lower = resolution.to_lowercase();
    let dims = RESOLUTION_PRESETS
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, dims)| dims.to_string())
        .unwrap_or_else(|| resolution.to_string());
    Some(dims)
}

/// Encoder threads for a host with `logical_cores` cores: half of them, at least 4.
pub fn derive_software_threads(logical_cores: usize) -> u32 {
    ((logical_cores / 2) as u32).max(4)
}

/// Thread bound for software encoding, explicit config or derived.
pub fn software_threads(settings: &EncoderConfig) -> u32 {
    if settings.software_threads > 0 {
        settings.software_threads
    } else {
        derive_software_threads(num_cpus::get())
    }
}

/// Split a raw override string into arguments.
pub fn split_custom_args(custom: &str) -> Vec<String> {
    custom.split_whitespace().map(String::from).collect()
}

fn push(args: &mut Vec<OsString>, items: &[&str]) {
    args.extend(items.iter().map(OsString::from));
}

/// Fixed trailer: overwrite output, machine-readable progress on stdout.
fn push_progress_reporting(args: &mut Vec<OsString>, job: &TranscodeJob) {
    push(args, &["-y", "-progress", "pipe:1", "-stats"]);
    args.push(job.destination.clone().into_os_string());
}

/// Build the argument vector for a planned transcode.
pub fn build_transcode_args(
    job: &TranscodeJob,
    plan: &EncodePlan,
    settings: &EncoderConfig,
) -> Vec<OsString> {
    let mut args = Vec::new();

    // Acceleration API, must come before the input
    if let Some(hwaccel) = plan.hwaccel() {
        push(&mut args, &["-hwaccel", hwaccel]);
    }

    args.push(OsString::from("-i"));
    args.push(job.source.clone().into_os_string());

    push(&mut args, &["-c:v", plan.video_codec.as_str()]);

    // Encoder tuning
    let codec = plan.video_codec.as_str();
    let threads = software_threads(settings).to_string();
    if codec.ends_with("_nvenc") {
        push(&mut args, &["-preset", "p4", "-tune", "hq"]);
    } else if codec.ends_with("_amf") {
        push(&mut args, &["-quality", "balanced", "-rc", "cbr_hq", "-g", "250"]);
    } else if codec.ends_with("_qsv") {
        push(&mut args, &["-preset", "veryfast", "-look_ahead", "1"]);
    } else if plan.encodes_in_software() {
        if matches!(codec, "libx264" | "libx265") {
            push(&mut args, &["-preset", "medium"]);
        }
        push(&mut args, &["-threads", threads.as_str()]);
    }

    if let Some(dims) = job.resolution.as_deref().and_then(resolution_dimensions) {
        push(&mut args, &["-s", dims.as_str()]);
    }

    if let Some(bitrate) = job.bitrate.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
        push(&mut args, &["-b:v", bitrate]);
    }

    push(&mut args, &["-c:a", plan.audio_codec.as_str()]);

    let queue = settings.muxing_queue_size.to_string();
    push(&mut args, &["-max_muxing_queue_size", queue.as_str()]);

    if plan.encodes_in_software() {
        let filter_threads = settings.filter_threads.to_string();
        push(&mut args, &["-filter_threads", filter_threads.as_str()]);
    }

    push_progress_reporting(&mut args, job);
    args
}

/// Argument vector when the caller supplied raw encoder arguments.
///
/// The override replaces every codec, resolution and bitrate argument; only
/// the input and the progress-reporting trailer are kept.
pub fn build_override_args(job: &TranscodeJob, custom: &str) -> Vec<OsString> {
    let mut args = vec![OsString::from("-i"), job.source.clone().into_os_string()];
    args.extend(split_custom_args(custom).into_iter().map(OsString::from));
    push_progress_reporting(&mut args, job);
    args
}
