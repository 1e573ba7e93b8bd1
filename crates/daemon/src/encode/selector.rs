//! Encoder path selection for a transcode.
//!
//! Evaluated once per task start. Every detection or dry-run failure degrades to
//! the next tier (vendor path, generic acceleration, software) instead of
//! failing the task.

use super::host::{classify_gpu, GpuVendor, HostCapabilities, HwSupport};
use crate::config::EncoderConfig;
use crate::task::TranscodeJob;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

/// Markers of hardware codecs and acceleration APIs.
const HW_CODEC_MARKERS: &[&str] = &[
    "nvenc", "qsv", "vaapi", "cuda", "amf", "vce", "videotoolbox", "v4l2m2m",
];

/// Containers that accept the hardware H.264/HEVC encoders.
const HW_CODEC_CONTAINERS: &[&str] = &["mp4", "mkv", "mov"];

/// Detect a hardware codec or acceleration flag in an encoder argument.
///
/// Returns the first matching marker.
pub fn detect_hardware_flag(s: &str) -> Option<&'static str> {
    let lower = s.to_lowercase();
    HW_CODEC_MARKERS
        .iter()
        .find(|&&marker| lower.contains(marker))
        .copied()
}

/// Platform acceleration API used when no vendor path applies.
pub fn generic_hwaccel() -> &'static str {
    if cfg!(windows) {
        "d3d11va"
    } else if cfg!(target_os = "macos") {
        "videotoolbox"
    } else {
        "vaapi"
    }
}

/// Lowercase extension of the output file.
fn container(destination: &Path) -> String {
    destination
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .unwrap_or_default()
}

/// Software video/audio codecs for an output container.
pub fn default_codecs(destination: &Path) -> (&'static str, &'static str) {
    match container(destination).as_str() {
        "webm" => ("libvpx-vp9", "libopus"),
        _ => ("libx264", "aac"),
    }
}

/// How the transcode will run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccelPath {
    Software,
    /// Hardware decode through the platform API, software encode.
    Generic { hwaccel: String },
    /// Vendor-preferred decode and, where the container allows, encode.
    Vendor { vendor: GpuVendor, hwaccel: String },
}

/// Concrete choice of acceleration and codecs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodePlan {
    pub path: AccelPath,
    pub video_codec: String,
    pub audio_codec: String,
}

impl EncodePlan {
    pub fn software(video_codec: &str, audio_codec: &str) -> Self {
        Self {
            path: AccelPath::Software,
            video_codec: video_codec.to_string(),
            audio_codec: audio_codec.to_string(),
        }
    }

    /// Value for `-hwaccel`, if any.
    pub fn hwaccel(&self) -> Option<&str> {
        match &self.path {
            AccelPath::Software => None,
            AccelPath::Generic { hwaccel } | AccelPath::Vendor { hwaccel, .. } => Some(hwaccel),
        }
    }

    /// True when the video encoder runs on the CPU.
    pub fn encodes_in_software(&self) -> bool {
        detect_hardware_flag(&self.video_codec).is_none()
    }
}

fn requested(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Map a software H.264/HEVC codec onto a vendor encoder family.
fn vendor_codec(software_codec: &str, suffix: &str) -> Option<String> {
    match software_codec {
        "libx264" | "h264" => Some(format!("h264_{}", suffix)),
        "libx265" | "hevc" => Some(format!("hevc_{}", suffix)),
        _ => None,
    }
}

/// Choose the acceleration path and codecs for `job`.
pub async fn select_plan(
    host: &dyn HostCapabilities,
    job: &TranscodeJob,
    settings: &EncoderConfig,
) -> EncodePlan {
    let (default_video, default_audio) = default_codecs(&job.destination);
    let audio = requested(&job.audio_codec).unwrap_or(default_audio);
    let video = match requested(&job.video_codec) {
        Some(codec) if detect_hardware_flag(codec).is_none() => codec,
        Some(codec) => {
            debug!(codec, "Requested hardware codec needs a verified path; starting from software default");
            default_video
        }
        None => default_video,
    };
    let software = EncodePlan::software(video, audio);

    if !settings.allow_hardware {
        return software;
    }

    let adapters = host.gpu_adapters().await;
    let vendor = match classify_gpu(&adapters) {
        Some(vendor) => vendor,
        None => {
            debug!("No GPU found, using software encoding");
            return software;
        }
    };

    let support = HwSupport::from_outputs(
        host.hwaccels().await.as_deref(),
        host.encoders().await.as_deref(),
    );
    if !support.advertises_acceleration() {
        debug!(%vendor, "Encoder advertises no hardware acceleration, using software encoding");
        return software;
    }

    let hw_container = HW_CODEC_CONTAINERS.contains(&container(&job.destination).as_str());
    let pick = |suffix: &str| -> String {
        if !hw_container {
            return video.to_string();
        }
        vendor_codec(video, suffix)
            .filter(|codec| support.has_encoder(codec))
            .unwrap_or_else(|| video.to_string())
    };

    let vendor_plan = match vendor {
        GpuVendor::Nvidia if host.dry_run("cuda", &job.source).await => Some(EncodePlan {
            path: AccelPath::Vendor {
                vendor,
                hwaccel: "cuda".to_string(),
            },
            video_codec: pick("nvenc"),
            audio_codec: audio.to_string(),
        }),
        GpuVendor::Amd
            if (support.has_encoder("h264_amf") || support.has_encoder("hevc_amf"))
                && host.dry_run(generic_hwaccel(), &job.source).await =>
        {
            let mut codec = pick("amf");
            // AMF is the whole point of this path; fall back to whichever flavour exists.
            if hw_container && detect_hardware_flag(&codec).is_none() {
                codec = if support.has_encoder("h264_amf") {
                    "h264_amf".to_string()
                } else {
                    "hevc_amf".to_string()
                };
            }
            Some(EncodePlan {
                path: AccelPath::Vendor {
                    vendor,
                    hwaccel: generic_hwaccel().to_string(),
                },
                video_codec: codec,
                audio_codec: audio.to_string(),
            })
        }
        GpuVendor::Intel if host.dry_run("qsv", &job.source).await => Some(EncodePlan {
            path: AccelPath::Vendor {
                vendor,
                hwaccel: "qsv".to_string(),
            },
            video_codec: pick("qsv"),
            audio_codec: audio.to_string(),
        }),
        _ => None,
    };

    if let Some(plan) = vendor_plan {
        info!(%vendor, codec = %plan.video_codec, "Using vendor hardware path");
        return plan;
    }

    let generic = generic_hwaccel();
    if host.dry_run(generic, &job.source).await {
        info!(%vendor, hwaccel = generic, "Using generic hardware decode");
        return EncodePlan {
            path: AccelPath::Generic {
                hwaccel: generic.to_string(),
            },
            video_codec: video.to_string(),
            audio_codec: audio.to_string(),
        };
    }

    debug!(%vendor, "Hardware dry runs failed, using software encoding");
    software
}
