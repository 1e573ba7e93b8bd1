//! Host capability queries for hardware-accelerated transcoding.
//!
//! Detection sits behind [`HostCapabilities`] so the selection logic can be exercised
//! without real GPUs. [`SystemHost`] runs the actual commands.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Acceleration methods that count as hardware support.
const ACCEL_KEYWORDS: &[&str] = &[
    "cuda",
    "nvenc",
    "dxva2",
    "d3d11va",
    "qsv",
    "vulkan",
    "amf",
    "vce",
    "opencl",
    "vaapi",
    "videotoolbox",
];

/// Encoder name suffixes of hardware encoders.
const HW_ENCODER_SUFFIXES: &[&str] = &["_nvenc", "_amf", "_qsv", "_vaapi", "_videotoolbox"];

/// GPU vendor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Other,
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "nvidia"),
            GpuVendor::Amd => write!(f, "amd"),
            GpuVendor::Intel => write!(f, "intel"),
            GpuVendor::Other => write!(f, "other"),
        }
    }
}

/// Classify display adapters by vendor; `None` when there are none.
///
/// A discrete NVIDIA or AMD adapter wins over an integrated Intel one.
pub fn classify_gpu(adapters: &[String]) -> Option<GpuVendor> {
    if adapters.is_empty() {
        return None;
    }

    let lower: Vec<String> = adapters.iter().map(|a| a.to_lowercase()).collect();
    let has_word = |words: &[&str]| {
        lower.iter().any(|adapter| {
            adapter
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|token| words.contains(&token))
        })
    };

    if has_word(&["nvidia", "geforce", "quadro"]) {
        Some(GpuVendor::Nvidia)
    } else if has_word(&["amd", "radeon", "ati"]) {
        Some(GpuVendor::Amd)
    } else if has_word(&["intel", "iris", "uhd"])
        || lower.iter().any(|a| a.contains("hd graphics"))
    {
        Some(GpuVendor::Intel)
    } else {
        Some(GpuVendor::Other)
    }
}

/// Adapter names from `wmic path win32_VideoController get Name`.
pub fn parse_wmic_adapters(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.eq_ignore_ascii_case("name"))
        .map(String::from)
        .collect()
}

/// Adapter names from `lspci` display-controller lines.
pub fn parse_lspci_adapters(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| {
            line.contains("VGA compatible controller")
                || line.contains("3D controller")
                || line.contains("Display controller")
        })
        .filter_map(|line| line.split_once(": ").map(|(_, name)| name.trim().to_string()))
        .filter(|name| !name.is_empty())
        .collect()
}

/// Methods listed by `<encoder> -hwaccels`.
pub fn parse_hwaccels(output: &str) -> Vec<String> {
    let mut methods = Vec::new();
    let mut in_list = false;
    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("Hardware acceleration methods") {
            in_list = true;
            continue;
        }
        if in_list && !line.is_empty() {
            methods.push(line.to_string());
        }
    }
    methods
}

/// Hardware encoder names listed by `<encoder> -encoders`.
pub fn parse_hw_encoders(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter(|name| HW_ENCODER_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)))
        .map(String::from)
        .collect()
}

/// What the encoder tool advertises.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HwSupport {
    pub hwaccels: Vec<String>,
    pub encoders: Vec<String>,
}

impl HwSupport {
    pub fn from_outputs(hwaccels: Option<&str>, encoders: Option<&str>) -> Self {
        Self {
            hwaccels: hwaccels.map(parse_hwaccels).unwrap_or_default(),
            encoders: encoders.map(parse_hw_encoders).unwrap_or_default(),
        }
    }

    /// Any acceleration method or hardware encoder at all.
    pub fn advertises_acceleration(&self) -> bool {
        self.hwaccels
            .iter()
            .any(|m| ACCEL_KEYWORDS.iter().any(|k| m.to_lowercase().contains(k)))
            || !self.encoders.is_empty()
    }

    pub fn has_encoder(&self, name: &str) -> bool {
        self.encoders.iter().any(|e| e == name)
    }
}

/// Host probing used by the encoder selector.
#[async_trait]
pub trait HostCapabilities: Send + Sync {
    /// Display adapter names; empty when none were found or probing failed.
    async fn gpu_adapters(&self) -> Vec<String>;

    /// Raw `-hwaccels` listing of the encoder tool.
    async fn hwaccels(&self) -> Option<String>;

    /// Raw `-encoders` listing of the encoder tool.
    async fn encoders(&self) -> Option<String>;

    /// Whether a short decode of `input` through `hwaccel` succeeds.
    async fn dry_run(&self, hwaccel: &str, input: &Path) -> bool;
}

/// Capability source that runs the real commands.
#[derive(Debug, Clone)]
pub struct SystemHost {
    encoder: PathBuf,
    timeout: Duration,
}

impl SystemHost {
    pub fn new(encoder: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            encoder: encoder.into(),
            timeout,
        }
    }

    /// Run a command to completion; `None` on spawn failure, timeout or non-zero exit.
    async fn capture<I, S>(&self, program: &Path, args: I) -> Option<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(Ok(output)) => {
                debug!(program = %program.display(), status = %output.status, "Capability query exited unsuccessfully");
                None
            }
            Ok(Err(e)) => {
                debug!(program = %program.display(), error = %e, "Capability query failed to run");
                None
            }
            Err(_) => {
                debug!(program = %program.display(), "Capability query timed out");
                None
            }
        }
    }
}

#[async_trait]
impl HostCapabilities for SystemHost {
    async fn gpu_adapters(&self) -> Vec<String> {
        if cfg!(windows) {
            self.capture(
                Path::new("wmic"),
                ["path", "win32_VideoController", "get", "Name"],
            )
            .await
            .map(|out| parse_wmic_adapters(&out))
            .unwrap_or_default()
        } else {
            self.capture(Path::new("lspci"), std::iter::empty::<&str>())
                .await
                .map(|out| parse_lspci_adapters(&out))
                .unwrap_or_default()
        }
    }

    async fn hwaccels(&self) -> Option<String> {
        self.capture(&self.encoder, ["-hide_banner", "-hwaccels"]).await
    }

    async fn encoders(&self) -> Option<String> {
        self.capture(&self.encoder, ["-hide_banner", "-encoders"]).await
    }

    async fn dry_run(&self, hwaccel: &str, input: &Path) -> bool {
        let args: Vec<&OsStr> = vec![
            OsStr::new("-hide_banner"),
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-hwaccel"),
            OsStr::new(hwaccel),
            OsStr::new("-i"),
            input.as_os_str(),
            OsStr::new("-t"),
            OsStr::new("1"),
            OsStr::new("-f"),
            OsStr::new("null"),
            OsStr::new("-"),
        ];
        self.capture(&self.encoder, args).await.is_some()
    }
}
