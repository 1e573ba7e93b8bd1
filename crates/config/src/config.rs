//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Locations of the external executables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    /// Peer-to-peer fetch tool (download domain)
    #[serde(default = "default_fetch_tool")]
    pub fetch: PathBuf,
    /// Encoder tool (transcode domain)
    #[serde(default = "default_encoder_tool")]
    pub encoder: PathBuf,
}

fn default_fetch_tool() -> PathBuf {
    PathBuf::from("tools/torrent")
}

fn default_encoder_tool() -> PathBuf {
    PathBuf::from("ffmpeg")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            fetch: default_fetch_tool(),
            encoder: default_encoder_tool(),
        }
    }
}

/// Output and state directories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Directory holding the per-domain task store files
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Default destination for downloads
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Base directory for relative transcode destinations
    #[serde(default = "default_transcode_dir")]
    pub transcode_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_transcode_dir() -> PathBuf {
    PathBuf::from("transcode")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            download_dir: default_download_dir(),
            transcode_dir: default_transcode_dir(),
        }
    }
}

/// Policy constants for transcode progress estimation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressPolicy {
    /// Minimum fraction increase before an update is written to the store
    #[serde(default = "default_min_commit_delta")]
    pub min_commit_delta: f64,
    /// Frames that count as "done" when the duration is unknown
    #[serde(default = "default_frame_scale")]
    pub frame_scale: f64,
    /// Increment per observed line when nothing better is known
    #[serde(default = "default_fallback_increment")]
    pub fallback_increment: f64,
    /// Upper bound for estimated progress before the end marker
    #[serde(default = "default_ceiling")]
    pub ceiling: f64,
}

fn default_min_commit_delta() -> f64 {
    0.005
}

fn default_frame_scale() -> f64 {
    100_000.0
}

fn default_fallback_increment() -> f64 {
    0.001
}

fn default_ceiling() -> f64 {
    0.99
}

impl Default for ProgressPolicy {
    fn default() -> Self {
        Self {
            min_commit_delta: default_min_commit_delta(),
            frame_scale: default_frame_scale(),
            fallback_increment: default_fallback_increment(),
            ceiling: default_ceiling(),
        }
    }
}

/// Encoder argument and probing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Allow hardware acceleration paths (default true)
    #[serde(default = "default_allow_hardware")]
    pub allow_hardware: bool,
    /// Encoder threads on the software path (0 = auto-derive)
    #[serde(default)]
    pub software_threads: u32,
    /// Filter graph threads on the software path
    #[serde(default = "default_filter_threads")]
    pub filter_threads: u32,
    /// Value passed to -max_muxing_queue_size
    #[serde(default = "default_muxing_queue_size")]
    pub muxing_queue_size: u32,
    /// Timeout for each capability query and dry run, in seconds
    #[serde(default = "default_detect_timeout_secs")]
    pub detect_timeout_secs: u64,
}

fn default_allow_hardware() -> bool {
    true
}

fn default_filter_threads() -> u32 {
    2
}

fn default_muxing_queue_size() -> u32 {
    1024
}

fn default_detect_timeout_secs() -> u64 {
    20
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            allow_hardware: default_allow_hardware(),
            software_threads: 0,
            filter_threads: default_filter_threads(),
            muxing_queue_size: default_muxing_queue_size(),
            detect_timeout_secs: default_detect_timeout_secs(),
        }
    }
}

/// HTTP control surface configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    /// Socket address the API listens on
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub progress: ProgressPolicy,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - TASKD_FETCH_TOOL -> tools.fetch
    /// - TASKD_ENCODER_TOOL -> tools.encoder
    /// - TASKD_STATE_DIR -> paths.state_dir
    /// - TASKD_DOWNLOAD_DIR -> paths.download_dir
    /// - TASKD_TRANSCODE_DIR -> paths.transcode_dir
    /// - TASKD_ALLOW_HARDWARE -> encoder.allow_hardware
    /// - TASKD_SOFTWARE_THREADS -> encoder.software_threads
    /// - TASKD_API_BIND -> api.bind
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = non_empty_var("TASKD_FETCH_TOOL") {
            self.tools.fetch = PathBuf::from(path);
        }

        if let Some(path) = non_empty_var("TASKD_ENCODER_TOOL") {
            self.tools.encoder = PathBuf::from(path);
        }

        if let Some(dir) = non_empty_var("TASKD_STATE_DIR") {
            self.paths.state_dir = PathBuf::from(dir);
        }

        if let Some(dir) = non_empty_var("TASKD_DOWNLOAD_DIR") {
            self.paths.download_dir = PathBuf::from(dir);
        }

        if let Some(dir) = non_empty_var("TASKD_TRANSCODE_DIR") {
            self.paths.transcode_dir = PathBuf::from(dir);
        }

        if let Ok(val) = env::var("TASKD_ALLOW_HARDWARE") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.encoder.allow_hardware = true,
                "false" | "0" | "no" => self.encoder.allow_hardware = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("TASKD_SOFTWARE_THREADS") {
            if let Ok(threads) = val.parse::<u32>() {
                self.encoder.software_threads = threads;
            }
        }

        if let Some(bind) = non_empty_var("TASKD_API_BIND") {
            self.api.bind = bind;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Make relative tool and directory paths absolute against `base_dir`
    ///
    /// Bare tool names such as `ffmpeg` are left alone so they resolve through `PATH`.
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        for tool in [&mut self.tools.fetch, &mut self.tools.encoder] {
            if tool.is_relative() && tool.components().count() > 1 {
                *tool = base_dir.join(&*tool);
            }
        }

        for dir in [
            &mut self.paths.state_dir,
            &mut self.paths.download_dir,
            &mut self.paths.transcode_dir,
        ] {
            if dir.is_relative() {
                *dir = base_dir.join(&*dir);
            }
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|val| !val.trim().is_empty())
}
