//! Daemon facade for the task orchestrator
//!
//! Owns the configuration and one scheduler per domain, and provides the
//! startup sequence (checks, recovery, promotion) plus the enqueue helpers
//! used by the HTTP surface.

use crate::api::run_api_server;
use crate::config::{Config, ConfigError};
use crate::encode::SystemHost;
use crate::locator::{resolve_locator, resolve_locator_base64, LocatorError};
use crate::pipeline::{DownloadPipeline, TranscodePipeline};
use crate::recovery::{recover, RecoveryReport};
use crate::scheduler::{QueueScheduler, SchedulerError};
use crate::startup::{run_startup_checks, StartupError};
use crate::store::{StoreError, TaskStore};
use crate::task::{DownloadJob, TranscodeJob};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Locator(#[from] LocatorError),

    /// Request rejected before anything was enqueued
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),
}

impl From<StoreError> for DaemonError {
    fn from(e: StoreError) -> Self {
        DaemonError::Scheduler(SchedulerError::Store(e))
    }
}

/// Body of a download enqueue request.
///
/// Exactly one of `locator`, `descriptor` or `descriptor_base64` identifies
/// what to fetch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub locator: Option<String>,
    /// Path of a descriptor file to resolve through the fetch tool.
    #[serde(default)]
    pub descriptor: Option<PathBuf>,
    /// Descriptor content, base64 encoded.
    #[serde(default)]
    pub descriptor_base64: Option<String>,
    /// Defaults to `paths.download_dir`.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Body of a transcode enqueue request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscodeRequest {
    pub source: PathBuf,
    /// Relative destinations are placed under `paths.transcode_dir`.
    #[serde(default)]
    pub destination: Option<PathBuf>,
    /// Target container; used to derive a destination when none is given.
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub video_codec: Option<String>,
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub bitrate: Option<String>,
    /// Quality level `q`, converted to a `<q*1000>k` bitrate.
    #[serde(default)]
    pub quality: Option<u32>,
    #[serde(default)]
    pub custom_args: Option<String>,
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    pub downloads: Arc<QueueScheduler<DownloadPipeline>>,
    pub transcodes: Arc<QueueScheduler<TranscodePipeline>>,
}

impl Daemon {
    /// Run the startup checks, then build the daemon.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Ok(Self::new_without_checks(config))
    }

    /// Build the daemon without touching the external tools.
    pub fn new_without_checks(config: Config) -> Self {
        let state_dir = &config.paths.state_dir;

        let downloads = QueueScheduler::new(
            DownloadPipeline::new(&config.tools.fetch),
            Arc::new(TaskStore::in_dir(state_dir)),
        );

        let host = SystemHost::new(
            &config.tools.encoder,
            Duration::from_secs(config.encoder.detect_timeout_secs),
        );
        let transcodes = QueueScheduler::new(
            TranscodePipeline::new(
                &config.tools.encoder,
                config.encoder.clone(),
                config.progress.clone(),
                Arc::new(host),
            ),
            Arc::new(TaskStore::in_dir(state_dir)),
        );

        Self {
            config,
            downloads,
            transcodes,
        }
    }

    /// Recover orphans of both domains, then start their queues.
    pub async fn start(&self) -> Result<Vec<RecoveryReport>, DaemonError> {
        let reports = vec![
            recover(self.downloads.store(), &self.config.tools.fetch)?,
            recover(self.transcodes.store(), &self.config.tools.encoder)?,
        ];

        self.downloads.promote_next().await?;
        self.transcodes.promote_next().await?;
        Ok(reports)
    }

    /// Enqueue a download, resolving a descriptor into a locator first if needed.
    pub async fn enqueue_download(&self, request: DownloadRequest) -> Result<String, DaemonError> {
        let fetch_tool = &self.config.tools.fetch;
        let locator = match (
            non_blank(request.locator),
            request.descriptor,
            non_blank(request.descriptor_base64),
        ) {
            (Some(locator), None, None) => locator,
            (None, Some(descriptor), None) => resolve_locator(fetch_tool, &descriptor).await?,
            (None, None, Some(encoded)) => resolve_locator_base64(fetch_tool, &encoded).await?,
            (None, None, None) => {
                return Err(DaemonError::Invalid(
                    "one of locator, descriptor or descriptor_base64 is required".to_string(),
                ))
            }
            _ => {
                return Err(DaemonError::Invalid(
                    "locator, descriptor and descriptor_base64 are mutually exclusive".to_string(),
                ))
            }
        };

        let output_dir = request
            .output_dir
            .unwrap_or_else(|| self.config.paths.download_dir.clone());
        let name = non_blank(request.name).unwrap_or_else(|| display_name(&locator));

        let id = self
            .downloads
            .enqueue(DownloadJob {
                locator,
                output_dir,
                name,
                ..Default::default()
            })
            .await?;
        Ok(id)
    }

    /// Validate and enqueue a transcode.
    pub async fn enqueue_transcode(&self, request: TranscodeRequest) -> Result<String, DaemonError> {
        let job = self.transcode_job(request)?;
        let id = self.transcodes.enqueue(job).await?;
        Ok(id)
    }

    fn transcode_job(&self, request: TranscodeRequest) -> Result<TranscodeJob, DaemonError> {
        if !request.source.is_file() {
            return Err(DaemonError::Invalid(format!(
                "source file does not exist: {}",
                request.source.display()
            )));
        }

        let destination = match (request.destination, non_blank(request.format)) {
            (Some(dest), _) if dest.is_relative() => self.config.paths.transcode_dir.join(dest),
            (Some(dest), _) => dest,
            (None, Some(format)) => converted_path(&request.source, &format),
            (None, None) => {
                return Err(DaemonError::Invalid(
                    "either destination or format is required".to_string(),
                ))
            }
        };
        if destination == request.source {
            return Err(DaemonError::Invalid(
                "destination must differ from source".to_string(),
            ));
        }

        let bitrate = non_blank(request.bitrate)
            .or_else(|| request.quality.map(|q| format!("{}k", u64::from(q) * 1000)));

        Ok(TranscodeJob {
            source: request.source,
            destination,
            video_codec: non_blank(request.video_codec),
            audio_codec: non_blank(request.audio_codec),
            resolution: non_blank(request.resolution),
            bitrate,
            custom_args: non_blank(request.custom_args),
        })
    }

    /// Recover, start the queues, and serve the API until ctrl-c.
    pub async fn run_with_server(self: Arc<Self>) -> Result<(), DaemonError> {
        self.start().await?;

        let bind = self.config.api.bind.clone();
        info!(%bind, "Serving task API");
        run_api_server(Arc::clone(&self), &bind, shutdown_signal())
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))?;

        info!("Shutting down; running tasks stay active for recovery");
        Ok(())
    }

    /// Tool executable of the download domain.
    pub fn fetch_tool(&self) -> &Path {
        &self.config.tools.fetch
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `<stem>_converted.<format>` next to the source.
fn converted_path(source: &Path, format: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    source.with_file_name(format!("{}_converted.{}", stem, format.trim_start_matches('.')))
}

/// Display name of a locator: its `dn` parameter when present.
fn display_name(locator: &str) -> String {
    locator
        .split_once('?')
        .map(|(_, query)| query)
        .into_iter()
        .flat_map(|query| query.split('&'))
        .find_map(|pair| pair.strip_prefix("dn="))
        .filter(|name| !name.is_empty())
        .map(|name| name.replace('+', " "))
        .unwrap_or_else(|| locator.to_string())
}
