//! Per-domain launch preparation.
//!
//! A [`Pipeline`] turns a waiting task into the concrete command to run and
//! supplies the meter that interprets the command's output.

use crate::config::{EncoderConfig, ProgressPolicy};
use crate::encode::{build_override_args, build_transcode_args, select_plan, HostCapabilities};
use crate::progress::{DownloadMeter, ProgressMeter, TranscodeMeter};
use crate::task::{DownloadJob, TaskPayload, TaskRecord, TranscodeJob};
use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Error type for launch preparation
#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid task: {0}")]
    Invalid(String),
}

/// A fully assembled command.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
}

impl Invocation {
    /// Human-readable command line for logs and the task record.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push('"');
                line.push_str(&arg);
                line.push('"');
            } else {
                line.push_str(&arg);
            }
        }
        line
    }
}

/// Domain-specific half of the process supervisor.
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    type Job: TaskPayload;
    type Meter: ProgressMeter + 'static;

    /// Executable this domain launches.
    fn tool(&self) -> &Path;

    /// Assemble the command for `task`.
    async fn prepare(&self, task: &TaskRecord<Self::Job>) -> Result<Invocation, PrepareError>;

    /// Fresh meter for one run.
    fn meter(&self) -> Self::Meter;
}

/// Fetch tool runs: `<fetch> download <locator>` inside the output directory.
#[derive(Debug, Clone)]
pub struct DownloadPipeline {
    fetch_tool: PathBuf,
}

impl DownloadPipeline {
    pub fn new(fetch_tool: impl Into<PathBuf>) -> Self {
        Self {
            fetch_tool: fetch_tool.into(),
        }
    }
}

#[async_trait]
impl Pipeline for DownloadPipeline {
    type Job = DownloadJob;
    type Meter = DownloadMeter;

    fn tool(&self) -> &Path {
        &self.fetch_tool
    }

    async fn prepare(&self, task: &TaskRecord<DownloadJob>) -> Result<Invocation, PrepareError> {
        let locator = task.job.locator.trim();
        if locator.is_empty() {
            return Err(PrepareError::Invalid("empty fetch locator".to_string()));
        }

        tokio::fs::create_dir_all(&task.job.output_dir).await?;

        Ok(Invocation {
            program: self.fetch_tool.clone(),
            args: vec![OsString::from("download"), OsString::from(locator)],
            working_dir: Some(task.job.output_dir.clone()),
        })
    }

    fn meter(&self) -> DownloadMeter {
        DownloadMeter::new()
    }
}

/// Encoder runs with detected acceleration and derived arguments.
#[derive(Clone)]
pub struct TranscodePipeline {
    encoder: PathBuf,
    settings: EncoderConfig,
    policy: ProgressPolicy,
    host: Arc<dyn HostCapabilities>,
}

impl TranscodePipeline {
    pub fn new(
        encoder: impl Into<PathBuf>,
        settings: EncoderConfig,
        policy: ProgressPolicy,
        host: Arc<dyn HostCapabilities>,
    ) -> Self {
        Self {
            encoder: encoder.into(),
            settings,
            policy,
            host,
        }
    }
}

#[async_trait]
impl Pipeline for TranscodePipeline {
    type Job = TranscodeJob;
    type Meter = TranscodeMeter;

    fn tool(&self) -> &Path {
        &self.encoder
    }

    async fn prepare(&self, task: &TaskRecord<TranscodeJob>) -> Result<Invocation, PrepareError> {
        let job = &task.job;
        if !tokio::fs::try_exists(&job.source).await.unwrap_or(false) {
            return Err(PrepareError::Invalid(format!(
                "source file does not exist: {}",
                job.source.display()
            )));
        }

        if let Some(parent) = job.destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let custom = job
            .custom_args
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        let args = match custom {
            Some(custom) => {
                debug!(task_id = %task.id, "Using caller-supplied encoder arguments");
                build_override_args(job, custom)
            }
            None => {
                let plan = select_plan(self.host.as_ref(), job, &self.settings).await;
                debug!(task_id = %task.id, ?plan, "Selected encode plan");
                build_transcode_args(job, &plan, &self.settings)
            }
        };

        Ok(Invocation {
            program: self.encoder.clone(),
            args,
            working_dir: None,
        })
    }

    fn meter(&self) -> TranscodeMeter {
        TranscodeMeter::new(self.policy.clone())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Pipelines for exercising real processes in tests.

    use super::*;

    /// Runs each task's locator as a `sh -c` script.
    pub struct ShellPipeline;

    #[async_trait]
    impl Pipeline for ShellPipeline {
        type Job = DownloadJob;
        type Meter = DownloadMeter;

        fn tool(&self) -> &Path {
            Path::new("sh")
        }

        async fn prepare(&self, task: &TaskRecord<DownloadJob>) -> Result<Invocation, PrepareError> {
            Ok(Invocation {
                program: PathBuf::from("sh"),
                args: vec![OsString::from("-c"), OsString::from(&task.job.locator)],
                working_dir: None,
            })
        }

        fn meter(&self) -> DownloadMeter {
            DownloadMeter::new()
        }
    }

    pub fn shell_job(script: &str) -> DownloadJob {
        DownloadJob {
            locator: script.to_string(),
            output_dir: PathBuf::from("."),
            name: "script".to_string(),
            ..Default::default()
        }
    }
}
