//! Task record model shared by the download and transcode domains.
//!
//! A task is persisted as one JSON object per record. The common lifecycle
//! fields live on [`TaskRecord`]; the domain payload is flattened into it.

use crate::progress::ProgressUpdate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, no process attached.
    Waiting,
    /// Bound to a running child process.
    Active,
    /// Child exited cleanly.
    Completed,
    /// Child failed to launch or exited with an error.
    Failed,
    /// Terminated on operator request.
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Waiting
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Waiting => write!(f, "waiting"),
            TaskStatus::Active => write!(f, "active"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl TaskStatus {
    /// Completed, failed and cancelled tasks never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Independent work category with its own queue and store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Download,
    Transcode,
}

impl Domain {
    /// Prefix used for generated task ids.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Domain::Download => "download",
            Domain::Transcode => "transcode",
        }
    }

    /// File name of the domain's store inside the state directory.
    pub fn store_file(&self) -> &'static str {
        match self {
            Domain::Download => "downloads.json",
            Domain::Transcode => "transcodes.json",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id_prefix())
    }
}

/// Domain-specific part of a task record.
pub trait TaskPayload:
    Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const DOMAIN: Domain;

    /// Merge domain-specific fields of a progress update.
    fn absorb(&mut self, _update: &ProgressUpdate) {}
}

/// Inputs and transfer counters of a download.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DownloadJob {
    /// Resolved fetch locator handed to the fetch tool.
    pub locator: String,
    /// Working directory of the fetch tool.
    pub output_dir: PathBuf,
    /// Human-readable name shown in listings.
    pub name: String,
    /// Bytes received so far.
    #[serde(default)]
    pub downloaded_bytes: u64,
    /// Total payload size, 0 until the tool reports it.
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub uploaded_bytes: u64,
    /// Running time reported by the fetch tool, in seconds.
    #[serde(default)]
    pub elapsed_secs: f64,
    /// Torrents and resolved metainfos the tool is currently tracking.
    #[serde(default)]
    pub torrents: u32,
    #[serde(default)]
    pub infos: u32,
}

impl TaskPayload for DownloadJob {
    const DOMAIN: Domain = Domain::Download;

    fn absorb(&mut self, update: &ProgressUpdate) {
        if let Some(transfer) = update.transfer {
            self.downloaded_bytes = transfer.done;
            self.total_bytes = transfer.total;
            self.uploaded_bytes = transfer.uploaded;
            self.elapsed_secs = transfer.elapsed_secs;
            self.torrents = transfer.torrents;
            self.infos = transfer.infos;
        }
    }
}

/// Inputs of a transcode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TranscodeJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    /// Named preset ("720p") or literal "WxH"; "original" keeps the source size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    /// Raw encoder arguments that replace the derived codec arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_args: Option<String>,
}

impl TaskPayload for TranscodeJob {
    const DOMAIN: Domain = Domain::Transcode;
}

/// A persisted unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord<P> {
    /// Stable unique identifier.
    pub id: String,
    pub status: TaskStatus,
    /// Unix timestamp (milliseconds) of the enqueue call; FIFO key.
    pub enqueued_at: i64,
    /// Domain payload.
    #[serde(flatten)]
    pub job: P,
    /// Fraction in [0, 1].
    #[serde(default)]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    /// OS process id, present only while active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Command line of the most recent launch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl<P: TaskPayload> TaskRecord<P> {
    /// Create a waiting record with a freshly generated id.
    pub fn new(job: P) -> Self {
        let now = current_timestamp_ms();
        Self {
            id: generate_task_id(P::DOMAIN, now),
            status: TaskStatus::Waiting,
            enqueued_at: now,
            job,
            progress: 0.0,
            speed: None,
            eta: None,
            pid: None,
            started_at: None,
            ended_at: None,
            error: None,
            command: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }

    /// Bind the task to a freshly spawned process.
    pub fn activate(&mut self, pid: u32, command: String) {
        self.status = TaskStatus::Active;
        self.pid = Some(pid);
        self.command = Some(command);
        self.started_at = Some(current_timestamp_ms());
        self.ended_at = None;
        self.error = None;
    }

    /// Clean exit; progress is forced to 1.0.
    pub fn complete(&mut self) {
        self.progress = 1.0;
        self.leave_active(TaskStatus::Completed);
    }

    pub fn fail(&mut self, reason: &str) {
        self.error = Some(reason.to_string());
        self.leave_active(TaskStatus::Failed);
    }

    pub fn cancel(&mut self) {
        self.leave_active(TaskStatus::Cancelled);
    }

    /// Return an orphaned active task to the queue.
    pub fn demote(&mut self) {
        self.leave_active(TaskStatus::Waiting);
    }

    fn leave_active(&mut self, status: TaskStatus) {
        if status != TaskStatus::Failed {
            self.error = None;
        }
        self.status = status;
        self.pid = None;
        self.speed = None;
        self.eta = None;
        self.ended_at = Some(current_timestamp_ms());
    }

    /// Merge a parsed progress update into the record.
    ///
    /// The fraction is clamped to [0, 1] and never moves backwards.
    pub fn apply(&mut self, update: &ProgressUpdate) {
        if let Some(fraction) = update.progress {
            let fraction = if fraction.is_finite() {
                fraction.clamp(0.0, 1.0)
            } else {
                0.0
            };
            self.progress = self.progress.max(fraction);
        }
        if let Some(speed) = &update.speed {
            self.speed = Some(speed.clone());
        }
        if let Some(eta) = &update.eta {
            self.eta = Some(eta.clone());
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        self.job.absorb(update);
    }
}

/// Get current timestamp in milliseconds.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Build an id of the form `<domain>-<millis>-<8 hex>`.
pub fn generate_task_id(domain: Domain, now_ms: i64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", domain.id_prefix(), now_ms, &suffix[..8])
}
