//! Task Daemon
//!
//! Background service that runs download and transcode tasks through
//! external tools, one at a time per domain, with durable task state,
//! progress tracking and recovery after restarts.

pub mod api;
pub mod daemon;
pub mod encode;
pub mod locator;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod recovery;
pub mod scheduler;
pub mod startup;
pub mod store;
pub mod supervisor;
pub mod task;

pub use taskd_config as config;
pub use taskd_config::Config;
pub use api::{create_api_router, run_api_server, ServerError};
pub use daemon::{Daemon, DaemonError, DownloadRequest, TranscodeRequest};
pub use encode::{select_plan, AccelPath, EncodePlan, HostCapabilities, SystemHost};
pub use locator::{resolve_locator, resolve_locator_base64, LocatorError};
pub use pipeline::{DownloadPipeline, Invocation, Pipeline, PrepareError, TranscodePipeline};
pub use progress::{DownloadMeter, ProgressMeter, ProgressUpdate, StreamKind, TranscodeMeter};
pub use recovery::{recover, RecoveryReport};
pub use scheduler::{CancelOutcome, QueueScheduler, SchedulerError};
pub use startup::{
    check_encoder_available, check_fetch_tool, parse_ffmpeg_version, run_startup_checks,
    StartupError,
};
pub use store::{StoreError, TaskStore};
pub use supervisor::{Launched, ProcessSupervisor, RunOutcome, SupervisorError};
pub use task::{
    DownloadJob, Domain, TaskPayload, TaskRecord, TaskStatus, TranscodeJob,
};
