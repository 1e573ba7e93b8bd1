//! Process supervisor
//!
//! Owns one child process end to end: launches it, persists the active state
//! before reading any output, feeds both output streams through the domain
//! meter, and records the terminal state once the child exits.

use crate::pipeline::{Pipeline, PrepareError};
use crate::progress::{ProgressMeter, ProgressUpdate, StreamKind};
use crate::store::{StoreError, TaskStore};
use crate::task::{TaskPayload, TaskRecord, TaskStatus};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long to wait for the output readers once the child has exited.
const READER_DRAIN: Duration = Duration::from_secs(5);

/// Longer output lines are cut; the remainder is read as the next line.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Error type for supervisor operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Task store could not be read or written
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Only waiting tasks can be launched
    #[error("Task {id} is {status}, not waiting")]
    NotWaiting { id: String, status: TaskStatus },

    /// Command could not be assembled
    #[error("Failed to prepare task: {0}")]
    Prepare(#[from] PrepareError),

    /// Executable missing or spawn failure
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// A child that has been spawned and persisted as active.
pub struct Launched<M> {
    pub id: String,
    pub pid: u32,
    child: Child,
    meter: M,
}

/// Terminal bookkeeping result of one monitored run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    /// Killed on request while still active.
    Cancelled,
    /// The record had already left the active state (e.g. a cancel won the race).
    Superseded(TaskStatus),
    /// The record disappeared from the store.
    Missing,
}

/// Launches and monitors child processes for one domain.
pub struct ProcessSupervisor<L: Pipeline> {
    pipeline: Arc<L>,
    store: Arc<TaskStore<L::Job>>,
}

impl<L: Pipeline> Clone for ProcessSupervisor<L> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
            store: Arc::clone(&self.store),
        }
    }
}

impl<L: Pipeline> ProcessSupervisor<L> {
    pub fn new(pipeline: Arc<L>, store: Arc<TaskStore<L::Job>>) -> Self {
        Self { pipeline, store }
    }

    pub fn pipeline(&self) -> &L {
        &self.pipeline
    }

    /// Start the waiting task `id`.
    ///
    /// Preparation and spawn failures mark the task failed. On success the
    /// task is persisted as active with the child's pid before any output is
    /// read.
    pub async fn launch(&self, id: &str) -> Result<Launched<L::Meter>, SupervisorError> {
        let task = self
            .store
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if task.status != TaskStatus::Waiting {
            return Err(SupervisorError::NotWaiting {
                id: id.to_string(),
                status: task.status,
            });
        }

        let invocation = match self.pipeline.prepare(&task).await {
            Ok(invocation) => invocation,
            Err(e) => {
                warn!(task_id = id, error = %e, "Task preparation failed");
                self.mark_failed(id, &e.to_string())?;
                return Err(e.into());
            }
        };
        let command_line = invocation.command_line();

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let program = invocation.program.display().to_string();
                let reason = format!("failed to launch {}: {}", program, source);
                warn!(task_id = id, error = %reason, "Task launch failed");
                self.mark_failed(id, &reason)?;
                return Err(SupervisorError::Launch { program, source });
            }
        };
        let pid = child.id().unwrap_or_default();

        let persisted = self.store.try_update(|tasks| {
            let task = find_mut(tasks, id)?;
            if task.status != TaskStatus::Waiting {
                return Err(SupervisorError::NotWaiting {
                    id: id.to_string(),
                    status: task.status,
                });
            }
            task.activate(pid, command_line.clone());
            Ok(())
        });
        if let Err(e) = persisted {
            if let Err(kill) = child.start_kill() {
                warn!(task_id = id, pid, error = %kill, "Failed to kill unrecorded child");
            }
            return Err(e);
        }

        info!(task_id = id, pid, command = %command_line, "Task started");
        Ok(Launched {
            id: id.to_string(),
            pid,
            child,
            meter: self.pipeline.meter(),
        })
    }

    /// Follow a launched child until it exits, then record the outcome.
    ///
    /// Resolving `cancel` kills the child and records the task as cancelled,
    /// unless it already reached a terminal state.
    pub async fn monitor(
        &self,
        run: Launched<L::Meter>,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<RunOutcome, StoreError> {
        let Launched {
            id,
            pid,
            mut child,
            meter,
        } = run;
        let meter = Arc::new(Mutex::new(meter));

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(
                stdout,
                StreamKind::Stdout,
                Arc::clone(&meter),
                Arc::clone(&self.store),
                id.clone(),
                pid,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(
                stderr,
                StreamKind::Stderr,
                Arc::clone(&meter),
                Arc::clone(&self.store),
                id.clone(),
                pid,
            )));
        }

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            Ok(()) = &mut cancel => None,
        };
        let cancelled = exited.is_none();
        let status = match exited {
            Some(status) => status,
            None => {
                info!(task_id = %id, pid, "Terminating child process");
                if let Err(e) = child.start_kill() {
                    warn!(task_id = %id, pid, error = %e, "Failed to terminate child process");
                }
                child.wait().await
            }
        };

        for reader in readers {
            drain(reader, &id).await;
        }

        let lines = meter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lines_observed();
        self.finalize(&id, pid, status, cancelled, lines)
    }

    /// Record the exit outcome unless the task already left the active state.
    fn finalize(
        &self,
        id: &str,
        pid: u32,
        status: io::Result<ExitStatus>,
        cancelled: bool,
        lines: u64,
    ) -> Result<RunOutcome, StoreError> {
        let outcome = self.store.update_when(|tasks| {
            let task = match tasks.iter_mut().find(|t| t.id == id) {
                Some(task) => task,
                None => return (false, RunOutcome::Missing),
            };
            if !task.is_active() || task.pid != Some(pid) {
                return (false, RunOutcome::Superseded(task.status));
            }

            if cancelled {
                task.cancel();
                return (true, RunOutcome::Cancelled);
            }

            match &status {
                Ok(exit) if exit.success() => {
                    task.complete();
                    (true, RunOutcome::Completed)
                }
                Ok(exit) => {
                    let reason = task.error.clone().unwrap_or_else(|| describe_exit(exit));
                    task.fail(&reason);
                    (true, RunOutcome::Failed(reason))
                }
                Err(e) => {
                    let reason = task
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("failed to wait for process: {}", e));
                    task.fail(&reason);
                    (true, RunOutcome::Failed(reason))
                }
            }
        })?;

        match &outcome {
            RunOutcome::Completed if lines == 0 => {
                warn!(task_id = id, pid, "Process exited cleanly without any output; trusting exit status");
            }
            RunOutcome::Completed => info!(task_id = id, pid, "Task completed"),
            RunOutcome::Failed(reason) => warn!(task_id = id, pid, reason = %reason, "Task failed"),
            RunOutcome::Cancelled => info!(task_id = id, pid, "Task cancelled"),
            RunOutcome::Superseded(status) => {
                info!(task_id = id, pid, %status, "Task already left active state; exit ignored")
            }
            RunOutcome::Missing => warn!(task_id = id, pid, "Task vanished from store"),
        }
        Ok(outcome)
    }

    fn mark_failed(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        self.store.update_when(|tasks| match find_mut(tasks, id) {
            Ok(task) if !task.is_terminal() => {
                task.fail(reason);
                (true, ())
            }
            _ => (false, ()),
        })
    }
}

fn find_mut<'a, P>(
    tasks: &'a mut [TaskRecord<P>],
    id: &str,
) -> Result<&'a mut TaskRecord<P>, StoreError> {
    tasks
        .iter_mut()
        .find(|t| t.id == id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

fn describe_exit(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with status {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Apply an update if `id` is still bound to the process that produced it.
fn apply_to_run<P: TaskPayload>(
    tasks: &mut [TaskRecord<P>],
    id: &str,
    pid: u32,
    update: &ProgressUpdate,
) -> bool {
    match tasks.iter_mut().find(|t| t.id == id) {
        Some(task) if task.is_active() && task.pid == Some(pid) => {
            task.apply(update);
            true
        }
        _ => false,
    }
}

/// Read the next line ended by `\n` or `\r` into `buf`.
///
/// The tools redraw status lines in place with bare carriage returns, so both
/// bytes end a line as soon as they arrive. Returns false at end of stream.
async fn read_line_any<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(!buf.is_empty());
        }

        let end = available.iter().position(|b| *b == b'\n' || *b == b'\r');
        let take = end.unwrap_or(available.len());
        let room = MAX_LINE_BYTES.saturating_sub(buf.len());
        if take > room {
            buf.extend_from_slice(&available[..room]);
            reader.consume(room);
            return Ok(true);
        }

        buf.extend_from_slice(&available[..take]);
        match end {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(true);
            }
            None => reader.consume(take),
        }
    }
}

/// Read one output stream line by line and persist what the meter extracts.
async fn pump<R, P, M>(
    reader: R,
    stream: StreamKind,
    meter: Arc<Mutex<M>>,
    store: Arc<TaskStore<P>>,
    id: String,
    pid: u32,
) where
    R: AsyncRead + Unpin + Send + 'static,
    P: TaskPayload,
    M: ProgressMeter,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match read_line_any(&mut reader, &mut buf).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                warn!(task_id = %id, %stream, error = %e, "Failed to read child output");
                break;
            }
        }

        let text = String::from_utf8_lossy(&buf);
        let line = text.trim();
        if line.is_empty() {
            continue;
        }
        debug!(task_id = %id, %stream, line, "Child output");

        let update = {
            let mut meter = meter.lock().unwrap_or_else(PoisonError::into_inner);
            meter.observe(stream, line)
        };
        let Some(update) = update else { continue };

        if let Err(e) = store.update_when(|tasks| (apply_to_run(tasks, &id, pid, &update), ())) {
            error!(task_id = %id, error = %e, "Failed to persist progress update");
        }
    }
}

async fn drain(mut reader: JoinHandle<()>, id: &str) {
    match tokio::time::timeout(READER_DRAIN, &mut reader).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task_id = id, error = %e, "Output reader task failed"),
        Err(_) => {
            warn!(task_id = id, "Output still open after exit; abandoning reader");
            reader.abort();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pipeline::fixtures::{shell_job, ShellPipeline};
    use crate::pipeline::DownloadPipeline;
    use crate::task::DownloadJob;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<TaskStore<DownloadJob>>, ProcessSupervisor<ShellPipeline>) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(TaskStore::in_dir(temp.path()));
        let supervisor = ProcessSupervisor::new(Arc::new(ShellPipeline), Arc::clone(&store));
        (temp, store, supervisor)
    }

    fn enqueue(store: &TaskStore<DownloadJob>, script: &str) -> String {
        let task = TaskRecord::new(shell_job(script));
        let id = task.id.clone();
        store.update(|tasks| tasks.push(task)).unwrap();
        id
    }

    async fn run(supervisor: &ProcessSupervisor<ShellPipeline>, id: &str) -> RunOutcome {
        let launched = supervisor.launch(id).await.unwrap();
        let (_tx, rx) = oneshot::channel();
        supervisor.monitor(launched, rx).await.unwrap()
    }

    #[tokio::test]
    async fn test_clean_exit_completes_with_progress() {
        let (_temp, store, supervisor) = setup();
        let id = enqueue(
            &store,
            "echo '1m2.5s: 1 torrents, 1 infos, 512 MB/1 GB ready, upload 3 MB, download 2 MB/s'",
        );

        assert_eq!(run(&supervisor, &id).await, RunOutcome::Completed);

        let task = store.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 1.0);
        assert!(task.pid.is_none());
        assert!(task.ended_at.is_some());
        assert_eq!(task.job.downloaded_bytes, 512 * 1024 * 1024);
        assert_eq!(task.job.total_bytes, 1024 * 1024 * 1024);
        assert!(task.command.unwrap().starts_with("sh -c"));
    }

    #[tokio::test]
    async fn test_failure_keeps_most_specific_error() {
        let (_temp, store, supervisor) = setup();
        let id = enqueue(&store, "echo 'error: tracker unreachable' >&2; exit 3");

        let outcome = run(&supervisor, &id).await;
        assert_eq!(outcome, RunOutcome::Failed("error: tracker unreachable".to_string()));

        let task = store.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("error: tracker unreachable"));
    }

    #[tokio::test]
    async fn test_failure_without_output_reports_exit_code() {
        let (_temp, store, supervisor) = setup();
        let id = enqueue(&store, "exit 2");

        assert_eq!(
            run(&supervisor, &id).await,
            RunOutcome::Failed("exited with status 2".to_string())
        );
    }

    #[tokio::test]
    async fn test_carriage_return_redraws_are_parsed() {
        let (_temp, store, supervisor) = setup();
        let id = enqueue(
            &store,
            "printf 'starting\\r4.1s: 1 torrents, 0 infos, 256 KB/1 MB ready, upload 0 B, download 128 KB/s\\r'; sleep 2",
        );

        let launched = supervisor.launch(&id).await.unwrap();
        let (_tx, rx) = oneshot::channel();

        // The redraw has no trailing newline, so it must land while the child still runs.
        let observe = async {
            for _ in 0..150 {
                let task = store.get(&id).unwrap().unwrap();
                if task.job.downloaded_bytes > 0 {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            store.get(&id).unwrap().unwrap()
        };
        let (outcome, running) = tokio::join!(supervisor.monitor(launched, rx), observe);

        assert_eq!(running.status, TaskStatus::Active);
        assert_eq!(running.job.downloaded_bytes, 256 * 1024);
        assert!((running.progress - 0.25).abs() < 1e-9);
        assert_eq!(outcome.unwrap(), RunOutcome::Completed);
    }

    #[tokio::test]
    async fn test_read_line_any_splits_on_either_terminator() {
        let input: &[u8] = b"a\rb\r\nc";
        let mut reader = BufReader::new(input);
        let mut buf = Vec::new();

        let mut lines = Vec::new();
        while read_line_any(&mut reader, &mut buf).await.unwrap() {
            lines.push(String::from_utf8(buf.clone()).unwrap());
        }
        assert_eq!(lines, ["a", "b", "", "c"]);
    }

    #[tokio::test]
    async fn test_read_line_any_caps_line_length() {
        let mut input = vec![b'x'; MAX_LINE_BYTES + 10];
        input.extend_from_slice(b"\nnext\n");
        let mut reader = BufReader::new(&input[..]);
        let mut buf = Vec::new();

        assert!(read_line_any(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf.len(), MAX_LINE_BYTES);
        assert!(read_line_any(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf, vec![b'x'; 10]);
        assert!(read_line_any(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf, b"next");
        assert!(!read_line_any(&mut reader, &mut buf).await.unwrap());
    }

    #[tokio::test]
    async fn test_active_is_persisted_before_output() {
        let (_temp, store, supervisor) = setup();
        let id = enqueue(&store, "exec sleep 5");

        let launched = supervisor.launch(&id).await.unwrap();
        let task = store.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.pid, Some(launched.pid));
        assert!(task.started_at.is_some());

        // A concurrent cancel claims the terminal state first.
        store
            .update(|tasks| tasks.iter_mut().for_each(|t| t.cancel()))
            .unwrap();
        let (tx, rx) = oneshot::channel();
        tx.send(()).unwrap();
        let outcome = supervisor.monitor(launched, rx).await.unwrap();

        assert_eq!(outcome, RunOutcome::Superseded(TaskStatus::Cancelled));
        assert_eq!(store.get(&id).unwrap().unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_signal_records_cancelled() {
        let (_temp, store, supervisor) = setup();
        let id = enqueue(&store, "exec sleep 5");

        let launched = supervisor.launch(&id).await.unwrap();
        let (tx, rx) = oneshot::channel();
        tx.send(()).unwrap();
        let outcome = supervisor.monitor(launched, rx).await.unwrap();

        assert_eq!(outcome, RunOutcome::Cancelled);
        let task = store.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.error.is_none());
        assert!(task.pid.is_none());
    }

    #[tokio::test]
    async fn test_only_waiting_tasks_launch() {
        let (_temp, store, supervisor) = setup();
        let id = enqueue(&store, "true");
        assert_eq!(run(&supervisor, &id).await, RunOutcome::Completed);

        let err = supervisor.launch(&id).await.err().unwrap();
        assert!(matches!(
            err,
            SupervisorError::NotWaiting {
                status: TaskStatus::Completed,
                ..
            }
        ));
        assert!(matches!(
            supervisor.launch("missing").await,
            Err(SupervisorError::Store(StoreError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_missing_executable_fails_task() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(TaskStore::<DownloadJob>::in_dir(temp.path()));
        let supervisor = ProcessSupervisor::new(
            Arc::new(DownloadPipeline::new("/nonexistent/torrent")),
            Arc::clone(&store),
        );
        let task = TaskRecord::new(DownloadJob {
            locator: "magnet:?xt=urn:btih:abc".to_string(),
            output_dir: temp.path().join("out"),
            name: "abc".to_string(),
            ..Default::default()
        });
        let id = task.id.clone();
        store.save_all(&[task]).unwrap();

        let err = supervisor.launch(&id).await.err().unwrap();
        assert!(matches!(err, SupervisorError::Launch { .. }));

        let task = store.get(&id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("failed to launch /nonexistent/torrent"));
        assert!(task.pid.is_none());
    }
}
