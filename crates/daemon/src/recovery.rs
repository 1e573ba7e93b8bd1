//! Startup recovery of tasks left active by a previous run.

use crate::process::kill_tool_process;
use crate::store::{StoreError, TaskStore};
use crate::task::{Domain, TaskPayload};
use std::path::Path;
use tracing::{info, warn};

/// What recovery changed in one domain.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecoveryReport {
    pub domain: Option<Domain>,
    /// Tasks returned to the waiting state.
    pub demoted: Vec<String>,
    /// Orphaned children that were still running and got killed.
    pub terminated: Vec<u32>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.demoted.is_empty() && self.terminated.is_empty()
    }
}

/// Demote every `active` record of the store to `waiting`.
///
/// No process survives a daemon restart in a monitored state, so any active
/// record is orphaned. A still-running orphan is killed when its executable
/// matches `tool`. Running this twice changes nothing the second time.
pub fn recover<P: TaskPayload>(
    store: &TaskStore<P>,
    tool: &Path,
) -> Result<RecoveryReport, StoreError> {
    let report = store.update_when(|tasks| {
        let mut report = RecoveryReport {
            domain: Some(P::DOMAIN),
            ..Default::default()
        };

        for task in tasks.iter_mut().filter(|t| t.is_active()) {
            if let Some(pid) = task.pid {
                if kill_tool_process(pid, tool) {
                    warn!(task_id = %task.id, pid, "Killed orphaned process from previous run");
                    report.terminated.push(pid);
                }
            }
            task.demote();
            report.demoted.push(task.id.clone());
        }

        (!report.demoted.is_empty(), report)
    })?;

    if report.is_empty() {
        info!(domain = %P::DOMAIN, "No orphaned tasks to recover");
    } else {
        info!(
            domain = %P::DOMAIN,
            demoted = report.demoted.len(),
            terminated = report.terminated.len(),
            "Recovered orphaned tasks"
        );
    }
    Ok(report)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::task::{DownloadJob, TaskRecord, TaskStatus};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn job(name: &str) -> DownloadJob {
        DownloadJob {
            locator: format!("magnet:?xt=urn:btih:{}", name),
            output_dir: PathBuf::from("/tmp"),
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_orphans_are_demoted_and_others_untouched() {
        let temp = TempDir::new().unwrap();
        let store = TaskStore::<DownloadJob>::in_dir(temp.path());

        let mut orphan = TaskRecord::new(job("a"));
        orphan.activate(dead_pid(), "torrent download a".to_string());
        orphan.progress = 0.4;
        let mut done = TaskRecord::new(job("b"));
        done.complete();
        let waiting = TaskRecord::new(job("c"));
        store
            .save_all(&[orphan.clone(), done.clone(), waiting.clone()])
            .unwrap();

        let report = recover(&store, Path::new("torrent")).unwrap();
        assert_eq!(report.domain, Some(Domain::Download));
        assert_eq!(report.demoted, vec![orphan.id.clone()]);
        assert!(report.terminated.is_empty());

        let tasks = store.load_all().unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Waiting);
        assert!(tasks[0].pid.is_none());
        assert_eq!(tasks[0].progress, 0.4);
        assert_eq!(tasks[1], done);
        assert_eq!(tasks[2], waiting);
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = TaskStore::<DownloadJob>::in_dir(temp.path());
        let mut orphan = TaskRecord::new(job("a"));
        orphan.activate(dead_pid(), "torrent download a".to_string());
        store.save_all(&[orphan]).unwrap();

        let first = recover(&store, Path::new("torrent")).unwrap();
        let after_first = std::fs::read_to_string(store.path()).unwrap();
        let second = recover(&store, Path::new("torrent")).unwrap();

        assert_eq!(first.demoted.len(), 1);
        assert!(second.is_empty());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), after_first);
    }

    #[test]
    fn test_live_orphan_of_tool_is_killed() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let tool = crate::process::process_exe(pid).expect("sleep should be visible");

        let temp = TempDir::new().unwrap();
        let store = TaskStore::<DownloadJob>::in_dir(temp.path());
        let mut orphan = TaskRecord::new(job("a"));
        orphan.activate(pid, "sleep 30".to_string());
        store.save_all(&[orphan]).unwrap();

        let report = recover(&store, &tool).unwrap();
        assert_eq!(report.terminated, vec![pid]);
        assert!(child.wait().unwrap().signal().is_some());
    }

    #[tokio::test]
    async fn test_recovered_task_restarts() {
        use crate::pipeline::fixtures::{shell_job, ShellPipeline};
        use crate::scheduler::QueueScheduler;
        use std::sync::Arc;
        use std::time::Duration;

        let temp = TempDir::new().unwrap();
        let store = Arc::new(TaskStore::<DownloadJob>::in_dir(temp.path()));
        let mut orphan = TaskRecord::new(shell_job("true"));
        orphan.activate(dead_pid(), "sh -c true".to_string());
        let id = orphan.id.clone();
        store.save_all(&[orphan]).unwrap();

        recover(store.as_ref(), Path::new("sh")).unwrap();
        let scheduler = QueueScheduler::new(ShellPipeline, Arc::clone(&store));
        assert_eq!(scheduler.promote_next().await.unwrap(), Some(id.clone()));

        for _ in 0..200 {
            if scheduler.get(&id).unwrap().status == TaskStatus::Completed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("recovered task never completed");
    }
}
