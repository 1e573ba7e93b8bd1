//! Queue scheduler
//!
//! One FIFO queue per domain with at most one active task. Every decision
//! that can start a process (promotion, explicit start, cancellation) runs
//! under the domain's promotion gate, so two children are never started for
//! the same domain.

use crate::pipeline::Pipeline;
use crate::process::kill_tool_process;
use crate::store::{StoreError, TaskStore};
use crate::supervisor::{ProcessSupervisor, SupervisorError};
use crate::task::{TaskRecord, TaskStatus};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Error type for scheduler operations
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("Task not found: {0}")]
    NotFound(String),

    /// Another task of the domain is already running
    #[error("Task {active} is already active")]
    Busy { active: String },

    #[error("Task {id} is {status}, not waiting")]
    NotWaiting { id: String, status: TaskStatus },
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was waiting and will never run.
    Dequeued,
    /// The task was running; its process has been signalled.
    Stopped,
    /// The task had already finished; nothing changed.
    AlreadyTerminal(TaskStatus),
}

/// Link from an active task to the activity monitoring its child.
struct ActiveHandle {
    id: String,
    pid: u32,
    kill: oneshot::Sender<()>,
}

/// FIFO scheduler for one domain.
pub struct QueueScheduler<L: Pipeline> {
    supervisor: ProcessSupervisor<L>,
    store: Arc<TaskStore<L::Job>>,
    gate: tokio::sync::Mutex<()>,
    active: Mutex<Option<ActiveHandle>>,
}

impl<L: Pipeline> QueueScheduler<L> {
    pub fn new(pipeline: L, store: Arc<TaskStore<L::Job>>) -> Arc<Self> {
        Arc::new(Self {
            supervisor: ProcessSupervisor::new(Arc::new(pipeline), Arc::clone(&store)),
            store,
            gate: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<TaskStore<L::Job>> {
        &self.store
    }

    /// Persist a new waiting task and try to start the queue.
    pub async fn enqueue(self: &Arc<Self>, job: L::Job) -> Result<String, SchedulerError> {
        let task = TaskRecord::new(job);
        let id = task.id.clone();
        self.store.update(|tasks| tasks.push(task))?;
        info!(task_id = %id, domain = %task_domain::<L>(), "Task enqueued");

        self.promote_next().await?;
        Ok(id)
    }

    /// Start the oldest waiting task if nothing is active.
    ///
    /// Returns the id of the started task. Tasks whose launch fails are
    /// marked failed by the supervisor and skipped.
    pub async fn promote_next(self: &Arc<Self>) -> Result<Option<String>, SchedulerError> {
        let _gate = self.gate.lock().await;

        loop {
            let tasks = self.store.load_all()?;
            if let Some(active) = tasks.iter().find(|t| t.is_active()) {
                info!(task_id = %active.id, "Queue busy; not promoting");
                return Ok(None);
            }
            let Some(next) = select_next(&tasks) else {
                return Ok(None);
            };
            let id = next.id.clone();

            match self.supervisor.launch(&id).await {
                Ok(run) => {
                    self.spawn_monitor(run);
                    return Ok(Some(id));
                }
                Err(SupervisorError::Store(e)) => return Err(e.into()),
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Launch failed; moving to next task");
                }
            }
        }
    }

    /// Start a specific waiting task, provided no other task is active.
    pub async fn resume(self: &Arc<Self>, id: &str) -> Result<(), SchedulerError> {
        let _gate = self.gate.lock().await;

        let tasks = self.store.load_all()?;
        if let Some(active) = tasks.iter().find(|t| t.is_active()) {
            return Err(SchedulerError::Busy {
                active: active.id.clone(),
            });
        }
        let task = tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if task.status != TaskStatus::Waiting {
            return Err(SchedulerError::NotWaiting {
                id: id.to_string(),
                status: task.status,
            });
        }

        let run = self.supervisor.launch(id).await?;
        self.spawn_monitor(run);
        Ok(())
    }

    /// Cancel a waiting or active task. Terminal tasks are left untouched.
    pub async fn cancel(self: &Arc<Self>, id: &str) -> Result<CancelOutcome, SchedulerError> {
        let (outcome, monitored) = {
            let _gate = self.gate.lock().await;

            let task = self
                .store
                .get(id)?
                .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

            match task.status {
                TaskStatus::Waiting => {
                    // Waiting tasks only leave the queue under the gate held here.
                    self.store.update(|tasks| {
                        if let Some(t) = tasks.iter_mut().find(|t| t.id == id) {
                            t.cancel();
                        }
                    })?;
                    info!(task_id = id, "Waiting task cancelled");
                    return Ok(CancelOutcome::Dequeued);
                }
                status if status.is_terminal() => {
                    return Ok(CancelOutcome::AlreadyTerminal(status));
                }
                _ => {}
            }

            let handle = {
                let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
                match active.as_ref() {
                    Some(handle) if handle.id == id => active.take(),
                    _ => None,
                }
            };

            // Termination is requested before the cancelled status is recorded.
            let monitored = match handle {
                Some(handle) => {
                    info!(task_id = id, pid = handle.pid, "Stopping active task");
                    // A monitor that already finished has recorded the real outcome.
                    let _ = handle.kill.send(());
                    true
                }
                None => {
                    // Active in the store but not monitored here, e.g. left over
                    // from another daemon instance.
                    if let Some(pid) = task.pid {
                        let tool = self.supervisor.pipeline().tool();
                        if kill_tool_process(pid, tool) {
                            info!(task_id = id, pid, "Terminated unmonitored process");
                        }
                    }
                    false
                }
            };

            let finished = self.store.update_when(|tasks| {
                match tasks.iter_mut().find(|t| t.id == id) {
                    Some(t) if !t.status.is_terminal() => {
                        t.cancel();
                        (true, None)
                    }
                    Some(t) => (false, Some(t.status)),
                    None => (false, None),
                }
            })?;

            let outcome = match finished {
                Some(status) if status != TaskStatus::Cancelled => {
                    CancelOutcome::AlreadyTerminal(status)
                }
                _ => CancelOutcome::Stopped,
            };
            (outcome, monitored)
        };

        // A signalled monitor promotes on its own once the child is gone.
        if !monitored {
            self.promote_next().await?;
        }
        Ok(outcome)
    }

    pub fn list(&self) -> Result<Vec<TaskRecord<L::Job>>, SchedulerError> {
        Ok(self.store.load_all()?)
    }

    pub fn get(&self, id: &str) -> Result<TaskRecord<L::Job>, SchedulerError> {
        self.store
            .get(id)?
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    fn spawn_monitor(self: &Arc<Self>, run: crate::supervisor::Launched<L::Meter>) {
        let (kill, cancel) = oneshot::channel();
        let id = run.id.clone();
        let pid = run.pid;
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(ActiveHandle {
            id: id.clone(),
            pid,
            kill,
        });

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = scheduler.supervisor.monitor(run, cancel).await {
                error!(task_id = %id, error = %e, "Failed to record task outcome");
            }

            {
                let mut active = scheduler
                    .active
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if active.as_ref().is_some_and(|h| h.id == id && h.pid == pid) {
                    *active = None;
                }
            }

            if let Err(e) = scheduler.promote_next().await {
                error!(error = %e, "Failed to promote next task");
            }
        });
    }
}

fn task_domain<L: Pipeline>() -> crate::task::Domain {
    <L::Job as crate::task::TaskPayload>::DOMAIN
}

/// Oldest waiting task; ties keep store order.
pub fn select_next<P>(tasks: &[TaskRecord<P>]) -> Option<&TaskRecord<P>> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Waiting)
        .fold(None, |best: Option<&TaskRecord<P>>, t| match best {
            Some(b) if b.enqueued_at <= t.enqueued_at => Some(b),
            _ => Some(t),
        })
}
