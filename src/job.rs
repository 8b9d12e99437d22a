//! The Job Record: per-job state owned by the registry.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::logbuf::LogBuffer;

/// Lifecycle status. Progresses from `Running` to exactly one terminal
/// variant and never reverses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    /// Process exited on its own; payload is the exit code.
    Exited(i32),
    /// Process was terminated by a signal; payload is the signal number.
    Signaled(i32),
    /// The job never ran or died outside the normal exit path.
    Failed(String),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Exited(_) => "exited",
            JobStatus::Signaled(_) => "signaled",
            JobStatus::Failed(_) => "failed",
        }
    }
}

/// One job. Stays in the registry after termination so status queries and
/// log replay keep working on completed jobs.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    /// Meaningful while the status is `Running`; 0 when the child never
    /// spawned.
    pub pid: u32,
    /// Where this job's cgroup lives (or lived, once reaped).
    pub cgroup_path: PathBuf,
    status: RwLock<JobStatus>,
    log: Arc<LogBuffer>,
    reaped_rx: watch::Receiver<bool>,
}

impl Job {
    /// Build a record in `Running` state. The returned sender is the
    /// reaper-completion signal: the reaper fires it exactly once, after
    /// the terminal status is set and cleanup has run.
    pub(crate) fn new(
        id: String,
        pid: u32,
        cgroup_path: PathBuf,
        log: Arc<LogBuffer>,
    ) -> (Arc<Self>, watch::Sender<bool>) {
        let (reaped_tx, reaped_rx) = watch::channel(false);
        let job = Arc::new(Job {
            id,
            pid,
            cgroup_path,
            status: RwLock::new(JobStatus::Running),
            log,
            reaped_rx,
        });
        (job, reaped_tx)
    }

    pub fn status(&self) -> JobStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Single-writer transition, called only by the reaper (and the
    /// launcher's failed-start path). A terminal status is never
    /// overwritten.
    pub(crate) fn set_status(&self, status: JobStatus) {
        let mut cell = self.status.write().unwrap_or_else(|e| e.into_inner());
        if cell.is_terminal() {
            return;
        }
        *cell = status;
    }

    pub fn log(&self) -> &Arc<LogBuffer> {
        &self.log
    }

    /// Resolves once the reaper has finished: terminal status set, log
    /// closed, cgroup removed. Any number of waiters may block here.
    pub async fn wait_reaped(&self) {
        let mut rx = self.reaped_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn is_reaped(&self) -> bool {
        *self.reaped_rx.borrow()
    }
}
