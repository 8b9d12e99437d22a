//! Public facade over the registry, launcher, and log buffers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::job::JobStatus;
use crate::launcher::{self, LaunchSpec, StopOutcome};
use crate::logbuf::LogReceiver;
use crate::registry::JobRegistry;

/// Point-in-time view of one job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub id: String,
    /// Meaningful only while `status` is `Running`.
    pub pid: u32,
    pub status: JobStatus,
}

pub struct JobManager {
    registry: Arc<JobRegistry>,
    config: Config,
}

impl JobManager {
    pub fn new(config: Config) -> Self {
        JobManager {
            registry: Arc::new(JobRegistry::new()),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start a confined job. Returns the new identifier once the child is
    /// running — or terminally failed, per the start contract; query the
    /// status to distinguish.
    pub async fn start(&self, spec: LaunchSpec) -> Result<String> {
        if spec.program.is_empty() {
            return Err(Error::StartFailed {
                cause: "empty program".into(),
            });
        }
        launcher::start(&self.registry, &self.config, spec).await
    }

    /// Graceful stop: SIGTERM, the configured grace interval, SIGKILL.
    /// Idempotent; stopping a terminal job reports `AlreadyTerminal`.
    pub async fn stop(&self, id: &str) -> Result<StopOutcome> {
        let job = self.registry.get(id)?;
        launcher::stop(&job, self.config.stop_grace()).await
    }

    /// Current status. No side effect observable to any other operation.
    pub fn query(&self, id: &str) -> Result<JobReport> {
        let job = self.registry.get(id)?;
        Ok(JobReport {
            id: job.id.clone(),
            pid: job.pid,
            status: job.status(),
        })
    }

    /// Subscribe to the job's combined output, replayed from byte zero.
    pub fn stream(&self, id: &str, cancel: CancellationToken) -> Result<LogReceiver> {
        let job = self.registry.get(id)?;
        Ok(Arc::clone(job.log()).subscribe(cancel))
    }

    /// Block until the job's reaper has completed, then report the terminal
    /// state.
    pub async fn wait(&self, id: &str) -> Result<JobReport> {
        let job = self.registry.get(id)?;
        job.wait_reaped().await;
        Ok(JobReport {
            id: job.id.clone(),
            pid: job.pid,
            status: job.status(),
        })
    }

    /// Terminate and reap every non-terminal job. Terminal records stay
    /// readable; no cgroup or child process survives this call.
    pub async fn shutdown(&self) {
        let jobs = self.registry.jobs();
        info!(jobs = jobs.len(), "manager shutdown");
        for job in jobs {
            if job.status().is_terminal() {
                continue;
            }
            if let Err(e) = launcher::stop(&job, self.config.stop_grace()).await {
                warn!(job_id = %job.id, error = %e, "stop during shutdown");
            }
            job.wait_reaped().await;
        }
    }
}
