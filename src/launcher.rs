//! Process launch, supervision, and the stop protocol.
//!
//! The start protocol pins the central invariant — no byte of user code
//! runs outside the cgroup — by having the child attach itself: a
//! pre-exec hook writes the child's own pid into `cgroup.procs` between
//! fork and exec, before the requested program exists in the process
//! image. The parent wires the child's stdout/stderr into the job's log
//! buffer and hands the child to a reaper task that finalizes the record
//! on termination.

use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use std::ffi::CString;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::cgroup::{Cgroup, JobLimits};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::job::{Job, JobStatus};
use crate::logbuf::LogBuffer;
use crate::registry::JobRegistry;

/// Read size for the pipe drain loops.
const PIPE_BUF: usize = 8192;

/// What to run and under which limits.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment for the child; the parent environment is inherited.
    pub env: Vec<(String, String)>,
    /// Working directory for the child.
    pub cwd: Option<String>,
    pub limits: JobLimits,
}

/// Outcome of a stop request. Both variants are success; `AlreadyTerminal`
/// is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The job was signaled and has reached a terminal status.
    Stopped,
    /// The job was already terminal when stop arrived.
    AlreadyTerminal,
}

impl StopOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StopOutcome::Stopped => "stopped",
            StopOutcome::AlreadyTerminal => "already_terminal",
        }
    }
}

/// Run the start protocol: cgroup, pipes, confined child, readers, reaper.
/// Returns the new Job Identifier; on the runtime-failure path (exec could
/// not run) the identifier refers to a record already in terminal `Failed`
/// status, per the start contract.
pub(crate) async fn start(
    registry: &Arc<JobRegistry>,
    config: &Config,
    spec: LaunchSpec,
) -> Result<String> {
    let job_id = Ulid::new().to_string();
    let cgroup = Cgroup::create(&config.cgroup_root, &job_id, &spec.limits)?;

    let procs = match cgroup.procs_cstring() {
        Ok(p) => p,
        Err(e) => {
            let _ = cgroup.destroy().await;
            return Err(e);
        }
    };

    let log = LogBuffer::new(config.subscriber_buffer, config.lag_threshold_bytes);

    let mut cmd = std::process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    // SAFETY: the hook runs between fork and exec and performs only
    // async-signal-safe syscalls (open/write/close/getpid); see
    // `attach_self`.
    unsafe {
        cmd.pre_exec(move || attach_self(&procs));
    }

    let mut child = match Command::from(cmd).kill_on_drop(true).spawn() {
        Ok(child) => child,
        Err(e) => return spawn_failed(registry, job_id, cgroup, log, e).await,
    };

    let pid = match child.id() {
        Some(pid) => pid,
        None => {
            let _ = child.kill().await;
            let _ = cgroup.destroy().await;
            return Err(Error::Internal("child pid unavailable after spawn".into()));
        }
    };
    info!(job_id = %job_id, pid, program = %spec.program, "job started");

    let reader_out = spawn_pipe_reader(child.stdout.take(), Arc::clone(&log));
    let reader_err = spawn_pipe_reader(child.stderr.take(), Arc::clone(&log));

    let (job, reaped_tx) = Job::new(job_id.clone(), pid, cgroup.path().to_path_buf(), log);
    registry.insert(Arc::clone(&job));

    tokio::spawn(reap(job, child, cgroup, reader_out, reader_err, reaped_tx));

    Ok(job_id)
}

/// Spawn refused. Exec-level refusals (the program itself cannot run)
/// become a terminal `Failed` record with the error text in the log, so
/// the caller can query and stream the reason. Fork-level refusals are a
/// `StartFailed` with no record. The cgroup is destroyed either way.
async fn spawn_failed(
    registry: &Arc<JobRegistry>,
    job_id: String,
    cgroup: Cgroup,
    log: Arc<LogBuffer>,
    err: io::Error,
) -> Result<String> {
    let exec_level = matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    );
    let cgroup_path = cgroup.path().to_path_buf();
    if let Err(e) = cgroup.destroy().await {
        warn!(job_id = %job_id, error = %e, "cgroup cleanup after spawn failure");
    }
    if !exec_level {
        return Err(Error::StartFailed {
            cause: format!("spawn {job_id}: {err}"),
        });
    }

    let (job, reaped_tx) = Job::new(job_id.clone(), 0, cgroup_path, Arc::clone(&log));
    log.append(format!("{err}\n").as_bytes());
    log.close();
    job.set_status(JobStatus::Failed(err.to_string()));
    registry.insert(job);
    let _ = reaped_tx.send(true);
    info!(job_id = %job_id, error = %err, "job failed before exec");
    Ok(job_id)
}

fn spawn_pipe_reader<R>(pipe: Option<R>, log: Arc<LogBuffer>) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else { return };
        let mut buf = [0u8; PIPE_BUF];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => log.append(&buf[..n]),
                Err(e) => {
                    debug!(error = %e, "pipe read ended");
                    break;
                }
            }
        }
    })
}

/// Await the child, then finalize the record: readers joined before the
/// log closes (every byte flushed), terminal status set, cgroup removed,
/// reaper-completion fired last.
async fn reap(
    job: Arc<Job>,
    mut child: Child,
    cgroup: Cgroup,
    reader_out: JoinHandle<()>,
    reader_err: JoinHandle<()>,
    reaped_tx: watch::Sender<bool>,
) {
    let status = match child.wait().await {
        Ok(exit) => {
            if let Some(signal) = exit.signal() {
                JobStatus::Signaled(signal)
            } else {
                JobStatus::Exited(exit.code().unwrap_or(-1))
            }
        }
        Err(e) => JobStatus::Failed(format!("wait: {e}")),
    };

    let _ = reader_out.await;
    let _ = reader_err.await;
    job.log().close();
    job.set_status(status.clone());

    if let Err(e) = cgroup.destroy().await {
        warn!(job_id = %job.id, error = %e, "cgroup removal failed");
    }
    info!(job_id = %job.id, status = status.label(), "job reaped");
    let _ = reaped_tx.send(true);
}

/// The stop protocol: SIGTERM, a grace interval, then SIGKILL. Idempotent;
/// returns once the job is terminal, whatever caused the termination.
pub(crate) async fn stop(job: &Arc<Job>, grace: Duration) -> Result<StopOutcome> {
    if job.status().is_terminal() {
        debug!(job_id = %job.id, "stop on terminal job");
        return Ok(StopOutcome::AlreadyTerminal);
    }

    send_signal(job.pid, libc::SIGTERM)
        .map_err(|e| Error::Internal(format!("SIGTERM pid {}: {e}", job.pid)))?;
    info!(job_id = %job.id, pid = job.pid, "SIGTERM sent");

    if tokio::time::timeout(grace, job.wait_reaped()).await.is_err() {
        info!(
            job_id = %job.id,
            pid = job.pid,
            grace_ms = grace.as_millis() as u64,
            "grace elapsed, sending SIGKILL"
        );
        send_signal(job.pid, libc::SIGKILL)
            .map_err(|e| Error::Internal(format!("SIGKILL pid {}: {e}", job.pid)))?;
        job.wait_reaped().await;
    }
    Ok(StopOutcome::Stopped)
}

/// kill(2) with ESRCH treated as success: the process being already gone
/// is exactly the state a signal sender wants.
pub(crate) fn send_signal(pid: u32, signum: libc::c_int) -> io::Result<()> {
    // SAFETY: kill(2) is safe to call with any pid and valid signal number.
    let ret = unsafe { libc::kill(pid as libc::pid_t, signum) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

/// Pre-exec hook body: write our own pid into `cgroup.procs`.
///
/// Runs in the forked child before exec, so only async-signal-safe calls
/// are permitted: raw open/write/close and getpid, with the pid digits
/// formatted into a stack buffer. No allocation, no locks, no logging.
/// `O_CREAT` reuses the kernel-provided file on a real cgroupfs and
/// materializes it on plain-directory roots (tests, unprivileged runs).
fn attach_self(procs: &CString) -> io::Result<()> {
    unsafe {
        let fd = libc::open(
            procs.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut digits = [0u8; 16];
        let len = format_pid(libc::getpid(), &mut digits);
        let mut written = 0usize;
        while written < len {
            let n = libc::write(
                fd,
                digits[written..].as_ptr() as *const libc::c_void,
                len - written,
            );
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                libc::close(fd);
                return Err(err);
            }
            written += n as usize;
        }
        libc::close(fd);
    }
    Ok(())
}

/// Decimal-format a pid into `buf` without allocating; returns the length.
fn format_pid(pid: libc::pid_t, buf: &mut [u8; 16]) -> usize {
    let mut value = pid as u64;
    let mut reversed = [0u8; 16];
    let mut count = 0usize;
    if value == 0 {
        reversed[0] = b'0';
        count = 1;
    }
    while value > 0 {
        reversed[count] = b'0' + (value % 10) as u8;
        value /= 10;
        count += 1;
    }
    for (i, slot) in buf.iter_mut().take(count).enumerate() {
        *slot = reversed[count - 1 - i];
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_pid_renders_decimal() {
        let mut buf = [0u8; 16];
        let len = format_pid(0, &mut buf);
        assert_eq!(&buf[..len], b"0");
        let len = format_pid(7, &mut buf);
        assert_eq!(&buf[..len], b"7");
        let len = format_pid(40321, &mut buf);
        assert_eq!(&buf[..len], b"40321");
    }

    #[test]
    fn send_signal_zero_probes_own_process() {
        send_signal(std::process::id(), 0).unwrap();
    }

    #[test]
    fn send_signal_to_reaped_pid_is_success() {
        let mut child = std::process::Command::new("/bin/true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        // ESRCH from the reaped pid maps to Ok; signum 0 keeps the probe
        // harmless if the pid was recycled.
        send_signal(pid, 0).unwrap();
    }

    #[test]
    fn stop_outcome_labels() {
        assert_eq!(StopOutcome::Stopped.label(), "stopped");
        assert_eq!(StopOutcome::AlreadyTerminal.label(), "already_terminal");
    }
}
