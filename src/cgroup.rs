//! cgroup v2 resource controller.
//!
//! One cgroup directory per job under the configured root, created before
//! the child is spawned and removed by the reaper after it exits. Limits
//! are a flat declarative record written once at create time; the kernel
//! rejects bad values at the write, which surfaces as `CgroupLimit`.

use std::ffi::CString;
use std::fs;
use std::io::{self, ErrorKind};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::launcher::send_signal;

/// Default root of the jobworker cgroup subtree.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/jobworker";

/// Pause between SIGKILL-ing residual members and retrying removal.
const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Removal attempts before destroy gives up.
const DESTROY_ATTEMPTS: u32 = 5;

/// CPU bandwidth cap, written to `cpu.max` as `"<quota> <period>"` in
/// microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuMax {
    pub quota_usec: u64,
    pub period_usec: u64,
}

/// Declarative per-job resource limits. `None` fields leave the controller
/// default in place; an all-`None` record still gets its own cgroup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobLimits {
    /// Relative CPU weight, 1..=10000 (`cpu.weight`).
    pub cpu_weight: Option<u32>,
    /// Absolute CPU bandwidth cap (`cpu.max`).
    pub cpu_max: Option<CpuMax>,
    /// Hard memory ceiling in bytes (`memory.max`).
    pub memory_max: Option<u64>,
    /// Relative block-I/O weight, 1..=10000 (`io.weight`).
    pub io_weight: Option<u32>,
    /// Raw per-device bandwidth line, e.g. `"8:0 rbps=1048576"` (`io.max`).
    pub io_max: Option<String>,
}

impl JobLimits {
    pub fn is_unlimited(&self) -> bool {
        self.cpu_weight.is_none()
            && self.cpu_max.is_none()
            && self.memory_max.is_none()
            && self.io_weight.is_none()
            && self.io_max.is_none()
    }
}

/// Handle to one job's cgroup directory. Owns cleanup: the launcher's
/// reaper calls [`Cgroup::destroy`] on every exit path.
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Create `<root>/job-<job_id>` and write the requested limit files.
    /// On any limit rejection the directory is removed before the error
    /// is returned, so a failed create leaves no residue.
    pub fn create(root: &Path, job_id: &str, limits: &JobLimits) -> Result<Self> {
        let path = root.join(format!("job-{job_id}"));
        fs::create_dir_all(&path).map_err(|source| Error::CgroupCreate {
            path: path.clone(),
            source,
        })?;

        // Best effort: delegate the controllers we write to the new level,
        // one write each so a controller missing from this hierarchy does
        // not block the others. A no-op when the file is absent
        // (plain-directory test roots) or the hierarchy is already
        // configured.
        let subtree = root.join("cgroup.subtree_control");
        if subtree.exists() {
            for controller in ["+cpu", "+memory", "+io"] {
                let _ = fs::write(&subtree, controller.as_bytes());
            }
        }

        let cgroup = Cgroup { path };
        if let Err(e) = cgroup.apply_limits(limits) {
            let _ = cgroup.remove_now();
            return Err(e);
        }
        debug!(path = %cgroup.path.display(), "cgroup created");
        Ok(cgroup)
    }

    fn apply_limits(&self, limits: &JobLimits) -> Result<()> {
        if let Some(weight) = limits.cpu_weight {
            self.write_limit("cpu.weight", weight.to_string())?;
        }
        if let Some(cpu) = limits.cpu_max {
            self.write_limit("cpu.max", format!("{} {}", cpu.quota_usec, cpu.period_usec))?;
        }
        if let Some(bytes) = limits.memory_max {
            self.write_limit("memory.max", bytes.to_string())?;
        }
        if let Some(weight) = limits.io_weight {
            self.write_limit("io.weight", weight.to_string())?;
        }
        if let Some(line) = &limits.io_max {
            self.write_limit("io.max", line.clone())?;
        }
        Ok(())
    }

    fn write_limit(&self, file: &'static str, value: String) -> Result<()> {
        fs::write(self.path.join(file), value.as_bytes())
            .map_err(|source| Error::CgroupLimit { file, value, source })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The process-attachment file for this cgroup.
    pub fn procs_path(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    /// `cgroup.procs` as a NUL-terminated path, pre-computed for the
    /// launcher's pre-exec hook (no allocation is allowed there).
    pub fn procs_cstring(&self) -> Result<CString> {
        CString::new(self.procs_path().as_os_str().as_bytes())
            .map_err(|e| Error::Internal(format!("cgroup path contains NUL: {e}")))
    }

    /// Attach a process by pid. Fails with `CgroupAttach` when the write is
    /// rejected, typically because the process no longer exists.
    pub fn attach(&self, pid: u32) -> Result<()> {
        let path = self.procs_path();
        fs::write(&path, pid.to_string())
            .map_err(|source| Error::CgroupAttach { pid, path, source })
    }

    /// Pids currently listed in `cgroup.procs`; empty when the cgroup is
    /// gone or has no members.
    pub fn pids(&self) -> Vec<u32> {
        let Ok(content) = fs::read_to_string(self.procs_path()) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect()
    }

    /// Remove the cgroup. Residual members are SIGKILLed and given a short
    /// drain before each removal retry. Idempotent: destroying an absent
    /// cgroup succeeds.
    pub async fn destroy(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let mut last_err: Option<io::Error> = None;
        for attempt in 0..DESTROY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(DRAIN_INTERVAL).await;
            }
            let pids = self.pids();
            for pid in &pids {
                let _ = send_signal(*pid, libc::SIGKILL);
            }
            if !pids.is_empty() {
                tokio::time::sleep(DRAIN_INTERVAL).await;
            }
            match self.remove_now() {
                Ok(()) => {
                    debug!(path = %self.path.display(), "cgroup removed");
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(Error::Internal(format!(
            "remove cgroup {}: {}",
            self.path.display(),
            last_err.map_or_else(|| "unknown".to_string(), |e| e.to_string())
        )))
    }

    /// Synchronous removal. Controller interface files are unlinked
    /// best-effort first: cgroupfs ignores the unlinks and honors only the
    /// rmdir, while plain-directory roots (tests) need the files gone.
    fn remove_now(&self) -> io::Result<()> {
        if let Ok(entries) = fs::read_dir(&self.path) {
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
        match fs::remove_dir(&self.path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Whether a cgroup v2 unified hierarchy is mounted at the standard path.
pub fn cgroup_v2_available() -> bool {
    Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_root() -> tempfile::TempDir {
        tempfile::tempdir().expect("create tempdir")
    }

    #[test]
    fn create_derives_path_from_job_id() {
        let root = tmp_root();
        let cg = Cgroup::create(root.path(), "abc123", &JobLimits::default()).unwrap();
        assert_eq!(cg.path(), root.path().join("job-abc123"));
        assert!(cg.path().is_dir());
    }

    #[test]
    fn limits_are_written_to_controller_files() {
        let root = tmp_root();
        let limits = JobLimits {
            cpu_weight: Some(200),
            cpu_max: Some(CpuMax {
                quota_usec: 50_000,
                period_usec: 100_000,
            }),
            memory_max: Some(64 * 1024 * 1024),
            io_weight: Some(80),
            io_max: Some("8:0 rbps=1048576".into()),
        };
        let cg = Cgroup::create(root.path(), "limited", &limits).unwrap();
        assert_eq!(fs::read_to_string(cg.path().join("cpu.weight")).unwrap(), "200");
        assert_eq!(
            fs::read_to_string(cg.path().join("cpu.max")).unwrap(),
            "50000 100000"
        );
        assert_eq!(
            fs::read_to_string(cg.path().join("memory.max")).unwrap(),
            "67108864"
        );
        assert_eq!(fs::read_to_string(cg.path().join("io.weight")).unwrap(), "80");
        assert_eq!(
            fs::read_to_string(cg.path().join("io.max")).unwrap(),
            "8:0 rbps=1048576"
        );
    }

    #[test]
    fn unlimited_record_writes_no_limit_files() {
        let root = tmp_root();
        let cg = Cgroup::create(root.path(), "bare", &JobLimits::default()).unwrap();
        assert!(JobLimits::default().is_unlimited());
        assert!(!cg.path().join("memory.max").exists());
        assert!(!cg.path().join("cpu.weight").exists());
    }

    #[test]
    fn attach_writes_pid_to_procs_file() {
        let root = tmp_root();
        let cg = Cgroup::create(root.path(), "attach", &JobLimits::default()).unwrap();
        cg.attach(4242).unwrap();
        assert_eq!(fs::read_to_string(cg.procs_path()).unwrap(), "4242");
        assert_eq!(cg.pids(), vec![4242]);
    }

    #[test]
    fn attach_to_destroyed_cgroup_fails() {
        let root = tmp_root();
        let cg = Cgroup::create(root.path(), "gone", &JobLimits::default()).unwrap();
        cg.remove_now().unwrap();
        let err = cg.attach(1).unwrap_err();
        assert!(matches!(err, Error::CgroupAttach { pid: 1, .. }));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let root = tmp_root();
        let cg = Cgroup::create(root.path(), "twice", &JobLimits::default()).unwrap();
        cg.attach(9999).unwrap();
        cg.destroy().await.unwrap();
        assert!(!cg.path().exists());
        cg.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn create_then_destroy_leaves_no_residue() {
        let root = tmp_root();
        let limits = JobLimits {
            memory_max: Some(1024),
            ..JobLimits::default()
        };
        let cg = Cgroup::create(root.path(), "residue", &limits).unwrap();
        cg.destroy().await.unwrap();
        assert!(!root.path().join("job-residue").exists());
    }

    #[test]
    fn unwritable_root_reports_cgroup_create() {
        let root = tmp_root();
        // Pointing the root at a regular file makes directory creation fail.
        let file_root = root.path().join("not-a-dir");
        fs::write(&file_root, b"x").unwrap();
        let err = Cgroup::create(&file_root, "x", &JobLimits::default()).unwrap_err();
        assert!(matches!(err, Error::CgroupCreate { .. }));
    }

    #[test]
    fn procs_cstring_round_trips() {
        let root = tmp_root();
        let cg = Cgroup::create(root.path(), "cstr", &JobLimits::default()).unwrap();
        let cstr = cg.procs_cstring().unwrap();
        assert_eq!(
            cstr.to_bytes(),
            cg.procs_path().as_os_str().as_bytes()
        );
    }
}
