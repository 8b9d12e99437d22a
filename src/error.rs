//! Error kinds surfaced by the core.
//!
//! Collaborators map kinds to wire failure codes by matching on the enum,
//! never by inspecting messages. `code()` and `retryable()` feed the JSON
//! error envelope in [`crate::schema`].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The per-job cgroup directory could not be created.
    #[error("create cgroup {}: {source}", path.display())]
    CgroupCreate { path: PathBuf, source: io::Error },

    /// A limit file rejected its value. The partially created cgroup has
    /// already been removed when this is returned.
    #[error("write cgroup limit {file}={value}: {source}")]
    CgroupLimit {
        file: &'static str,
        value: String,
        source: io::Error,
    },

    /// Writing a pid into `cgroup.procs` failed, typically because the
    /// process no longer exists.
    #[error("attach pid {pid} to {}: {source}", path.display())]
    CgroupAttach {
        pid: u32,
        path: PathBuf,
        source: io::Error,
    },

    /// The child could not be started and no Job Record was created.
    #[error("job start failed: {cause}")]
    StartFailed { cause: String },

    /// No job with the given identifier exists in the registry.
    #[error("job not found: {0}")]
    NotFound(String),

    /// A log subscriber fell too far behind the appender and was dropped.
    /// Delivered through the subscriber's own channel; other subscribers
    /// and the appender are unaffected.
    #[error("subscriber dropped {behind} bytes behind the log head")]
    SubscriberLagged { behind: u64 },

    /// Invariant violation. The service should be shut down.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable wire code for the JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::CgroupCreate { .. } => "cgroup_create",
            Error::CgroupLimit { .. } => "cgroup_limit",
            Error::CgroupAttach { .. } => "cgroup_attach",
            Error::StartFailed { .. } => "start_failed",
            Error::NotFound(_) => "job_not_found",
            Error::SubscriberLagged { .. } => "subscriber_lagged",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller may retry the same request and expect a different
    /// outcome. Start-path failures leave no residue, so a retry is sound.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::CgroupCreate { .. }
                | Error::CgroupLimit { .. }
                | Error::CgroupAttach { .. }
                | Error::StartFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let errors = [
            Error::CgroupCreate {
                path: PathBuf::from("/x"),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            },
            Error::CgroupLimit {
                file: "memory.max",
                value: "1".into(),
                source: io::Error::from(io::ErrorKind::InvalidInput),
            },
            Error::CgroupAttach {
                pid: 1,
                path: PathBuf::from("/x/cgroup.procs"),
                source: io::Error::from(io::ErrorKind::NotFound),
            },
            Error::StartFailed { cause: "x".into() },
            Error::NotFound("id".into()),
            Error::SubscriberLagged { behind: 1 },
            Error::Internal("x".into()),
        ];
        let mut codes: Vec<&str> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn not_found_is_not_retryable() {
        assert!(!Error::NotFound("x".into()).retryable());
        assert!(!Error::Internal("x".into()).retryable());
        assert!(Error::StartFailed { cause: "x".into() }.retryable());
    }
}
