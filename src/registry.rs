//! Thread-safe registry mapping Job Identifier to Job Record.
//!
//! Records persist after termination; only service shutdown walks the map
//! to terminate what is still live. Readers get `Arc` clones and never
//! hold the map lock while working.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::job::Job;

#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Arc<Job>) {
        self.write().insert(job.id.clone(), job);
    }

    pub fn get(&self, id: &str) -> Result<Arc<Job>> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Snapshot of every record, for shutdown sweeps and listings.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Job>>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Job>>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logbuf::LogBuffer;
    use std::path::PathBuf;

    fn job(id: &str) -> Arc<Job> {
        let (job, _tx) = Job::new(
            id.to_string(),
            1,
            PathBuf::from(format!("/tmp/jobworker/job-{id}")),
            LogBuffer::new(4, 0),
        );
        job
    }

    #[test]
    fn insert_then_get() {
        let reg = JobRegistry::new();
        reg.insert(job("a"));
        assert_eq!(reg.get("a").unwrap().id, "a");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn get_unknown_is_not_found() {
        let reg = JobRegistry::new();
        let err = reg.get("nope").unwrap_err();
        assert!(matches!(err, Error::NotFound(id) if id == "nope"));
    }

    #[test]
    fn snapshot_contains_all_records() {
        let reg = JobRegistry::new();
        assert!(reg.is_empty());
        reg.insert(job("a"));
        reg.insert(job("b"));
        let mut ids: Vec<String> = reg.jobs().iter().map(|j| j.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, ["a", "b"]);
    }
}
