//! Durable job snapshot and the single-instance lock.
//!
//! The snapshot is written to a sibling temp file and renamed over
//! `state.json`, so a reader only ever sees a complete document.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use issue_worker_common::{JobRecord, JobSnapshot, SNAPSHOT_VERSION};
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::{WorkerError, WorkerResult};

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot. A missing file is an empty state; an unreadable
    /// or unknown-version one is a configuration error.
    pub fn load(&self) -> WorkerResult<JobSnapshot> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(JobSnapshot::empty(Utc::now()));
            }
            Err(source) => {
                return Err(WorkerError::State {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let snapshot: JobSnapshot = serde_json::from_str(&raw).map_err(|e| {
            WorkerError::Configuration(format!(
                "state file {} is not valid: {}",
                self.path.display(),
                e
            ))
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(WorkerError::Configuration(format!(
                "state file {} has version {}, expected {}",
                self.path.display(),
                snapshot.version,
                SNAPSHOT_VERSION
            )));
        }
        Ok(snapshot)
    }

    /// Load and mark any job caught mid-run as failed, persisting the change.
    pub fn load_recovered(&self) -> WorkerResult<Option<JobRecord>> {
        let mut job = self.load()?.job;
        if let Some(record) = job.as_mut() {
            let interrupted = record.phase;
            if record.recover_after_restart(Utc::now()) {
                warn!(
                    job = %record.identity,
                    phase = %interrupted,
                    "job was interrupted by a restart, marking failed"
                );
                self.save(Some(record))?;
            }
        }
        Ok(job)
    }

    pub fn save(&self, job: Option<&JobRecord>) -> WorkerResult<()> {
        let snapshot = JobSnapshot {
            version: SNAPSHOT_VERSION,
            job: job.cloned(),
            saved_at: Utc::now(),
        };
        write_json_atomic(&self.path, &snapshot)
    }
}

/// Write `value` as pretty JSON via a temp file and rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> WorkerResult<()> {
    let state_err = |source| WorkerError::State {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| WorkerError::Configuration(format!("cannot encode {}: {}", path.display(), e)))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(state_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp).map_err(state_err)?;
    file.write_all(&json).map_err(state_err)?;
    file.write_all(b"\n").map_err(state_err)?;
    file.sync_all().map_err(state_err)?;
    fs::rename(&tmp, path).map_err(state_err)?;
    Ok(())
}

/// Exclusive advisory lock held for the life of a serving or running worker.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> WorkerResult<Self> {
        Self::try_acquire(path)?.ok_or_else(|| {
            WorkerError::Configuration(format!(
                "another worker already holds {}",
                path.display()
            ))
        })
    }

    /// `Ok(None)` when some other process holds the lock.
    pub fn try_acquire(path: &Path) -> WorkerResult<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| WorkerError::State {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| WorkerError::State {
                path: path.to_path_buf(),
                source,
            })?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                info!(path = %path.display(), "acquired instance lock");
                Ok(Some(Self {
                    file,
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(source) => Err(WorkerError::State {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release instance lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use issue_worker_common::{ErrorKind, JobIdentity, JobPhase};

    fn record() -> JobRecord {
        JobRecord::new(
            JobIdentity::new("acme/widgets", 7, "main").unwrap(),
            Utc::now(),
        )
    }

    #[test]
    fn missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let snapshot = store.load().unwrap();
        assert!(snapshot.job.is_none());
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
    }

    #[test]
    fn save_then_load_keeps_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state").join("state.json"));
        let job = record();
        store.save(Some(&job)).unwrap();
        assert_eq!(store.load().unwrap().job, Some(job));
        assert!(!dir.path().join("state").join("state.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        let err = StateStore::new(&path).load().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn recovery_fails_interrupted_job_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let mut job = record();
        let now = Utc::now();
        job.transition(JobPhase::Preparing, now).unwrap();
        job.transition(JobPhase::AgentRunning, now).unwrap();
        store.save(Some(&job)).unwrap();

        let recovered = store.load_recovered().unwrap().unwrap();
        assert_eq!(recovered.phase, JobPhase::Failed);
        assert_eq!(recovered.last_error.as_ref().unwrap().kind, ErrorKind::Agent);

        let reloaded = store.load().unwrap().job.unwrap();
        assert_eq!(reloaded.phase, JobPhase::Failed);
    }

    #[test]
    fn terminal_job_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let mut job = record();
        job.transition(JobPhase::Preparing, Utc::now()).unwrap();
        job.fail(JobPhase::Cancelled, ErrorKind::Cancelled, "stopped", Utc::now())
            .unwrap();
        store.save(Some(&job)).unwrap();
        assert_eq!(store.load_recovered().unwrap(), Some(job));
    }

    #[test]
    fn second_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.lock");
        let first = InstanceLock::acquire(&path).unwrap();
        assert!(InstanceLock::try_acquire(&path).unwrap().is_none());
        drop(first);
        assert!(InstanceLock::try_acquire(&path).unwrap().is_some());
    }
}
