use crate::{
    sync::{FileLock, LockError},
    test_run::{TestId, TestRun},
};
use rand::Rng;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fs,
    io::{self, ErrorKind, Write},
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

pub const INFO_FN: &str = "info";
pub const KICKOFF_FN: &str = "kickoff";
pub const SCHED_LOG_FN: &str = "sched.log";
pub const KICKOFF_LOG_FN: &str = "kickoff.log";
pub const NODE_INFO_FN: &str = "node_info";
pub const TESTS_DIR: &str = "tests";

/// Attempts at allocating a fresh random job directory name.
const NAME_ATTEMPTS: usize = 16;

/// Scheduler-defined job metadata (job id and friends), stored as JSON.
pub type JobInfo = BTreeMap<String, Value>;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Failed to create job entry at {path:?}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Job I/O failure at {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Job info has not been written yet at {path:?}")]
    MissingInfo { path: PathBuf },
    #[error("Job info file was invalid at {path:?}")]
    InvalidInfo {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Exhausted attempts to allocate a job directory under {root:?}")]
    NoFreeName { root: PathBuf },
    #[error("Failed to lock the jobs root for cleanup")]
    CleanupLock(#[from] LockError),
    #[error("Not a job directory: {path:?}")]
    NotADirectory { path: PathBuf },
}

/// A test that is still a resolvable member of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobMember {
    pub id: TestId,
    pub run_dir: PathBuf,
    pub working_dir: PathBuf,
}

/// Allocates and enumerates job directories under the jobs root.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    jobs_root: PathBuf,
}

impl JobRegistry {
    pub fn new(jobs_root: impl Into<PathBuf>) -> Self {
        Self {
            jobs_root: jobs_root.into(),
        }
    }

    /// Create the on-disk entry binding one scheduler submission to its
    /// member tests. Partial state on failure is left in place for
    /// diagnostics; job directories are cheap and orphans are swept by the
    /// cleanup pass, not here.
    pub fn new_job(&self, tests: &[TestRun]) -> Result<Job, JobError> {
        fs::create_dir_all(&self.jobs_root).map_err(|error| JobError::Create {
            path: self.jobs_root.clone(),
            source: error,
        })?;

        let path = self.allocate_dir()?;
        let tests_dir = path.join(TESTS_DIR);
        fs::create_dir(&tests_dir).map_err(|error| JobError::Create {
            path: tests_dir.clone(),
            source: error,
        })?;

        for test in tests {
            let link = tests_dir.join(test.id.to_string());
            symlink(test.run_dir(), &link).map_err(|error| JobError::Create {
                path: link,
                source: error,
            })?;
        }

        debug!(path = ?path, tests = tests.len(), "Created job entry");

        Ok(Job { path })
    }

    fn allocate_dir(&self) -> Result<PathBuf, JobError> {
        for _ in 0..NAME_ATTEMPTS {
            let name: u64 = rand::thread_rng().gen();
            let path = self.jobs_root.join(format!("{name:016x}"));

            match fs::create_dir(&path) {
                Ok(()) => return Ok(path),
                Err(error) if error.kind() == ErrorKind::AlreadyExists => continue,
                Err(error) => return Err(JobError::Create { path, source: error }),
            }
        }

        Err(JobError::NoFreeName {
            root: self.jobs_root.clone(),
        })
    }

    /// Every job entry currently under the jobs root.
    pub fn jobs(&self) -> Result<Vec<Job>, JobError> {
        let entries = match fs::read_dir(&self.jobs_root) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(JobError::Io {
                    path: self.jobs_root.clone(),
                    source: error,
                })
            }
        };

        let mut jobs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|error| JobError::Io {
                path: self.jobs_root.clone(),
                source: error,
            })?;

            if entry.path().is_dir() {
                jobs.push(Job { path: entry.path() });
            }
        }

        Ok(jobs)
    }

    /// Sweep every fully-drained job entry.
    ///
    /// Bulk cleanup is the one operation serialized by a coarse lock on the
    /// jobs root, so racing prune passes don't trip over each other; normal
    /// submission and per-job teardown never take it. Returns how many
    /// entries were removed.
    pub fn prune(
        &self,
        lock_path: &Path,
        timeout: Option<std::time::Duration>,
    ) -> Result<usize, JobError> {
        let lock = FileLock::new(lock_path);
        let _guard = lock.acquire(timeout)?;

        let mut removed = 0;
        for job in self.jobs()? {
            if job.safe_delete(false)? {
                removed += 1;
            }
        }

        Ok(removed)
    }
}

/// One scheduler submission, persisted as a directory.
///
/// The member set is exactly the set of still-resolvable symlinks under
/// `tests/`. A job never removes a member's symlink itself; membership only
/// shrinks when the member test's run directory is deleted elsewhere, which
/// is what makes teardown order-independent.
#[derive(Debug, Clone)]
pub struct Job {
    path: PathBuf,
}

impl Job {
    /// Rehydrate a handle from an existing job directory.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JobError> {
        let path = path.into();

        if !path.is_dir() {
            return Err(JobError::NotADirectory { path });
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The random directory name, used as the job's display handle.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }

    pub fn kickoff_path(&self) -> PathBuf {
        self.path.join(KICKOFF_FN)
    }

    pub fn sched_log_path(&self) -> PathBuf {
        self.path.join(SCHED_LOG_FN)
    }

    pub fn kickoff_log_path(&self) -> PathBuf {
        self.path.join(KICKOFF_LOG_FN)
    }

    pub fn node_info_path(&self) -> PathBuf {
        self.path.join(NODE_INFO_FN)
    }

    /// Persist scheduler metadata. Write-to-temp-then-rename, so a reader
    /// never observes a partially written info file.
    pub fn set_info(&self, info: &JobInfo) -> Result<(), JobError> {
        let path = self.path.join(INFO_FN);
        let io_error = |error: io::Error| JobError::Io {
            path: path.clone(),
            source: error,
        };

        let encoded = serde_json::to_vec_pretty(info).map_err(|error| JobError::InvalidInfo {
            path: path.clone(),
            source: error,
        })?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.path).map_err(io_error)?;
        temp.write_all(&encoded).map_err(io_error)?;
        temp.persist(&path).map_err(|error| io_error(error.error))?;

        Ok(())
    }

    pub fn info(&self) -> Result<JobInfo, JobError> {
        let path = self.path.join(INFO_FN);

        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(JobError::MissingInfo { path })
            }
            Err(error) => return Err(JobError::Io { path, source: error }),
        };

        serde_json::from_str(&raw).map_err(|error| JobError::InvalidInfo { path, source: error })
    }

    /// Resolve the still-live members. Dangling symlinks and entries whose
    /// names don't parse as test ids are skipped, never fatal.
    pub fn member_test_ids(&self) -> Result<Vec<JobMember>, JobError> {
        let tests_dir = self.path.join(TESTS_DIR);

        let entries = match fs::read_dir(&tests_dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(JobError::Io {
                    path: tests_dir,
                    source: error,
                })
            }
        };

        let mut members = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|error| JobError::Io {
                path: tests_dir.clone(),
                source: error,
            })?;

            let name = entry.file_name();
            let id: TestId = match name.to_string_lossy().parse() {
                Ok(id) => id,
                Err(()) => {
                    warn!(path = ?entry.path(), "Skipping job member link with unparseable name");

                    continue;
                }
            };

            // canonicalize fails on dangling links: the member is gone
            let run_dir = match entry.path().canonicalize() {
                Ok(run_dir) => run_dir,
                Err(_) => continue,
            };

            let working_dir = run_dir
                .parent()
                .and_then(Path::parent)
                .map(Path::to_path_buf)
                .unwrap_or_else(|| run_dir.clone());

            members.push(JobMember {
                id,
                run_dir,
                working_dir,
            });
        }

        Ok(members)
    }

    /// Delete the job directory, but only once no member remains (or when
    /// forced). Racing cleanup passes are fine: the no-op case is silent and
    /// the whole operation is idempotent. Returns whether a delete happened.
    pub fn safe_delete(&self, force: bool) -> Result<bool, JobError> {
        if !force && !self.member_test_ids()?.is_empty() {
            return Ok(false);
        }

        match fs::remove_dir_all(&self.path) {
            Ok(()) => {
                debug!(path = ?self.path, "Deleted job entry");

                Ok(true)
            }
            // someone else's cleanup pass got there first
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(true),
            Err(error) => Err(JobError::Io {
                path: self.path.clone(),
                source: error,
            }),
        }
    }
}
