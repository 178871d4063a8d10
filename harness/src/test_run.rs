use crate::status::{states, StatusLog};
use chrono::{Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

/// Name of the per-run status log file.
pub const STATUS_FN: &str = "status";
/// Marker written by the runner once a test has fully stopped.
pub const COMPLETE_FN: &str = "RUN_COMPLETE";
/// Persisted identity of a run, for rehydration after process restart.
pub const RUN_FN: &str = "run.json";

#[derive(Error, Debug)]
pub enum TestRunError {
    #[error("Test run I/O failure at {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Test run identity file was invalid at {path:?}")]
    InvalidRunFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// `<suite>.<number>`, the name a test goes by everywhere: status displays,
/// job membership symlinks, cancellation batches.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestId {
    pub suite: String,
    pub number: u64,
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.suite, self.number)
    }
}

impl FromStr for TestId {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (suite, number) = raw.rsplit_once('.').ok_or(())?;
        if suite.is_empty() {
            return Err(());
        }
        let number = number.parse().map_err(|_| ())?;

        Ok(Self {
            suite: suite.to_string(),
            number,
        })
    }
}

/// What the coordination core knows about one test run: identity, where it
/// lives, which scheduler owns it, and which job it was submitted under.
/// Everything else about a run belongs to the config/runner layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub id: TestId,
    pub scheduler: String,
    #[serde(default)]
    pub job: Option<PathBuf>,
    #[serde(skip)]
    run_dir: PathBuf,
}

impl TestRun {
    pub fn new(
        id: TestId,
        run_dir: impl Into<PathBuf>,
        scheduler: impl Into<String>,
        job: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            scheduler: scheduler.into(),
            job,
            run_dir: run_dir.into(),
        }
    }

    /// Rehydrate from an existing run directory.
    pub fn load(run_dir: impl Into<PathBuf>) -> Result<Self, TestRunError> {
        let run_dir = run_dir.into();
        let path = run_dir.join(RUN_FN);

        let raw = std::fs::read_to_string(&path).map_err(|error| TestRunError::Io {
            path: path.clone(),
            source: error,
        })?;
        let mut run: TestRun = serde_json::from_str(&raw)
            .map_err(|error| TestRunError::InvalidRunFile { path, source: error })?;
        run.run_dir = run_dir;

        Ok(run)
    }

    /// Persist the identity file, atomically.
    pub fn save(&self) -> Result<(), TestRunError> {
        let path = self.run_dir.join(RUN_FN);
        let io_error = |error: io::Error| TestRunError::Io {
            path: path.clone(),
            source: error,
        };

        std::fs::create_dir_all(&self.run_dir).map_err(io_error)?;

        let encoded = serde_json::to_vec_pretty(self).map_err(|error| {
            TestRunError::InvalidRunFile {
                path: path.clone(),
                source: error,
            }
        })?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.run_dir).map_err(io_error)?;
        temp.write_all(&encoded).map_err(io_error)?;
        temp.persist(&path).map_err(|error| io_error(error.error))?;

        Ok(())
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn status(&self) -> StatusLog {
        StatusLog::open(self.run_dir.join(STATUS_FN))
    }

    /// Whether the run has actually stopped producing state changes. The
    /// runner writes the marker as its very last act.
    pub fn complete(&self) -> bool {
        self.run_dir.join(COMPLETE_FN).exists()
    }

    /// Record the completion marker. Called by the runner side, and by
    /// tests; the coordination core itself only ever reads it.
    pub fn mark_complete(&self) -> Result<(), TestRunError> {
        let path = self.run_dir.join(COMPLETE_FN);
        let io_error = |error: io::Error| TestRunError::Io {
            path: path.clone(),
            source: error,
        };

        let stamp = Local::now().to_rfc3339_opts(SecondsFormat::Micros, false);
        let mut temp = tempfile::NamedTempFile::new_in(&self.run_dir).map_err(io_error)?;
        writeln!(temp, "{{\"finished\": \"{stamp}\"}}").map_err(io_error)?;
        temp.persist(&path).map_err(|error| io_error(error.error))?;

        Ok(())
    }

    /// Ask the run to stop, locally: records `SCHED_CANCELLED` with the
    /// attributed reason. Never talks to the scheduler. Returns false when
    /// the run was already complete and nothing was recorded.
    pub fn cancel(&self, reason: &str) -> Result<bool, crate::status::StatusError> {
        if self.complete() {
            return Ok(false);
        }

        self.status().append(states::SCHED_CANCELLED, reason)?;

        Ok(true)
    }
}
