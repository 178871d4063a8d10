use crate::{jobs::JobInfo, test_run::TestRun};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("No scheduler registered under '{0}'")]
    UnknownScheduler(String),
    #[error("Scheduler submission failed: {0}")]
    Schedule(String),
    #[error("Scheduler cancellation failed: {0}")]
    Cancel(String),
    #[error("Scheduler status query failed: {0}")]
    Status(String),
}

/// The capability set the coordination core needs from a batch scheduler.
///
/// Implementations (Slurm, Moab, the local raw runner) live outside this
/// crate; they own command construction and polling. The core only ever
/// submits, cancels, and asks after a job it already knows about.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Submit one scheduler job covering all of `tests`, returning the
    /// metadata to persist into the job's info file.
    fn schedule(&self, tests: &[TestRun]) -> Result<JobInfo, SchedError>;

    fn cancel(&self, info: &JobInfo) -> Result<(), SchedError>;

    fn status(&self, info: &JobInfo) -> Result<String, SchedError>;
}

/// Explicit, startup-constructed plugin map. Built once by the top-level
/// context and passed to whatever needs to dispatch by scheduler name; there
/// is deliberately no process-global registry to mutate.
#[derive(Default)]
pub struct SchedulerRegistry {
    schedulers: BTreeMap<String, Arc<dyn Scheduler>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scheduler: Arc<dyn Scheduler>) {
        self.schedulers
            .insert(scheduler.name().to_string(), scheduler);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Scheduler>, SchedError> {
        self.schedulers
            .get(name)
            .ok_or_else(|| SchedError::UnknownScheduler(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schedulers.keys().map(String::as_str)
    }
}
