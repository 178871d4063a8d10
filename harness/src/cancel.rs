use crate::{
    jobs::Job,
    sched::SchedulerRegistry,
    status::StatusError,
    sync::{lockfile, SLEEP_PERIOD},
    test_run::{TestId, TestRun},
};
use itertools::Itertools;
use rayon::prelude::*;
use std::{
    collections::BTreeSet,
    fmt,
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Message reported for a job skipped because a sibling test outside the
/// batch is still running.
pub const UNCANCELLED_RUNNING: &str = "Uncancelled tests still running";

#[derive(Error, Debug)]
pub enum CancelError {
    #[error("Failed to record cancellation for test {test}")]
    Status {
        test: String,
        #[source]
        source: StatusError,
    },
}

/// Outcome for one scheduler job considered during a cancellation batch.
#[derive(Debug, Clone)]
pub struct CancelResult {
    pub scheduler: String,
    pub job: String,
    pub success: bool,
    pub message: String,
}

impl fmt::Display for CancelResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.success { "ok" } else { "failed" };

        write!(
            f,
            "{}/{}: {} ({})",
            self.scheduler, self.job, verdict, self.message
        )
    }
}

/// Cancel a batch of tests, then the scheduler jobs that become fully
/// cancellable as a result.
///
/// Test-level cancellation is purely local (a `SCHED_CANCELLED` status
/// record); a job is only cancelled with its scheduler once every test that
/// is a member of that job has either stopped or was itself part of this
/// batch. Per-job scheduler failures land in that job's `CancelResult` and
/// never abort the rest of the batch.
pub fn cancel_tests(
    tests: &[TestRun],
    registry: &SchedulerRegistry,
    max_wait: Duration,
) -> Result<Vec<CancelResult>, CancelError> {
    // 1. already-complete tests need nothing from us
    let pending: Vec<&TestRun> = tests.iter().filter(|test| !test.complete()).collect();

    // 2. ask each remaining test to stop, locally
    let reason = format!(
        "Cancelled by {}@{}",
        lockfile::USERNAME.as_str(),
        lockfile::HOSTNAME.as_str()
    );
    for test in &pending {
        test.cancel(&reason).map_err(|error| CancelError::Status {
            test: test.id.to_string(),
            source: error,
        })?;

        info!(test = %test.id, "Cancelled test");
    }

    // 3. bridge the race between asking and the runner actually noticing
    wait_for_quiescence(&pending, max_wait);

    // 4. every job referenced by the batch, cancellable only when no member
    //    outside the batch is still running
    let batch_ids: BTreeSet<&TestId> = tests.iter().map(|test| &test.id).collect();
    let jobs: Vec<(String, PathBuf)> = tests
        .iter()
        .filter_map(|test| {
            test.job
                .as_ref()
                .map(|job| (test.scheduler.clone(), job.clone()))
        })
        .unique()
        .sorted()
        .collect();

    Ok(jobs
        .iter()
        .map(|(scheduler_name, job_path)| cancel_job(scheduler_name, job_path, &batch_ids, registry))
        .collect())
}

fn wait_for_quiescence(pending: &[&TestRun], max_wait: Duration) {
    let deadline = Instant::now() + max_wait;

    loop {
        if pending.par_iter().all(|test| test.complete()) {
            debug!("All targeted tests have stopped");

            return;
        }

        let now = Instant::now();
        if now >= deadline {
            warn!("Gave up waiting for cancelled tests to stop, proceeding to job cancellation");

            return;
        }

        thread::sleep(SLEEP_PERIOD.min(deadline - now));
    }
}

fn cancel_job(
    scheduler_name: &str,
    job_path: &PathBuf,
    batch_ids: &BTreeSet<&TestId>,
    registry: &SchedulerRegistry,
) -> CancelResult {
    let job_name = job_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| job_path.to_string_lossy().into_owned());

    let failure = |message: String| CancelResult {
        scheduler: scheduler_name.to_string(),
        job: job_name.clone(),
        success: false,
        message,
    };

    let job = match Job::open(job_path) {
        Ok(job) => job,
        Err(error) => return failure(error.to_string()),
    };

    let members = match job.member_test_ids() {
        Ok(members) => members,
        Err(error) => return failure(error.to_string()),
    };

    // a member is safe iff it was in the batch (so it was cancelled above)
    // or it has already stopped on its own
    let all_stopped = members.iter().all(|member| {
        batch_ids.contains(&member.id) || member.run_dir.join(crate::test_run::COMPLETE_FN).exists()
    });
    if !all_stopped {
        debug!(job = %job_name, "Skipping job with live tests outside the batch");

        return failure(UNCANCELLED_RUNNING.to_string());
    }

    let scheduler = match registry.get(scheduler_name) {
        Ok(scheduler) => scheduler,
        Err(error) => return failure(error.to_string()),
    };

    let info = match job.info() {
        Ok(info) => info,
        Err(error) => return failure(error.to_string()),
    };

    match scheduler.cancel(&info) {
        Ok(()) => {
            info!(job = %job_name, scheduler = scheduler_name, "Cancelled scheduler job");

            CancelResult {
                scheduler: scheduler_name.to_string(),
                job: job_name,
                success: true,
                message: String::from("Cancelled"),
            }
        }
        Err(error) => {
            warn!(job = %job_name, error = ?error, "Scheduler refused to cancel job");

            failure(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        jobs::{JobInfo, JobRegistry},
        sched::{SchedError, Scheduler},
        status::{states, StatusLog},
        test_run::STATUS_FN,
    };
    use parking_lot::Mutex;
    use serde_json::json;
    use std::{path::Path, sync::Arc};

    /// Records cancellations instead of talking to a real scheduler.
    struct StubScheduler {
        cancelled: Mutex<Vec<String>>,
        fail_ids: Vec<String>,
    }

    impl StubScheduler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                cancelled: Mutex::new(Vec::new()),
                fail_ids: Vec::new(),
            })
        }

        fn failing_on(id: &str) -> Arc<Self> {
            Arc::new(Self {
                cancelled: Mutex::new(Vec::new()),
                fail_ids: vec![id.to_string()],
            })
        }

        fn job_id(info: &JobInfo) -> String {
            info.get("id")
                .and_then(|value| value.as_str())
                .unwrap_or("")
                .to_string()
        }
    }

    impl Scheduler for StubScheduler {
        fn name(&self) -> &str {
            "stub"
        }

        fn schedule(&self, _tests: &[TestRun]) -> Result<JobInfo, SchedError> {
            Ok(JobInfo::new())
        }

        fn cancel(&self, info: &JobInfo) -> Result<(), SchedError> {
            let id = Self::job_id(info);
            if self.fail_ids.contains(&id) {
                return Err(SchedError::Cancel(format!("scancel failed for {id}")));
            }

            self.cancelled.lock().push(id);

            Ok(())
        }

        fn status(&self, _info: &JobInfo) -> Result<String, SchedError> {
            Ok(String::from("stub"))
        }
    }

    fn make_run(working_dir: &Path, full_id: &str) -> TestRun {
        let id: TestId = full_id.parse().unwrap();
        let run_dir = working_dir.join("test_runs").join(id.to_string());
        std::fs::create_dir_all(&run_dir).unwrap();
        StatusLog::create(run_dir.join(STATUS_FN)).unwrap();

        TestRun::new(id, run_dir, "stub", None)
    }

    /// Create a job over `runs` and point each of them back at it.
    fn make_job(working_dir: &Path, sched_id: &str, runs: &mut [TestRun]) {
        let registry = JobRegistry::new(working_dir.join("jobs"));
        let job = registry.new_job(runs).unwrap();

        let mut info = JobInfo::new();
        info.insert("id".to_string(), json!(sched_id));
        job.set_info(&info).unwrap();

        for run in runs {
            run.job = Some(job.path().to_path_buf());
        }
    }

    fn registry_with(stub: &Arc<StubScheduler>) -> SchedulerRegistry {
        let mut registry = SchedulerRegistry::new();
        registry.register(Arc::clone(stub) as Arc<dyn Scheduler>);

        registry
    }

    #[test]
    pub fn partial_batches_skip_shared_jobs() {
        let dir = tempfile::tempdir().unwrap();

        // job A: both tests targeted. job B: b2 is not in the batch.
        let mut job_a = vec![make_run(dir.path(), "main.1"), make_run(dir.path(), "main.2")];
        make_job(dir.path(), "1001", &mut job_a);

        let mut job_b = vec![make_run(dir.path(), "main.3"), make_run(dir.path(), "main.4")];
        make_job(dir.path(), "1002", &mut job_b);

        let stub = StubScheduler::new();
        let registry = registry_with(&stub);

        let batch = vec![job_a[0].clone(), job_a[1].clone(), job_b[0].clone()];
        let results = cancel_tests(&batch, &registry, Duration::ZERO).unwrap();

        assert_eq!(results.len(), 2);
        let cancelled = results.iter().find(|r| r.success).unwrap();
        assert_eq!(cancelled.scheduler, "stub");
        assert_eq!(cancelled.message, "Cancelled");
        let skipped = results.iter().find(|r| !r.success).unwrap();
        assert_eq!(skipped.message, UNCANCELLED_RUNNING);

        // only job A reached the scheduler
        assert_eq!(*stub.cancelled.lock(), vec!["1001".to_string()]);

        // every targeted test was cancelled locally, the outsider untouched
        for run in [&job_a[0], &job_a[1], &job_b[0]] {
            assert_eq!(
                run.status().current().unwrap().unwrap().state,
                states::SCHED_CANCELLED
            );
        }
        assert_eq!(
            job_b[1].status().current().unwrap().unwrap().state,
            states::CREATED
        );
    }

    #[test]
    pub fn scheduler_failures_are_isolated_per_job() {
        let dir = tempfile::tempdir().unwrap();

        let mut job_a = vec![make_run(dir.path(), "main.1")];
        make_job(dir.path(), "2001", &mut job_a);
        let mut job_b = vec![make_run(dir.path(), "main.2")];
        make_job(dir.path(), "2002", &mut job_b);

        let stub = StubScheduler::failing_on("2001");
        let registry = registry_with(&stub);

        let batch = vec![job_a[0].clone(), job_b[0].clone()];
        let results = cancel_tests(&batch, &registry, Duration::ZERO).unwrap();

        assert_eq!(results.len(), 2);
        let failed = results.iter().find(|r| !r.success).unwrap();
        assert!(failed.message.contains("2001"));
        assert!(results.iter().any(|r| r.success));
        assert_eq!(*stub.cancelled.lock(), vec!["2002".to_string()]);
    }

    #[test]
    pub fn complete_tests_are_not_re_cancelled() {
        let dir = tempfile::tempdir().unwrap();

        let mut runs = vec![make_run(dir.path(), "main.1")];
        make_job(dir.path(), "3001", &mut runs);
        runs[0].status().append(states::COMPLETE, "").unwrap();
        runs[0].mark_complete().unwrap();

        let stub = StubScheduler::new();
        let registry = registry_with(&stub);

        let results = cancel_tests(&runs, &registry, Duration::ZERO).unwrap();

        // no SCHED_CANCELLED was recorded over the COMPLETE state
        assert_eq!(
            runs[0].status().current().unwrap().unwrap().state,
            states::COMPLETE
        );
        // but the now-quiet job was still cleaned up with the scheduler
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
    }

    #[test]
    pub fn waits_for_targeted_tests_to_stop() {
        let dir = tempfile::tempdir().unwrap();

        let mut runs = vec![make_run(dir.path(), "main.1")];
        make_job(dir.path(), "4001", &mut runs);

        let stub = StubScheduler::new();
        let registry = registry_with(&stub);

        let straggler = runs[0].clone();
        let marker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            straggler.mark_complete().unwrap();
        });

        let started = Instant::now();
        let results = cancel_tests(&runs, &registry, Duration::from_secs(10)).unwrap();
        marker.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(results[0].success);
    }

    #[test]
    pub fn unknown_scheduler_is_a_per_job_failure() {
        let dir = tempfile::tempdir().unwrap();

        let mut runs = vec![make_run(dir.path(), "main.1")];
        make_job(dir.path(), "5001", &mut runs);
        for run in &mut runs {
            run.scheduler = String::from("slurm");
        }

        let registry = SchedulerRegistry::new();
        let results = cancel_tests(&runs, &registry, Duration::ZERO).unwrap();

        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].message.contains("slurm"));
    }
}
