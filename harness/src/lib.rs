//! Build and job lifecycle coordination for a shared-filesystem test
//! harness: advisory file locks with lease expiry, per-hash build
//! de-duplication, append-only status logs, refcounted job entries and
//! batch cancellation. All coordination runs through the working
//! directory; there is no daemon and no database.

pub mod build;
pub mod cancel;
pub mod config;
pub mod jobs;
pub mod sched;
pub mod status;
pub mod sync;
pub mod test_run;

pub use build::{BuildCoordinator, BuildError, BuildHandle, BuildPermit, LockScope};
pub use cancel::{cancel_tests, CancelError, CancelResult};
pub use config::{HarnessConfig, WorkingDir};
pub use jobs::{Job, JobError, JobInfo, JobRegistry};
pub use sched::{SchedError, Scheduler, SchedulerRegistry};
pub use status::{StatusEntry, StatusError, StatusLog, LINE_MAX};
pub use sync::{FileLock, LockError, LockGuard};
pub use test_run::{TestId, TestRun};
