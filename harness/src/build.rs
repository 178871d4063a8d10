pub mod tracker;

use crate::{
    status::StatusLog,
    sync::{FileLock, LockError, LockGuard, DEFAULT_EXPIRES},
};
use chrono::{Local, SecondsFormat};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

pub use tracker::{BuildHandle, BuildNote, BuildTracker};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Timed out waiting for the build lock on {hash}")]
    Timeout { hash: String },
    #[error("Build lock failure")]
    Lock(#[from] LockError),
    #[error("Build I/O failure for {hash}")]
    Io {
        hash: String,
        #[source]
        source: io::Error,
    },
}

/// Where contenders for a build hash live.
///
/// Permutation fan-out within one process only needs a mutex; builds that
/// may race across processes or hosts go through a `FileLock`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LockScope {
    Process,
    Host,
}

/// Collapses concurrent build requests per hash into a single execution and
/// fans progress out to every registered permutation.
///
/// One coordinator per process, owned by the top-level context and threaded
/// through to whatever dispatches builds.
#[derive(Debug)]
pub struct BuildCoordinator {
    builds_root: PathBuf,
    lock_expires: Duration,
    trackers: Mutex<BTreeMap<String, Arc<BuildTracker>>>,
}

impl BuildCoordinator {
    pub fn new(builds_root: impl Into<PathBuf>) -> Self {
        Self {
            builds_root: builds_root.into(),
            lock_expires: DEFAULT_EXPIRES,
            trackers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn lock_expires(mut self, lock_expires: Duration) -> Self {
        self.lock_expires = lock_expires;
        self
    }

    /// Register a permutation against a build hash. Idempotent per hash:
    /// every caller gets a handle onto the same shared tracker.
    pub fn register(
        &self,
        test_id: impl Into<String>,
        hash: &str,
        status: Option<StatusLog>,
    ) -> BuildHandle {
        BuildHandle::new(test_id.into(), self.tracker(hash), status)
    }

    /// Acquire the right to build `hash`. The winner builds into
    /// `permit.build_dir()` and publishes with `permit.finish()`; everyone
    /// blocked behind it wakes up to `already_built() == true` and skips.
    pub fn acquire_build_lock(
        &self,
        hash: &str,
        timeout: Option<Duration>,
        scope: LockScope,
    ) -> Result<BuildPermit, BuildError> {
        std::fs::create_dir_all(&self.builds_root).map_err(|error| BuildError::Io {
            hash: hash.to_string(),
            source: error,
        })?;

        let guard = match scope {
            LockScope::Process => {
                let tracker = self.tracker(hash);
                let guard = match timeout {
                    Some(timeout) if !timeout.is_zero() => tracker.gate.try_lock_arc_for(timeout),
                    _ => tracker.gate.try_lock_arc(),
                }
                .ok_or_else(|| BuildError::Timeout {
                    hash: hash.to_string(),
                })?;

                PermitGuard::Process(guard)
            }
            LockScope::Host => {
                let lock = FileLock::new(self.lock_path(hash)).expires_after(self.lock_expires);
                let guard = lock.acquire(timeout).map_err(|error| match error {
                    LockError::Timeout { .. } => BuildError::Timeout {
                        hash: hash.to_string(),
                    },
                    other => BuildError::Lock(other),
                })?;

                PermitGuard::Host(guard)
            }
        };

        debug!(hash, ?scope, "Acquired build lock");

        Ok(BuildPermit {
            hash: hash.to_string(),
            build_dir: self.build_dir(hash),
            marker: self.finished_marker(hash),
            _guard: guard,
        })
    }

    /// Trackers that reported a terminal failure, for aborting dependents.
    pub fn failures(&self) -> Vec<Arc<BuildTracker>> {
        self.trackers
            .lock()
            .values()
            .filter(|tracker| tracker.failed())
            .cloned()
            .collect()
    }

    pub fn build_dir(&self, hash: &str) -> PathBuf {
        self.builds_root.join(hash)
    }

    pub fn finished_marker(&self, hash: &str) -> PathBuf {
        self.builds_root.join(format!("{hash}.finished"))
    }

    fn lock_path(&self, hash: &str) -> PathBuf {
        self.builds_root.join(format!("{hash}.lock"))
    }

    fn tracker(&self, hash: &str) -> Arc<BuildTracker> {
        self.trackers
            .lock()
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(BuildTracker::new(hash.to_string())))
            .clone()
    }
}

enum PermitGuard {
    Process(parking_lot::lock_api::ArcMutexGuard<parking_lot::RawMutex, ()>),
    Host(LockGuard),
}

/// Exclusive right to populate one build directory, released on drop.
#[must_use = "dropping the permit releases the build lock"]
pub struct BuildPermit {
    hash: String,
    build_dir: PathBuf,
    marker: PathBuf,
    _guard: PermitGuard,
}

impl BuildPermit {
    /// A finished marker is only ever written after the build directory is
    /// fully populated, so readers never need the lock.
    pub fn already_built(&self) -> bool {
        self.marker.exists()
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    /// Publish the completed build. Write-then-rename keeps a crashed
    /// publisher from leaving a half-written marker behind.
    pub fn finish(&self) -> Result<(), BuildError> {
        let io_error = |error: io::Error| BuildError::Io {
            hash: self.hash.clone(),
            source: error,
        };

        let parent = self.marker.parent().unwrap_or(Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(io_error)?;
        let stamp = Local::now().to_rfc3339_opts(SecondsFormat::Micros, false);
        temp.write_all(stamp.as_bytes()).map_err(io_error)?;

        temp.persist(&self.marker)
            .map_err(|error| io_error(error.error))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{states, StatusLog};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HASH: &str = "a1b2c3d4e5f6";

    #[test]
    pub fn singleflight_within_process() {
        for scope in [LockScope::Process, LockScope::Host] {
            let dir = tempfile::tempdir().unwrap();
            let coordinator = Arc::new(BuildCoordinator::new(dir.path().join("builds")));
            let executions = Arc::new(AtomicUsize::new(0));

            let threads: Vec<_> = (0..8)
                .map(|index| {
                    let coordinator = Arc::clone(&coordinator);
                    let executions = Arc::clone(&executions);

                    std::thread::spawn(move || {
                        let handle =
                            coordinator.register(format!("suite.{index}"), HASH, None);
                        let permit = coordinator
                            .acquire_build_lock(HASH, Some(Duration::from_secs(30)), scope)
                            .unwrap();

                        if !permit.already_built() {
                            executions.fetch_add(1, Ordering::SeqCst);
                            std::fs::create_dir_all(permit.build_dir()).unwrap();
                            std::thread::sleep(Duration::from_millis(10));
                            permit.finish().unwrap();
                            handle.update("built", Some(states::BUILD_DONE));
                        } else {
                            handle.update("reusing build", Some(states::BUILD_REUSED));
                        }
                    })
                })
                .collect();

            for thread in threads {
                thread.join().unwrap();
            }

            assert_eq!(
                executions.load(Ordering::SeqCst),
                1,
                "exactly one physical build per hash ({scope:?})"
            );
        }
    }

    #[test]
    pub fn failure_is_sticky_and_shared() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = BuildCoordinator::new(dir.path().join("builds"));

        let first = coordinator.register("suite.1", HASH, None);
        let second = coordinator.register("suite.2", HASH, None);

        assert!(!second.failed());
        first.fail("compiler exploded");
        assert!(second.failed());

        // later progress never clears the flag
        second.update("retrying anyway", None);
        assert!(first.failed());

        let failures = coordinator.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].hash(), HASH);
        assert_eq!(failures[0].status(), states::BUILDING);
    }

    #[test]
    pub fn notes_fan_out_to_all_handles() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = BuildCoordinator::new(dir.path().join("builds"));

        let first = coordinator.register("suite.1", HASH, None);
        let second = coordinator.register("suite.2", HASH, None);

        first.update("configuring", None);
        second.warn("slow filesystem");

        let notes = first.tracker().notes();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].note, "configuring");
        assert_eq!(notes[1].note, "slow filesystem");
    }

    #[test]
    pub fn lock_timeout_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = BuildCoordinator::new(dir.path().join("builds"));

        let status_path = dir.path().join("status");
        let status = StatusLog::create(&status_path).unwrap();
        let handle = coordinator.register("suite.1", HASH, Some(status.clone()));

        let permit = coordinator
            .acquire_build_lock(HASH, None, LockScope::Process)
            .unwrap();

        let blocked = coordinator.acquire_build_lock(
            HASH,
            Some(Duration::from_millis(20)),
            LockScope::Process,
        );
        assert!(matches!(blocked, Err(BuildError::Timeout { .. })));

        handle.timeout("gave up waiting for sibling build");
        assert!(handle.failed());
        assert_eq!(
            status.current().unwrap().unwrap().state,
            states::BUILD_TIMEOUT
        );

        drop(permit);
    }

    #[test]
    pub fn finish_publishes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = BuildCoordinator::new(dir.path().join("builds"));

        let permit = coordinator
            .acquire_build_lock(HASH, None, LockScope::Host)
            .unwrap();
        assert!(!permit.already_built());

        std::fs::create_dir_all(permit.build_dir()).unwrap();
        permit.finish().unwrap();
        assert!(permit.already_built());
        drop(permit);

        let permit = coordinator
            .acquire_build_lock(HASH, None, LockScope::Host)
            .unwrap();
        assert!(permit.already_built());
    }
}
