use crate::status::{states, StatusLog};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, warn};

/// One progress note, mirrored to every permutation sharing the build.
#[derive(Debug, Clone)]
pub struct BuildNote {
    pub when: DateTime<Local>,
    pub state: String,
    pub note: String,
}

#[derive(Debug, Default)]
struct TrackerState {
    status: String,
    failed: bool,
    notes: Vec<BuildNote>,
}

/// Shared progress record for one build hash.
///
/// Every permutation that registers for the hash holds the same tracker;
/// exactly one of them performs the physical build, the rest watch this.
#[derive(Debug)]
pub struct BuildTracker {
    hash: String,
    /// Serializes same-process builders of this hash.
    pub(super) gate: Arc<Mutex<()>>,
    state: Mutex<TrackerState>,
}

impl BuildTracker {
    pub(super) fn new(hash: String) -> Self {
        Self {
            hash,
            gate: Arc::new(Mutex::new(())),
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn status(&self) -> String {
        self.state.lock().status.clone()
    }

    /// Sticky: once a builder fails, the hash stays failed for the life of
    /// this process. Retrying is a caller decision.
    pub fn failed(&self) -> bool {
        self.state.lock().failed
    }

    pub fn notes(&self) -> Vec<BuildNote> {
        self.state.lock().notes.clone()
    }

    fn record(&self, state: &str, note: &str, failed: bool) {
        let mut shared = self.state.lock();

        shared.status = state.to_string();
        shared.failed |= failed;
        shared.notes.push(BuildNote {
            when: Local::now(),
            state: state.to_string(),
            note: note.to_string(),
        });
    }
}

/// A single permutation's view of a shared build.
///
/// Progress and failure reporting goes to the shared tracker and, when the
/// permutation has a status log, to that log as well.
#[derive(Debug, Clone)]
pub struct BuildHandle {
    test_id: String,
    tracker: Arc<BuildTracker>,
    status: Option<StatusLog>,
}

impl BuildHandle {
    pub(super) fn new(test_id: String, tracker: Arc<BuildTracker>, status: Option<StatusLog>) -> Self {
        Self {
            test_id,
            tracker,
            status,
        }
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn tracker(&self) -> &Arc<BuildTracker> {
        &self.tracker
    }

    pub fn failed(&self) -> bool {
        self.tracker.failed()
    }

    /// Report routine progress. `state` defaults to `BUILDING`.
    pub fn update(&self, note: &str, state: Option<&str>) {
        let state = state.unwrap_or(states::BUILDING);

        self.tracker.record(state, note, false);
        self.log(state, note);
    }

    pub fn warn(&self, note: &str) {
        warn!(test = %self.test_id, hash = %self.tracker.hash, note, "Build warning");

        self.tracker.record(states::BUILDING, note, false);
        self.log(states::BUILDING, note);
    }

    /// An error in the harness while building. Sticky.
    pub fn error(&self, note: &str) {
        self.terminal(states::BUILD_ERROR, note);
    }

    /// The build itself failed (compiler error, etc.). Sticky.
    pub fn fail(&self, note: &str) {
        self.terminal(states::BUILD_FAILED, note);
    }

    /// The builder could not get the build lock in time. Sticky.
    pub fn timeout(&self, note: &str) {
        self.terminal(states::BUILD_TIMEOUT, note);
    }

    fn terminal(&self, state: &str, note: &str) {
        error!(test = %self.test_id, hash = %self.tracker.hash, state, note, "Build failed");

        self.tracker.record(state, note, true);
        self.log(state, note);
    }

    fn log(&self, state: &str, note: &str) {
        let Some(status) = &self.status else {
            return;
        };

        if let Err(error) = status.append(state, note) {
            error!(test = %self.test_id, error = ?error, "Failed to append build state to status log");
        }
    }
}
