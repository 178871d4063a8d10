use chrono::{DateTime, FixedOffset, Local, SecondsFormat};
use std::{
    fs::OpenOptions,
    io::{self, ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::warn;

/// Hard ceiling on the encoded size of one status record, newline included.
/// A record this small goes out in a single `write` call, which is what keeps
/// concurrent appenders from different hosts safe without any locking.
pub const LINE_MAX: usize = 4096;

/// Extra bytes read past `LINE_MAX` when tailing, so the final record is
/// always preceded by at least one newline from the record before it.
const TAIL_SLACK: usize = 256;

pub mod states {
    use once_cell::sync::Lazy;
    use std::collections::BTreeSet;

    pub const MAX_LENGTH: usize = 15;

    pub const CREATED: &str = "CREATED";
    pub const INVALID: &str = "INVALID";
    pub const ABORTED: &str = "ABORTED";
    pub const BUILD_WAIT: &str = "BUILD_WAIT";
    pub const BUILDING: &str = "BUILDING";
    pub const BUILD_REUSED: &str = "BUILD_REUSED";
    pub const BUILD_DONE: &str = "BUILD_DONE";
    pub const BUILD_ERROR: &str = "BUILD_ERROR";
    pub const BUILD_FAILED: &str = "BUILD_FAILED";
    pub const BUILD_TIMEOUT: &str = "BUILD_TIMEOUT";
    pub const SCHEDULED: &str = "SCHEDULED";
    pub const SCHED_ERROR: &str = "SCHED_ERROR";
    pub const SCHED_CANCELLED: &str = "SCHED_CANCELLED";
    pub const PREPPING_RUN: &str = "PREPPING_RUN";
    pub const RUNNING: &str = "RUNNING";
    pub const RUN_TIMEOUT: &str = "RUN_TIMEOUT";
    pub const RUN_ERROR: &str = "RUN_ERROR";
    pub const RUN_DONE: &str = "RUN_DONE";
    pub const RESULTS_ERROR: &str = "RESULTS_ERROR";
    pub const COMPLETE: &str = "COMPLETE";
    /// Series-level state, recorded once every member test has launched.
    pub const ALL_STARTED: &str = "ALL_STARTED";

    static KNOWN: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
        BTreeSet::from([
            CREATED,
            INVALID,
            ABORTED,
            BUILD_WAIT,
            BUILDING,
            BUILD_REUSED,
            BUILD_DONE,
            BUILD_ERROR,
            BUILD_FAILED,
            BUILD_TIMEOUT,
            SCHEDULED,
            SCHED_ERROR,
            SCHED_CANCELLED,
            PREPPING_RUN,
            RUNNING,
            RUN_TIMEOUT,
            RUN_ERROR,
            RUN_DONE,
            RESULTS_ERROR,
            COMPLETE,
            ALL_STARTED,
        ])
    });

    /// A state token must be a known, uppercase identifier of at most
    /// `MAX_LENGTH` bytes. Anything else gets folded into `INVALID`.
    pub fn validate(token: &str) -> bool {
        token.len() <= MAX_LENGTH
            && !token.is_empty()
            && token.as_bytes()[0].is_ascii_uppercase()
            && token
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
            && KNOWN.contains(token)
    }
}

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Status log I/O failure at {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Short write to status log at {path:?}")]
    ShortWrite { path: PathBuf },
}

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    pub when: DateTime<FixedOffset>,
    pub state: String,
    pub note: String,
}

/// Append-only state history for a single tracked entity (test run, series).
///
/// Records are written whole, one `write` per record, and never rewritten.
/// Multiple processes may append to the same log concurrently; each of them
/// only ever sees complete records.
#[derive(Debug, Clone)]
pub struct StatusLog {
    path: PathBuf,
}

impl StatusLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create the log with an initial `CREATED` entry, unless it already
    /// exists. Losing the creation race to another process is fine, the
    /// winner wrote the same entry.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StatusError> {
        let log = Self::open(path);

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&log.path)
        {
            Ok(mut file) => {
                let record = log.encode(states::CREATED, "");
                log.write_record(&mut file, &record)?;

                Ok(log)
            }
            Err(error) if error.kind() == ErrorKind::AlreadyExists => Ok(log),
            Err(error) => Err(StatusError::Io {
                path: log.path.clone(),
                source: error,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Invalid state tokens are replaced with `INVALID`
    /// and the rejected token is folded into the note; the note is truncated
    /// so the whole record fits in `LINE_MAX`.
    pub fn append(&self, state: &str, note: &str) -> Result<(), StatusError> {
        let record = self.encode(state, note);

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|error| StatusError::Io {
                path: self.path.clone(),
                source: error,
            })?;

        self.write_record(&mut file, &record)
    }

    /// The last valid entry, read from the tail of the file without parsing
    /// the whole history.
    pub fn current(&self) -> Result<Option<StatusEntry>, StatusError> {
        let mut file = std::fs::File::open(&self.path).map_err(|error| StatusError::Io {
            path: self.path.clone(),
            source: error,
        })?;

        let len = file
            .metadata()
            .map_err(|error| StatusError::Io {
                path: self.path.clone(),
                source: error,
            })?
            .len();
        let tail = (LINE_MAX + TAIL_SLACK) as u64;
        let start = len.saturating_sub(tail);

        let mut buffer = Vec::with_capacity(tail as usize);
        file.seek(SeekFrom::Start(start))
            .map_err(|error| StatusError::Io {
                path: self.path.clone(),
                source: error,
            })?;
        file.read_to_end(&mut buffer)
            .map_err(|error| StatusError::Io {
                path: self.path.clone(),
                source: error,
            })?;

        let text = String::from_utf8_lossy(&buffer);

        // A truncated first line parses as garbage and is skipped like any
        // other malformed record.
        Ok(text.lines().rev().find_map(|line| parse_entry(line).ok()))
    }

    /// The full, ordered history. Malformed lines are skipped with a warning.
    pub fn history(&self) -> Result<Vec<StatusEntry>, StatusError> {
        let text = std::fs::read_to_string(&self.path).map_err(|error| StatusError::Io {
            path: self.path.clone(),
            source: error,
        })?;

        Ok(text
            .lines()
            .filter_map(|line| match parse_entry(line) {
                Ok(entry) => Some(entry),
                Err(reason) => {
                    warn!(path = ?self.path, line, reason, "Skipping malformed status record");

                    None
                }
            })
            .collect())
    }

    /// Build the full encoded record, applying state validation and note
    /// truncation.
    fn encode(&self, state: &str, note: &str) -> String {
        let stamp = Local::now().to_rfc3339_opts(SecondsFormat::Micros, false);

        let (state, note) = if states::validate(state) {
            (state.to_string(), note.to_string())
        } else {
            (
                states::INVALID.to_string(),
                format!("(bad state '{state}') {note}"),
            )
        };

        // Notes are single-line by format
        let mut note = note.replace(['\n', '\r'], " ");

        // timestamp + ' ' + state + ' ' + note + '\n'
        let overhead = stamp.len() + state.len() + 3;
        let budget = LINE_MAX - overhead;
        if note.len() > budget {
            let mut cut = budget;
            while !note.is_char_boundary(cut) {
                cut -= 1;
            }
            note.truncate(cut);
        }

        format!("{stamp} {state} {note}\n")
    }

    fn write_record(&self, file: &mut std::fs::File, record: &str) -> Result<(), StatusError> {
        // One write call per record; partial writes of a <4KiB record to a
        // regular file do not happen on POSIX filesystems, but check anyway.
        let written = file
            .write(record.as_bytes())
            .map_err(|error| StatusError::Io {
                path: self.path.clone(),
                source: error,
            })?;

        if written != record.len() {
            Err(StatusError::ShortWrite {
                path: self.path.clone(),
            })
        } else {
            Ok(())
        }
    }
}

fn parse_entry(line: &str) -> Result<StatusEntry, &'static str> {
    let mut parts = line.splitn(3, ' ');

    let stamp = parts.next().ok_or("missing timestamp")?;
    let state = parts.next().ok_or("missing state")?;
    let note = parts.next().unwrap_or("");

    let when = DateTime::parse_from_rfc3339(stamp).map_err(|_| "bad timestamp")?;
    if state.is_empty() {
        return Err("empty state");
    }

    Ok(StatusEntry {
        when,
        state: state.to_string(),
        note: note.to_string(),
    })
}
