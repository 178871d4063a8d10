use once_cell::sync::Lazy;
use rand::Rng;
use std::{
    ffi::OsString,
    fs,
    io::{self, ErrorKind, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, warn};

/* Advisory mutual exclusion over a shared filesystem. No daemon, no
 * database: a lock is a file created with O_CREAT|O_EXCL, holding
 * `host,user,expiration,id`. Waiters poll. A lock whose expiration passed
 * may be swept by any waiter, but only while holding the `.expired`
 * meta-lock, and the sweep itself is a single atomic rename so two sweepers
 * can never both end up believing they hold the lock.
 */

/// Pause between acquisition attempts while waiting on a held lock.
pub const SLEEP_PERIOD: Duration = Duration::from_millis(200);

/// Default lease length. Deliberately long: expiry exists only to recover
/// from holders that died without releasing, never to preempt live ones.
pub const DEFAULT_EXPIRES: Duration = Duration::from_secs(60 * 60);

/// Lease on the `.expired` meta-lock taken while sweeping a stale lock.
const META_EXPIRES: Duration = Duration::from_secs(2 * 60 * 60);

pub(crate) static HOSTNAME: Lazy<String> = Lazy::new(|| match nix::unistd::gethostname() {
    Ok(hostname) => hostname.to_string_lossy().into_owned(),
    Err(error) => {
        warn!(error = ?error, "Failed to retrieve hostname for lock identity");

        String::from("unknown")
    }
});

pub(crate) static USERNAME: Lazy<String> = Lazy::new(|| {
    match nix::unistd::User::from_uid(nix::unistd::getuid()) {
        Ok(Some(user)) => user.name,
        _ => std::env::var("USER").unwrap_or_else(|_| String::from("unknown")),
    }
});

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timed out acquiring lock at {path:?}")]
    Timeout { path: PathBuf },
    #[error("Lock I/O failure at {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Parsed payload of a lock file: `host,user,expiration_float,id`.
#[derive(Debug, Clone, PartialEq)]
struct LockContents {
    host: String,
    user: String,
    expires: f64,
    id: String,
}

impl LockContents {
    fn render(&self) -> String {
        format!("{},{},{},{}\n", self.host, self.user, self.expires, self.id)
    }

    fn parse(raw: &str) -> Option<Self> {
        let mut fields = raw.trim_end().split(',');

        let host = fields.next()?.to_string();
        let user = fields.next()?.to_string();
        let expires = fields.next()?.parse().ok()?;
        let id = fields.next()?.to_string();

        fields.next().is_none().then_some(Self {
            host,
            user,
            expires,
            id,
        })
    }

    fn expired(&self) -> bool {
        unix_now() > self.expires
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// One potential holder of the lock at `path`.
///
/// Two `FileLock` handles to the same path contend through the filesystem
/// even within one process; there is deliberately no in-process fast path.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    expires_after: Duration,
    group: Option<String>,
    id: String,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let id: u128 = rand::thread_rng().gen();

        Self {
            path: path.into(),
            expires_after: DEFAULT_EXPIRES,
            group: None,
            id: format!("{id:032x}"),
        }
    }

    pub fn expires_after(mut self, expires_after: Duration) -> Self {
        self.expires_after = expires_after;
        self
    }

    /// Group ownership to set on the lock file in shared directories.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, polling until `timeout` elapses. `None` (or a zero
    /// timeout) means a single attempt. The returned guard releases the lock
    /// when dropped, on every exit path.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<LockGuard, LockError> {
        let deadline = match timeout {
            Some(timeout) if !timeout.is_zero() => Some(Instant::now() + timeout),
            _ => None,
        };

        loop {
            if self.try_create(&self.path, self.expires_after)? {
                self.apply_group(&self.path);

                return Ok(LockGuard {
                    path: self.path.clone(),
                    id: self.id.clone(),
                });
            }

            // Held by someone. Sweep it if its lease ran out.
            if let Some(raw) = self.read_raw(&self.path)? {
                let stale = match LockContents::parse(&raw) {
                    Some(peer) => peer.expired(),
                    None => {
                        warn!(path = ?self.path, "Lock file contents are unreadable, treating as stale");

                        true
                    }
                };

                if stale && self.takeover(&raw)? {
                    self.apply_group(&self.path);

                    return Ok(LockGuard {
                        path: self.path.clone(),
                        id: self.id.clone(),
                    });
                }
            }

            let Some(deadline) = deadline else {
                return Err(LockError::Timeout {
                    path: self.path.clone(),
                });
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    path: self.path.clone(),
                });
            }

            thread::sleep(SLEEP_PERIOD.min(deadline - now));
        }
    }

    /// One O_CREAT|O_EXCL attempt. `Ok(false)` means the path is held.
    fn try_create(&self, path: &Path, expires_after: Duration) -> Result<bool, LockError> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                let contents = self.fresh_contents(expires_after);

                file.write_all(contents.render().as_bytes())
                    .and_then(|_| file.sync_all())
                    .map_err(|error| LockError::Io {
                        path: path.to_path_buf(),
                        source: error,
                    })?;

                Ok(true)
            }
            Err(error) if error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(error) => Err(LockError::Io {
                path: path.to_path_buf(),
                source: error,
            }),
        }
    }

    fn fresh_contents(&self, expires_after: Duration) -> LockContents {
        LockContents {
            host: HOSTNAME.clone(),
            user: USERNAME.clone(),
            expires: unix_now() + expires_after.as_secs_f64(),
            id: self.id.clone(),
        }
    }

    /// `Ok(None)` when the file vanished between attempts.
    fn read_raw(&self, path: &Path) -> Result<Option<String>, LockError> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(Some(raw)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(LockError::Io {
                path: path.to_path_buf(),
                source: error,
            }),
        }
    }

    /// Replace a stale lock with our own, atomically.
    ///
    /// Runs under the `.expired` meta-lock so only one waiter sweeps, and
    /// swaps via rename after re-checking the stale file is byte-identical
    /// to what we read: a release or a competing recreation in the meantime
    /// aborts the takeover instead of clobbering a live lock.
    fn takeover(&self, stale_raw: &str) -> Result<bool, LockError> {
        let meta_path = suffixed(&self.path, ".expired");

        if !self.try_create(&meta_path, META_EXPIRES)? {
            // Another waiter is sweeping. Clear the meta-lock itself if its
            // holder died mid-sweep, then let the caller retry.
            if let Some(raw) = self.read_raw(&meta_path)? {
                let dead = LockContents::parse(&raw).map_or(true, |meta| meta.expired());
                if dead {
                    let _ = fs::remove_file(&meta_path);
                }
            }

            return Ok(false);
        }

        let result = self.takeover_under_meta(stale_raw);
        if let Err(error) = fs::remove_file(&meta_path) {
            warn!(path = ?meta_path, error = ?error, "Failed to remove meta-lock after sweep");
        }

        result
    }

    fn takeover_under_meta(&self, stale_raw: &str) -> Result<bool, LockError> {
        let temp_path = suffixed(&self.path, &format!(".{}.takeover", self.id));

        if !self.try_create(&temp_path, self.expires_after)? {
            // A leftover from a crashed sweep by a previous incarnation of
            // this id; the name is unique per handle, so just replace it.
            let _ = fs::remove_file(&temp_path);
            if !self.try_create(&temp_path, self.expires_after)? {
                return Ok(false);
            }
        }

        match self.read_raw(&self.path)? {
            Some(current) if current == stale_raw => {
                fs::rename(&temp_path, &self.path).map_err(|error| LockError::Io {
                    path: self.path.clone(),
                    source: error,
                })?;

                debug!(path = ?self.path, "Swept expired lock");

                Ok(true)
            }
            _ => {
                // Released or re-acquired while we staged the swap.
                let _ = fs::remove_file(&temp_path);

                Ok(false)
            }
        }
    }

    /// Defensive permissions for shared lock directories. Failure here
    /// never affects correctness, only cleanliness; log and move on.
    fn apply_group(&self, path: &Path) {
        let Some(group) = &self.group else {
            return;
        };

        match nix::unistd::Group::from_name(group) {
            Ok(Some(entry)) => {
                if let Err(error) = nix::unistd::chown(path, None, Some(entry.gid)) {
                    warn!(path = ?path, group, error = ?error, "Failed to set lock file group");
                }
                if let Err(error) = fs::set_permissions(path, fs::Permissions::from_mode(0o660)) {
                    warn!(path = ?path, error = ?error, "Failed to set lock file mode");
                }
            }
            Ok(None) => warn!(group, "Lock file group does not exist"),
            Err(error) => warn!(group, error = ?error, "Failed to look up lock file group"),
        }
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);

    PathBuf::from(name)
}

/// Scoped ownership of an acquired lock. Dropping it releases the lock.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    id: String,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(raw) => {
                let ours = LockContents::parse(&raw).map_or(false, |held| held.id == self.id);
                if ours {
                    match fs::remove_file(&self.path) {
                        Ok(()) => debug!(path = ?self.path, "Released lock"),
                        Err(error) => {
                            warn!(path = ?self.path, error = ?error, "Failed to remove lock file on release")
                        }
                    }
                } else {
                    // Expired out from under us and swept by another waiter.
                    warn!(path = ?self.path, "Lock no longer ours on release, leaving it alone");
                }
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                warn!(path = ?self.path, "Lock file vanished before release");
            }
            Err(error) => {
                warn!(path = ?self.path, error = ?error, "Failed to read lock file on release");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn lock_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("foo.lock")
    }

    #[test]
    pub fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(lock_path(&dir));

        let guard = lock.acquire(None).unwrap();
        assert!(lock_path(&dir).exists());

        drop(guard);
        assert!(!lock_path(&dir).exists());
    }

    #[test]
    pub fn single_attempt_fails_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileLock::new(lock_path(&dir));
        let second = FileLock::new(lock_path(&dir));

        let _guard = first.acquire(None).unwrap();
        assert!(matches!(
            second.acquire(None),
            Err(LockError::Timeout { .. })
        ));
    }

    #[test]
    pub fn waiter_gets_lock_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        let guard = FileLock::new(&path).acquire(None).unwrap();
        let waiter = FileLock::new(&path);

        let handle = std::thread::spawn(move || waiter.acquire(Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(50));
        drop(guard);

        let guard = handle.join().unwrap().unwrap();
        drop(guard);
    }

    #[test]
    pub fn expired_lock_is_swept() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        // a holder that crashed an hour ago
        fs::write(&path, format!("otherhost,otheruser,{},deadbeef\n", unix_now() - 3600.0))
            .unwrap();

        let lock = FileLock::new(&path);
        let started = Instant::now();
        let guard = lock.acquire(Some(Duration::from_secs(2))).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        let raw = fs::read_to_string(&path).unwrap();
        let contents = LockContents::parse(&raw).unwrap();
        assert_ne!(contents.id, "deadbeef");

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    pub fn unreadable_lock_is_swept() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        fs::write(&path, "complete nonsense").unwrap();

        let guard = FileLock::new(&path)
            .acquire(Some(Duration::from_secs(2)))
            .unwrap();
        drop(guard);
    }

    #[test]
    pub fn stale_meta_lock_does_not_wedge_sweeping() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        fs::write(&path, format!("h,u,{},deadbeef\n", unix_now() - 3600.0)).unwrap();
        // a sweeper that died holding the meta-lock, long ago
        fs::write(
            suffixed(&path, ".expired"),
            format!("h,u,{},cafecafe\n", unix_now() - 3600.0),
        )
        .unwrap();

        let guard = FileLock::new(&path)
            .acquire(Some(Duration::from_secs(5)))
            .unwrap();
        drop(guard);
        assert!(!suffixed(&path, ".expired").exists());
    }

    #[test]
    pub fn release_leaves_foreign_lock_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        let guard = FileLock::new(&path).acquire(None).unwrap();
        // simulate a sweep by someone who decided we were dead
        fs::write(&path, format!("h,u,{},cafecafe\n", unix_now() + 3600.0)).unwrap();
        drop(guard);

        assert!(path.exists(), "foreign lock must not be deleted");
    }

    #[test]
    pub fn mutual_exclusion_under_contention() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        let holders = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                let holders = Arc::clone(&holders);

                std::thread::spawn(move || {
                    for _ in 0..5 {
                        let lock = FileLock::new(&path);
                        let guard = lock.acquire(Some(Duration::from_secs(30))).unwrap();

                        assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::sleep(Duration::from_millis(2));
                        assert_eq!(holders.fetch_sub(1, Ordering::SeqCst), 1);

                        drop(guard);
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    pub fn contents_round_trip() {
        let contents = LockContents {
            host: String::from("node01"),
            user: String::from("tester"),
            expires: 1234.5,
            id: String::from("abc123"),
        };

        assert_eq!(LockContents::parse(&contents.render()), Some(contents));
        assert_eq!(LockContents::parse("too,few"), None);
        assert_eq!(LockContents::parse("a,b,not_a_number,d"), None);
    }
}
