pub mod lockfile;

pub use lockfile::{FileLock, LockError, LockGuard, DEFAULT_EXPIRES, SLEEP_PERIOD};
