use serde::{Deserialize, Serialize};
use std::{fs::File, io, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file")]
    Io(#[from] io::Error),
    #[error("Config file was invalid")]
    InvalidConfig(#[from] serde_yaml::Error),
}

/// Layout of the shared working directory all processes coordinate through.
///
/// Everything the harness persists lives under one root, usually on a
/// filesystem shared by every node that runs tests.
#[derive(Debug, Clone)]
pub struct WorkingDir {
    root: PathBuf,
}

impl WorkingDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// transient lock files
    pub fn locks(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// build directories keyed by build hash, plus their `.finished` markers
    pub fn builds(&self) -> PathBuf {
        self.root.join("builds")
    }

    /// one directory per scheduler submission
    pub fn jobs(&self) -> PathBuf {
        self.root.join("jobs")
    }

    /// one directory per test run
    pub fn test_runs(&self) -> PathBuf {
        self.root.join("test_runs")
    }

    /// Create the working directory skeleton if any part of it is missing.
    pub fn ensure(&self) -> Result<(), io::Error> {
        for dir in [self.locks(), self.builds(), self.jobs(), self.test_runs()] {
            std::fs::create_dir_all(dir)?;
        }

        Ok(())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// Root of the shared working directory
    pub working_dir: PathBuf,

    /// Group name applied to lock files in multi-user shared directories
    #[serde(default)]
    pub group: Option<String>,

    /// Lock lease length. Long on purpose, it only matters for crashed holders
    #[serde(default = "default_lock_expires_secs")]
    pub lock_expires_secs: u64,

    /// How long a cancellation batch waits for targeted tests to quiesce
    #[serde(default = "default_cancel_max_wait_secs")]
    pub cancel_max_wait_secs: u64,
}

impl HarnessConfig {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn working_dir(&self) -> WorkingDir {
        WorkingDir::new(&self.working_dir)
    }

    pub fn lock_expires(&self) -> Duration {
        Duration::from_secs(self.lock_expires_secs)
    }

    pub fn cancel_max_wait(&self) -> Duration {
        Duration::from_secs(self.cancel_max_wait_secs)
    }
}

fn default_lock_expires_secs() -> u64 {
    60 * 60
}

fn default_cancel_max_wait_secs() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pavilion.yaml");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "working_dir: /tmp/pav_wd").unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.working_dir, PathBuf::from("/tmp/pav_wd"));
        assert_eq!(config.lock_expires(), Duration::from_secs(3600));
        assert_eq!(config.cancel_max_wait(), Duration::from_secs(5));
        assert!(config.group.is_none());
    }

    #[test]
    fn working_dir_skeleton() {
        let dir = tempfile::tempdir().unwrap();
        let wd = WorkingDir::new(dir.path());
        wd.ensure().unwrap();

        for sub in ["locks", "builds", "jobs", "test_runs"] {
            assert!(dir.path().join(sub).is_dir(), "missing {sub}");
        }
    }
}
