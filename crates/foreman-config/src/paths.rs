//! Filesystem layout shared by the supervisor and its lifecycle commands.
//!
//! The run directory houses the pid record registry and transient cluster
//! state. `start`, `stop`, and `status` may execute from different process
//! instances, so every instance must agree on this layout to discover the
//! records written by a running supervisor.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Config;

/// Canonical run-directory layout derived from configuration.
#[derive(Debug, Clone)]
pub struct RunPaths {
    run_dir: PathBuf,
    records_dir: PathBuf,
    state_dir: PathBuf,
    keys_dir: PathBuf,
}

impl RunPaths {
    /// Derives the layout from configuration, creating missing directories.
    pub fn from_config(config: &Config) -> Result<Self, RunPathsError> {
        let run_dir = config.run_dir().as_std_path().to_path_buf();
        let records_dir = run_dir.join("records");
        let state_dir = run_dir.join("state");
        let keys_dir = config.data_dir().as_std_path().join("keys");
        for dir in [&run_dir, &records_dir, &state_dir, &keys_dir] {
            fs::create_dir_all(dir).map_err(|source| RunPathsError::CreateDirectory {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(Self {
            run_dir,
            records_dir,
            state_dir,
            keys_dir,
        })
    }

    /// Directory holding runtime artefacts.
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        self.run_dir.as_path()
    }

    /// Directory holding pid records.
    #[must_use]
    pub fn records_dir(&self) -> &Path {
        self.records_dir.as_path()
    }

    /// Directory holding transient cluster state cleared at startup.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        self.state_dir.as_path()
    }

    /// Directory holding the node's signing key material.
    #[must_use]
    pub fn keys_dir(&self) -> &Path {
        self.keys_dir.as_path()
    }
}

/// Default run directory when configuration does not override it.
#[must_use]
pub fn default_run_dir() -> PathBuf {
    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } == 0 {
            return PathBuf::from("/run/foreman");
        }
        if let Some(mut dir) = dirs::runtime_dir() {
            dir.push("foreman");
            return dir;
        }
        let mut dir = std::env::temp_dir();
        dir.push("foreman");
        dir.push(format!("uid-{}", unsafe { libc::geteuid() }));
        dir
    }

    #[cfg(not(unix))]
    {
        let mut dir = std::env::temp_dir();
        dir.push("foreman");
        dir
    }
}

/// Default data directory when configuration does not override it.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } == 0 {
            return PathBuf::from("/var/lib/foreman");
        }
    }
    let mut dir = default_run_dir();
    dir.push("data");
    dir
}

/// Errors raised while deriving the run-directory layout.
#[derive(Debug, Error)]
pub enum RunPathsError {
    /// Creating a directory failed.
    #[error("failed to prepare directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
