//! Durable registry of running daemon processes.
//!
//! Each managed daemon that survives its startup grace window gets a record
//! file named `<daemon>.pid` under the records directory. Records are small
//! JSON documents written atomically so lifecycle commands running in other
//! processes never observe a partial payload. A record whose process is gone
//! is stale and is removed on sight.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::files::atomic_write;

const REGISTRY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::registry");

const RECORD_SUFFIX: &str = "pid";

/// Persisted description of a managed process.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PidRecord {
    /// Daemon name the record belongs to.
    pub name: String,
    /// Operating-system process id.
    pub pid: u32,
    /// Unix timestamp, in seconds, when the record was written.
    pub started_at: u64,
}

/// Registry of pid records under a single directory.
#[derive(Debug, Clone)]
pub struct PidRegistry {
    records_dir: PathBuf,
}

impl PidRegistry {
    /// Creates a registry rooted at `records_dir`. The directory must already
    /// exist.
    #[must_use]
    pub fn new(records_dir: impl Into<PathBuf>) -> Self {
        Self {
            records_dir: records_dir.into(),
        }
    }

    /// Directory holding the record files.
    #[must_use]
    pub fn records_dir(&self) -> &Path {
        self.records_dir.as_path()
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.records_dir.join(format!("{name}.{RECORD_SUFFIX}"))
    }

    /// Writes (or replaces) the record for `name`.
    pub fn write(&self, name: &str, pid: u32) -> Result<(), RegistryError> {
        let record = PidRecord {
            name: name.to_owned(),
            pid,
            started_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
        };
        let payload =
            serde_json::to_vec_pretty(&record).map_err(|source| RegistryError::Serialise {
                name: name.to_owned(),
                source,
            })?;
        let path = self.record_path(name);
        atomic_write(&path, &payload).map_err(|source| RegistryError::Write {
            name: name.to_owned(),
            path,
            source,
        })?;
        debug!(target: REGISTRY_TARGET, daemon = name, pid, "recorded pid");
        Ok(())
    }

    /// Removes the record for `name`. A missing record is not an error.
    pub fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let path = self.record_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RegistryError::Remove {
                name: name.to_owned(),
                path,
                source,
            }),
        }
    }

    /// Reads the record for `name` without liveness checks.
    pub fn lookup(&self, name: &str) -> Result<Option<PidRecord>, RegistryError> {
        let path = self.record_path(name);
        let payload = match fs::read(&path) {
            Ok(payload) => payload,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(RegistryError::Read {
                    name: name.to_owned(),
                    path,
                    source,
                });
            }
        };
        match serde_json::from_slice(&payload) {
            Ok(record) => Ok(Some(record)),
            Err(_) => Err(RegistryError::Malformed {
                name: name.to_owned(),
                path,
            }),
        }
    }

    /// Returns the pid recorded for `name` when that process is still alive.
    ///
    /// Stale records, including malformed ones, are removed and yield `None`.
    pub fn live_pid(&self, name: &str) -> Result<Option<u32>, RegistryError> {
        let record = match self.lookup(name) {
            Ok(record) => record,
            Err(RegistryError::Malformed { name, path }) => {
                warn!(
                    target: REGISTRY_TARGET,
                    daemon = %name,
                    path = %path.display(),
                    "removing malformed pid record"
                );
                self.remove(&name)?;
                return Ok(None);
            }
            Err(error) => return Err(error),
        };
        let Some(record) = record else {
            return Ok(None);
        };
        if process_alive(record.pid) {
            Ok(Some(record.pid))
        } else {
            debug!(
                target: REGISTRY_TARGET,
                daemon = name,
                pid = record.pid,
                "removing stale pid record"
            );
            self.remove(name)?;
            Ok(None)
        }
    }

    /// Removes every record whose process is no longer alive.
    pub fn clean_stale(&self) -> Result<(), RegistryError> {
        let entries =
            fs::read_dir(&self.records_dir).map_err(|source| RegistryError::Scan {
                path: self.records_dir.clone(),
                source,
            })?;
        for entry in entries {
            let entry = entry.map_err(|source| RegistryError::Scan {
                path: self.records_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|extension| extension.to_str()) != Some(RECORD_SUFFIX) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            self.live_pid(name)?;
        }
        Ok(())
    }
}

/// Reports whether a process with `pid` currently exists.
///
/// Signal 0 probes existence without delivering anything; `EPERM` means the
/// process exists but belongs to another user, which still counts as alive.
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Errors raised by the pid registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Serialising a record failed.
    #[error("failed to serialise pid record for '{name}': {source}")]
    Serialise {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    /// Writing a record file failed.
    #[error("failed to write pid record for '{name}' at '{path}': {source}", path = path.display())]
    Write {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Reading a record file failed.
    #[error("failed to read pid record for '{name}' at '{path}': {source}", path = path.display())]
    Read {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// A record file held unparseable content.
    #[error("pid record for '{name}' at '{path}' is malformed", path = path.display())]
    Malformed { name: String, path: PathBuf },
    /// Removing a record file failed.
    #[error("failed to remove pid record for '{name}' at '{path}': {source}", path = path.display())]
    Remove {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Listing the records directory failed.
    #[error("failed to scan records directory '{path}': {source}", path = path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
