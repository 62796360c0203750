//! Subprocess launch with a bounded startup grace window.
//!
//! There is no daemon-side readiness acknowledgement, so the launcher uses a
//! heuristic: spawn the process and watch it for a short grace window. A
//! process still running when the window closes is treated as started; a
//! non-zero exit inside the window is a startup failure that aborts the whole
//! sequence. Keep the window at two seconds unless the daemons ever grow a
//! real readiness signal.

use std::io;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{debug, info};

use crate::registry::{PidRegistry, RegistryError};

const LAUNCHER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::launcher");

const GRACE_WINDOW: Duration = Duration::from_secs(2);
const GRACE_POLL: Duration = Duration::from_millis(50);

/// Immutable description of one daemon launch.
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    /// Daemon name used for records and logging.
    pub name: &'static str,
    /// Executable path.
    pub program: Utf8PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Whether a lifecycle record must be written on successful launch.
    pub records_pid: bool,
}

/// Launches a single daemon.
pub trait Launcher {
    /// Spawns the daemon and classifies the outcome after the grace window.
    fn launch(&self, spec: &DaemonSpec) -> Result<u32, LaunchError>;
}

/// Launcher that spawns real subprocesses and records their pids.
#[derive(Debug)]
pub struct SystemLauncher {
    registry: PidRegistry,
    grace: Duration,
}

impl SystemLauncher {
    #[must_use]
    pub fn new(registry: PidRegistry) -> Self {
        Self {
            registry,
            grace: GRACE_WINDOW,
        }
    }

    #[cfg(test)]
    fn with_grace(registry: PidRegistry, grace: Duration) -> Self {
        Self { registry, grace }
    }
}

impl Launcher for SystemLauncher {
    fn launch(&self, spec: &DaemonSpec) -> Result<u32, LaunchError> {
        info!(
            target: LAUNCHER_TARGET,
            daemon = spec.name,
            program = %spec.program,
            "launching daemon"
        );
        let mut child = Command::new(spec.program.as_std_path())
            .args(&spec.args)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                name: spec.name,
                source,
            })?;
        let pid = child.id();

        let deadline = Instant::now() + self.grace;
        loop {
            let status = child.try_wait().map_err(|source| LaunchError::Monitor {
                name: spec.name,
                source,
            })?;
            if let Some(status) = status {
                let code = status.code().unwrap_or(-1);
                if code != 0 {
                    return Err(LaunchError::Exited {
                        name: spec.name,
                        code,
                    });
                }
                // A clean exit inside the window leaves nothing to track; no
                // record is written for a pid that is already gone.
                debug!(
                    target: LAUNCHER_TARGET,
                    daemon = spec.name,
                    "daemon exited cleanly within the grace window"
                );
                return Ok(pid);
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(GRACE_POLL);
        }

        if spec.records_pid {
            self.registry
                .write(spec.name, pid)
                .map_err(|source| LaunchError::Record {
                    name: spec.name,
                    source,
                })?;
        }
        info!(target: LAUNCHER_TARGET, daemon = spec.name, pid, "daemon started");
        Ok(pid)
    }
}

/// Launches every spec in order, stopping at the first failure.
pub fn launch_all(launcher: &dyn Launcher, specs: &[DaemonSpec]) -> Result<(), LaunchError> {
    for spec in specs {
        launcher.launch(spec)?;
    }
    Ok(())
}

/// Errors raised while launching daemons.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Spawning the subprocess failed.
    #[error("failed to spawn daemon '{name}': {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    /// The subprocess exited with an error inside the grace window.
    #[error("daemon '{name}' exited with status {code} during startup")]
    Exited { name: &'static str, code: i32 },
    /// Polling the subprocess state failed.
    #[error("failed to monitor daemon '{name}': {source}")]
    Monitor {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    /// Writing the lifecycle record failed.
    #[error("failed to record daemon '{name}': {source}")]
    Record {
        name: &'static str,
        #[source]
        source: RegistryError,
    },
}

impl LaunchError {
    /// Name of the daemon the failure concerns.
    #[must_use]
    pub fn daemon(&self) -> &'static str {
        match self {
            Self::Spawn { name, .. }
            | Self::Exited { name, .. }
            | Self::Monitor { name, .. }
            | Self::Record { name, .. } => name,
        }
    }
}
