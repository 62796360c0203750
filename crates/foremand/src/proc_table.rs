//! Read-and-signal access to the operating system's process table.

use std::sync::Mutex;

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tracing::debug;

const TABLE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::proc_table");

/// Queries and signals processes by name or pid.
///
/// Trait seam so lifecycle logic can run against a scripted table in tests.
pub trait ProcessTable: Send + Sync {
    /// Reports whether a process with the given name is currently running.
    fn is_running(&self, name: &str) -> bool;

    /// Returns the pids of every process matching `name`. Daemons without a
    /// lifecycle record are only reachable through this lookup.
    fn pids_of(&self, name: &str) -> Vec<u32>;

    /// Returns every transitive child of `pid`, in no particular order.
    fn children_of(&self, pid: u32) -> Vec<u32>;

    /// Sends a termination signal to `pid`. Delivery failures are ignored:
    /// the target may have exited between observation and signalling.
    fn terminate(&self, pid: u32);
}

/// Process table backed by the live operating system.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    #[must_use]
    pub fn new() -> Self {
        let refresh = RefreshKind::new().with_processes(ProcessRefreshKind::new());
        Self {
            system: Mutex::new(System::new_with_specifics(refresh)),
        }
    }

    fn with_refreshed<T>(&self, reader: impl FnOnce(&System) -> T) -> T {
        // A poisoned lock means another thread panicked mid-refresh; the
        // snapshot is still usable for read-only queries.
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_processes();
        reader(&system)
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn is_running(&self, name: &str) -> bool {
        self.with_refreshed(|system| {
            system
                .processes()
                .values()
                .any(|process| names_match(name, process.name()))
        })
    }

    fn pids_of(&self, name: &str) -> Vec<u32> {
        self.with_refreshed(|system| {
            system
                .processes()
                .iter()
                .filter(|(_, process)| names_match(name, process.name()))
                .map(|(pid, _)| pid.as_u32())
                .collect()
        })
    }

    fn children_of(&self, pid: u32) -> Vec<u32> {
        self.with_refreshed(|system| {
            let mut descendants = Vec::new();
            let mut frontier = vec![Pid::from_u32(pid)];
            while let Some(parent) = frontier.pop() {
                for (child_pid, process) in system.processes() {
                    if process.parent() == Some(parent) {
                        descendants.push(child_pid.as_u32());
                        frontier.push(*child_pid);
                    }
                }
            }
            descendants
        })
    }

    fn terminate(&self, pid: u32) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid as NixPid;

            let Ok(raw) = i32::try_from(pid) else {
                return;
            };
            if let Err(error) = kill(NixPid::from_raw(raw), Signal::SIGTERM) {
                debug!(
                    target: TABLE_TARGET,
                    pid,
                    error = %error,
                    "termination signal not delivered"
                );
            }
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
        }
    }
}

/// Matches a daemon name against a process-table entry, tolerating the
/// kernel's 15-character truncation of process names.
fn names_match(daemon: &str, process: &str) -> bool {
    if daemon == process {
        return true;
    }
    process.len() >= 15 && daemon.starts_with(process)
}
