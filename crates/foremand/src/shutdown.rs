//! Ordered teardown of the managed daemon set.
//!
//! Shutdown signals daemons in a fixed order, then blocks until every tracked
//! daemon has left the process table before reaping the supervisor's own
//! children. It must never return while a tracked daemon is still alive, and
//! running it against an already-stopped system is a no-op beyond log lines.

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::daemons::{ENGINE_DAEMON, SHUTDOWN_ORDER, SUPERVISOR_DAEMON};
use crate::proc_table::ProcessTable;
use crate::registry::{PidRegistry, RegistryError};

const SHUTDOWN_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::shutdown");

const DISAPPEARANCE_POLL: Duration = Duration::from_secs(1);

/// Tears down the daemon set and the supervisor's process tree.
pub struct ShutdownCoordinator<'a> {
    registry: &'a PidRegistry,
    table: &'a dyn ProcessTable,
    poll_interval: Duration,
}

impl<'a> ShutdownCoordinator<'a> {
    #[must_use]
    pub fn new(registry: &'a PidRegistry, table: &'a dyn ProcessTable) -> Self {
        Self {
            registry,
            table,
            poll_interval: DISAPPEARANCE_POLL,
        }
    }

    #[cfg(test)]
    fn with_poll_interval(
        registry: &'a PidRegistry,
        table: &'a dyn ProcessTable,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            table,
            poll_interval,
        }
    }

    /// Signals every live daemon, waits for full disappearance, reaps the
    /// supervisor's children, and removes the supervisor's own record.
    ///
    /// Only the engine carries a lifecycle record; the API daemons are found
    /// by scanning the process table for their names. Both sources are
    /// signalled, so the disappearance wait below can always make progress.
    pub fn shutdown(&self, supervisor_pid: u32) -> Result<(), ShutdownError> {
        for name in SHUTDOWN_ORDER {
            let mut pids = self.table.pids_of(name);
            if let Some(recorded) = self.registry.live_pid(name)? {
                if !pids.contains(&recorded) {
                    pids.push(recorded);
                }
            }
            if pids.is_empty() {
                debug!(target: SHUTDOWN_TARGET, daemon = name, "daemon not running");
            }
            for pid in pids {
                info!(target: SHUTDOWN_TARGET, daemon = name, pid, "signalling daemon");
                self.table.terminate(pid);
            }
            // The engine is the only separately recorded daemon; its record
            // goes as soon as the signal is sent so a crashing shutdown
            // cannot leave a record for a dying process.
            if name == ENGINE_DAEMON {
                self.registry.remove(name)?;
            }
        }

        self.await_disappearance();

        for child in self.table.children_of(supervisor_pid) {
            debug!(target: SHUTDOWN_TARGET, pid = child, "terminating supervisor child");
            self.table.terminate(child);
        }

        self.registry.remove(SUPERVISOR_DAEMON)?;
        info!(target: SHUTDOWN_TARGET, "shutdown complete");
        Ok(())
    }

    fn await_disappearance(&self) {
        loop {
            let lingering: Vec<&str> = SHUTDOWN_ORDER
                .iter()
                .copied()
                .filter(|name| self.table.is_running(name))
                .collect();
            if lingering.is_empty() {
                return;
            }
            debug!(
                target: SHUTDOWN_TARGET,
                daemons = ?lingering,
                "waiting for daemons to exit"
            );
            thread::sleep(self.poll_interval);
        }
    }
}

/// Errors raised during shutdown.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Lifecycle record bookkeeping failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
