//! Fixed-size pool of idle worker threads for CPU-bound helper work.
//!
//! Work items are handed to the pool by the role's network process, which is
//! outside this crate; the supervisor only guarantees the workers exist for
//! the lifetime of the run. Spawning verifies the scratch directory is
//! usable first, because an inaccessible scratch directory is the one
//! resource failure operators can fix without touching the cluster.

use std::io;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cancel::{interruptible_sleep, CancelFlag};

const POOL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::pool");

const IDLE_INTERVAL: Duration = Duration::from_millis(500);

/// Pool of idle workers held for the lifetime of a run.
pub struct WorkerPool {
    cancel: CancelFlag,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` idle workers after verifying the scratch directory.
    pub fn spawn(size: usize) -> Result<Self, PoolError> {
        tempfile::tempfile().map_err(|source| PoolError::Scratch { source })?;

        let cancel = CancelFlag::new();
        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            let worker_cancel = cancel.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || {
                    while interruptible_sleep(IDLE_INTERVAL, &worker_cancel) {}
                })
                .map_err(|source| PoolError::Spawn { source })?;
            handles.push(handle);
        }
        debug!(target: POOL_TARGET, workers = size, "worker pool ready");
        Ok(Self { cancel, handles })
    }

    /// Stops the workers and waits for them to exit.
    pub fn stop(mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!(target: POOL_TARGET, "worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Errors raised while spawning the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The scratch directory is not writable.
    #[error("scratch directory is not writable: {source}")]
    Scratch {
        #[source]
        source: io::Error,
    },
    /// Spawning a worker thread failed.
    #[error("failed to spawn worker thread: {source}")]
    Spawn {
        #[source]
        source: io::Error,
    },
}

impl PoolError {
    /// Operator guidance for the failure.
    #[must_use]
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::Scratch { .. } => {
                "ensure the temporary directory exists and is writable by the service user"
            }
            Self::Spawn { .. } => "the host is out of threads; raise the process limits",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn spawns_and_stops_workers() {
        let pool = WorkerPool::spawn(2).expect("spawn pool");
        let started = Instant::now();
        pool.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
