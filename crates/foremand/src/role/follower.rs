//! Follower startup path with its unbounded reconnect loop.
//!
//! State machine: `Connecting -> Ready -> Connected`, where a lost
//! connection returns to `Connecting` after one fixed-interval sleep and any
//! other failure is terminal. `Connecting` re-runs the readiness probe so a
//! configuration subsystem restart is noticed after every disconnect, and
//! sessions are rebuilt from scratch each iteration so no connection state
//! survives a reconnect. The auxiliary daemons launch once, on the first
//! iteration that reaches `Connected`.

use std::time::Duration;

use tracing::{info, warn};

use crate::cancel::interruptible_sleep;
use crate::launcher::launch_all;
use crate::pool::WorkerPool;
use crate::probe::wait_until_ready;

use super::session::{SessionHandle, SessionOutcome};
use super::{RoleError, RoleRuntime, READINESS_POLL, ROLE_TARGET, WORKER_COUNT};

/// Reconnect bookkeeping. The loop is unbounded, so there is no terminal
/// give-up state; the attempt count only feeds log lines.
#[derive(Debug)]
struct RetryState {
    interval: Duration,
    attempts: u64,
}

pub(super) fn run(runtime: &RoleRuntime<'_>) -> Result<(), RoleError> {
    let span = tracing::info_span!(
        target: ROLE_TARGET,
        "follower",
        correlation = runtime.context.correlation()
    );
    let _guard = span.enter();

    let pool = WorkerPool::spawn(WORKER_COUNT)?;
    let result = run_loop(runtime);
    pool.stop();
    result
}

fn run_loop(runtime: &RoleRuntime<'_>) -> Result<(), RoleError> {
    let mut retry = RetryState {
        interval: runtime.retry_interval,
        attempts: 0,
    };
    let mut daemons_started = false;

    loop {
        if runtime.cancel.is_cancelled() {
            return Ok(());
        }

        // Connecting: bind the control channel, then gate on configuration.
        let control = runtime
            .factory
            .control_session()
            .map_err(RoleError::Session)?;
        if wait_until_ready(runtime.probe, READINESS_POLL, runtime.cancel).is_err() {
            return Ok(());
        }

        // Ready: fresh sessions for this attempt.
        let network = runtime
            .factory
            .network_session()
            .map_err(RoleError::Session)?;
        let control_handle =
            SessionHandle::spawn("control", control, runtime.cancel).map_err(RoleError::Session)?;
        let network_handle =
            SessionHandle::spawn("network", network, runtime.cancel).map_err(RoleError::Session)?;

        if !daemons_started {
            if let Err(error) = launch_all(runtime.launcher, runtime.specs) {
                network_handle.cancel();
                control_handle.cancel();
                drop(network_handle.join());
                drop(control_handle.join());
                return Err(error.into());
            }
            daemons_started = true;
            info!(target: ROLE_TARGET, "follower node started");
        }

        // Connected.
        let network_outcome = network_handle.join();
        control_handle.cancel();
        let control_outcome = control_handle.join();

        match network_outcome {
            SessionOutcome::Completed => {
                return classify_control(control_outcome);
            }
            SessionOutcome::ConnectionLost => {
                classify_control(control_outcome)?;
                retry.attempts += 1;
                warn!(
                    target: ROLE_TARGET,
                    attempt = retry.attempts,
                    retry_secs = retry.interval.as_secs(),
                    "connection to coordinator lost, reconnecting"
                );
                if !interruptible_sleep(retry.interval, runtime.cancel) {
                    return Ok(());
                }
            }
            SessionOutcome::Failed(source) => {
                return Err(RoleError::SessionFailed {
                    name: "network",
                    source,
                });
            }
        }
    }
}

fn classify_control(outcome: SessionOutcome) -> Result<(), RoleError> {
    match outcome {
        SessionOutcome::Completed | SessionOutcome::ConnectionLost => Ok(()),
        SessionOutcome::Failed(source) => Err(RoleError::SessionFailed {
            name: "control",
            source,
        }),
    }
}
