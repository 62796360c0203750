//! Coordinator startup path.

use tracing::info;

use crate::keys::ensure_keys;
use crate::launcher::launch_all;
use crate::pool::WorkerPool;
use crate::probe::wait_until_ready;

use super::session::{SessionHandle, SessionOutcome};
use super::{RoleError, RoleRuntime, READINESS_POLL, ROLE_TARGET, WORKER_COUNT};

/// Runs the coordinator path until cancellation or failure.
///
/// Ordering is load-bearing: the control channel binds before the readiness
/// probe so operators can reach the node while it waits on configuration,
/// and the signing key pair exists before any daemon that might consume it
/// is launched.
pub(super) fn run(runtime: &RoleRuntime<'_>) -> Result<(), RoleError> {
    let span = tracing::info_span!(
        target: ROLE_TARGET,
        "coordinator",
        correlation = runtime.context.correlation()
    );
    let _guard = span.enter();

    let pool = WorkerPool::spawn(WORKER_COUNT)?;
    let result = run_inner(runtime);
    pool.stop();
    result
}

fn run_inner(runtime: &RoleRuntime<'_>) -> Result<(), RoleError> {
    let control = runtime
        .factory
        .control_session()
        .map_err(RoleError::Session)?;

    if wait_until_ready(runtime.probe, READINESS_POLL, runtime.cancel).is_err() {
        // Interrupted while waiting on configuration; nothing started yet.
        return Ok(());
    }

    ensure_keys(runtime.keys)?;

    let network = runtime
        .factory
        .network_session()
        .map_err(RoleError::Session)?;
    let control_handle =
        SessionHandle::spawn("control", control, runtime.cancel).map_err(RoleError::Session)?;
    let network_handle =
        SessionHandle::spawn("network", network, runtime.cancel).map_err(RoleError::Session)?;

    if let Err(error) = launch_all(runtime.launcher, runtime.specs) {
        network_handle.cancel();
        control_handle.cancel();
        drop(network_handle.join());
        drop(control_handle.join());
        return Err(error.into());
    }
    info!(target: ROLE_TARGET, "coordinator node started");

    let network_outcome = network_handle.join();
    control_handle.cancel();
    let control_outcome = control_handle.join();

    classify(network_outcome, "network")?;
    classify(control_outcome, "control")
}

/// The coordinator has no reconnect path, so a lost connection is as fatal
/// as any other session failure.
fn classify(outcome: SessionOutcome, name: &'static str) -> Result<(), RoleError> {
    match outcome {
        SessionOutcome::Completed => Ok(()),
        SessionOutcome::ConnectionLost => Err(RoleError::SessionFailed {
            name,
            source: super::SessionError("connection lost".to_owned()),
        }),
        SessionOutcome::Failed(source) => Err(RoleError::SessionFailed { name, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::cancel::CancelFlag;
    use crate::context::RunContext;
    use crate::keys::{KeyError, SigningKeys};
    use crate::launcher::{DaemonSpec, LaunchError, Launcher};
    use crate::probe::ChannelProbe;
    use crate::role::session::{
        Cancellation, NodeSession, SessionError, SessionFactory, SessionOutcome,
    };

    use camino::Utf8PathBuf;
    use foreman_config::NodeRole;

    struct InstantSession(SessionOutcome);

    impl NodeSession for InstantSession {
        fn run(self: Box<Self>, _cancel: &Cancellation) -> SessionOutcome {
            self.0
        }
    }

    struct UntilCancelled;

    impl NodeSession for UntilCancelled {
        fn run(self: Box<Self>, cancel: &Cancellation) -> SessionOutcome {
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            SessionOutcome::Completed
        }
    }

    struct StubFactory {
        network_outcome: Mutex<Option<SessionOutcome>>,
    }

    impl SessionFactory for StubFactory {
        fn network_session(&self) -> Result<Box<dyn NodeSession>, SessionError> {
            let outcome = self
                .network_outcome
                .lock()
                .expect("lock")
                .take()
                .unwrap_or(SessionOutcome::Completed);
            Ok(Box::new(InstantSession(outcome)))
        }

        fn control_session(&self) -> Result<Box<dyn NodeSession>, SessionError> {
            Ok(Box::new(UntilCancelled))
        }
    }

    struct ReadyProbe;

    impl ChannelProbe for ReadyProbe {
        fn probe(&self) -> bool {
            true
        }
        fn describe(&self) -> String {
            "ready".to_owned()
        }
    }

    struct RecordingLauncher {
        launched: Mutex<Vec<&'static str>>,
    }

    impl Launcher for RecordingLauncher {
        fn launch(&self, spec: &DaemonSpec) -> Result<u32, LaunchError> {
            self.launched.lock().expect("lock").push(spec.name);
            Ok(4000)
        }
    }

    struct CountingKeys {
        generated: AtomicUsize,
        present: bool,
    }

    impl SigningKeys for CountingKeys {
        fn exists(&self) -> bool {
            self.present || self.generated.load(Ordering::SeqCst) > 0
        }
        fn generate(&self) -> Result<(), KeyError> {
            self.generated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn specs() -> Vec<DaemonSpec> {
        ["engine", "comms", "management"]
            .into_iter()
            .map(|name| DaemonSpec {
                name,
                program: Utf8PathBuf::from("/bin/true"),
                args: Vec::new(),
                records_pid: false,
            })
            .collect()
    }

    #[test]
    fn launches_daemons_and_generates_keys_once() {
        let context = RunContext::new(NodeRole::Coordinator);
        let factory = StubFactory {
            network_outcome: Mutex::new(Some(SessionOutcome::Completed)),
        };
        let launcher = RecordingLauncher {
            launched: Mutex::new(Vec::new()),
        };
        let keys = CountingKeys {
            generated: AtomicUsize::new(0),
            present: false,
        };
        let cancel = CancelFlag::new();
        let specs = specs();
        let runtime = RoleRuntime {
            context: &context,
            factory: &factory,
            probe: &ReadyProbe,
            launcher: &launcher,
            specs: &specs,
            keys: &keys,
            retry_interval: Duration::from_millis(10),
            cancel: &cancel,
        };

        run(&runtime).expect("coordinator run");
        assert_eq!(
            *launcher.launched.lock().expect("lock"),
            vec!["engine", "comms", "management"]
        );
        assert_eq!(keys.generated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn existing_keys_are_not_rotated() {
        let context = RunContext::new(NodeRole::Coordinator);
        let factory = StubFactory {
            network_outcome: Mutex::new(Some(SessionOutcome::Completed)),
        };
        let launcher = RecordingLauncher {
            launched: Mutex::new(Vec::new()),
        };
        let keys = CountingKeys {
            generated: AtomicUsize::new(0),
            present: true,
        };
        let cancel = CancelFlag::new();
        let specs = specs();
        let runtime = RoleRuntime {
            context: &context,
            factory: &factory,
            probe: &ReadyProbe,
            launcher: &launcher,
            specs: &specs,
            keys: &keys,
            retry_interval: Duration::from_millis(10),
            cancel: &cancel,
        };

        run(&runtime).expect("coordinator run");
        assert_eq!(keys.generated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_network_session_is_fatal() {
        let context = RunContext::new(NodeRole::Coordinator);
        let factory = StubFactory {
            network_outcome: Mutex::new(Some(SessionOutcome::Failed(SessionError(
                "broken".to_owned(),
            )))),
        };
        let launcher = RecordingLauncher {
            launched: Mutex::new(Vec::new()),
        };
        let keys = CountingKeys {
            generated: AtomicUsize::new(0),
            present: true,
        };
        let cancel = CancelFlag::new();
        let specs = specs();
        let runtime = RoleRuntime {
            context: &context,
            factory: &factory,
            probe: &ReadyProbe,
            launcher: &launcher,
            specs: &specs,
            keys: &keys,
            retry_interval: Duration::from_millis(10),
            cancel: &cancel,
        };

        let error = run(&runtime).expect_err("run must fail");
        assert!(matches!(
            error,
            RoleError::SessionFailed {
                name: "network",
                ..
            }
        ));
    }
}
