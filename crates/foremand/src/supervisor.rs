//! Top-level lifecycle: `start`, `stop`, and `status`.
//!
//! `start` owns the run from single-instance check to teardown. Every fatal
//! condition inside the run funnels through one handler that executes the
//! shutdown sequence exactly once, whatever stage failed.

use std::fs;
use std::io;
use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tracing::{info, warn};

use foreman_config::{Config, RunPaths};

use crate::cancel::CancelFlag;
use crate::context::RunContext;
use crate::daemons::{daemon_specs, STATUS_ORDER, SUPERVISOR_DAEMON};
use crate::identity::{Identity, IdentityError};
use crate::keys::SigningKeys;
use crate::launcher::{LaunchError, Launcher};
use crate::orders::{OrderError, OrderFetcher, OrdersTask, FETCH_INTERVAL};
use crate::pool::PoolError;
use crate::probe::ChannelProbe;
use crate::proc_table::ProcessTable;
use crate::registry::{PidRegistry, RegistryError};
use crate::role::{run_role, RoleError, RoleRuntime, SessionFactory};
use crate::shutdown::{ShutdownCoordinator, ShutdownError};
use crate::signals::ShutdownSignal;

const SUPERVISOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::supervisor");

/// Collaborators a supervisor run needs, resolved once by the entry point.
pub struct SupervisorPlan<'a> {
    pub config: &'a Config,
    pub paths: &'a RunPaths,
    pub registry: &'a PidRegistry,
    pub table: &'a dyn ProcessTable,
    pub launcher: &'a dyn Launcher,
    pub probe: &'a dyn ChannelProbe,
    pub factory: &'a dyn SessionFactory,
    pub keys: &'a dyn SigningKeys,
    pub identity: &'a dyn Identity,
    pub signal: Arc<dyn ShutdownSignal>,
    pub orders: Arc<dyn OrderFetcher>,
    pub run_as_root: bool,
}

/// Runs the supervisor until interrupt or fatal error, then tears down.
pub fn start(plan: &SupervisorPlan<'_>) -> Result<(), SupervisorError> {
    preflight(plan)?;

    let outcome = run(plan);

    let shutdown = ShutdownCoordinator::new(plan.registry, plan.table);
    let shutdown_outcome = shutdown.shutdown(std::process::id());

    match outcome {
        Err(error) => {
            if let Err(shutdown_error) = shutdown_outcome {
                warn!(
                    target: SUPERVISOR_TARGET,
                    error = %shutdown_error,
                    "teardown after failure was incomplete"
                );
            }
            Err(error)
        }
        Ok(()) => shutdown_outcome.map_err(SupervisorError::from),
    }
}

/// Everything that must hold before the node commits to running.
fn preflight(plan: &SupervisorPlan<'_>) -> Result<(), SupervisorError> {
    if let Some(pid) = plan.registry.live_pid(SUPERVISOR_DAEMON)? {
        return Err(SupervisorError::AlreadyRunning { pid });
    }

    plan.registry.clean_stale()?;
    clear_state_dir(plan.paths);

    if plan.run_as_root {
        warn!(target: SUPERVISOR_TARGET, "running as root by operator request");
    } else {
        plan.identity.drop_privileges(plan.config.service_user())?;
    }

    plan.registry
        .write(SUPERVISOR_DAEMON, std::process::id())?;
    Ok(())
}

fn run(plan: &SupervisorPlan<'_>) -> Result<(), SupervisorError> {
    let orders_task = OrdersTask::spawn(Arc::clone(&plan.orders), FETCH_INTERVAL)?;

    let cancel = CancelFlag::new();
    spawn_signal_watcher(Arc::clone(&plan.signal), cancel.clone());

    let context = RunContext::new(plan.config.node_role());
    info!(
        target: SUPERVISOR_TARGET,
        role = %context.role(),
        correlation = context.correlation(),
        "supervisor starting"
    );

    let specs = daemon_specs(plan.config, plan.run_as_root);
    let runtime = RoleRuntime {
        context: &context,
        factory: plan.factory,
        probe: plan.probe,
        launcher: plan.launcher,
        specs: &specs,
        keys: plan.keys,
        retry_interval: plan.config.connection_retry(),
        cancel: &cancel,
    };
    let result = run_role(&runtime).map_err(classify_role_error);

    orders_task.stop();
    result
}

fn spawn_signal_watcher(signal: Arc<dyn ShutdownSignal>, cancel: CancelFlag) {
    // Detached on purpose: the watcher lives for at most the process
    // lifetime and blocks in signal delivery, which has no clean join point.
    let builder = thread::Builder::new().name("signals".to_owned());
    let spawned = builder.spawn(move || {
        if let Err(error) = signal.wait() {
            warn!(target: SUPERVISOR_TARGET, error = %error, "signal watcher failed");
        }
        cancel.cancel();
    });
    if let Err(error) = spawned {
        warn!(
            target: SUPERVISOR_TARGET,
            error = %error,
            "failed to spawn the signal watcher; interrupts will not be handled"
        );
    }
}

fn classify_role_error(error: RoleError) -> SupervisorError {
    match error {
        RoleError::Launch(source) => SupervisorError::DaemonStart { source },
        RoleError::Pool(source) => SupervisorError::ResourceExhaustion {
            guidance: source.guidance(),
            source,
        },
        other => SupervisorError::Unclassified {
            message: other.to_string(),
        },
    }
}

/// Transient cluster state does not survive a restart. Failures here are
/// non-fatal; stale state is an inconvenience, not a blocker.
fn clear_state_dir(paths: &RunPaths) {
    let entries = match fs::read_dir(paths.state_dir()) {
        Ok(entries) => entries,
        Err(error) => {
            warn!(
                target: SUPERVISOR_TARGET,
                error = %error,
                "could not scan the state directory"
            );
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(error) = removed {
            warn!(
                target: SUPERVISOR_TARGET,
                path = %path.display(),
                error = %error,
                "could not clear stale state"
            );
        }
    }
}

/// Stops a running supervisor from a separate process instance.
///
/// Degrades to informational output: a supervisor that is not running is
/// reported, not raised.
pub fn stop(registry: &PidRegistry, table: &dyn ProcessTable) {
    let pid = match registry.live_pid(SUPERVISOR_DAEMON) {
        Ok(Some(pid)) => pid,
        Ok(None) => {
            info!(target: SUPERVISOR_TARGET, "supervisor is not running");
            return;
        }
        Err(error) => {
            warn!(target: SUPERVISOR_TARGET, error = %error, "could not read the supervisor record");
            return;
        }
    };

    let shutdown = ShutdownCoordinator::new(registry, table);
    if let Err(error) = shutdown.shutdown(pid) {
        warn!(target: SUPERVISOR_TARGET, error = %error, "shutdown was incomplete");
    }
    table.terminate(pid);
    info!(target: SUPERVISOR_TARGET, pid, "supervisor stopped");
}

/// Reports liveness for each daemon name. Pure read.
pub fn status(table: &dyn ProcessTable, out: &mut dyn io::Write) -> io::Result<()> {
    for name in STATUS_ORDER {
        let state = if table.is_running(name) {
            "running"
        } else {
            "not running"
        };
        writeln!(out, "{name} is {state}")?;
    }
    Ok(())
}

/// Fatal supervisor failures, each mapped to exit code 1 by the entry point.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Another live supervisor instance holds the record.
    #[error("supervisor is already running with pid {pid}")]
    AlreadyRunning { pid: u32 },
    /// Lifecycle record bookkeeping failed.
    #[error(transparent)]
    Records(#[from] RegistryError),
    /// Dropping privileges failed.
    #[error(transparent)]
    Identity(#[from] IdentityError),
    /// A daemon failed during the startup sequence.
    #[error("daemon startup failed: {source}")]
    DaemonStart {
        #[source]
        source: LaunchError,
    },
    /// A required resource is exhausted or inaccessible.
    #[error("resource exhausted: {source}; {guidance}")]
    ResourceExhaustion {
        guidance: &'static str,
        #[source]
        source: PoolError,
    },
    /// The order-fetching task could not start.
    #[error(transparent)]
    Orders(#[from] OrderError),
    /// Teardown failed after an otherwise clean run.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    /// Anything else; logged generically, never swallowed.
    #[error("{message}")]
    Unclassified { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::daemons::ENGINE_DAEMON;
    use crate::keys::KeyError;
    use crate::launcher::DaemonSpec;
    use crate::role::{
        Cancellation, NodeSession, SessionError, SessionOutcome,
    };
    use crate::signals::SignalError;

    use camino::Utf8PathBuf;

    struct QuietTable;

    impl ProcessTable for QuietTable {
        fn is_running(&self, _name: &str) -> bool {
            false
        }
        fn pids_of(&self, _name: &str) -> Vec<u32> {
            Vec::new()
        }
        fn children_of(&self, _pid: u32) -> Vec<u32> {
            Vec::new()
        }
        fn terminate(&self, _pid: u32) {}
    }

    struct RecordingLauncher {
        registry: PidRegistry,
        launched: Mutex<Vec<&'static str>>,
    }

    impl Launcher for RecordingLauncher {
        fn launch(&self, spec: &DaemonSpec) -> Result<u32, LaunchError> {
            self.launched.lock().expect("lock").push(spec.name);
            if spec.records_pid {
                self.registry
                    .write(spec.name, std::process::id())
                    .map_err(|source| LaunchError::Record {
                        name: spec.name,
                        source,
                    })?;
            }
            Ok(5000)
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

    struct InstantSession;

    impl NodeSession for InstantSession {
        fn run(self: Box<Self>, _cancel: &Cancellation) -> SessionOutcome {
            SessionOutcome::Completed
        }
    }

    struct InstantFactory;

    impl SessionFactory for InstantFactory {
        fn network_session(&self) -> Result<Box<dyn NodeSession>, SessionError> {
            Ok(Box::new(InstantSession))
        }
        fn control_session(&self) -> Result<Box<dyn NodeSession>, SessionError> {
            Ok(Box::new(InstantSession))
        }
    }

    struct PresentKeys;

    impl SigningKeys for PresentKeys {
        fn exists(&self) -> bool {
            true
        }
        fn generate(&self) -> Result<(), KeyError> {
            Ok(())
        }
    }

    struct NoopIdentity;

    impl Identity for NoopIdentity {
        fn drop_privileges(&self, _user: &str) -> Result<(), IdentityError> {
            Ok(())
        }
    }

    struct NeverSignal;

    impl ShutdownSignal for NeverSignal {
        fn wait(&self) -> Result<(), SignalError> {
            loop {
                thread::sleep(Duration::from_secs(3600));
            }
        }
    }

    struct NoOrders;

    impl OrderFetcher for NoOrders {
        fn fetch(&self) -> Result<(), OrderError> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Config,
        paths: RunPaths,
        registry: PidRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("temp dir");
            let root =
                Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
            let mut config = Config::default();
            config.paths.run_dir = root.join("run");
            config.paths.data_dir = root.join("data");
            let paths = RunPaths::from_config(&config).expect("derive paths");
            let registry = PidRegistry::new(paths.records_dir());
            Self {
                _dir: dir,
                config,
                paths,
                registry,
            }
        }
    }

    fn plan<'a>(fixture: &'a Fixture, launcher: &'a RecordingLauncher) -> SupervisorPlan<'a> {
        SupervisorPlan {
            config: &fixture.config,
            paths: &fixture.paths,
            registry: &fixture.registry,
            table: &QuietTable,
            launcher,
            probe: &ReadyProbe,
            factory: &InstantFactory,
            keys: &PresentKeys,
            identity: &NoopIdentity,
            signal: Arc::new(NeverSignal),
            orders: Arc::new(NoOrders),
            run_as_root: true,
        }
    }

    #[test]
    fn start_launches_daemons_and_cleans_up() {
        let fixture = Fixture::new();
        let launcher = RecordingLauncher {
            registry: fixture.registry.clone(),
            launched: Mutex::new(Vec::new()),
        };
        start(&plan(&fixture, &launcher)).expect("supervisor run");

        assert_eq!(
            *launcher.launched.lock().expect("lock"),
            vec!["foreman-engined", "foreman-comms-apid", "foreman-apid"]
        );
        // Teardown must leave no records behind.
        assert_eq!(
            fixture
                .registry
                .lookup(SUPERVISOR_DAEMON)
                .expect("lookup supervisor"),
            None
        );
        assert_eq!(
            fixture.registry.lookup(ENGINE_DAEMON).expect("lookup engine"),
            None
        );
    }

    #[test]
    fn second_instance_is_rejected() {
        let fixture = Fixture::new();
        fixture
            .registry
            .write(SUPERVISOR_DAEMON, std::process::id())
            .expect("write record");
        let launcher = RecordingLauncher {
            registry: fixture.registry.clone(),
            launched: Mutex::new(Vec::new()),
        };
        let error = start(&plan(&fixture, &launcher)).expect_err("start must fail");
        assert!(matches!(error, SupervisorError::AlreadyRunning { .. }));
        assert!(launcher.launched.lock().expect("lock").is_empty());
    }

    #[test]
    fn stale_state_is_cleared_on_start() {
        let fixture = Fixture::new();
        let stale = fixture.paths.state_dir().join("membership.json");
        fs::write(&stale, b"{}").expect("write stale state");
        let launcher = RecordingLauncher {
            registry: fixture.registry.clone(),
            launched: Mutex::new(Vec::new()),
        };
        start(&plan(&fixture, &launcher)).expect("supervisor run");
        assert!(!stale.exists());
    }

    #[test]
    fn stop_without_record_degrades_to_log_output() {
        let fixture = Fixture::new();
        stop(&fixture.registry, &QuietTable);
    }

    #[test]
    fn status_reports_every_daemon() {
        let mut out = Vec::new();
        status(&QuietTable, &mut out).expect("render status");
        let text = String::from_utf8(out).expect("utf8 output");
        for name in STATUS_ORDER {
            assert!(text.contains(&format!("{name} is not running")));
        }
    }
}
