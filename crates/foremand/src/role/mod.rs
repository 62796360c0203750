//! Role dispatch for the coordinator and follower startup paths.

mod coordinator;
mod follower;
mod session;

pub use session::{
    Cancellation, ControlSession, IdleSession, NodeSession, SessionError, SessionFactory,
    SessionHandle, SessionOutcome, SystemSessionFactory,
};

use std::time::Duration;

use thiserror::Error;

use foreman_config::NodeRole;

use crate::cancel::CancelFlag;
use crate::context::RunContext;
use crate::keys::{KeyError, SigningKeys};
use crate::launcher::{DaemonSpec, LaunchError, Launcher};
use crate::pool::PoolError;
use crate::probe::ChannelProbe;

pub(crate) const ROLE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::role");

/// Interval between readiness probe attempts.
pub(crate) const READINESS_POLL: Duration = Duration::from_secs(1);

/// Number of idle workers each role spawns for helper work.
pub(crate) const WORKER_COUNT: usize = 1;

/// Collaborators a role run needs, resolved once by the supervisor.
pub struct RoleRuntime<'a> {
    pub context: &'a RunContext,
    pub factory: &'a dyn SessionFactory,
    pub probe: &'a dyn ChannelProbe,
    pub launcher: &'a dyn Launcher,
    pub specs: &'a [DaemonSpec],
    pub keys: &'a dyn SigningKeys,
    pub retry_interval: Duration,
    pub cancel: &'a CancelFlag,
}

/// Runs the code path for the resolved role until cancellation or failure.
pub fn run_role(runtime: &RoleRuntime<'_>) -> Result<(), RoleError> {
    match runtime.context.role() {
        NodeRole::Coordinator => coordinator::run(runtime),
        NodeRole::Follower => follower::run(runtime),
    }
}

/// Fatal failures surfaced by a role run.
#[derive(Debug, Error)]
pub enum RoleError {
    /// Building a session failed.
    #[error("failed to prepare role session: {0}")]
    Session(SessionError),
    /// A running session failed in a way the role cannot recover from.
    #[error("session '{name}' failed: {source}")]
    SessionFailed {
        name: &'static str,
        #[source]
        source: SessionError,
    },
    /// A daemon failed to launch.
    #[error(transparent)]
    Launch(#[from] LaunchError),
    /// Key-pair generation failed.
    #[error(transparent)]
    Keys(#[from] KeyError),
    /// The worker pool could not be spawned.
    #[error(transparent)]
    Pool(#[from] PoolError),
}
