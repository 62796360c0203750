//! Long-running role sessions and their lifecycle plumbing.
//!
//! Each role runs two sessions concurrently: the network process speaking to
//! the rest of the cluster and the local-control companion serving same-host
//! management queries. Sessions are constructed fresh for every attempt so a
//! follower reconnect never reuses connection state.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::cancel::CancelFlag;
use crate::control::{ControlListener, ControlResponder};

use foreman_config::SocketEndpoint;

const SESSION_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::session");

const SESSION_POLL: Duration = Duration::from_millis(50);

/// Two-level cancellation visible to a running session.
///
/// The outer flag belongs to the whole supervisor run; the inner flag belongs
/// to one session attempt and lets the role retire a companion session
/// without tearing the run down.
#[derive(Debug, Clone)]
pub struct Cancellation {
    outer: CancelFlag,
    inner: CancelFlag,
}

impl Cancellation {
    #[must_use]
    pub fn new(outer: CancelFlag, inner: CancelFlag) -> Self {
        Self { outer, inner }
    }

    /// Whether either level has requested cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.outer.is_cancelled() || self.inner.is_cancelled()
    }
}

/// Failure detail carried out of a session.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SessionError(pub String);

/// How a session attempt ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The session retired in response to cancellation.
    Completed,
    /// The link to the coordinator dropped; recoverable for followers.
    ConnectionLost,
    /// The session hit an unrecoverable error.
    Failed(SessionError),
}

/// A long-running role task.
pub trait NodeSession: Send {
    /// Runs until completion, cancellation, or failure.
    fn run(self: Box<Self>, cancel: &Cancellation) -> SessionOutcome;
}

/// Builds fresh sessions for each role attempt.
pub trait SessionFactory: Send + Sync {
    /// The role's cluster-facing network process.
    fn network_session(&self) -> Result<Box<dyn NodeSession>, SessionError>;

    /// The local-control companion. Binds its channel at construction so an
    /// unusable endpoint fails the attempt before any daemon is launched.
    fn control_session(&self) -> Result<Box<dyn NodeSession>, SessionError>;
}

/// Handle to a session running on its own thread.
pub struct SessionHandle {
    name: &'static str,
    inner: CancelFlag,
    handle: thread::JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    /// Spawns `session` with a fresh inner cancellation flag chained to
    /// `outer`.
    pub fn spawn(
        name: &'static str,
        session: Box<dyn NodeSession>,
        outer: &CancelFlag,
    ) -> Result<Self, SessionError> {
        let inner = CancelFlag::new();
        let cancellation = Cancellation::new(outer.clone(), inner.clone());
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || session.run(&cancellation))
            .map_err(|error| SessionError(format!("failed to spawn session '{name}': {error}")))?;
        Ok(Self {
            name,
            inner,
            handle,
        })
    }

    /// Asks this session, and only this session, to retire.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Session name for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Waits for the session to finish. A panicked session counts as failed.
    #[must_use]
    pub fn join(self) -> SessionOutcome {
        match self.handle.join() {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(target: SESSION_TARGET, session = self.name, "session thread panicked");
                SessionOutcome::Failed(SessionError(format!(
                    "session '{}' panicked",
                    self.name
                )))
            }
        }
    }
}

/// Network session placeholder for the production build.
///
/// The cluster protocol itself lives in the communications daemon; the
/// supervisor's network session only holds the role open until cancellation.
pub struct IdleSession;

impl NodeSession for IdleSession {
    fn run(self: Box<Self>, cancel: &Cancellation) -> SessionOutcome {
        while !cancel.is_cancelled() {
            thread::sleep(SESSION_POLL);
        }
        SessionOutcome::Completed
    }
}

/// Control session serving the bound listener until cancelled.
pub struct ControlSession {
    listener: ControlListener,
    responder: Arc<dyn ControlResponder>,
}

impl NodeSession for ControlSession {
    fn run(self: Box<Self>, cancel: &Cancellation) -> SessionOutcome {
        let handle = match self.listener.serve(self.responder) {
            Ok(handle) => handle,
            Err(error) => return SessionOutcome::Failed(SessionError(error.to_string())),
        };
        while !cancel.is_cancelled() {
            thread::sleep(SESSION_POLL);
        }
        handle.shutdown();
        match handle.join() {
            Ok(()) => SessionOutcome::Completed,
            Err(error) => SessionOutcome::Failed(SessionError(error.to_string())),
        }
    }
}

/// Factory wired to the real control channel.
pub struct SystemSessionFactory {
    control_endpoint: SocketEndpoint,
    responder: Arc<dyn ControlResponder>,
}

impl SystemSessionFactory {
    #[must_use]
    pub fn new(control_endpoint: SocketEndpoint, responder: Arc<dyn ControlResponder>) -> Self {
        Self {
            control_endpoint,
            responder,
        }
    }
}

impl SessionFactory for SystemSessionFactory {
    fn network_session(&self) -> Result<Box<dyn NodeSession>, SessionError> {
        Ok(Box::new(IdleSession))
    }

    fn control_session(&self) -> Result<Box<dyn NodeSession>, SessionError> {
        self.control_endpoint
            .prepare_filesystem()
            .map_err(|error| SessionError(error.to_string()))?;
        let listener = ControlListener::bind(&self.control_endpoint)
            .map_err(|error| SessionError(error.to_string()))?;
        Ok(Box::new(ControlSession {
            listener,
            responder: Arc::clone(&self.responder),
        }))
    }
}
