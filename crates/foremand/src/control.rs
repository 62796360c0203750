//! Local control channel for same-host management queries.
//!
//! The supervisor serves a tiny listener next to each role run. A connection
//! gets exactly one JSON line describing the node's role and daemon liveness
//! and is then closed; richer management commands travel through the
//! management API daemon, not through this channel. Replies are written
//! inline on the accept thread, so the listener needs no per-connection
//! workers.

use std::io::{self, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use foreman_config::{NodeRole, SocketEndpoint};

use crate::cancel::{interruptible_sleep, CancelFlag};
use crate::daemons::STATUS_ORDER;
use crate::proc_table::ProcessTable;

#[cfg(unix)]
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};

use std::sync::Arc;

use camino::Utf8PathBuf;

const CONTROL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::control");

const IDLE_PAUSE: Duration = Duration::from_millis(25);
const FAULT_PAUSE: Duration = Duration::from_millis(150);

/// Produces the reply sent to one control client.
pub trait ControlResponder: Send + Sync {
    /// Writes the full reply. The connection closes once this returns.
    fn respond(&self, out: &mut dyn Write) -> io::Result<()>;
}

/// Responder answering with a one-line JSON liveness snapshot.
pub struct StatusResponder {
    node: String,
    role: NodeRole,
    table: Arc<dyn ProcessTable>,
}

#[derive(Serialize)]
struct Snapshot<'a> {
    node: &'a str,
    role: String,
    daemons: Vec<DaemonState>,
}

#[derive(Serialize)]
struct DaemonState {
    name: &'static str,
    running: bool,
}

impl StatusResponder {
    #[must_use]
    pub fn new(node: impl Into<String>, role: NodeRole, table: Arc<dyn ProcessTable>) -> Self {
        Self {
            node: node.into(),
            role,
            table,
        }
    }
}

impl ControlResponder for StatusResponder {
    fn respond(&self, out: &mut dyn Write) -> io::Result<()> {
        let snapshot = Snapshot {
            node: &self.node,
            role: self.role.to_string(),
            daemons: STATUS_ORDER
                .iter()
                .map(|name| DaemonState {
                    name,
                    running: self.table.is_running(name),
                })
                .collect(),
        };
        serde_json::to_writer(&mut *out, &snapshot).map_err(io::Error::other)?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

/// Listener bound to the control endpoint, not yet serving.
#[derive(Debug)]
pub struct ControlListener {
    endpoint: SocketEndpoint,
    kind: ListenerKind,
}

#[derive(Debug)]
enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl ControlListener {
    /// Binds the endpoint. An existing unix socket path is reclaimed when no
    /// live listener answers on it, and rejected when one does.
    pub fn bind(endpoint: &SocketEndpoint) -> Result<Self, ControlError> {
        let kind = match endpoint {
            SocketEndpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).map_err(|source| {
                    ControlError::Bind {
                        endpoint: endpoint.to_string(),
                        source,
                    }
                })?;
                ListenerKind::Tcp(listener)
            }
            SocketEndpoint::Unix { path } => {
                #[cfg(unix)]
                {
                    reclaim_unix_path(path)?;
                    let listener =
                        UnixListener::bind(path.as_std_path()).map_err(|source| {
                            ControlError::Bind {
                                endpoint: endpoint.to_string(),
                                source,
                            }
                        })?;
                    ListenerKind::Unix(listener)
                }

                #[cfg(not(unix))]
                {
                    let _ = path;
                    return Err(ControlError::UnixUnsupported {
                        endpoint: endpoint.to_string(),
                    });
                }
            }
        };
        Ok(Self {
            endpoint: endpoint.clone(),
            kind,
        })
    }

    #[cfg(test)]
    fn tcp_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.kind {
            ListenerKind::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            ListenerKind::Unix(_) => None,
        }
    }

    /// Starts answering clients on a background thread.
    pub fn serve(self, responder: Arc<dyn ControlResponder>) -> Result<ControlHandle, ControlError> {
        let nonblocking = match &self.kind {
            ListenerKind::Tcp(listener) => listener.set_nonblocking(true),
            #[cfg(unix)]
            ListenerKind::Unix(listener) => listener.set_nonblocking(true),
        };
        if let Err(source) = nonblocking {
            self.remove_socket_file();
            return Err(ControlError::Configure { source });
        }

        let cancel = CancelFlag::new();
        let loop_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name("control".to_owned())
            .spawn(move || self.answer_clients(&loop_cancel, responder.as_ref()))
            .map_err(|source| ControlError::Spawn { source })?;
        Ok(ControlHandle {
            cancel,
            handle: Some(handle),
        })
    }

    fn answer_clients(self, cancel: &CancelFlag, responder: &dyn ControlResponder) {
        info!(
            target: CONTROL_TARGET,
            endpoint = %self.endpoint,
            "control channel open"
        );
        while !cancel.is_cancelled() {
            match self.next_client() {
                Ok(Some(mut client)) => {
                    if let Err(error) = responder.respond(&mut client) {
                        warn!(
                            target: CONTROL_TARGET,
                            error = %error,
                            "failed to answer control client"
                        );
                    }
                }
                Ok(None) => {
                    interruptible_sleep(IDLE_PAUSE, cancel);
                }
                Err(error) => {
                    warn!(target: CONTROL_TARGET, error = %error, "control accept failed");
                    interruptible_sleep(FAULT_PAUSE, cancel);
                }
            }
        }
        self.remove_socket_file();
    }

    /// One nonblocking accept attempt. `None` means no client was waiting.
    fn next_client(&self) -> io::Result<Option<Box<dyn Write>>> {
        let client: Box<dyn Write> = match &self.kind {
            ListenerKind::Tcp(listener) => match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    Box::new(stream)
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(error) => return Err(error),
            },
            #[cfg(unix)]
            ListenerKind::Unix(listener) => match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    Box::new(stream)
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(error) => return Err(error),
            },
        };
        Ok(Some(client))
    }

    fn remove_socket_file(&self) {
        #[cfg(unix)]
        if let SocketEndpoint::Unix { path } = &self.endpoint {
            match fs::remove_file(path.as_std_path()) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => {
                    warn!(
                        target: CONTROL_TARGET,
                        error = %error,
                        path = %path,
                        "failed to remove control socket file"
                    );
                }
            }
        }
    }
}

/// Decides whether an existing path at the unix endpoint can be reused.
///
/// A connectable socket belongs to a live instance and stays; a socket
/// nobody answers on is left over from a crash and is removed.
#[cfg(unix)]
fn reclaim_unix_path(path: &Utf8PathBuf) -> Result<(), ControlError> {
    let std_path = path.as_std_path();
    let metadata = match fs::symlink_metadata(std_path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(ControlError::PathInspect {
                path: path.clone(),
                source,
            })
        }
    };
    if !metadata.file_type().is_socket() {
        return Err(ControlError::PathNotSocket { path: path.clone() });
    }
    match UnixStream::connect(std_path) {
        Ok(_live) => Err(ControlError::PathBusy { path: path.clone() }),
        Err(error)
            if error.kind() == io::ErrorKind::ConnectionRefused
                || error.kind() == io::ErrorKind::NotFound =>
        {
            fs::remove_file(std_path).map_err(|source| ControlError::PathReclaim {
                path: path.clone(),
                source,
            })
        }
        Err(source) => Err(ControlError::PathInspect {
            path: path.clone(),
            source,
        }),
    }
}

/// Handle to the serving thread.
pub struct ControlHandle {
    cancel: CancelFlag,
    handle: Option<thread::JoinHandle<()>>,
}

impl ControlHandle {
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn join(mut self) -> Result<(), ControlError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| ControlError::Panicked),
            None => Ok(()),
        }
    }
}

impl Drop for ControlHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Errors raised by the control channel.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Binding the endpoint failed.
    #[error("failed to bind control endpoint {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    /// Inspecting an existing socket path failed.
    #[error("failed to inspect control socket '{path}': {source}")]
    PathInspect {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
    /// The configured path exists but is not a socket.
    #[error("control socket path '{path}' exists and is not a socket")]
    PathNotSocket { path: Utf8PathBuf },
    /// Another instance is already serving the socket.
    #[error("control socket '{path}' is already in use")]
    PathBusy { path: Utf8PathBuf },
    /// Removing a crashed instance's socket file failed.
    #[error("failed to reclaim stale control socket '{path}': {source}")]
    PathReclaim {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
    /// Switching the listener to non-blocking mode failed.
    #[error("failed to configure control listener: {source}")]
    Configure {
        #[source]
        source: io::Error,
    },
    /// Spawning the serving thread failed.
    #[error("failed to spawn control thread: {source}")]
    Spawn {
        #[source]
        source: io::Error,
    },
    /// Unix sockets are unsupported on this platform.
    #[error("unix control sockets are not supported on this platform: {endpoint}")]
    UnixUnsupported { endpoint: String },
    /// The serving thread panicked.
    #[error("control thread panicked")]
    Panicked,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpStream;

    struct EmptyTable;

    impl ProcessTable for EmptyTable {
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

    fn status_responder() -> Arc<StatusResponder> {
        Arc::new(StatusResponder::new(
            "node-1",
            NodeRole::Coordinator,
            Arc::new(EmptyTable),
        ))
    }

    #[test]
    fn responder_writes_one_snapshot_line() {
        let mut reply = Vec::new();
        status_responder().respond(&mut reply).expect("respond");
        let text = String::from_utf8(reply).expect("utf8 reply");
        assert!(text.ends_with('\n'));
        assert!(text.contains("\"node\":\"node-1\""));
        assert!(text.contains("\"role\":\"coordinator\""));
        assert_eq!(text.matches("\"running\":false").count(), STATUS_ORDER.len());
    }

    #[test]
    fn tcp_clients_each_receive_a_snapshot() {
        let endpoint = SocketEndpoint::tcp("127.0.0.1", 0);
        let listener = ControlListener::bind(&endpoint).expect("bind tcp listener");
        let addr = listener.tcp_addr().expect("local address");
        let handle = listener.serve(status_responder()).expect("serve");

        for _ in 0..2 {
            let client = TcpStream::connect(addr).expect("connect client");
            let mut line = String::new();
            BufReader::new(client)
                .read_line(&mut line)
                .expect("read snapshot");
            assert!(line.contains("\"daemons\""));
        }

        handle.shutdown();
        handle.join().expect("join control thread");
    }

    #[cfg(unix)]
    #[test]
    fn stale_unix_socket_is_reclaimed() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("control.sock");
        {
            let _crashed = UnixListener::bind(&path).expect("bind stale listener");
        }
        assert!(path.exists(), "stale socket should remain");

        let endpoint = SocketEndpoint::unix(path.to_str().expect("utf8 path").to_string());
        let listener = ControlListener::bind(&endpoint).expect("bind over stale socket");
        let handle = listener.serve(status_responder()).expect("serve");

        let client = UnixStream::connect(&path).expect("connect unix client");
        let mut line = String::new();
        BufReader::new(client)
            .read_line(&mut line)
            .expect("read snapshot");
        assert!(line.contains("\"role\""));

        handle.shutdown();
        handle.join().expect("join control thread");
        assert!(!path.exists(), "socket file should be removed on shutdown");
    }

    #[cfg(unix)]
    #[test]
    fn live_unix_socket_is_not_stolen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("control.sock");
        let _existing = UnixListener::bind(&path).expect("bind existing listener");

        let endpoint = SocketEndpoint::unix(path.to_str().expect("utf8 path").to_string());
        let error = ControlListener::bind(&endpoint).expect_err("bind must fail");
        assert!(matches!(error, ControlError::PathBusy { .. }));
        assert!(path.exists(), "the live socket must be left alone");
    }
}
