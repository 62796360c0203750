//! Readiness probing for channels served by other subsystems.
//!
//! Before launching daemons the supervisor waits until the configuration
//! subsystem answers on its readiness channel, which proves the shared
//! configuration has been validated. Probing is a plain connect attempt; any
//! accepted connection counts as ready.

use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::{info, warn};

use foreman_config::SocketEndpoint;

use crate::cancel::{interruptible_sleep, CancelFlag};

const PROBE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::probe");

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Probes a channel for readiness.
pub trait ChannelProbe: Send + Sync {
    /// Attempts one connection; `true` means the channel answered.
    fn probe(&self) -> bool;

    /// Human-readable channel description for logging.
    fn describe(&self) -> String;
}

/// Probe that connects to a configured socket endpoint.
#[derive(Debug, Clone)]
pub struct SocketChannelProbe {
    endpoint: SocketEndpoint,
}

impl SocketChannelProbe {
    #[must_use]
    pub fn new(endpoint: SocketEndpoint) -> Self {
        Self { endpoint }
    }
}

impl ChannelProbe for SocketChannelProbe {
    fn probe(&self) -> bool {
        match &self.endpoint {
            SocketEndpoint::Unix { path } => {
                #[cfg(unix)]
                {
                    let Ok(address) = SockAddr::unix(path.as_std_path()) else {
                        return false;
                    };
                    connect_once(Domain::UNIX, &address)
                }

                #[cfg(not(unix))]
                {
                    let _ = path;
                    false
                }
            }
            SocketEndpoint::Tcp { host, port } => {
                use std::net::ToSocketAddrs;

                let Ok(addresses) = (host.as_str(), *port).to_socket_addrs() else {
                    return false;
                };
                for address in addresses {
                    let domain = Domain::for_address(address);
                    if connect_once(domain, &SockAddr::from(address)) {
                        return true;
                    }
                }
                false
            }
        }
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

fn connect_once(domain: Domain, address: &SockAddr) -> bool {
    let Ok(socket) = Socket::new(domain, Type::STREAM, None) else {
        return false;
    };
    socket.connect_timeout(address, CONNECT_TIMEOUT).is_ok()
}

/// Blocks until `probe` answers, retrying every `interval`.
///
/// Returns [`ReadinessError::Cancelled`] when `cancel` is raised before the
/// channel becomes ready. The wait is otherwise unbounded: a channel that
/// never answers keeps the caller in startup, which is the signal operators
/// need to inspect the subsystem behind it.
pub fn wait_until_ready(
    probe: &dyn ChannelProbe,
    interval: Duration,
    cancel: &CancelFlag,
) -> Result<(), ReadinessError> {
    let channel = probe.describe();
    loop {
        if cancel.is_cancelled() {
            return Err(ReadinessError::Cancelled { channel });
        }
        if probe.probe() {
            info!(target: PROBE_TARGET, %channel, "channel ready");
            return Ok(());
        }
        warn!(target: PROBE_TARGET, %channel, "channel not ready yet, retrying");
        if !interruptible_sleep(interval, cancel) {
            return Err(ReadinessError::Cancelled { channel });
        }
    }
}

/// Errors raised while waiting for channel readiness.
#[derive(Debug, Error)]
pub enum ReadinessError {
    /// Cancellation was requested before the channel answered.
    #[error("cancelled while waiting for channel '{channel}'")]
    Cancelled { channel: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use tracing_subscriber::fmt::MakeWriter;

    struct ScriptedProbe {
        misses: usize,
        attempts: Arc<AtomicUsize>,
    }

    impl ChannelProbe for ScriptedProbe {
        fn probe(&self) -> bool {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            attempt >= self.misses
        }

        fn describe(&self) -> String {
            "scripted".to_owned()
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLog {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl CapturedLog {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.buffer.lock().expect("lock")).into_owned()
        }
    }

    impl io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLog {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn waits_through_misses_until_ready() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let probe = ScriptedProbe {
            misses: 2,
            attempts: Arc::clone(&attempts),
        };
        let cancel = CancelFlag::new();
        wait_until_ready(&probe, Duration::from_millis(5), &cancel).expect("channel ready");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn each_failed_attempt_logs_one_warning() {
        let log = CapturedLog::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(log.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();

        let attempts = Arc::new(AtomicUsize::new(0));
        let probe = ScriptedProbe {
            misses: 2,
            attempts,
        };
        let cancel = CancelFlag::new();
        tracing::subscriber::with_default(subscriber, || {
            wait_until_ready(&probe, Duration::from_millis(5), &cancel).expect("channel ready");
        });

        let text = log.contents();
        assert_eq!(text.matches("channel not ready yet").count(), 2);
    }

    #[test]
    fn cancellation_interrupts_the_wait() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let probe = ScriptedProbe {
            misses: usize::MAX,
            attempts,
        };
        let cancel = CancelFlag::new();
        cancel.cancel();
        let error = wait_until_ready(&probe, Duration::from_millis(5), &cancel)
            .expect_err("wait must stop");
        assert!(matches!(error, ReadinessError::Cancelled { .. }));
    }

    #[test]
    fn tcp_probe_detects_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        let probe = SocketChannelProbe::new(SocketEndpoint::tcp("127.0.0.1", port));
        assert!(probe.probe());
    }

    #[test]
    fn tcp_probe_misses_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);
        let probe = SocketChannelProbe::new(SocketEndpoint::tcp("127.0.0.1", port));
        assert!(!probe.probe());
    }
}
