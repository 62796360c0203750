//! Socket endpoints used for the readiness and local-control channels.
//!
//! Configuration carries endpoints as single url strings, `unix:///run/x.sock`
//! or `tcp://host:port`, which keeps the channel entries in the TOML file to
//! one line each.

use std::fmt;
use std::fs;
use std::io;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// One pollable or servable channel endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum SocketEndpoint {
    /// Unix domain socket endpoint.
    Unix { path: Utf8PathBuf },
    /// TCP socket endpoint.
    Tcp { host: String, port: u16 },
}

impl SocketEndpoint {
    /// Builds a Unix domain socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Builds a TCP socket endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Creates the directory a Unix socket lives in, restricted to the owner.
    /// TCP endpoints have no filesystem footprint.
    pub fn prepare_filesystem(&self) -> Result<(), SocketPreparationError> {
        let Self::Unix { path } = self else {
            return Ok(());
        };
        let failure = |source: io::Error| SocketPreparationError {
            path: path.clone(),
            source,
        };
        let Some(directory) = path.parent() else {
            return Err(failure(io::Error::new(
                io::ErrorKind::InvalidInput,
                "socket path has no parent directory",
            )));
        };
        fs::create_dir_all(directory.as_std_path()).map_err(failure)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(
                directory.as_std_path(),
                std::fs::Permissions::from_mode(0o700),
            )
            .map_err(failure)?;
        }
        Ok(())
    }
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(formatter, "unix://{path}"),
            Self::Tcp { host, port } => write!(formatter, "tcp://{host}:{port}"),
        }
    }
}

impl FromStr for SocketEndpoint {
    type Err = SocketParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(input).map_err(|source| SocketParseError::Malformed {
            input: input.to_owned(),
            source,
        })?;
        let unusable = |reason: &'static str| SocketParseError::Unusable {
            input: input.to_owned(),
            reason,
        };
        match url.scheme() {
            "unix" => match url.path() {
                "" => Err(unusable("names no socket path")),
                path => Ok(Self::unix(path)),
            },
            "tcp" => {
                let host = url.host_str().ok_or_else(|| unusable("names no host"))?;
                let port = url.port().ok_or_else(|| unusable("names no port"))?;
                Ok(Self::tcp(host, port))
            }
            _ => Err(unusable("uses a scheme other than unix or tcp")),
        }
    }
}

impl TryFrom<String> for SocketEndpoint {
    type Error = SocketParseError;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        input.parse()
    }
}

impl From<SocketEndpoint> for String {
    fn from(endpoint: SocketEndpoint) -> Self {
        endpoint.to_string()
    }
}

/// Errors raised when parsing an endpoint from its url form.
#[derive(Debug, Error)]
pub enum SocketParseError {
    /// The text is not a url at all.
    #[error("invalid endpoint '{input}': {source}")]
    Malformed {
        input: String,
        #[source]
        source: url::ParseError,
    },
    /// The url parsed but does not describe a usable endpoint.
    #[error("endpoint '{input}' {reason}")]
    Unusable { input: String, reason: &'static str },
}

/// Failure to create a Unix socket's directory.
#[derive(Debug, Error)]
#[error("failed to prepare socket directory for '{path}': {source}")]
pub struct SocketPreparationError {
    path: Utf8PathBuf,
    #[source]
    source: io::Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_in_url_form() {
        let unix = SocketEndpoint::unix("/run/foreman/config.sock");
        assert_eq!(unix.to_string(), "unix:///run/foreman/config.sock");
        let tcp = SocketEndpoint::tcp("127.0.0.1", 9000);
        assert_eq!(tcp.to_string(), "tcp://127.0.0.1:9000");
    }

    #[test]
    fn parses_both_transports() {
        let unix: SocketEndpoint = "unix:///run/foreman/control.sock".parse().unwrap();
        assert_eq!(unix, SocketEndpoint::unix("/run/foreman/control.sock"));
        let tcp: SocketEndpoint = "tcp://127.0.0.1:9000".parse().unwrap();
        assert_eq!(tcp, SocketEndpoint::tcp("127.0.0.1", 9000));
    }

    #[test]
    fn rejects_unusable_urls() {
        for input in ["http://example", "tcp://127.0.0.1"] {
            let error = input.parse::<SocketEndpoint>().unwrap_err();
            assert!(matches!(error, SocketParseError::Unusable { .. }), "{input}");
        }
    }

    #[test]
    fn deserialises_from_a_toml_string() {
        #[derive(Deserialize)]
        struct Holder {
            endpoint: SocketEndpoint,
        }
        let holder: Holder =
            toml::from_str("endpoint = \"tcp://10.0.0.1:7801\"").expect("parse holder");
        assert_eq!(holder.endpoint, SocketEndpoint::tcp("10.0.0.1", 7801));
    }

    #[test]
    fn prepare_filesystem_creates_the_socket_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested/run/control.sock");
        let endpoint = SocketEndpoint::unix(path.to_str().expect("utf8 path"));
        endpoint.prepare_filesystem().expect("prepare directory");
        assert!(path.parent().expect("parent").is_dir());
    }
}
