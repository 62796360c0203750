//! Typed configuration shared by the foreman supervisor and its lifecycle
//! commands.
//!
//! The supervisor treats configuration semantics as an external concern: this
//! crate only materialises the handful of values the orchestration core reads
//! (node role, debug level, reconnect interval, channel endpoints, and the
//! filesystem layout) from a TOML file plus built-in defaults. Validation of
//! the wider server configuration belongs to the configuration subsystem the
//! supervisor merely polls for readiness.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod logging;
mod paths;
mod role;
mod socket;

pub use logging::{DebugLevel, LogFormat};
pub use paths::{default_data_dir, default_run_dir, RunPaths, RunPathsError};
pub use role::NodeRole;
pub use socket::{SocketEndpoint, SocketParseError, SocketPreparationError};

/// Environment variable naming an alternative configuration file.
pub const CONFIG_PATH_ENV_VAR: &str = "FOREMAND_CONFIG_PATH";
/// Default configuration file consulted when nothing overrides it.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/foreman/foreman.toml";

const CONFIG_PATH_FLAG: &str = "--config-path";

/// Resolved node configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Identity and cluster role of this node.
    pub node: NodeSection,
    /// Logging controls shared with the engine daemon.
    pub logging: LoggingSection,
    /// Follower reconnect tuning.
    pub retry: RetrySection,
    /// Filesystem layout.
    pub paths: PathsSection,
    /// Channel endpoints the supervisor polls or serves.
    pub channels: ChannelsSection,
    /// Unprivileged identity the supervisor drops to.
    pub identity: IdentitySection,
}

/// Identity and role of the node.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeSection {
    pub name: String,
    pub role: NodeRole,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: "node".to_owned(),
            role: NodeRole::default(),
        }
    }
}

/// Logging section.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSection {
    pub level: DebugLevel,
    pub format: LogFormat,
}

/// Follower reconnect tuning.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySection {
    /// Fixed interval, in seconds, between follower reconnect attempts.
    pub connection_retry_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            connection_retry_secs: 10,
        }
    }
}

/// Filesystem layout section.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsSection {
    /// Installation prefix holding the daemon binaries.
    pub share_dir: Utf8PathBuf,
    /// Runtime directory holding pid records and transient state.
    pub run_dir: Utf8PathBuf,
    /// Persistent data directory holding key material.
    pub data_dir: Utf8PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            share_dir: Utf8PathBuf::from("/usr/share/foreman"),
            run_dir: utf8_or_tmp(default_run_dir()),
            data_dir: utf8_or_tmp(default_data_dir()),
        }
    }
}

/// Channel endpoints section.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelsSection {
    /// Readiness channel served by the configuration subsystem.
    pub readiness: SocketEndpoint,
    /// Local control channel served by the supervisor itself.
    pub control: SocketEndpoint,
    /// Endpoint the order-fetching task polls.
    pub orders: SocketEndpoint,
}

impl Default for ChannelsSection {
    fn default() -> Self {
        let run_dir = utf8_or_tmp(default_run_dir());
        Self {
            readiness: SocketEndpoint::unix(run_dir.join("config.sock")),
            control: SocketEndpoint::unix(run_dir.join("control.sock")),
            orders: SocketEndpoint::unix(run_dir.join("comms.sock")),
        }
    }
}

/// Unprivileged identity section.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdentitySection {
    /// Service user the supervisor drops privileges to.
    pub user: String,
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            user: "foreman".to_owned(),
        }
    }
}

impl Config {
    /// Loads configuration from the default file location.
    ///
    /// A missing file yields the built-in defaults; a present but malformed
    /// file is an error.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var_os(CONFIG_PATH_ENV_VAR) {
            Some(path) => Self::load_from_file(PathBuf::from(path), true),
            None => Self::load_from_file(PathBuf::from(DEFAULT_CONFIG_PATH), false),
        }
    }

    /// Loads configuration, honouring a `--config-path` argument when one
    /// appears in `args` ahead of any subcommand token.
    pub fn load_from_iter<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = OsString>,
    {
        match extract_config_path(args) {
            Some(path) => Self::load_from_file(path, true),
            None => Self::load(),
        }
    }

    fn load_from_file(path: PathBuf, required: bool) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if !required && error.kind() == io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Role this node plays in the cluster.
    #[must_use]
    pub fn node_role(&self) -> NodeRole {
        self.node.role
    }

    /// Configured node name.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node.name
    }

    /// Numeric debug mode.
    #[must_use]
    pub fn debug_level(&self) -> DebugLevel {
        self.logging.level
    }

    /// Logging output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.logging.format
    }

    /// Filter directive for the tracing subscriber.
    #[must_use]
    pub fn log_filter(&self) -> &'static str {
        self.logging.level.filter_directive()
    }

    /// Fixed follower reconnect interval.
    #[must_use]
    pub fn connection_retry(&self) -> Duration {
        Duration::from_secs(self.retry.connection_retry_secs)
    }

    /// Installation prefix holding the daemon binaries.
    #[must_use]
    pub fn share_dir(&self) -> &Utf8PathBuf {
        &self.paths.share_dir
    }

    /// Runtime directory.
    #[must_use]
    pub fn run_dir(&self) -> &Utf8PathBuf {
        &self.paths.run_dir
    }

    /// Persistent data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Utf8PathBuf {
        &self.paths.data_dir
    }

    /// Readiness channel endpoint.
    #[must_use]
    pub fn readiness_channel(&self) -> &SocketEndpoint {
        &self.channels.readiness
    }

    /// Local control channel endpoint.
    #[must_use]
    pub fn control_channel(&self) -> &SocketEndpoint {
        &self.channels.control
    }

    /// Endpoint polled by the order-fetching task.
    #[must_use]
    pub fn orders_channel(&self) -> &SocketEndpoint {
        &self.channels.orders
    }

    /// Service user the supervisor drops privileges to.
    #[must_use]
    pub fn service_user(&self) -> &str {
        &self.identity.user
    }
}

fn extract_config_path<I>(args: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = OsString>,
{
    let mut iter = args.into_iter();
    while let Some(argument) = iter.next() {
        let text = argument.to_string_lossy();
        if text == CONFIG_PATH_FLAG {
            return iter.next().map(PathBuf::from);
        }
        if let Some(value) = text.strip_prefix("--config-path=") {
            return Some(PathBuf::from(value));
        }
    }
    None
}

fn utf8_or_tmp(path: PathBuf) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path).unwrap_or_else(|_| Utf8PathBuf::from("/tmp/foreman"))
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the configuration file failed.
    #[error("failed to read configuration file '{path}': {source}", path = path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Parsing the configuration file failed.
    #[error("failed to parse configuration file '{path}': {source}", path = path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_file() {
        let config = Config::default();
        assert_eq!(config.node_role(), NodeRole::Coordinator);
        assert_eq!(config.connection_retry(), Duration::from_secs(10));
        assert_eq!(config.log_filter(), "info");
    }

    #[test]
    fn parses_configuration_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("foreman.toml");
        fs::write(
            &path,
            r#"
[node]
name = "edge-7"
role = "follower"

[logging]
level = 2

[retry]
connection_retry_secs = 3

[channels]
readiness = "tcp://127.0.0.1:7801"
"#,
        )
        .expect("write config");

        let args = vec![
            OsString::from("foremand"),
            OsString::from("--config-path"),
            path.clone().into_os_string(),
        ];
        let config = Config::load_from_iter(args).expect("load config");
        assert_eq!(config.node_role(), NodeRole::Follower);
        assert_eq!(config.node_name(), "edge-7");
        assert_eq!(config.log_filter(), "trace");
        assert_eq!(config.connection_retry(), Duration::from_secs(3));
        assert_eq!(
            config.readiness_channel(),
            &SocketEndpoint::tcp("127.0.0.1", 7801)
        );
    }

    #[test]
    fn inline_config_path_flag_is_honoured() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("foreman.toml");
        fs::write(&path, "[node]\nrole = \"follower\"\n").expect("write config");
        let flag = format!("--config-path={}", path.display());
        let config = Config::load_from_iter(vec![OsString::from("foremand"), flag.into()])
            .expect("load config");
        assert_eq!(config.node_role(), NodeRole::Follower);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let args = vec![
            OsString::from("foremand"),
            OsString::from("--config-path"),
            OsString::from("/nonexistent/foreman.toml"),
        ];
        let error = Config::load_from_iter(args).expect_err("load must fail");
        assert!(matches!(error, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("foreman.toml");
        fs::write(&path, "[node\nrole = ").expect("write config");
        let args = vec![
            OsString::from("foremand"),
            OsString::from("--config-path"),
            path.into_os_string(),
        ];
        let error = Config::load_from_iter(args).expect_err("load must fail");
        assert!(matches!(error, ConfigError::Parse { .. }));
    }
}
