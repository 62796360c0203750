//! Names, ordering, and launch specifications for the managed daemons.

use camino::Utf8PathBuf;

use foreman_config::Config;

use crate::launcher::DaemonSpec;

/// The supervisor's own lifecycle name.
pub const SUPERVISOR_DAEMON: &str = "foremand";
/// Core engine daemon.
pub const ENGINE_DAEMON: &str = "foreman-engined";
/// Communications API daemon.
pub const COMMS_DAEMON: &str = "foreman-comms-apid";
/// Management API daemon.
pub const MANAGEMENT_DAEMON: &str = "foreman-apid";

/// Fixed launch order. Failure at any position aborts the remainder.
pub const LAUNCH_ORDER: [&str; 3] = [ENGINE_DAEMON, COMMS_DAEMON, MANAGEMENT_DAEMON];

/// Fixed shutdown signalling order.
pub const SHUTDOWN_ORDER: [&str; 3] = [ENGINE_DAEMON, MANAGEMENT_DAEMON, COMMS_DAEMON];

/// Reporting order used by the `status` command.
pub const STATUS_ORDER: [&str; 4] = [
    SUPERVISOR_DAEMON,
    COMMS_DAEMON,
    MANAGEMENT_DAEMON,
    ENGINE_DAEMON,
];

fn daemon_binary(config: &Config, name: &str) -> Utf8PathBuf {
    config.share_dir().join("bin").join(name)
}

/// Builds the launch specifications for the auxiliary daemons, in launch
/// order.
///
/// The engine accepts a log-level flag derived from the configured debug
/// level and is the only daemon tracked by a lifecycle record; the two API
/// daemons are children of the supervisor's process tree and take a root flag
/// when privilege drop was skipped.
#[must_use]
pub fn daemon_specs(config: &Config, run_as_root: bool) -> Vec<DaemonSpec> {
    let engine = DaemonSpec {
        name: ENGINE_DAEMON,
        program: daemon_binary(config, ENGINE_DAEMON),
        args: vec![
            "server".to_owned(),
            "-l".to_owned(),
            config.debug_level().engine_log_level().to_owned(),
            "start".to_owned(),
        ],
        records_pid: true,
    };

    let api_args = |name: &'static str| {
        let mut args = Vec::new();
        if run_as_root {
            args.push("--root".to_owned());
        }
        DaemonSpec {
            name,
            program: daemon_binary(config, name),
            args,
            records_pid: false,
        }
    };

    vec![engine, api_args(COMMS_DAEMON), api_args(MANAGEMENT_DAEMON)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn specs_follow_the_launch_order() {
        let config = Config::default();
        let specs = daemon_specs(&config, false);
        let names: Vec<&str> = specs.iter().map(|spec| spec.name).collect();
        assert_eq!(names, LAUNCH_ORDER);
    }

    #[test]
    fn only_the_engine_records_a_pid() {
        let config = Config::default();
        let specs = daemon_specs(&config, false);
        let recorded: Vec<&str> = specs
            .iter()
            .filter(|spec| spec.records_pid)
            .map(|spec| spec.name)
            .collect();
        assert_eq!(recorded, vec![ENGINE_DAEMON]);
    }

    #[test]
    fn root_flag_reaches_the_api_daemons() {
        let config = Config::default();
        let specs = daemon_specs(&config, true);
        for spec in specs.iter().filter(|spec| !spec.records_pid) {
            assert_eq!(spec.args, vec!["--root".to_owned()]);
        }
        let engine = specs.iter().find(|spec| spec.records_pid).expect("engine");
        assert!(!engine.args.contains(&"--root".to_owned()));
    }

    #[rstest]
    #[case(0, "info")]
    #[case(1, "debug")]
    #[case(2, "trace")]
    fn engine_log_level_tracks_debug_mode(#[case] level: u8, #[case] expected: &str) {
        let mut config = Config::default();
        config.logging.level = foreman_config::DebugLevel(level);
        let specs = daemon_specs(&config, false);
        let engine = specs.first().expect("engine spec");
        assert_eq!(engine.args, vec!["server", "-l", expected, "start"]);
    }
}
