//! Command-line entry point for the foreman supervisor.

use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{debug, error};

use foreman_config::{Config, RunPaths};

use foremand::control::StatusResponder;
use foremand::identity::ServiceIdentity;
use foremand::keys::FileSigningKeys;
use foremand::launcher::SystemLauncher;
use foremand::orders::ChannelOrderFetcher;
use foremand::probe::SocketChannelProbe;
use foremand::proc_table::SystemProcessTable;
use foremand::registry::PidRegistry;
use foremand::role::SystemSessionFactory;
use foremand::signals::SystemShutdownSignal;
use foremand::supervisor::{self, SupervisorPlan};
use foremand::telemetry;

const MAIN_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::main");

#[derive(Debug, Parser)]
#[command(name = "foremand", version, about = "Supervisor for a foreman node")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the supervisor and its daemons.
    Start(StartArgs),
    /// Stop a running supervisor.
    Stop,
    /// Report daemon liveness.
    Status,
}

#[derive(Debug, Args)]
struct StartArgs {
    /// Keep root privileges instead of dropping to the service user.
    #[arg(long)]
    root: bool,

    /// Benchmark hook consumed by the network process.
    #[arg(long = "performance_test", hide = true, value_name = "N")]
    performance_test: Option<u64>,

    /// Benchmark hook consumed by the network process.
    #[arg(long = "concurrency_test", hide = true, value_name = "N")]
    concurrency_test: Option<u64>,

    /// Benchmark hook: synthetic payload size.
    #[arg(long = "string", hide = true, value_name = "N")]
    string_size: Option<u64>,

    /// Benchmark hook: payload file.
    #[arg(long = "file", hide = true, value_name = "PATH")]
    payload_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load_from_iter(env::args_os()) {
        Ok(config) => config,
        Err(config_error) => {
            eprintln!("foremand: {config_error}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(telemetry_error) = telemetry::initialise(&config) {
        eprintln!("foremand: {telemetry_error}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Command::Start(args) => start(&config, &args),
        Command::Stop => stop(&config),
        Command::Status => status(),
    }
}

fn start(config: &Config, args: &StartArgs) -> ExitCode {
    if args.performance_test.is_some()
        || args.concurrency_test.is_some()
        || args.string_size.is_some()
        || args.payload_file.is_some()
    {
        debug!(
            target: MAIN_TARGET,
            performance = ?args.performance_test,
            concurrency = ?args.concurrency_test,
            "benchmark flags forwarded to the network process"
        );
    }

    let paths = match RunPaths::from_config(config) {
        Ok(paths) => paths,
        Err(paths_error) => {
            error!(target: MAIN_TARGET, error = %paths_error, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    let registry = PidRegistry::new(paths.records_dir());
    let table = SystemProcessTable::new();
    let launcher = SystemLauncher::new(registry.clone());
    let probe = SocketChannelProbe::new(config.readiness_channel().clone());
    let responder = StatusResponder::new(
        config.node_name(),
        config.node_role(),
        Arc::new(SystemProcessTable::new()),
    );
    let factory = SystemSessionFactory::new(config.control_channel().clone(), Arc::new(responder));
    let keys = FileSigningKeys::new(paths.keys_dir());
    let identity = ServiceIdentity;
    let orders = ChannelOrderFetcher::new(Box::new(SocketChannelProbe::new(
        config.orders_channel().clone(),
    )));

    let plan = SupervisorPlan {
        config,
        paths: &paths,
        registry: &registry,
        table: &table,
        launcher: &launcher,
        probe: &probe,
        factory: &factory,
        keys: &keys,
        identity: &identity,
        signal: Arc::new(SystemShutdownSignal),
        orders: Arc::new(orders),
        run_as_root: args.root,
    };

    match supervisor::start(&plan) {
        Ok(()) => ExitCode::SUCCESS,
        Err(supervisor_error) => {
            error!(target: MAIN_TARGET, error = %supervisor_error, "supervisor exited with failure");
            ExitCode::FAILURE
        }
    }
}

fn stop(config: &Config) -> ExitCode {
    let paths = match RunPaths::from_config(config) {
        Ok(paths) => paths,
        Err(paths_error) => {
            error!(target: MAIN_TARGET, error = %paths_error, "stop failed");
            return ExitCode::FAILURE;
        }
    };
    let registry = PidRegistry::new(paths.records_dir());
    let table = SystemProcessTable::new();
    supervisor::stop(&registry, &table);
    ExitCode::SUCCESS
}

fn status() -> ExitCode {
    let table = SystemProcessTable::new();
    let mut stdout = io::stdout();
    if let Err(status_error) = supervisor::status(&table, &mut stdout) {
        error!(target: MAIN_TARGET, error = %status_error, "status output failed");
    }
    ExitCode::SUCCESS
}
