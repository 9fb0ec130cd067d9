//! Cluster rollback CLI

use clap::{Arg, ArgAction, Command};
use clusterlab_rollback::{
    addresses,
    config::Config,
    guard::Guard,
    ledger::cli::Cli,
    router::Router,
    scenario,
    topology::{self, Controller},
    Error, GENERATE_CMD, HEAL_CMD, RUN_CMD, SPLIT_CMD,
};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Flag for removing the respin marker after a manual heal
const CLEAR_RESPIN_FLAG: &str = "clear-respin";

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .required(true)
        .help("Path to YAML config file")
        .value_parser(clap::value_parser!(PathBuf))
}

/// Write split topology files for every node, replacing any already there.
fn generate(config_path: &Path) -> Result<PathBuf, Error> {
    let config = Config::load(config_path)?;
    let dir = config.split_topology_dir()?;
    topology::generate(&dir, &config.layout()?, &config.host)?;
    Ok(dir)
}

/// Split the cluster and return the backup of its original topology.
async fn split(config_path: &Path) -> Result<PathBuf, Error> {
    let config = Config::load(config_path)?;
    let layout = config.layout()?;
    let split_dir = topology::ensure_split_dir(&config.split_topology_dir()?, &layout, &config.host)?;
    Guard::new(&config.state_dir).require_clear()?;
    let ledger = Cli::new(config.cli()?);
    let mut controller = Controller::detect(&config.state_dir, &layout, config.p2p)?;
    let backup = controller.backup()?;
    controller.split(&split_dir, &ledger).await?;
    Ok(backup)
}

/// Restore the topology saved in `backup`, optionally removing the respin marker afterwards.
async fn heal(config_path: &Path, backup: &Path, clear_respin: bool) -> Result<(), Error> {
    let config = Config::load(config_path)?;
    let layout = config.layout()?;
    let ledger = Cli::new(config.cli()?);
    let mut controller = Controller::detect(&config.state_dir, &layout, config.p2p)?;
    controller.heal(backup, &ledger).await?;
    controller.confirm();
    let guard = Guard::new(&config.state_dir);
    if clear_respin {
        guard.clear()?;
        info!(path = ?guard.marker(), "cleared respin marker");
    } else if guard.needs_respin() {
        warn!(path = ?guard.marker(), "cluster is still marked for respin");
    }
    Ok(())
}

/// Run the whole rollback protocol.
async fn run(config_path: &Path) -> Result<(), Error> {
    // Load configuration
    let config = Config::load(config_path)?;
    let layout = config.layout()?;
    let socket = config.socket()?;
    let ledger = Cli::new(config.cli()?);
    let router = Router::new(&ledger, socket)?;
    info!(path = ?config_path, pools = layout.len(), "loaded configuration");

    // Prepare split topology
    topology::ensure_split_dir(&config.split_topology_dir()?, &layout, &config.host)?;
    let mut controller = Controller::detect(&config.state_dir, &layout, config.p2p)?;

    // Prepare addresses
    let records = addresses::ensure(&ledger, &config.work_dir()?, config.instance).await?;
    addresses::fund(
        &ledger,
        &router.default_endpoint(),
        &config.faucet,
        &records,
        config.fund_amount,
    )
    .await?;

    // Run
    let params = config.params(scenario::template())?;
    let outcome = scenario::run(&router, &layout, &mut controller, &records, &params).await?;
    info!(
        survivor = %outcome.survivor,
        transactions = outcome.records.len(),
        backup = ?outcome.backup,
        "consensus reached"
    );
    Ok(())
}

/// Define the application.
fn command() -> Command {
    Command::new("rollback")
        .version(crate_version())
        .about("Split a local cluster in two, heal it and verify that it rolls back to a single chain.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(GENERATE_CMD)
                .about("Generate split topology files for every node of the cluster.")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new(SPLIT_CMD)
                .about("Split the cluster into two halves and restart all nodes.")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new(HEAL_CMD)
                .about("Restore the original topology from a backup and restart all nodes.")
                .arg(config_arg())
                .arg(
                    Arg::new("backup")
                        .long("backup")
                        .required(true)
                        .help("Path to the topology backup created by split")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new(CLEAR_RESPIN_FLAG)
                        .long(CLEAR_RESPIN_FLAG)
                        .help("Remove the respin marker once the topology is restored")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new(RUN_CMD)
                .about("Split, diverge, heal and verify that exactly one half's transaction survived.")
                .arg(config_arg()),
        )
}

/// Entrypoint for the cluster rollback CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let matches = command().get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Parse subcommands
    match matches.subcommand() {
        Some((GENERATE_CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            match generate(config_path) {
                Ok(dir) => {
                    info!(path = ?dir, "generated split topology");
                    return std::process::ExitCode::SUCCESS;
                }
                Err(e) => error!(error=?e, "failed to generate split topology"),
            }
        }
        Some((SPLIT_CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            match split(config_path).await {
                Ok(backup) => {
                    info!(backup = ?backup, "split cluster");
                    return std::process::ExitCode::SUCCESS;
                }
                Err(e) => error!(error=?e, "failed to split cluster"),
            }
        }
        Some((HEAL_CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            let backup = matches.get_one::<PathBuf>("backup").unwrap();
            let clear_respin = matches.get_flag(CLEAR_RESPIN_FLAG);
            if let Err(e) = heal(config_path, backup, clear_respin).await {
                error!(error=?e, "failed to heal cluster");
            } else {
                return std::process::ExitCode::SUCCESS;
            }
        }
        Some((RUN_CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            if let Err(e) = run(config_path).await {
                error!(error=?e, "rollback run failed");
            } else {
                return std::process::ExitCode::SUCCESS;
            }
        }
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
        }
        None => {
            error!("no subcommand provided");
        }
    }
    std::process::ExitCode::FAILURE
}
