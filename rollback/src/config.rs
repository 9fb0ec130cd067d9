//! Configuration file of the harness.

use crate::{
    addresses::{Faucet, DEFAULT_FUND_AMOUNT},
    cluster::{Layout, INSTANCE_PORT_STRIDE},
    ledger::cli,
    router::sibling,
    scenario::{Params, DEFAULT_DIVERGENCE_BLOCKS},
    verifier::Settle,
    Error, SOCKET_ENV,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};

/// Path of the genesis file, relative to the state directory
pub const GENESIS_FILE: &str = "shelley/genesis.json";

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_base_port() -> u16 {
    30000
}

fn default_cli() -> PathBuf {
    PathBuf::from("cardano-cli")
}

const fn default_divergence_blocks() -> u64 {
    DEFAULT_DIVERGENCE_BLOCKS
}

const fn default_fund_amount() -> u64 {
    DEFAULT_FUND_AMOUNT
}

const fn default_poll_interval_ms() -> u64 {
    1_000
}

const fn default_max_polls() -> usize {
    120
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Cluster instance number (selects ports and names).
    #[serde(default)]
    pub instance: u16,
    pub state_dir: PathBuf,
    /// Defaults to `split_topology_ci<instance>` in the working directory.
    pub split_topology_dir: Option<PathBuf>,
    /// Defaults to the value of `CARDANO_NODE_SOCKET_PATH`.
    pub socket_path: Option<PathBuf>,
    pub pools: usize,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Inferred from the live topology files when unset.
    pub p2p: Option<bool>,
    #[serde(default = "default_cli")]
    pub cli: PathBuf,
    pub era: Option<String>,
    /// Read from the genesis file when unset.
    pub testnet_magic: Option<u64>,
    /// Read from the genesis file when unset.
    pub security_param: Option<u64>,
    pub restart_command: String,
    #[serde(default)]
    pub settle: Settle,
    #[serde(default = "default_divergence_blocks")]
    pub divergence_blocks: u64,
    pub faucet: Faucet,
    #[serde(default = "default_fund_amount")]
    pub fund_amount: u64,
    /// Defaults to the working directory.
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: usize,
}

/// Network parameters read from the genesis file.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Genesis {
    pub network_magic: u64,
    pub security_param: u64,
}

impl Config {
    /// Load a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Layout of the cluster instance.
    ///
    /// Every instance gets its own range of ports, starting at
    /// `base_port + instance * INSTANCE_PORT_STRIDE`.
    pub fn layout(&self) -> Result<Layout, Error> {
        let first_port = u64::from(self.base_port)
            + u64::from(self.instance) * u64::from(INSTANCE_PORT_STRIDE);
        let first_port =
            u16::try_from(first_port).map_err(|_| Error::PortRange(first_port))?;
        Layout::new(self.pools, first_port)
    }

    /// Control socket of the default node.
    pub fn socket(&self) -> Result<PathBuf, Error> {
        self.resolve_socket(std::env::var_os(SOCKET_ENV).map(PathBuf::from))
    }

    fn resolve_socket(&self, env: Option<PathBuf>) -> Result<PathBuf, Error> {
        self.socket_path
            .clone()
            .or(env)
            .filter(|path| !path.as_os_str().is_empty())
            .ok_or(Error::MissingSocketPath)
    }

    pub fn split_topology_dir(&self) -> Result<PathBuf, Error> {
        match &self.split_topology_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(std::env::current_dir()?.join(format!("split_topology_ci{}", self.instance))),
        }
    }

    pub fn work_dir(&self) -> Result<PathBuf, Error> {
        match &self.work_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }

    /// Read the genesis file of the cluster.
    pub fn genesis(&self) -> Result<Genesis, Error> {
        let path = self.state_dir.join(GENESIS_FILE);
        let file = File::open(&path).map_err(|_| Error::MissingGenesis(path.clone()))?;
        Ok(serde_json::from_reader(file)?)
    }

    /// Network magic and security parameter, preferring configured values over genesis.
    pub fn network(&self) -> Result<Genesis, Error> {
        if let (Some(network_magic), Some(security_param)) =
            (self.testnet_magic, self.security_param)
        {
            return Ok(Genesis {
                network_magic,
                security_param,
            });
        }
        let genesis = self.genesis()?;
        Ok(Genesis {
            network_magic: self.testnet_magic.unwrap_or(genesis.network_magic),
            security_param: self.security_param.unwrap_or(genesis.security_param),
        })
    }

    /// Configuration of the command-line [cli::Cli].
    pub fn cli(&self) -> Result<cli::Config, Error> {
        let socket = self.socket()?;
        let layout = self.layout()?;
        Ok(cli::Config {
            binary: self.cli.clone(),
            era: self.era.clone(),
            testnet_magic: self.network()?.network_magic,
            work_dir: self.work_dir()?,
            restart_command: self.restart_command.clone(),
            endpoints: layout.nodes().map(|node| sibling(&socket, node)).collect(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_polls: self.max_polls,
        })
    }

    /// Parameters of a run, named after `template`.
    pub fn params(&self, template: String) -> Result<Params, Error> {
        Ok(Params {
            split_dir: self.split_topology_dir()?,
            template,
            settle: self.settle.clone(),
            divergence_blocks: self.divergence_blocks,
            security_param: self.network()?.security_param,
        })
    }
}
