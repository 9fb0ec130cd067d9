//! [Ledger] implemented on top of the node's command-line tool.

use super::{AddressRecord, Endpoint, Filter, Ledger, RawTx, TxIn, TxOut, TxRequest, Utxo};
use crate::{Error, SOCKET_ENV};
use futures::future::try_join_all;
use serde_json::Value;
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{process::Command, time::sleep};
use tracing::{debug, info};

/// Configuration for [Cli].
#[derive(Clone, Debug)]
pub struct Config {
    /// Path to the command-line tool.
    pub binary: PathBuf,

    /// Era subcommand placed in front of `query` and `transaction` commands (e.g. `conway`).
    pub era: Option<String>,

    /// Network magic of the local cluster.
    pub testnet_magic: u64,

    /// Directory where transaction files are written.
    pub work_dir: PathBuf,

    /// Shell command that restarts every node process.
    pub restart_command: String,

    /// Control sockets of every node (checked for readiness after a restart).
    pub endpoints: Vec<Endpoint>,

    /// Interval between polls of a node.
    pub poll_interval: Duration,

    /// Maximum number of polls before giving up.
    pub max_polls: usize,
}

/// Drives the cluster by running the command-line tool as a child process.
///
/// The control socket of the node a command is issued against is handed to the child via
/// its environment only.
#[derive(Clone, Debug)]
pub struct Cli {
    cfg: Config,
}

impl Cli {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Run the tool and return its standard output.
    async fn execute(&self, endpoint: Option<&Endpoint>, args: &[String]) -> Result<String, Error> {
        let mut command = Command::new(&self.cfg.binary);
        command.args(args);
        if let Some(endpoint) = endpoint {
            command.env(SOCKET_ENV, endpoint.socket());
        }
        let output = command.output().await?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: format!("{} {}", self.cfg.binary.display(), args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn with_era(&self, args: &[&str]) -> Vec<String> {
        let mut prefixed = Vec::with_capacity(args.len() + 1);
        if let Some(era) = &self.cfg.era {
            prefixed.push(era.clone());
        }
        prefixed.extend(args.iter().map(|arg| arg.to_string()));
        prefixed
    }

    fn push_magic(&self, args: &mut Vec<String>) {
        args.push("--testnet-magic".to_string());
        args.push(self.cfg.testnet_magic.to_string());
    }

    /// Fetch the number of the latest block known to a node.
    pub async fn tip(&self, endpoint: &Endpoint) -> Result<u64, Error> {
        let mut args = self.with_era(&["query", "tip"]);
        self.push_magic(&mut args);
        let output = self.execute(Some(endpoint), &args).await?;
        parse_tip(&output)
    }

    /// Poll a node until it answers queries.
    async fn await_reachable(&self, endpoint: &Endpoint) -> Result<(), Error> {
        for _ in 0..self.cfg.max_polls {
            if self.tip(endpoint).await.is_ok() {
                debug!(%endpoint, "node reachable");
                return Ok(());
            }
            sleep(self.cfg.poll_interval).await;
        }
        Err(Error::NodeUnreachable(endpoint.to_string()))
    }

    /// Poll a node until the outputs of a transaction are visible.
    async fn await_included(&self, endpoint: &Endpoint, raw: &RawTx) -> Result<(), Error> {
        let filter = Filter::tx(raw);
        for _ in 0..self.cfg.max_polls {
            if !self.query_utxo(endpoint, &filter).await?.is_empty() {
                return Ok(());
            }
            sleep(self.cfg.poll_interval).await;
        }
        Err(Error::NotIncluded(raw.txid.clone()))
    }
}

impl Ledger for Cli {
    async fn restart_all_nodes(&self) -> Result<(), Error> {
        // Restart node processes
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.cfg.restart_command)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: self.cfg.restart_command.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!(nodes = self.cfg.endpoints.len(), "restarted all nodes");

        // Wait for every node to come back
        try_join_all(
            self.cfg
                .endpoints
                .iter()
                .map(|endpoint| self.await_reachable(endpoint)),
        )
        .await?;
        Ok(())
    }

    async fn wait_for_new_block(&self, endpoint: &Endpoint) -> Result<(), Error> {
        let start = self.tip(endpoint).await?;
        for _ in 0..self.cfg.max_polls {
            sleep(self.cfg.poll_interval).await;
            let block = self.tip(endpoint).await?;
            if block > start {
                debug!(%endpoint, start, block, "observed new block");
                return Ok(());
            }
        }
        Err(Error::NoNewBlock(endpoint.to_string()))
    }

    async fn query_utxo(&self, endpoint: &Endpoint, filter: &Filter) -> Result<BTreeSet<Utxo>, Error> {
        let mut args = self.with_era(&["query", "utxo"]);
        match filter {
            Filter::Address(address) => {
                args.push("--address".to_string());
                args.push(address.clone());
            }
            Filter::Tx { txid, outputs } => {
                // Without any `--tx-in` the tool would return the whole UTxO set
                if *outputs == 0 {
                    return Ok(BTreeSet::new());
                }
                for index in 0..*outputs {
                    args.push("--tx-in".to_string());
                    args.push(format!("{txid}#{index}"));
                }
            }
        }
        self.push_magic(&mut args);
        args.push("--out-file".to_string());
        args.push("/dev/stdout".to_string());
        let output = self.execute(Some(endpoint), &args).await?;
        parse_utxo(&output)
    }

    async fn send_tx(&self, endpoint: &Endpoint, request: TxRequest) -> Result<RawTx, Error> {
        // Spend everything locked at the source address
        let utxos = self
            .query_utxo(endpoint, &Filter::Address(request.source.clone()))
            .await?;
        if utxos.is_empty() {
            return Err(Error::NoFunds(request.source));
        }
        let available: u64 = utxos.iter().map(|utxo| utxo.amount).sum();
        let requested: u64 = request.outputs.iter().map(|out| out.amount).sum();
        if available < requested {
            return Err(Error::InsufficientFunds {
                address: request.source,
                available,
                required: requested,
            });
        }
        let inputs: Vec<TxIn> = utxos
            .into_iter()
            .map(|utxo| TxIn {
                txid: utxo.txid,
                index: utxo.index,
                amount: utxo.amount,
            })
            .collect();

        // Build
        let body = self.cfg.work_dir.join(format!("{}_tx.body", request.name));
        let mut args = self.with_era(&["transaction", "build"]);
        for input in &inputs {
            args.push("--tx-in".to_string());
            args.push(format!("{}#{}", input.txid, input.index));
        }
        for out in &request.outputs {
            args.push("--tx-out".to_string());
            args.push(format!("{}+{}", out.address, out.amount));
        }
        args.push("--change-address".to_string());
        args.push(request.source.clone());
        self.push_magic(&mut args);
        args.push("--out-file".to_string());
        args.push(body.display().to_string());
        let output = self.execute(Some(endpoint), &args).await?;
        let fee = parse_fee(&output).ok_or_else(|| Error::UnexpectedOutput(output.clone()))?;

        // Sign
        let signed = self.cfg.work_dir.join(format!("{}_tx.signed", request.name));
        let mut args = self.with_era(&["transaction", "sign"]);
        args.push("--tx-body-file".to_string());
        args.push(body.display().to_string());
        for key in &request.signing_keys {
            args.push("--signing-key-file".to_string());
            args.push(key.display().to_string());
        }
        self.push_magic(&mut args);
        args.push("--out-file".to_string());
        args.push(signed.display().to_string());
        self.execute(None, &args).await?;

        // Submit
        let mut args = self.with_era(&["transaction", "submit"]);
        args.push("--tx-file".to_string());
        args.push(signed.display().to_string());
        self.push_magic(&mut args);
        self.execute(Some(endpoint), &args).await?;

        // Identify
        let mut args = self.with_era(&["transaction", "txid"]);
        args.push("--tx-file".to_string());
        args.push(signed.display().to_string());
        let output = self.execute(None, &args).await?;
        let txid = parse_txid(&output)?;
        info!(%endpoint, txid = txid.as_str(), fee, "submitted transaction");

        // Requested outputs come first, change last
        let mut outputs = request.outputs;
        let change = (available - requested).saturating_sub(fee);
        if change > 0 {
            outputs.push(TxOut {
                address: request.source,
                amount: change,
            });
        }
        let raw = RawTx {
            txid,
            name: request.name,
            fee,
            inputs,
            outputs,
            file: signed,
        };

        // Wait until the submitting node includes it
        self.await_included(endpoint, &raw).await?;
        Ok(raw)
    }

    async fn payment_address(&self, name: &str, dir: &Path) -> Result<AddressRecord, Error> {
        let verification_key = dir.join(format!("{name}.vkey"));
        let signing_key = dir.join(format!("{name}.skey"));
        let address_file = dir.join(format!("{name}.addr"));
        std::fs::create_dir_all(dir)?;

        // Generate keys
        let args = vec![
            "address".to_string(),
            "key-gen".to_string(),
            "--verification-key-file".to_string(),
            verification_key.display().to_string(),
            "--signing-key-file".to_string(),
            signing_key.display().to_string(),
        ];
        self.execute(None, &args).await?;

        // Derive address
        let mut args = vec![
            "address".to_string(),
            "build".to_string(),
            "--payment-verification-key-file".to_string(),
            verification_key.display().to_string(),
        ];
        self.push_magic(&mut args);
        args.push("--out-file".to_string());
        args.push(address_file.display().to_string());
        self.execute(None, &args).await?;
        let address = std::fs::read_to_string(&address_file)?.trim().to_string();
        debug!(name, address = address.as_str(), "generated payment address");

        Ok(AddressRecord {
            name: name.to_string(),
            address,
            verification_key,
            signing_key,
        })
    }
}

/// Parse the JSON written by `query utxo`.
pub fn parse_utxo(output: &str) -> Result<BTreeSet<Utxo>, Error> {
    let value: Value = serde_json::from_str(output)?;
    let entries = value
        .as_object()
        .ok_or_else(|| Error::UnexpectedOutput(output.to_string()))?;
    let mut utxos = BTreeSet::new();
    for (reference, entry) in entries {
        let unexpected = || Error::UnexpectedOutput(reference.clone());
        let (txid, index) = reference.split_once('#').ok_or_else(unexpected)?;
        let index = index.parse::<u32>().map_err(|_| unexpected())?;
        let address = entry
            .get("address")
            .and_then(Value::as_str)
            .ok_or_else(unexpected)?;

        // Older tools report a bare number, newer ones a multi-asset value
        let amount = match entry.get("value") {
            Some(Value::Number(amount)) => amount.as_u64(),
            Some(value) => value.get("lovelace").and_then(Value::as_u64),
            None => None,
        }
        .ok_or_else(unexpected)?;
        utxos.insert(Utxo {
            txid: txid.to_string(),
            index,
            address: address.to_string(),
            amount,
        });
    }
    Ok(utxos)
}

/// Parse the block number out of `query tip`.
///
/// A chain without any block yet reports no block number at all.
pub fn parse_tip(output: &str) -> Result<u64, Error> {
    let value: Value = serde_json::from_str(output)?;
    if !value.is_object() {
        return Err(Error::UnexpectedOutput(output.to_string()));
    }
    Ok(value.get("block").and_then(Value::as_u64).unwrap_or(0))
}

/// Parse the fee printed by `transaction build`.
pub fn parse_fee(output: &str) -> Option<u64> {
    let line = output
        .lines()
        .find(|line| line.to_ascii_lowercase().contains("fee"))?;
    let digits: String = line
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Parse the output of `transaction txid` (plain hex or `{"txhash": ...}`).
pub fn parse_txid(output: &str) -> Result<String, Error> {
    let trimmed = output.trim();
    let txid = if trimmed.starts_with('{') {
        let value: Value = serde_json::from_str(trimmed)?;
        value
            .get("txhash")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::UnexpectedOutput(trimmed.to_string()))?
    } else {
        trimmed.lines().next().unwrap_or_default().trim().to_string()
    };
    if txid.len() != 64 || !txid.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::UnexpectedOutput(trimmed.to_string()));
    }
    Ok(txid)
}
