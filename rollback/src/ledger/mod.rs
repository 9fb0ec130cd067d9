//! Interfaces of the externally-owned node processes and command-line tool.
//!
//! Every call names the [Endpoint] (control socket) it is issued against. Nothing here
//! changes process-wide state, so calls against different nodes never interfere.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt,
    future::Future,
    path::{Path, PathBuf},
};

pub mod cli;

/// Control socket of a single node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    socket: PathBuf,
}

impl Endpoint {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Name of the node behind this socket (`<dir>/<node>.socket`).
    pub fn node_name(&self) -> Option<&str> {
        self.socket.file_stem().and_then(|stem| stem.to_str())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket.display())
    }
}

/// An unspent transaction output.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Utxo {
    pub txid: String,
    pub index: u32,
    pub address: String,
    pub amount: u64,
}

/// Selects which outputs a UTxO query returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    /// All outputs locked at an address.
    Address(String),
    /// Outputs `0..outputs` created by a transaction.
    Tx { txid: String, outputs: u32 },
}

impl Filter {
    /// Select every output (including change) of a built transaction.
    pub fn tx(raw: &RawTx) -> Self {
        Self::Tx {
            txid: raw.txid.clone(),
            outputs: raw.outputs.len() as u32,
        }
    }
}

/// Output of a transaction being built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub address: String,
    pub amount: u64,
}

/// Reference to an output spent by a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub txid: String,
    pub index: u32,
    pub amount: u64,
}

/// Everything needed to build, sign and submit a transaction.
#[derive(Clone, Debug)]
pub struct TxRequest {
    pub source: String,
    pub name: String,
    pub outputs: Vec<TxOut>,
    pub signing_keys: Vec<PathBuf>,
}

/// A submitted transaction.
///
/// `outputs` lists the requested outputs followed by the change output, in the order the
/// ledger assigns output indexes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawTx {
    pub txid: String,
    pub name: String,
    pub fee: u64,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub file: PathBuf,
}

/// A payment address and the keys controlling it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub name: String,
    pub address: String,
    pub verification_key: PathBuf,
    pub signing_key: PathBuf,
}

/// Operations offered by the node processes and their command-line tool.
pub trait Ledger {
    /// Restart every node process and wait until all of them answer queries again.
    fn restart_all_nodes(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Wait until the chain seen through `endpoint` grows by at least one block.
    fn wait_for_new_block(
        &self,
        endpoint: &Endpoint,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Query the confirmed outputs matching `filter`.
    ///
    /// An empty set is a valid answer.
    fn query_utxo(
        &self,
        endpoint: &Endpoint,
        filter: &Filter,
    ) -> impl Future<Output = Result<BTreeSet<Utxo>, Error>> + Send;

    /// Build, sign and submit a transaction spending from `request.source`, returning once
    /// its outputs are visible through `endpoint`.
    fn send_tx(
        &self,
        endpoint: &Endpoint,
        request: TxRequest,
    ) -> impl Future<Output = Result<RawTx, Error>> + Send;

    /// Generate a new payment key pair and address in `dir`.
    fn payment_address(
        &self,
        name: &str,
        dir: &Path,
    ) -> impl Future<Output = Result<AddressRecord, Error>> + Send;
}

/// Sum the amounts of a set of outputs.
pub fn balance(utxos: &BTreeSet<Utxo>) -> u64 {
    utxos.iter().map(|utxo| utxo.amount).sum()
}
