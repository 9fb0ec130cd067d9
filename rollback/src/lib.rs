//! Split a local ledger cluster into two partitions, heal it, and verify that it rolls back
//! to a single chain.
//!
//! # Overview
//!
//! The harness drives a cluster of N block-producing nodes (`pool1..poolN`, N even and at
//! least 4) that is managed elsewhere. It never implements any ledger logic itself: nodes are
//! reached through their control sockets and the command-line tool that ships with them.
//!
//! A single run of the protocol looks like this:
//!
//! 1. Submit `Tx1` on `pool1` while the cluster is joined.
//! 2. Replace every node's topology file with a "split" variant that only lists peers in the
//!    node's own half, then restart all nodes.
//! 3. Check that `Tx1` is visible on both halves.
//! 4. Submit `Tx2` on the first half and `Tx3` on the second half. Each must be visible only
//!    where it was submitted.
//! 5. Let both halves extend their chains by a block (but stay well within the security
//!    parameter, otherwise the halves can never be reconciled).
//! 6. Restore the original topology files, restart all nodes and wait for the rollback.
//! 7. Check that both halves agree on `Tx2` and `Tx3` and that exactly one of them survived.
//!
//! If anything fails while the cluster is still split, a `needs_respin` marker is written to
//! the cluster's state directory so that whoever manages the cluster rebuilds it before
//! running anything else against it. Runs and splits refuse to start while it exists.
//!
//! # Usage
//!
//! ```sh
//! rollback run --config rollback.yaml
//! ```
//!
//! See [config::Config] for the configuration file format.

use std::path::PathBuf;
use thiserror::Error;

pub mod addresses;
pub mod cluster;
pub mod config;
pub mod guard;
pub mod ledger;
pub mod mocks;
pub mod recorder;
pub mod router;
pub mod scenario;
pub mod topology;
pub mod verifier;

pub const GENERATE_CMD: &str = "generate";
pub const SPLIT_CMD: &str = "split";
pub const HEAL_CMD: &str = "heal";
pub const RUN_CMD: &str = "run";

/// Environment variable naming the control socket of the default node
pub const SOCKET_ENV: &str = "CARDANO_NODE_SOCKET_PATH";

/// Amount sent by every partition-local transaction
pub const TX_AMOUNT: u64 = 1_000_000;

/// Number of pre-funded payment addresses used by a single run
pub const ADDRESS_COUNT: usize = 3;

/// Name of the marker file written when the cluster must be rebuilt
pub const RESPIN_FILE_NAME: &str = "needs_respin";

/// An expected vs observed mismatch in transaction visibility.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("Tx number {ordinal} doesn't exist on {node} after the split")]
    NotPropagated { ordinal: usize, node: String },
    #[error("Tx number {ordinal} doesn't exist on {node} where it was submitted")]
    MissingLocally { ordinal: usize, node: String },
    #[error("Tx number {ordinal} does exist on {node} across the partition")]
    Leaked { ordinal: usize, node: String },
    #[error("UTxOs of Tx number {ordinal} are not identical on {a} and {b}, consensus was not restored")]
    Disagreement { ordinal: usize, a: String, b: String },
    #[error("none of the partition-local transactions exists on chain")]
    NoSurvivor,
    #[error("none of the partition-local transactions was rolled back")]
    BothSurvived,
}

/// Errors that can occur while driving the cluster.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cluster must be rebuilt before it is used again: {0}")]
    NeedsRespin(PathBuf),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("consensus violation: {0}")]
    Violation(#[from] Violation),
    #[error("control socket not configured and CARDANO_NODE_SOCKET_PATH is not set")]
    MissingSocketPath,
    #[error("invalid socket path: {0}")]
    InvalidSocketPath(PathBuf),
    #[error("no topology files found in {0}")]
    NoTopologyFiles(PathBuf),
    #[error("topology file missing: {0}")]
    MissingTopology(PathBuf),
    #[error("unrecognized topology file: {0}")]
    InvalidTopology(PathBuf),
    #[error("nodes use a mix of P2P and legacy topology files")]
    MixedTopology,
    #[error("pool count must be even and at least 4: {0}")]
    InvalidPoolCount(usize),
    #[error("port {0} is out of range")]
    PortRange(u64),
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("genesis file missing: {0}")]
    MissingGenesis(PathBuf),
    #[error("divergence of {blocks} blocks is not within security parameter {security_param}")]
    DivergenceBound { blocks: u64, security_param: u64 },
    #[error("command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("unexpected command output: {0}")]
    UnexpectedOutput(String),
    #[error("node unreachable: {0}")]
    NodeUnreachable(String),
    #[error("no new block on {0}")]
    NoNewBlock(String),
    #[error("transaction {0} not visible after submission")]
    NotIncluded(String),
    #[error("expected 3 payment addresses, got {0}")]
    InvalidAddressCount(usize),
    #[error("no funds available at {0}")]
    NoFunds(String),
    #[error("insufficient funds at {address}: have {available}, need {required}")]
    InsufficientFunds {
        address: String,
        available: u64,
        required: u64,
    },
}
