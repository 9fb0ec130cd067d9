//! A simulated cluster that follows the topology files it is given.
//!
//! Every node keeps its own chain. Nodes that can reach each other (directly or through other
//! nodes) adopt the longest chain among them, unless doing so would roll back more than the
//! security parameter allows. Connectivity is recomputed from the live topology files in the
//! state directory each time the nodes are restarted, so splitting and healing the cluster
//! works exactly as it does against real nodes.

use crate::{
    cluster::{Layout, Node},
    ledger::{AddressRecord, Endpoint, Filter, Ledger, RawTx, TxIn, TxOut, TxRequest, Utxo},
    topology::{self, Topology},
    Error,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::debug;

/// Fee charged for every simulated transaction
pub const FEE: u64 = 170_000;

/// Host every simulated node listens on
pub const HOST: &str = "127.0.0.1";

/// Upper bound on convergence rounds after a single event
const MAX_ROUNDS: usize = 64;

/// Misbehavior to inject into the simulated cluster.
#[derive(Clone, Copy, Debug, Default)]
pub struct Faults {
    /// Keep the connectivity the cluster started with, regardless of topology changes.
    pub ignore_topology: bool,
    /// Re-include transactions abandoned by a rollback in the adopted chain.
    pub replay_rolled_back: bool,
    /// Fail the restart with this number (counting from 1) before any node picks up its
    /// topology.
    pub fail_restart: Option<usize>,
}

#[derive(Clone, Debug)]
struct Tx {
    txid: String,
    inputs: Vec<(String, u32)>,
    outputs: Vec<TxOut>,
}

#[derive(Clone, Debug)]
struct Block {
    id: u64,
    txs: Vec<Tx>,
}

struct State {
    genesis: Vec<Utxo>,
    chains: BTreeMap<Node, Vec<Block>>,
    links: BTreeSet<(Node, Node)>,
    next_id: u64,
    restarts: usize,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn utxos(&self, node: &Node) -> BTreeSet<Utxo> {
        let mut utxos: BTreeSet<Utxo> = self.genesis.iter().cloned().collect();
        for block in self.chains.get(node).into_iter().flatten() {
            for tx in &block.txs {
                utxos.retain(|utxo| {
                    !tx.inputs
                        .iter()
                        .any(|(txid, index)| *txid == utxo.txid && *index == utxo.index)
                });
                for (index, output) in tx.outputs.iter().enumerate() {
                    utxos.insert(Utxo {
                        txid: tx.txid.clone(),
                        index: index as u32,
                        address: output.address.clone(),
                        amount: output.amount,
                    });
                }
            }
        }
        utxos
    }

    /// Group nodes into sets that can reach each other.
    fn components(&self) -> Vec<BTreeSet<Node>> {
        let mut remaining: BTreeSet<Node> = self.chains.keys().cloned().collect();
        let mut components = Vec::new();
        while let Some(start) = remaining.pop_first() {
            let mut component = BTreeSet::from([start.clone()]);
            let mut frontier = vec![start];
            while let Some(node) = frontier.pop() {
                for (a, b) in &self.links {
                    let peer = if *a == node {
                        b
                    } else if *b == node {
                        a
                    } else {
                        continue;
                    };
                    if remaining.remove(peer) {
                        component.insert(peer.clone());
                        frontier.push(peer.clone());
                    }
                }
            }
            components.push(component);
        }
        components
    }

    /// Let every node adopt the best chain it can reach until nothing changes.
    fn converge(&mut self, security_param: u64, replay: bool) {
        for _ in 0..MAX_ROUNDS {
            let mut changed = false;
            for component in self.components() {
                // Longest chain wins, ties go to the lowest tip
                let Some(best) = component
                    .iter()
                    .map(|node| &self.chains[node])
                    .max_by(|a, b| {
                        a.len()
                            .cmp(&b.len())
                            .then_with(|| tip(b).cmp(&tip(a)))
                    })
                    .cloned()
                else {
                    continue;
                };
                for node in &component {
                    let current = &self.chains[node];
                    let common = current
                        .iter()
                        .zip(best.iter())
                        .take_while(|(a, b)| a.id == b.id)
                        .count();
                    if common == current.len() && common == best.len() {
                        continue;
                    }
                    if best.len() < current.len() {
                        continue;
                    }
                    let depth = (current.len() - common) as u64;
                    if depth > security_param {
                        debug!(%node, depth, security_param, "refusing deep rollback");
                        continue;
                    }

                    // Find transactions the rollback abandons
                    let kept: BTreeSet<&str> = best
                        .iter()
                        .flat_map(|block| block.txs.iter())
                        .map(|tx| tx.txid.as_str())
                        .collect();
                    let abandoned: Vec<Tx> = current[common..]
                        .iter()
                        .flat_map(|block| block.txs.iter())
                        .filter(|tx| !kept.contains(tx.txid.as_str()))
                        .cloned()
                        .collect();
                    let mut adopted = best.clone();
                    if replay && !abandoned.is_empty() {
                        let id = self.next_id();
                        adopted.push(Block { id, txs: abandoned });
                    }
                    debug!(%node, depth, "switched chain");
                    self.chains.insert(node.clone(), adopted);
                    changed = true;
                }
            }
            if !changed {
                return;
            }
        }
    }
}

fn tip(chain: &[Block]) -> u64 {
    chain.last().map(|block| block.id).unwrap_or_default()
}

/// A [Ledger] backed by an in-memory cluster.
pub struct Simulated {
    state_dir: PathBuf,
    layout: Layout,
    security_param: u64,
    faults: Faults,
    state: Mutex<State>,
}

impl Simulated {
    /// Start a cluster with the nodes of `layout`, connected as described by the topology
    /// files in `state_dir`.
    pub fn new(state_dir: &Path, layout: &Layout, security_param: u64) -> Result<Self, Error> {
        Self::with_faults(state_dir, layout, security_param, Faults::default())
    }

    pub fn with_faults(
        state_dir: &Path,
        layout: &Layout,
        security_param: u64,
        faults: Faults,
    ) -> Result<Self, Error> {
        let links = load_links(state_dir, layout)?;
        let chains = layout.nodes().map(|node| (node.clone(), Vec::new())).collect();
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            layout: layout.clone(),
            security_param,
            faults,
            state: Mutex::new(State {
                genesis: Vec::new(),
                chains,
                links,
                next_id: 0,
                restarts: 0,
            }),
        })
    }

    /// Add an output of `amount` locked at `address` to the genesis of every node.
    pub fn fund(&self, address: &str, amount: u64) {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.genesis.push(Utxo {
            txid: format!("{id:064x}"),
            index: 0,
            address: address.to_string(),
            amount,
        });
    }

    /// Number of times all nodes were restarted.
    pub fn restarts(&self) -> usize {
        self.state.lock().unwrap().restarts
    }

    /// Whether `a` and `b` can currently reach each other.
    pub fn connected(&self, a: &Node, b: &Node) -> bool {
        let state = self.state.lock().unwrap();
        state
            .components()
            .iter()
            .any(|component| component.contains(a) && component.contains(b))
    }

    /// Number of blocks on the chain of `node`.
    pub fn height(&self, node: &Node) -> usize {
        let state = self.state.lock().unwrap();
        state.chains.get(node).map(Vec::len).unwrap_or_default()
    }

    fn resolve(&self, endpoint: &Endpoint) -> Result<Node, Error> {
        endpoint
            .node_name()
            .and_then(|name| self.layout.node(name).ok())
            .cloned()
            .ok_or_else(|| Error::NodeUnreachable(endpoint.to_string()))
    }
}

impl Ledger for Simulated {
    async fn restart_all_nodes(&self) -> Result<(), Error> {
        let links = if self.faults.ignore_topology {
            None
        } else {
            Some(load_links(&self.state_dir, &self.layout)?)
        };
        let mut state = self.state.lock().unwrap();
        state.restarts += 1;
        if self.faults.fail_restart == Some(state.restarts) {
            return Err(Error::CommandFailed {
                command: "restart".to_string(),
                stderr: format!("restart {} failed", state.restarts),
            });
        }
        if let Some(links) = links {
            state.links = links;
        }
        state.converge(self.security_param, self.faults.replay_rolled_back);
        debug!(restarts = state.restarts, "restarted nodes");
        Ok(())
    }

    async fn wait_for_new_block(&self, endpoint: &Endpoint) -> Result<(), Error> {
        let node = self.resolve(endpoint)?;
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        if let Some(chain) = state.chains.get_mut(&node) {
            chain.push(Block { id, txs: Vec::new() });
        }
        state.converge(self.security_param, self.faults.replay_rolled_back);
        Ok(())
    }

    async fn query_utxo(
        &self,
        endpoint: &Endpoint,
        filter: &Filter,
    ) -> Result<BTreeSet<Utxo>, Error> {
        let node = self.resolve(endpoint)?;
        let state = self.state.lock().unwrap();
        let utxos = state.utxos(&node);
        Ok(utxos
            .into_iter()
            .filter(|utxo| match filter {
                Filter::Address(address) => utxo.address == *address,
                Filter::Tx { txid, outputs } => utxo.txid == *txid && utxo.index < *outputs,
            })
            .collect())
    }

    async fn send_tx(&self, endpoint: &Endpoint, request: TxRequest) -> Result<RawTx, Error> {
        let node = self.resolve(endpoint)?;
        let mut state = self.state.lock().unwrap();

        // Select inputs
        let inputs: Vec<TxIn> = state
            .utxos(&node)
            .into_iter()
            .filter(|utxo| utxo.address == request.source)
            .map(|utxo| TxIn {
                txid: utxo.txid,
                index: utxo.index,
                amount: utxo.amount,
            })
            .collect();
        if inputs.is_empty() {
            return Err(Error::NoFunds(request.source));
        }
        let available: u64 = inputs.iter().map(|input| input.amount).sum();
        let requested: u64 = request.outputs.iter().map(|output| output.amount).sum();
        if available < requested + FEE {
            return Err(Error::InsufficientFunds {
                address: request.source,
                available,
                required: requested + FEE,
            });
        }

        // Include in a new block
        let mut outputs = request.outputs.clone();
        outputs.push(TxOut {
            address: request.source.clone(),
            amount: available - requested - FEE,
        });
        let id = state.next_id();
        let txid = format!("{id:064x}");
        let tx = Tx {
            txid: txid.clone(),
            inputs: inputs
                .iter()
                .map(|input| (input.txid.clone(), input.index))
                .collect(),
            outputs: outputs.clone(),
        };
        let block = state.next_id();
        if let Some(chain) = state.chains.get_mut(&node) {
            chain.push(Block {
                id: block,
                txs: vec![tx],
            });
        }
        state.converge(self.security_param, self.faults.replay_rolled_back);
        debug!(%node, %txid, name = %request.name, "included transaction");
        Ok(RawTx {
            txid,
            name: request.name.clone(),
            fee: FEE,
            inputs,
            outputs,
            file: self.state_dir.join(format!("{}.signed", request.name)),
        })
    }

    async fn payment_address(&self, name: &str, dir: &Path) -> Result<AddressRecord, Error> {
        fs::create_dir_all(dir)?;
        let verification_key = dir.join(format!("{name}.vkey"));
        let signing_key = dir.join(format!("{name}.skey"));
        fs::write(&verification_key, name.as_bytes())?;
        fs::write(&signing_key, name.as_bytes())?;
        Ok(AddressRecord {
            name: name.to_string(),
            address: format!("addr_test1_{name}"),
            verification_key,
            signing_key,
        })
    }
}

/// Read which nodes connect to which from the live topology files in `state_dir`.
fn load_links(state_dir: &Path, layout: &Layout) -> Result<BTreeSet<(Node, Node)>, Error> {
    let mut links = BTreeSet::new();
    for node in layout.nodes() {
        let path = state_dir.join(topology::file_name(node));
        if !path.exists() {
            continue;
        }
        for (_, port) in Topology::load(&path)?.peers() {
            let Some(peer) = layout.by_port(port) else {
                continue;
            };
            if peer == node {
                continue;
            }
            let link = if node < peer {
                (node.clone(), peer.clone())
            } else {
                (peer.clone(), node.clone())
            };
            links.insert(link);
        }
    }
    Ok(links)
}

/// Write fully connected topology files for every node of `layout` into `state_dir`.
pub fn write_joined(state_dir: &Path, layout: &Layout, p2p: bool) -> Result<(), Error> {
    fs::create_dir_all(state_dir)?;
    for node in layout.nodes() {
        let mut peers = Vec::new();
        for peer in layout.nodes().filter(|peer| *peer != node) {
            peers.push((HOST.to_string(), layout.port(peer)?));
        }
        let contents = serde_json::to_vec_pretty(&Topology::new(&peers, p2p))?;
        fs::write(state_dir.join(topology::file_name(node)), contents)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    fn endpoint(state_dir: &Path, node: &str) -> Endpoint {
        Endpoint::new(state_dir.join(format!("{node}.socket")))
    }

    fn request(source: &str, destination: &str, amount: u64) -> TxRequest {
        TxRequest {
            source: source.to_string(),
            name: "tx".to_string(),
            outputs: vec![TxOut {
                address: destination.to_string(),
                amount,
            }],
            signing_keys: Vec::new(),
        }
    }

    #[test_traced]
    fn test_joined_cluster_is_connected() {
        let layout = Layout::new(4, 30000).unwrap();
        let state = tempfile::tempdir().unwrap();
        write_joined(state.path(), &layout, true).unwrap();
        let ledger = Simulated::new(state.path(), &layout, 10).unwrap();
        let nodes: Vec<&Node> = layout.nodes().collect();
        for a in &nodes {
            for b in &nodes {
                assert!(ledger.connected(a, b));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transactions_propagate_within_component() {
        let layout = Layout::new(4, 30000).unwrap();
        let state = tempfile::tempdir().unwrap();
        write_joined(state.path(), &layout, false).unwrap();
        let ledger = Simulated::new(state.path(), &layout, 10).unwrap();
        ledger.fund("src", 10_000_000);

        let raw = ledger
            .send_tx(&endpoint(state.path(), "pool1"), request("src", "dst", 1_000_000))
            .await
            .unwrap();
        assert_eq!(raw.outputs.len(), 2);
        assert_eq!(raw.outputs[1].amount, 10_000_000 - 1_000_000 - FEE);
        for node in layout.nodes() {
            let utxos = ledger
                .query_utxo(&endpoint(state.path(), node.name()), &Filter::tx(&raw))
                .await
                .unwrap();
            assert_eq!(utxos.len(), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_tx_requires_funds() {
        let layout = Layout::new(4, 30000).unwrap();
        let state = tempfile::tempdir().unwrap();
        write_joined(state.path(), &layout, false).unwrap();
        let ledger = Simulated::new(state.path(), &layout, 10).unwrap();
        let pool1 = endpoint(state.path(), "pool1");

        let result = ledger.send_tx(&pool1, request("src", "dst", 1)).await;
        assert!(matches!(result, Err(Error::NoFunds(_))));

        ledger.fund("src", 1_000_000);
        let result = ledger.send_tx(&pool1, request("src", "dst", 1_000_000)).await;
        assert!(matches!(
            result,
            Err(Error::InsufficientFunds { available: 1_000_000, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_socket_is_unreachable() {
        let layout = Layout::new(4, 30000).unwrap();
        let state = tempfile::tempdir().unwrap();
        write_joined(state.path(), &layout, false).unwrap();
        let ledger = Simulated::new(state.path(), &layout, 10).unwrap();
        let result = ledger
            .wait_for_new_block(&endpoint(state.path(), "bft1"))
            .await;
        assert!(matches!(result, Err(Error::NodeUnreachable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restart_keeps_old_links() {
        let layout = Layout::new(4, 30000).unwrap();
        let state = tempfile::tempdir().unwrap();
        write_joined(state.path(), &layout, false).unwrap();
        let faults = Faults {
            fail_restart: Some(2),
            ..Default::default()
        };
        let ledger = Simulated::with_faults(state.path(), &layout, 10, faults).unwrap();
        let pool1 = layout.node("pool1").unwrap();
        let pool4 = layout.node("pool4").unwrap();
        ledger.restart_all_nodes().await.unwrap();

        // Isolate pool1
        let empty = serde_json::to_vec(&Topology::new(&[], false)).unwrap();
        fs::write(state.path().join(topology::file_name(pool1)), empty).unwrap();
        for node in layout.nodes().filter(|node| *node != pool1) {
            let peers: Vec<(String, u16)> = layout
                .nodes()
                .filter(|peer| *peer != node && *peer != pool1)
                .map(|peer| (HOST.to_string(), layout.port(peer).unwrap()))
                .collect();
            let contents = serde_json::to_vec(&Topology::new(&peers, false)).unwrap();
            fs::write(state.path().join(topology::file_name(node)), contents).unwrap();
        }
        let result = ledger.restart_all_nodes().await;
        assert!(matches!(result, Err(Error::CommandFailed { .. })));
        assert!(ledger.connected(pool1, pool4));

        // Later restarts succeed
        ledger.restart_all_nodes().await.unwrap();
        assert!(!ledger.connected(pool1, pool4));
        assert_eq!(ledger.restarts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_chain_rolls_back_on_reconnect() {
        let layout = Layout::new(4, 30000).unwrap();
        let state = tempfile::tempdir().unwrap();
        write_joined(state.path(), &layout, false).unwrap();
        let ledger = Simulated::new(state.path(), &layout, 10).unwrap();
        let pool1 = layout.node("pool1").unwrap();
        let pool4 = layout.node("pool4").unwrap();

        // Isolate every node
        for node in layout.nodes() {
            let empty = Topology::new(&[], false);
            fs::write(
                state.path().join(topology::file_name(node)),
                serde_json::to_vec(&empty).unwrap(),
            )
            .unwrap();
        }
        ledger.restart_all_nodes().await.unwrap();
        assert!(!ledger.connected(pool1, pool4));

        // Grow pool1 further than pool4
        for _ in 0..3 {
            ledger
                .wait_for_new_block(&endpoint(state.path(), "pool1"))
                .await
                .unwrap();
        }
        ledger
            .wait_for_new_block(&endpoint(state.path(), "pool4"))
            .await
            .unwrap();
        assert_eq!(ledger.height(pool1), 3);
        assert_eq!(ledger.height(pool4), 1);

        // Reconnect
        write_joined(state.path(), &layout, false).unwrap();
        ledger.restart_all_nodes().await.unwrap();
        for node in layout.nodes() {
            assert_eq!(ledger.height(node), 3);
        }
        assert_eq!(ledger.restarts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deep_rollback_is_refused() {
        let layout = Layout::new(4, 30000).unwrap();
        let state = tempfile::tempdir().unwrap();
        write_joined(state.path(), &layout, false).unwrap();
        let ledger = Simulated::new(state.path(), &layout, 1).unwrap();
        let pool1 = layout.node("pool1").unwrap();
        let pool4 = layout.node("pool4").unwrap();

        let empty = serde_json::to_vec(&Topology::new(&[], false)).unwrap();
        for node in layout.nodes() {
            fs::write(state.path().join(topology::file_name(node)), &empty).unwrap();
        }
        ledger.restart_all_nodes().await.unwrap();
        for _ in 0..3 {
            ledger
                .wait_for_new_block(&endpoint(state.path(), "pool1"))
                .await
                .unwrap();
            ledger
                .wait_for_new_block(&endpoint(state.path(), "pool4"))
                .await
                .unwrap();
        }

        // Equal length forks three blocks deep never merge
        write_joined(state.path(), &layout, false).unwrap();
        ledger.restart_all_nodes().await.unwrap();
        assert_eq!(ledger.height(pool1), 3);
        assert_eq!(ledger.height(pool4), 3);
        let state_guard = ledger.state.lock().unwrap();
        assert_ne!(
            tip(&state_guard.chains[pool1]),
            tip(&state_guard.chains[pool4])
        );
    }
}
