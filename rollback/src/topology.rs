//! Split and heal the cluster by rewriting the topology file of every node.
//!
//! Each node reads the peers it connects to from a `topology*.json` file in the cluster's
//! state directory. The cluster is split by replacing the file of every pool with a variant
//! that only lists peers from the pool's own half, and healed by restoring the originals.
//! Nodes only pick up a new topology when restarted.

use crate::{
    cluster::{Layout, Node, Side},
    ledger::Ledger,
    Error,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// Prefix of split topology files used with P2P networking
pub const P2P_SPLIT_PREFIX: &str = "p2p-split";

/// Prefix of split topology files used with legacy networking
pub const SPLIT_PREFIX: &str = "split";

/// Prefix of backup directories created in the state directory
pub const BACKUP_DIR_PREFIX: &str = "backup_topology";

/// A peer entry of a legacy topology file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Producer {
    pub addr: String,
    pub port: u16,
    pub valency: u32,
}

/// Legacy topology: a flat list of producers to connect to.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LegacyTopology {
    #[serde(rename = "Producers")]
    pub producers: Vec<Producer>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AccessPoint {
    pub address: String,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalRoot {
    pub access_points: Vec<AccessPoint>,
    pub advertise: bool,
    pub valency: u32,
}

/// P2P topology: local roots only, with ledger peers disabled so that no peer outside of
/// the listed ones is ever discovered.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct P2pTopology {
    pub local_roots: Vec<LocalRoot>,
    #[serde(default)]
    pub public_roots: Vec<serde_json::Value>,
    #[serde(default = "ledger_peers_disabled")]
    pub use_ledger_after_slot: i64,
}

const fn ledger_peers_disabled() -> i64 {
    -1
}

/// Contents of a node's topology file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum Topology {
    P2p(P2pTopology),
    Legacy(LegacyTopology),
}

impl Topology {
    /// Build a topology connecting to `peers`.
    pub fn new(peers: &[(String, u16)], p2p: bool) -> Self {
        if p2p {
            Self::P2p(P2pTopology {
                local_roots: vec![LocalRoot {
                    access_points: peers
                        .iter()
                        .map(|(address, port)| AccessPoint {
                            address: address.clone(),
                            port: *port,
                        })
                        .collect(),
                    advertise: false,
                    valency: peers.len() as u32,
                }],
                public_roots: Vec::new(),
                use_ledger_after_slot: ledger_peers_disabled(),
            })
        } else {
            Self::Legacy(LegacyTopology {
                producers: peers
                    .iter()
                    .map(|(addr, port)| Producer {
                        addr: addr.clone(),
                        port: *port,
                        valency: 1,
                    })
                    .collect(),
            })
        }
    }

    /// Read a topology file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read(path)?;
        serde_json::from_slice(&contents).map_err(|_| Error::InvalidTopology(path.to_path_buf()))
    }

    pub fn is_p2p(&self) -> bool {
        matches!(self, Self::P2p(_))
    }

    /// Every `(address, port)` this topology connects to.
    pub fn peers(&self) -> Vec<(String, u16)> {
        match self {
            Self::P2p(topology) => topology
                .local_roots
                .iter()
                .flat_map(|root| root.access_points.iter())
                .map(|point| (point.address.clone(), point.port))
                .collect(),
            Self::Legacy(topology) => topology
                .producers
                .iter()
                .map(|producer| (producer.addr.clone(), producer.port))
                .collect(),
        }
    }
}

/// Name of the live topology file of `node`.
pub fn file_name(node: &Node) -> String {
    format!("topology-{node}.json")
}

/// Prefix of the split variant matching the networking mode.
pub const fn split_prefix(p2p: bool) -> &'static str {
    if p2p {
        P2P_SPLIT_PREFIX
    } else {
        SPLIT_PREFIX
    }
}

/// List every live topology file (`topology*.json`) in `state_dir`, sorted by name.
pub fn live_files(state_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();
    for entry in fs::read_dir(state_dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with("topology") && name.ends_with(".json") {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(Error::NoTopologyFiles(state_dir.to_path_buf()));
    }
    files.sort();
    Ok(files)
}

/// Write the split topology of every node into `dest`, in both the P2P and legacy shapes.
///
/// A node's split topology lists every other member of its own half and nothing else.
pub fn generate(dest: &Path, layout: &Layout, host: &str) -> Result<(), Error> {
    fs::create_dir_all(dest)?;
    for side in [Side::A, Side::B] {
        let partition = layout.partition(side);
        for node in &partition.members {
            let mut peers = Vec::new();
            for peer in partition.members.iter().filter(|peer| *peer != node) {
                peers.push((host.to_string(), layout.port(peer)?));
            }
            for p2p in [true, false] {
                let name = format!("{}-{}", split_prefix(p2p), file_name(node));
                let contents = serde_json::to_vec_pretty(&Topology::new(&peers, p2p))?;
                fs::write(dest.join(name), contents)?;
            }
        }
    }
    info!(path = ?dest, nodes = layout.len(), "generated split topology files");
    Ok(())
}

/// Return the directory with split topology files, generating it only if it doesn't exist.
pub fn ensure_split_dir(dir: &Path, layout: &Layout, host: &str) -> Result<PathBuf, Error> {
    if dir.exists() {
        debug!(path = ?dir, "reusing split topology directory");
        return Ok(dir.to_path_buf());
    }
    generate(dir, layout, host)?;
    Ok(dir.to_path_buf())
}

/// Whether the cluster is (possibly) partitioned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Joined,
    Split,
    /// Topology restored, but the halves were not yet seen to agree.
    Healed,
}

/// Rewrites the live topology files of a cluster and restarts its nodes.
///
/// Every node of the [Layout] gets its split variant. Live topology files of any other node
/// (e.g. `topology-bft1.json`) are replaced with an empty topology while split, so that no
/// such node can bridge the two halves.
pub struct Controller {
    state_dir: PathBuf,
    p2p: bool,
    state: State,
    pools: Vec<PathBuf>,
    others: Vec<PathBuf>,
}

impl Controller {
    /// Create a controller for the nodes of `layout` running from `state_dir`.
    ///
    /// If `p2p` is not given, the networking mode is inferred from the live topology files.
    /// All nodes must use the same mode.
    pub fn detect(state_dir: &Path, layout: &Layout, p2p: Option<bool>) -> Result<Self, Error> {
        let files = live_files(state_dir)?;
        let mut pools = Vec::with_capacity(layout.len());
        for node in layout.nodes() {
            let path = state_dir.join(file_name(node));
            if !files.contains(&path) {
                return Err(Error::MissingTopology(path));
            }
            pools.push(path);
        }
        let others: Vec<PathBuf> = files
            .iter()
            .filter(|file| !pools.contains(file))
            .cloned()
            .collect();
        let p2p = match p2p {
            Some(p2p) => p2p,
            None => {
                let mut modes = Vec::with_capacity(files.len());
                for file in &files {
                    modes.push(Topology::load(file)?.is_p2p());
                }
                if modes.iter().any(|p2p| *p2p != modes[0]) {
                    return Err(Error::MixedTopology);
                }
                modes[0]
            }
        };
        if !others.is_empty() {
            warn!(files = ?others, "isolating nodes outside of the cluster layout while split");
        }
        info!(
            path = ?state_dir,
            p2p,
            pools = pools.len(),
            others = others.len(),
            "found topology files"
        );
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            p2p,
            state: State::Joined,
            pools,
            others,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn p2p(&self) -> bool {
        self.p2p
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.pools.iter().chain(self.others.iter())
    }

    /// Copy every managed topology file into a freshly named directory.
    pub fn backup(&self) -> Result<PathBuf, Error> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let backup = self
            .state_dir
            .join(format!("{BACKUP_DIR_PREFIX}_{}", &suffix[..8]));
        fs::create_dir_all(&backup)?;
        let mut count = 0;
        for file in self.files() {
            let Some(name) = file.file_name() else {
                continue;
            };
            fs::copy(file, backup.join(name))?;
            count += 1;
        }
        info!(path = ?backup, files = count, "backed up topology");
        Ok(backup)
    }

    /// Replace the topology file of every node with its split variant from `split_dir` and
    /// restart all nodes.
    ///
    /// Nothing is rewritten unless `split_dir` holds a variant for every node.
    pub async fn split<L: Ledger>(&mut self, split_dir: &Path, ledger: &L) -> Result<(), Error> {
        let prefix = split_prefix(self.p2p);
        let mut copies = Vec::with_capacity(self.pools.len());
        for file in &self.pools {
            let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let source = split_dir.join(format!("{prefix}-{name}"));
            if !source.exists() {
                return Err(Error::MissingTopology(source));
            }
            copies.push((source, file.clone()));
        }
        let isolated = serde_json::to_vec_pretty(&Topology::new(&[], self.p2p))?;

        // Partially rewritten files already leave the cluster unsafe to use
        self.state = State::Split;
        for (source, file) in &copies {
            fs::copy(source, file)?;
        }
        for file in &self.others {
            fs::write(file, &isolated)?;
        }

        // Apply
        ledger.restart_all_nodes().await?;
        info!(
            pools = self.pools.len(),
            isolated = self.others.len(),
            "split cluster"
        );
        Ok(())
    }

    /// Restore every managed topology file from `backup` and restart all nodes.
    ///
    /// The cluster only counts as healed once the restart succeeded, and as joined once
    /// [Controller::confirm] is called.
    pub async fn heal<L: Ledger>(&mut self, backup: &Path, ledger: &L) -> Result<(), Error> {
        let mut copies = Vec::with_capacity(self.pools.len() + self.others.len());
        for file in self.files() {
            let Some(name) = file.file_name() else {
                continue;
            };
            let source = backup.join(name);
            if !source.exists() {
                return Err(Error::MissingTopology(source));
            }
            copies.push((source, file.clone()));
        }
        for (source, file) in &copies {
            fs::copy(source, file)?;
        }

        // Only healed once every node runs with the restored topology
        ledger.restart_all_nodes().await?;
        self.state = State::Healed;
        info!(files = copies.len(), "healed cluster");
        Ok(())
    }

    /// Record that both halves of a healed cluster agree on a single chain.
    pub fn confirm(&mut self) {
        if self.state == State::Healed {
            self.state = State::Joined;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{write_joined, Simulated};
    use commonware_macros::test_traced;

    fn layout() -> Layout {
        Layout::new(4, 30000).unwrap()
    }

    #[test_traced]
    fn test_parse_both_shapes() {
        let legacy = r#"{"Producers": [{"addr": "127.0.0.1", "port": 30002, "valency": 1}]}"#;
        let topology: Topology = serde_json::from_str(legacy).unwrap();
        assert!(!topology.is_p2p());
        assert_eq!(topology.peers(), vec![("127.0.0.1".to_string(), 30002)]);

        let p2p = r#"{
            "localRoots": [
                {
                    "accessPoints": [
                        {"address": "127.0.0.1", "port": 30002},
                        {"address": "127.0.0.1", "port": 30003}
                    ],
                    "advertise": false,
                    "valency": 2
                }
            ],
            "publicRoots": [],
            "useLedgerAfterSlot": -1
        }"#;
        let topology: Topology = serde_json::from_str(p2p).unwrap();
        assert!(topology.is_p2p());
        assert_eq!(topology.peers().len(), 2);
    }

    #[test_traced]
    fn test_generate_restricts_peers_to_own_half() {
        let layout = Layout::new(6, 30000).unwrap();
        let dir = tempfile::tempdir().unwrap();
        generate(dir.path(), &layout, "127.0.0.1").unwrap();

        for node in layout.nodes() {
            let side = layout.side_of(node).unwrap();
            let own = layout.partition(side);
            for p2p in [true, false] {
                let path = dir
                    .path()
                    .join(format!("{}-{}", split_prefix(p2p), file_name(node)));
                let topology = Topology::load(&path).unwrap();
                assert_eq!(topology.is_p2p(), p2p);
                let peers = topology.peers();
                assert_eq!(peers.len(), own.members.len() - 1);
                for (_, port) in peers {
                    let peer = layout.by_port(port).unwrap();
                    assert!(own.contains(peer));
                    assert_ne!(peer, node);
                }
            }
        }
    }

    #[test_traced]
    fn test_ensure_split_dir_reuses_existing() {
        let layout = layout();
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("split_topology_ci0");
        ensure_split_dir(&dir, &layout, "127.0.0.1").unwrap();

        // Mark a file to detect regeneration
        let marked = dir.join(format!("{SPLIT_PREFIX}-topology-pool1.json"));
        fs::write(&marked, b"{}").unwrap();
        ensure_split_dir(&dir, &layout, "127.0.0.1").unwrap();
        assert_eq!(fs::read(&marked).unwrap(), b"{}");
    }

    #[test_traced]
    fn test_detect_networking_mode() {
        let layout = layout();
        let state = tempfile::tempdir().unwrap();
        write_joined(state.path(), &layout, true).unwrap();
        assert!(Controller::detect(state.path(), &layout, None).unwrap().p2p());
        assert!(!Controller::detect(state.path(), &layout, Some(false)).unwrap().p2p());

        // Mixed modes are refused
        let pool1 = layout.node("pool1").unwrap();
        let legacy = Topology::new(&[("127.0.0.1".to_string(), 30002)], false);
        fs::write(
            state.path().join(file_name(pool1)),
            serde_json::to_vec(&legacy).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            Controller::detect(state.path(), &layout, None),
            Err(Error::MixedTopology)
        ));
    }

    #[test_traced]
    fn test_detect_requires_topology_files() {
        let layout = layout();
        let state = tempfile::tempdir().unwrap();
        fs::write(state.path().join("config-pool1.json"), b"{}").unwrap();
        assert!(matches!(
            Controller::detect(state.path(), &layout, None),
            Err(Error::NoTopologyFiles(_))
        ));

        // Every node of the layout needs one
        write_joined(state.path(), &layout, false).unwrap();
        let pool3 = layout.node("pool3").unwrap();
        fs::remove_file(state.path().join(file_name(pool3))).unwrap();
        match Controller::detect(state.path(), &layout, None) {
            Err(Error::MissingTopology(path)) => assert!(path.ends_with("topology-pool3.json")),
            other => panic!("unexpected result: {:?}", other.map(|c| c.state())),
        }
    }

    #[test_traced]
    fn test_backup_directories_are_fresh() {
        let layout = layout();
        let state = tempfile::tempdir().unwrap();
        write_joined(state.path(), &layout, false).unwrap();
        let controller = Controller::detect(state.path(), &layout, None).unwrap();
        let first = controller.backup().unwrap();
        let second = controller.backup().unwrap();
        assert_ne!(first, second);
        for backup in [first, second] {
            assert!(backup.starts_with(state.path()));
            for node in layout.nodes() {
                assert!(backup.join(file_name(node)).exists());
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heal_restores_identical_files() {
        let layout = layout();
        let state = tempfile::tempdir().unwrap();
        let split_dir = state.path().join("split");
        write_joined(state.path(), &layout, true).unwrap();
        generate(&split_dir, &layout, "127.0.0.1").unwrap();
        let ledger = Simulated::new(state.path(), &layout, 10).unwrap();
        let mut controller = Controller::detect(state.path(), &layout, None).unwrap();

        let originals: Vec<(PathBuf, Vec<u8>)> = live_files(state.path())
            .unwrap()
            .into_iter()
            .map(|path| {
                let contents = fs::read(&path).unwrap();
                (path, contents)
            })
            .collect();
        let backup = controller.backup().unwrap();

        // Split
        controller.split(&split_dir, &ledger).await.unwrap();
        assert_eq!(controller.state(), State::Split);
        for (path, contents) in &originals {
            assert_ne!(&fs::read(path).unwrap(), contents);
        }
        let pool1 = layout.node("pool1").unwrap();
        let pool4 = layout.node("pool4").unwrap();
        assert!(!ledger.connected(pool1, pool4));

        // Heal
        controller.heal(&backup, &ledger).await.unwrap();
        assert_eq!(controller.state(), State::Healed);
        controller.confirm();
        assert_eq!(controller.state(), State::Joined);
        for (path, contents) in &originals {
            assert_eq!(&fs::read(path).unwrap(), contents);
        }
        assert!(ledger.connected(pool1, pool4));
        assert_eq!(ledger.restarts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_split_requires_every_variant() {
        let layout = layout();
        let state = tempfile::tempdir().unwrap();
        let split_dir = state.path().join("split");
        write_joined(state.path(), &layout, false).unwrap();
        generate(&split_dir, &layout, "127.0.0.1").unwrap();
        fs::remove_file(split_dir.join(format!("{SPLIT_PREFIX}-topology-pool3.json"))).unwrap();
        let ledger = Simulated::new(state.path(), &layout, 10).unwrap();
        let mut controller = Controller::detect(state.path(), &layout, None).unwrap();

        let originals: Vec<Vec<u8>> = layout
            .nodes()
            .map(|node| fs::read(state.path().join(file_name(node))).unwrap())
            .collect();
        let result = controller.split(&split_dir, &ledger).await;
        assert!(matches!(result, Err(Error::MissingTopology(_))));

        // Nothing was rewritten
        assert_eq!(controller.state(), State::Joined);
        for (node, contents) in layout.nodes().zip(&originals) {
            assert_eq!(&fs::read(state.path().join(file_name(node))).unwrap(), contents);
        }
        assert_eq!(ledger.restarts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_split_isolates_nodes_outside_layout() {
        let layout = layout();
        let state = tempfile::tempdir().unwrap();
        let split_dir = state.path().join("split");
        write_joined(state.path(), &layout, false).unwrap();
        generate(&split_dir, &layout, "127.0.0.1").unwrap();

        // A node that is not part of the layout, peering with both halves
        let bft1 = state.path().join("topology-bft1.json");
        let pool1 = layout.node("pool1").unwrap();
        fs::copy(state.path().join(file_name(pool1)), &bft1).unwrap();
        let original = fs::read(&bft1).unwrap();
        let ledger = Simulated::new(state.path(), &layout, 10).unwrap();
        let mut controller = Controller::detect(state.path(), &layout, None).unwrap();
        let backup = controller.backup().unwrap();
        assert!(backup.join("topology-bft1.json").exists());

        // Split
        controller.split(&split_dir, &ledger).await.unwrap();
        assert_eq!(controller.state(), State::Split);
        assert!(Topology::load(&bft1).unwrap().peers().is_empty());
        for node in layout.nodes() {
            let variant = split_dir.join(format!("{SPLIT_PREFIX}-{}", file_name(node)));
            assert_eq!(
                fs::read(state.path().join(file_name(node))).unwrap(),
                fs::read(variant).unwrap()
            );
        }

        // Heal
        controller.heal(&backup, &ledger).await.unwrap();
        assert_eq!(controller.state(), State::Healed);
        assert_eq!(fs::read(&bft1).unwrap(), original);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heal_failure_keeps_split() {
        let layout = layout();
        let state = tempfile::tempdir().unwrap();
        let split_dir = state.path().join("split");
        write_joined(state.path(), &layout, true).unwrap();
        generate(&split_dir, &layout, "127.0.0.1").unwrap();
        let ledger = Simulated::new(state.path(), &layout, 10).unwrap();
        let mut controller = Controller::detect(state.path(), &layout, None).unwrap();
        let backup = controller.backup().unwrap();
        controller.split(&split_dir, &ledger).await.unwrap();

        // Backup lost a file
        fs::remove_file(backup.join("topology-pool2.json")).unwrap();
        let result = controller.heal(&backup, &ledger).await;
        assert!(matches!(result, Err(Error::MissingTopology(_))));
        assert_eq!(controller.state(), State::Split);
        controller.confirm();
        assert_eq!(controller.state(), State::Split);
        assert_eq!(ledger.restarts(), 1);
        let pool1 = layout.node("pool1").unwrap();
        let pool4 = layout.node("pool4").unwrap();
        assert!(!ledger.connected(pool1, pool4));
    }
}
