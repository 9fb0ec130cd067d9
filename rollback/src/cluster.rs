//! Nodes of the cluster and the two halves it is split into.

use crate::Error;
use std::fmt;

/// Spacing between the port ranges of two cluster instances
pub const INSTANCE_PORT_STRIDE: u16 = 100;

/// Name prefix of every block-producing node
pub const POOL_PREFIX: &str = "pool";

/// A block-producing node, identified by its name (e.g. `pool1`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Node(String);

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One of the two halves of a split cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::B => f.write_str("B"),
        }
    }
}

/// Nodes of one half of the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub side: Side,
    pub members: Vec<Node>,
}

impl Partition {
    pub fn first(&self) -> &Node {
        &self.members[0]
    }

    pub fn last(&self) -> &Node {
        &self.members[self.members.len() - 1]
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.members.contains(node)
    }
}

/// The nodes of a cluster instance and the port each one listens on.
#[derive(Clone, Debug)]
pub struct Layout {
    nodes: Vec<(Node, u16)>,
}

impl Layout {
    /// Create the layout of `pools` nodes whose ports start right after `first_port`.
    ///
    /// The cluster can only be split into two equal halves that are each large enough to
    /// keep producing blocks, so `pools` must be even and at least 4.
    pub fn new(pools: usize, first_port: u16) -> Result<Self, Error> {
        if pools < 4 || pools % 2 != 0 {
            return Err(Error::InvalidPoolCount(pools));
        }
        let nodes = (1..=pools)
            .map(|i| {
                let node = Node::new(format!("{POOL_PREFIX}{i}"));
                let port = u64::from(first_port) + i as u64;
                let port = u16::try_from(port).map_err(|_| Error::PortRange(port))?;
                Ok((node, port))
            })
            .collect::<Result<_, Error>>()?;
        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().map(|(node, _)| node)
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Result<&Node, Error> {
        self.nodes
            .iter()
            .map(|(node, _)| node)
            .find(|node| node.name() == name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))
    }

    pub fn port(&self, node: &Node) -> Result<u16, Error> {
        self.nodes
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, port)| *port)
            .ok_or_else(|| Error::UnknownNode(node.to_string()))
    }

    /// Find the node listening on `port`.
    pub fn by_port(&self, port: u16) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|(_, p)| *p == port)
            .map(|(node, _)| node)
    }

    pub fn partition(&self, side: Side) -> Partition {
        let half = self.nodes.len() / 2;
        let range = match side {
            Side::A => 0..half,
            Side::B => half..self.nodes.len(),
        };
        Partition {
            side,
            members: self.nodes[range].iter().map(|(n, _)| n.clone()).collect(),
        }
    }

    pub fn side_of(&self, node: &Node) -> Result<Side, Error> {
        let index = self
            .nodes
            .iter()
            .position(|(n, _)| n == node)
            .ok_or_else(|| Error::UnknownNode(node.to_string()))?;
        if index < self.nodes.len() / 2 {
            Ok(Side::A)
        } else {
            Ok(Side::B)
        }
    }

    /// The node used as a proxy for a whole half.
    ///
    /// Half A is represented by its first member and half B by its last member (`pool1` and
    /// `poolN`).
    pub fn representative(&self, side: Side) -> Node {
        let partition = self.partition(side);
        match side {
            Side::A => partition.first().clone(),
            Side::B => partition.last().clone(),
        }
    }
}
