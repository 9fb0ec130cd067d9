//! Route queries and submissions to the control socket of a specific node.
//!
//! The cluster exposes one control socket per node, all living next to the socket of the
//! default node. Every operation takes the target node explicitly and derives that node's
//! socket from the default one, so nothing process-wide is ever rebound.

use crate::{
    cluster::Node,
    ledger::{AddressRecord, Endpoint, Filter, Ledger, RawTx, TxOut, TxRequest, Utxo},
    Error, TX_AMOUNT,
};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::debug;

/// Endpoint of `node`, whose socket lives next to `socket` (`<dir>/<node>.socket`).
pub fn sibling(socket: &Path, node: &Node) -> Endpoint {
    let parent = socket.parent().unwrap_or_else(|| Path::new(""));
    Endpoint::new(parent.join(format!("{node}.socket")))
}

/// Issues operations against individual nodes of the cluster.
pub struct Router<'a, L: Ledger> {
    ledger: &'a L,
    socket: PathBuf,
    stamp: AtomicU64,
}

impl<'a, L: Ledger> Router<'a, L> {
    /// Create a router from the socket of the default node.
    ///
    /// The socket must live in a directory, since the sockets of all other nodes are found
    /// next to it.
    pub fn new(ledger: &'a L, socket: impl Into<PathBuf>) -> Result<Self, Error> {
        let socket = socket.into();
        if socket.parent().is_none() || socket.file_name().is_none() {
            return Err(Error::InvalidSocketPath(socket));
        }
        Ok(Self {
            ledger,
            socket,
            stamp: AtomicU64::new(0),
        })
    }

    pub fn ledger(&self) -> &'a L {
        self.ledger
    }

    /// Endpoint of the default node.
    pub fn default_endpoint(&self) -> Endpoint {
        Endpoint::new(&self.socket)
    }

    /// Endpoint of `node`.
    pub fn endpoint(&self, node: &Node) -> Endpoint {
        sibling(&self.socket, node)
    }

    /// Return a millisecond timestamp that is strictly greater than any returned before.
    fn next_stamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        let previous = self
            .stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_default();
        now.max(previous + 1)
    }

    /// Derive a unique transaction name from `template`.
    pub fn tx_name(&self, template: &str) -> String {
        format!("{template}_{}", self.next_stamp())
    }

    /// Query the confirmed outputs on `node` matching `filter`.
    pub async fn query_utxo(&self, node: &Node, filter: &Filter) -> Result<BTreeSet<Utxo>, Error> {
        let endpoint = self.endpoint(node);
        let utxos = self.ledger.query_utxo(&endpoint, filter).await?;
        debug!(%node, ?filter, found = utxos.len(), "queried UTxO");
        Ok(utxos)
    }

    /// Send [TX_AMOUNT] from `src` to `dst` through `node`.
    pub async fn submit_tx(
        &self,
        node: &Node,
        template: &str,
        src: &AddressRecord,
        dst: &AddressRecord,
    ) -> Result<RawTx, Error> {
        let endpoint = self.endpoint(node);
        let request = TxRequest {
            source: src.address.clone(),
            name: self.tx_name(template),
            outputs: vec![TxOut {
                address: dst.address.clone(),
                amount: TX_AMOUNT,
            }],
            signing_keys: vec![src.signing_key.clone()],
        };
        self.ledger.send_tx(&endpoint, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::Layout,
        mocks::{write_joined, Simulated},
    };
    use commonware_macros::test_traced;
    use std::collections::HashSet;

    #[test_traced]
    fn test_endpoint_sibling_substitution() {
        let layout = Layout::new(4, 30000).unwrap();
        let state = tempfile::tempdir().unwrap();
        write_joined(state.path(), &layout, false).unwrap();
        let ledger = Simulated::new(state.path(), &layout, 10).unwrap();
        let router = Router::new(&ledger, "/tmp/state-cluster0/bft1.socket").unwrap();

        let pool3 = layout.node("pool3").unwrap();
        let endpoint = router.endpoint(pool3);
        assert_eq!(
            endpoint.socket(),
            Path::new("/tmp/state-cluster0/pool3.socket")
        );
        assert_eq!(endpoint.node_name(), Some("pool3"));
        assert_eq!(
            router.default_endpoint().socket(),
            Path::new("/tmp/state-cluster0/bft1.socket")
        );
    }

    #[test_traced]
    fn test_rejects_socket_without_parent() {
        let layout = Layout::new(4, 30000).unwrap();
        let state = tempfile::tempdir().unwrap();
        write_joined(state.path(), &layout, false).unwrap();
        let ledger = Simulated::new(state.path(), &layout, 10).unwrap();
        assert!(matches!(
            Router::new(&ledger, "/"),
            Err(Error::InvalidSocketPath(_))
        ));
    }

    #[test_traced]
    fn test_tx_names_are_unique() {
        let layout = Layout::new(4, 30000).unwrap();
        let state = tempfile::tempdir().unwrap();
        write_joined(state.path(), &layout, false).unwrap();
        let ledger = Simulated::new(state.path(), &layout, 10).unwrap();
        let router = Router::new(&ledger, state.path().join("pool1.socket")).unwrap();

        // Names generated within the same millisecond must still differ
        let names: Vec<String> = (0..1000).map(|_| router.tx_name("rollback")).collect();
        let unique: HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len());

        // Stamps only increase
        let stamps: Vec<u64> = names
            .iter()
            .map(|name| name.rsplit('_').next().unwrap().parse().unwrap())
            .collect();
        assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_and_query_target_node() {
        let layout = Layout::new(4, 30000).unwrap();
        let state = tempfile::tempdir().unwrap();
        write_joined(state.path(), &layout, false).unwrap();
        let ledger = Simulated::new(state.path(), &layout, 10).unwrap();
        let keys = tempfile::tempdir().unwrap();
        let src = ledger.payment_address("src", keys.path()).await.unwrap();
        let dst = ledger.payment_address("dst", keys.path()).await.unwrap();
        ledger.fund(&src.address, 10 * TX_AMOUNT);
        let router = Router::new(&ledger, state.path().join("pool1.socket")).unwrap();

        let pool2 = layout.node("pool2").unwrap();
        let raw = router.submit_tx(pool2, "route", &src, &dst).await.unwrap();
        assert!(raw.name.starts_with("route_"));
        assert_eq!(raw.outputs[0].address, dst.address);
        assert_eq!(raw.outputs[0].amount, TX_AMOUNT);

        let utxos = router.query_utxo(pool2, &Filter::tx(&raw)).await.unwrap();
        assert_eq!(utxos.len(), raw.outputs.len());
        let received = router
            .query_utxo(pool2, &Filter::Address(dst.address.clone()))
            .await
            .unwrap();
        assert_eq!(crate::ledger::balance(&received), TX_AMOUNT);
    }
}
