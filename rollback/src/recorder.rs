//! Record submitted transactions and check where their outputs are visible.

use crate::{
    cluster::{Node, Side},
    ledger::{AddressRecord, Filter, Ledger, RawTx, Utxo},
    router::Router,
    Error, Violation,
};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// A transaction submitted during a run.
///
/// `side` is the half the transaction was submitted on, or `None` when it was submitted
/// while the cluster was joined.
#[derive(Clone, Debug)]
pub struct TxRecord {
    pub ordinal: usize,
    pub source: AddressRecord,
    pub destination: AddressRecord,
    pub node: Node,
    pub side: Option<Side>,
    pub raw: RawTx,
}

/// The outputs of a recorded transaction as seen by a single node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub ordinal: usize,
    pub node: Node,
    pub utxos: BTreeSet<Utxo>,
}

impl Observation {
    pub fn visible(&self) -> bool {
        !self.utxos.is_empty()
    }
}

/// Submits numbered transactions through a [Router] and checks their visibility.
pub struct Recorder<'a, L: Ledger> {
    router: &'a Router<'a, L>,
    template: String,
    records: Vec<TxRecord>,
}

impl<'a, L: Ledger> Recorder<'a, L> {
    pub fn new(router: &'a Router<'a, L>, template: impl Into<String>) -> Self {
        Self {
            router,
            template: template.into(),
            records: Vec::new(),
        }
    }

    /// Submit the next transaction (numbered from 1) on `node`.
    pub async fn submit(
        &mut self,
        node: &Node,
        side: Option<Side>,
        source: &AddressRecord,
        destination: &AddressRecord,
    ) -> Result<TxRecord, Error> {
        let ordinal = self.records.len() + 1;
        let raw = self
            .router
            .submit_tx(node, &self.template, source, destination)
            .await?;
        info!(ordinal, %node, txid = %raw.txid, "submitted transaction");
        let record = TxRecord {
            ordinal,
            source: source.clone(),
            destination: destination.clone(),
            node: node.clone(),
            side,
            raw,
        };
        self.records.push(record.clone());
        Ok(record)
    }

    pub fn router(&self) -> &'a Router<'a, L> {
        self.router
    }

    pub fn records(&self) -> &[TxRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<TxRecord> {
        self.records
    }

    /// Query the outputs of `record` on `node`.
    pub async fn observe(&self, record: &TxRecord, node: &Node) -> Result<Observation, Error> {
        let utxos = self.router.query_utxo(node, &Filter::tx(&record.raw)).await?;
        let observation = Observation {
            ordinal: record.ordinal,
            node: node.clone(),
            utxos,
        };
        debug!(
            ordinal = record.ordinal,
            %node,
            visible = observation.visible(),
            "observed transaction"
        );
        Ok(observation)
    }

    /// Fail unless `record` is visible on `node`.
    ///
    /// The failure is [Violation::MissingLocally] when `node` is where the transaction was
    /// submitted and [Violation::NotPropagated] otherwise.
    pub async fn expect_visible(&self, record: &TxRecord, node: &Node) -> Result<(), Error> {
        if self.observe(record, node).await?.visible() {
            return Ok(());
        }
        let ordinal = record.ordinal;
        let node = node.to_string();
        if record.node.name() == node {
            return Err(Violation::MissingLocally { ordinal, node }.into());
        }
        Err(Violation::NotPropagated { ordinal, node }.into())
    }

    /// Fail with [Violation::Leaked] if `record` is visible on `node`.
    pub async fn expect_absent(&self, record: &TxRecord, node: &Node) -> Result<(), Error> {
        if self.observe(record, node).await?.visible() {
            return Err(Violation::Leaked {
                ordinal: record.ordinal,
                node: node.to_string(),
            }
            .into());
        }
        Ok(())
    }
}
