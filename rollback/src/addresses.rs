//! Payment addresses used by a run, created once per cluster instance and reused after.

use crate::{
    ledger::{balance, AddressRecord, Endpoint, Filter, Ledger, RawTx, TxOut, TxRequest},
    Error, ADDRESS_COUNT,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Default balance every address is topped up to
pub const DEFAULT_FUND_AMOUNT: u64 = 100_000_000;

/// Source of funds for the addresses of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Faucet {
    pub address: String,
    pub signing_key: PathBuf,
}

/// Prefix shared by the addresses (and their cache) of cluster `instance`.
pub fn name_prefix(instance: u16) -> String {
    format!("addr_rollback_ci{instance}")
}

fn cache_path(work_dir: &Path, instance: u16) -> PathBuf {
    work_dir.join(format!("{}.yaml", name_prefix(instance)))
}

fn load_cache(path: &Path) -> Option<Vec<AddressRecord>> {
    let file = File::open(path).ok()?;
    let records: Vec<AddressRecord> = match serde_yaml::from_reader(file) {
        Ok(records) => records,
        Err(err) => {
            debug!(path = ?path, error = ?err, "ignoring unreadable address cache");
            return None;
        }
    };
    let complete = records.len() == ADDRESS_COUNT
        && records
            .iter()
            .all(|record| record.verification_key.exists() && record.signing_key.exists());
    complete.then_some(records)
}

/// Return the [ADDRESS_COUNT] addresses of cluster `instance`, generating them in `work_dir`
/// unless a complete set is already cached there.
pub async fn ensure<L: Ledger>(
    ledger: &L,
    work_dir: &Path,
    instance: u16,
) -> Result<Vec<AddressRecord>, Error> {
    let path = cache_path(work_dir, instance);
    if let Some(records) = load_cache(&path) {
        debug!(path = ?path, "reusing addresses");
        return Ok(records);
    }

    // Generate
    let prefix = name_prefix(instance);
    let mut records = Vec::with_capacity(ADDRESS_COUNT);
    for i in 0..ADDRESS_COUNT {
        let record = ledger
            .payment_address(&format!("{prefix}_{i}"), work_dir)
            .await?;
        records.push(record);
    }
    let file = File::create(&path)?;
    serde_yaml::to_writer(file, &records)?;
    info!(path = ?path, count = records.len(), "generated addresses");
    Ok(records)
}

/// Top up every address holding less than `amount` back to `amount` from `faucet`, in a
/// single transaction submitted through `endpoint`.
///
/// Returns the funding transaction, if one was needed.
pub async fn fund<L: Ledger>(
    ledger: &L,
    endpoint: &Endpoint,
    faucet: &Faucet,
    records: &[AddressRecord],
    amount: u64,
) -> Result<Option<RawTx>, Error> {
    let mut outputs = Vec::new();
    for record in records {
        let utxos = ledger
            .query_utxo(endpoint, &Filter::Address(record.address.clone()))
            .await?;
        let available = balance(&utxos);
        if available < amount {
            outputs.push(TxOut {
                address: record.address.clone(),
                amount: amount - available,
            });
        }
    }
    if outputs.is_empty() {
        return Ok(None);
    }
    let request = TxRequest {
        source: faucet.address.clone(),
        name: format!("fund_{}", uuid::Uuid::new_v4().simple()),
        outputs,
        signing_keys: vec![faucet.signing_key.clone()],
    };
    let raw = ledger.send_tx(endpoint, request).await?;
    info!(txid = %raw.txid, outputs = raw.outputs.len() - 1, "funded addresses");
    Ok(Some(raw))
}
