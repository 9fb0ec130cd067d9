//! Split the cluster, let both halves diverge, heal it and check that exactly one half's
//! history survived.

use crate::{
    cluster::{Layout, Side},
    guard::Guard,
    ledger::{AddressRecord, Ledger},
    recorder::{Recorder, TxRecord},
    router::Router,
    topology::Controller,
    verifier::{Settle, Snapshot, Verifier},
    Error,
};
use std::path::{Path, PathBuf};
use tracing::info;

/// Default number of blocks each half produces while split
pub const DEFAULT_DIVERGENCE_BLOCKS: u64 = 1;

/// Parameters of a single run.
#[derive(Clone, Debug)]
pub struct Params {
    /// Directory holding the split topology files.
    pub split_dir: PathBuf,
    /// Prefix of every transaction name.
    pub template: String,
    pub settle: Settle,
    /// Blocks to wait for on each half while split.
    pub divergence_blocks: u64,
    /// Deepest rollback the nodes accept.
    pub security_param: u64,
}

impl Params {
    /// Fail unless the halves can still be reconciled after diverging.
    pub fn validate(&self) -> Result<(), Error> {
        if self.divergence_blocks == 0 || self.divergence_blocks >= self.security_param {
            return Err(Error::DivergenceBound {
                blocks: self.divergence_blocks,
                security_param: self.security_param,
            });
        }
        Ok(())
    }
}

/// Result of a successful run.
#[derive(Clone, Debug)]
pub struct Outcome {
    /// Half whose transaction survived.
    pub survivor: Side,
    pub records: Vec<TxRecord>,
    /// Backup of the original topology files.
    pub backup: PathBuf,
}

/// Generate a transaction name template unique to this run.
pub fn template() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("test_rollback_{}", &suffix[..8])
}

/// Run the whole protocol against the cluster behind `router`.
///
/// `addresses` must hold [ADDRESS_COUNT](crate::ADDRESS_COUNT) funded addresses. Any failure
/// while the cluster may still be split marks it for a rebuild (see [Guard]), and a cluster
/// marked that way is refused with [Error::NeedsRespin] before anything is submitted.
pub async fn run<L: Ledger>(
    router: &Router<'_, L>,
    layout: &Layout,
    controller: &mut Controller,
    addresses: &[AddressRecord],
    params: &Params,
) -> Result<Outcome, Error> {
    params.validate()?;
    let [first, second, third] = addresses else {
        return Err(Error::InvalidAddressCount(addresses.len()));
    };
    let guard = Guard::new(controller.state_dir());
    guard.require_clear()?;
    let a = layout.representative(Side::A);
    let mut recorder = Recorder::new(router, params.template.clone());

    // Submit while joined
    let joined = recorder.submit(&a, None, first, first).await?;

    // Back up the original topology
    let backup = controller.backup()?;

    // Split, diverge and heal
    let result = partitioned(
        &mut recorder,
        layout,
        controller,
        &backup,
        &joined,
        [second, third],
        params,
    )
    .await;
    let snapshot = guard.check(controller.state(), result)?;
    controller.confirm();

    // Exactly one of the partition-local transactions survives
    let survivor = snapshot.survivor()?;
    info!(%survivor, "cluster rolled back to a single chain");
    Ok(Outcome {
        survivor,
        records: recorder.into_records(),
        backup,
    })
}

async fn partitioned<L: Ledger>(
    recorder: &mut Recorder<'_, L>,
    layout: &Layout,
    controller: &mut Controller,
    backup: &Path,
    joined: &TxRecord,
    [second, third]: [&AddressRecord; 2],
    params: &Params,
) -> Result<Snapshot, Error> {
    let ledger = recorder.router().ledger();
    let a = layout.representative(Side::A);
    let b = layout.representative(Side::B);

    // Split
    controller.split(&params.split_dir, ledger).await?;
    recorder.expect_visible(joined, &a).await?;
    recorder.expect_visible(joined, &b).await?;

    // Diverge
    let on_a = recorder.submit(&a, Some(Side::A), second, second).await?;
    recorder.expect_visible(&on_a, &a).await?;
    recorder.expect_absent(&on_a, &b).await?;
    let on_b = recorder.submit(&b, Some(Side::B), third, third).await?;
    recorder.expect_visible(&on_b, &b).await?;
    recorder.expect_absent(&on_b, &a).await?;
    let endpoint_a = recorder.router().endpoint(&a);
    let endpoint_b = recorder.router().endpoint(&b);
    for _ in 0..params.divergence_blocks {
        futures::try_join!(
            ledger.wait_for_new_block(&endpoint_a),
            ledger.wait_for_new_block(&endpoint_b)
        )?;
    }
    info!(blocks = params.divergence_blocks, "halves diverged");

    // Heal
    controller.heal(backup, ledger).await?;
    let local: Vec<&TxRecord> = recorder
        .records()
        .iter()
        .filter(|record| record.side.is_some())
        .collect();
    let snapshot = Verifier::new(recorder, layout, params.settle.clone())
        .settle(&local)
        .await?;
    snapshot.agreement()?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    fn params(divergence_blocks: u64, security_param: u64) -> Params {
        Params {
            split_dir: PathBuf::from("split"),
            template: template(),
            settle: Settle::default(),
            divergence_blocks,
            security_param,
        }
    }

    #[test_traced]
    fn test_divergence_bound() {
        assert!(params(1, 10).validate().is_ok());
        assert!(params(9, 10).validate().is_ok());
        for (blocks, k) in [(0, 10), (10, 10), (11, 10), (1, 1)] {
            assert!(matches!(
                params(blocks, k).validate(),
                Err(Error::DivergenceBound { .. })
            ));
        }
    }

    #[test_traced]
    fn test_templates_differ() {
        let first = template();
        assert!(first.starts_with("test_rollback_"));
        assert_ne!(first, template());
    }
}
