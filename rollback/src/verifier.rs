//! Check that a healed cluster converged on a single chain.

use crate::{
    cluster::{Layout, Side},
    ledger::Ledger,
    recorder::{Observation, Recorder, TxRecord},
    Error, Violation,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Delay before the fixed settle check, matching the time a small cluster needs to roll back
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 10_000;

/// How long to wait for the cluster to settle after healing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Settle {
    /// Sleep once, then look.
    Fixed { delay_ms: u64 },
    /// Look every `interval_ms` until both halves agree or `timeout_ms` elapses.
    Poll { interval_ms: u64, timeout_ms: u64 },
}

impl Default for Settle {
    fn default() -> Self {
        Self::Fixed {
            delay_ms: DEFAULT_SETTLE_DELAY_MS,
        }
    }
}

/// Observations of every partition-local transaction on both representatives.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub entries: Vec<(Side, Observation, Observation)>,
}

impl Snapshot {
    /// Fail with [Violation::Disagreement] unless both representatives see identical outputs
    /// for every transaction.
    pub fn agreement(&self) -> Result<(), Violation> {
        for (_, a, b) in &self.entries {
            if a.utxos != b.utxos {
                return Err(Violation::Disagreement {
                    ordinal: a.ordinal,
                    a: a.node.to_string(),
                    b: b.node.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Return the side whose transaction survived the rollback.
    ///
    /// Exactly one transaction must be visible.
    pub fn survivor(&self) -> Result<Side, Violation> {
        let visible: Vec<Side> = self
            .entries
            .iter()
            .filter(|(_, a, _)| a.visible())
            .map(|(side, _, _)| *side)
            .collect();
        match visible.as_slice() {
            [side] => Ok(*side),
            [] => Err(Violation::NoSurvivor),
            _ => Err(Violation::BothSurvived),
        }
    }
}

/// Re-queries partition-local transactions after the cluster was healed.
pub struct Verifier<'a, L: Ledger> {
    recorder: &'a Recorder<'a, L>,
    layout: &'a Layout,
    settle: Settle,
}

impl<'a, L: Ledger> Verifier<'a, L> {
    pub fn new(recorder: &'a Recorder<'a, L>, layout: &'a Layout, settle: Settle) -> Self {
        Self {
            recorder,
            layout,
            settle,
        }
    }

    async fn snapshot(&self, records: &[&TxRecord]) -> Result<Snapshot, Error> {
        let a = self.layout.representative(Side::A);
        let b = self.layout.representative(Side::B);
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let Some(side) = record.side else {
                continue;
            };
            let seen_a = self.recorder.observe(record, &a).await?;
            let seen_b = self.recorder.observe(record, &b).await?;
            entries.push((side, seen_a, seen_b));
        }
        Ok(Snapshot { entries })
    }

    /// Wait for the cluster to settle, then observe every partition-local transaction in
    /// `records` on both representatives.
    pub async fn settle(&self, records: &[&TxRecord]) -> Result<Snapshot, Error> {
        match &self.settle {
            Settle::Fixed { delay_ms } => {
                debug!(delay_ms, "waiting for cluster to settle");
                sleep(Duration::from_millis(*delay_ms)).await;
                self.snapshot(records).await
            }
            Settle::Poll {
                interval_ms,
                timeout_ms,
            } => {
                let deadline = Instant::now() + Duration::from_millis(*timeout_ms);
                let mut attempts = 0;
                loop {
                    attempts += 1;
                    let snapshot = self.snapshot(records).await?;
                    if snapshot.agreement().is_ok() {
                        info!(attempts, "cluster settled");
                        return Ok(snapshot);
                    }
                    if Instant::now() >= deadline {
                        warn!(attempts, timeout_ms, "cluster did not settle");
                        return Ok(snapshot);
                    }
                    sleep(Duration::from_millis(*interval_ms)).await;
                }
            }
        }
    }
}
