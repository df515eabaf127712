//! JSON forms of a condensation batch and its outcome.
//!
//! Maps keyed by address have no JSON object form, so both directions use
//! lists of `{ "address": .., ... }` entries instead.

use std::io::Read;

use anyhow::{Context as _, Result};
use ethereum_types::H256;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utxo_bridge::{
    address::UniversalAddress,
    backing::{BackingLedger, BackingRecord, BackingUpdates},
    condenser::{Condensation, CondensingTx, SenderVin, Transfer},
    config::BridgeConfig,
};

/// A backing record and the account it backs.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AddressRecord {
    pub address: UniversalAddress,
    #[serde(flatten)]
    pub record: BackingRecord,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VoutEntry {
    pub address: UniversalAddress,
    pub vout: u32,
}

/// Everything one run of the condenser needs.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CondenseBatch {
    /// Backing records the ledger holds before the batch.
    #[serde(default)]
    pub priors: Vec<AddressRecord>,
    pub transfers: Vec<Transfer>,
    /// The contract call output that funds the batch, if any.
    #[serde(default)]
    pub sender: Option<SenderVin>,
    /// Accounts destroyed while producing the transfers.
    #[serde(default)]
    pub deleted: Vec<UniversalAddress>,
}

impl CondenseBatch {
    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut buffer = String::new();
        reader.read_to_string(&mut buffer)?;
        let des = &mut serde_json::Deserializer::from_str(&buffer);
        serde_path_to_error::deserialize(des).context("malformed condensation batch")
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CondenseReport {
    Condensed {
        /// `None` when the batch moved no value.
        txid: Option<H256>,
        /// Wire encoding of the condensing transaction, hex.
        raw_tx: Option<String>,
        vout_numbers: Vec<VoutEntry>,
        updates: Vec<AddressRecord>,
        backing_root: H256,
    },
    VoutOverflow {
        required: usize,
        limit: usize,
    },
}

fn records(updates: BackingUpdates) -> Vec<AddressRecord> {
    updates
        .into_iter()
        .map(|(address, record)| AddressRecord { address, record })
        .collect()
}

/// Condenses `batch` against a ledger holding exactly its priors and commits
/// the result.
pub fn condense(batch: CondenseBatch, config: &BridgeConfig) -> Result<CondenseReport> {
    let mut ledger = BackingLedger::new();
    let priors: BackingUpdates = batch
        .priors
        .into_iter()
        .map(|p| (p.address, p.record))
        .collect();
    debug!("seeding backing ledger with {} records", priors.len());
    ledger
        .commit(priors)
        .context("failed to seed the backing ledger")?;

    let mut condensing =
        CondensingTx::new(&ledger, &batch.transfers, config).with_deleted(batch.deleted);
    if let Some(sender) = batch.sender {
        condensing = condensing.with_sender(sender);
    }
    let condensation = condensing.condense().context("condensation failed")?;

    let ct = match condensation {
        Condensation::Condensed(ct) => ct,
        Condensation::VoutOverflow { required, limit } => {
            info!("batch needs {required} outputs, limit is {limit}");
            return Ok(CondenseReport::VoutOverflow { required, limit });
        }
    };

    let backing_root = ledger
        .commit(ct.updates.clone())
        .context("failed to commit backing updates")?;
    Ok(CondenseReport::Condensed {
        txid: ct.txid(),
        raw_tx: ct.transaction.as_ref().map(|tx| hex::encode(tx.encode())),
        vout_numbers: ct
            .vout_numbers
            .into_iter()
            .map(|(address, vout)| VoutEntry { address, vout })
            .collect(),
        updates: records(ct.updates),
        backing_root,
    })
}
