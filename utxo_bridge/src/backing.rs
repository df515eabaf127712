//! The UTXO-backing ledger: which ledger output currently holds each
//! account's balance.
//!
//! Records live in an authenticated trie keyed by
//! [`UniversalAddress::trie_key`] and are RLP encoded as
//! `[txid, vout, value, alive]`. Writes collect in a pending cache and only
//! reach the trie through [`BackingLedger::commit`], which applies them in a
//! single atomic batch. Dead records are removed from the trie on commit, so
//! a committed root never holds a stale alive record for an address.

use std::collections::BTreeMap;

use ethereum_types::{H256, U256};
use log::debug;
use rlp_derive::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    address::UniversalAddress,
    transaction::OutPoint,
    trie_store::{TrieStore, TrieStoreError},
};

/// Pending per-address record changes, in canonical address order.
pub type BackingUpdates = BTreeMap<UniversalAddress, BackingRecord>;

#[derive(Debug, Error)]
pub enum BackingError {
    #[error(transparent)]
    Trie(#[from] TrieStoreError),

    /// A stored record is not valid RLP for a [`BackingRecord`].
    #[error("undecodable backing record for {address}: {source}")]
    Decode {
        address: UniversalAddress,
        source: rlp::DecoderError,
    },
}

/// The output currently backing an account.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    PartialEq,
    RlpDecodable,
    RlpEncodable,
    Serialize,
)]
pub struct BackingRecord {
    pub txid: H256,
    pub vout: u32,
    pub value: U256,
    pub alive: bool,
}

impl BackingRecord {
    /// A live record for output `vout` of `txid`.
    pub fn new(txid: H256, vout: u32, value: U256) -> Self {
        Self {
            txid,
            vout,
            value,
            alive: true,
        }
    }

    /// Marks an account whose backing output has been spent without
    /// replacement.
    pub fn tombstone() -> Self {
        Self::default()
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    /// Whether this record names an output that can still be consumed.
    pub fn is_spendable(&self) -> bool {
        self.alive && !self.value.is_zero()
    }
}

/// Read access to backing records.
pub trait BackingView {
    /// The record currently associated with `address`, dead or alive.
    fn record(&self, address: &UniversalAddress) -> Result<Option<BackingRecord>, BackingError>;

    /// The record for `address` if it can be spent.
    fn spendable(&self, address: &UniversalAddress) -> Result<Option<BackingRecord>, BackingError> {
        Ok(self.record(address)?.filter(BackingRecord::is_spendable))
    }
}

impl BackingView for BackingUpdates {
    fn record(&self, address: &UniversalAddress) -> Result<Option<BackingRecord>, BackingError> {
        Ok(self.get(address).copied())
    }
}

#[derive(Clone, Debug, Default)]
pub struct BackingLedger {
    trie: TrieStore,
    pending: BackingUpdates,
}

impl BackingView for BackingLedger {
    fn record(&self, address: &UniversalAddress) -> Result<Option<BackingRecord>, BackingError> {
        self.get(address)
    }
}

impl BackingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pending record for `address` if there is one, otherwise the
    /// committed one.
    pub fn get(&self, address: &UniversalAddress) -> Result<Option<BackingRecord>, BackingError> {
        if let Some(record) = self.pending.get(address) {
            return Ok(Some(*record));
        }
        self.trie
            .get(address.trie_key())
            .map(|raw| {
                rlp::decode(raw).map_err(|source| BackingError::Decode {
                    address: address.clone(),
                    source,
                })
            })
            .transpose()
    }

    pub fn set(&mut self, address: UniversalAddress, record: BackingRecord) {
        self.pending.insert(address, record);
    }

    /// Tombstones `address`. The record disappears from the trie at the next
    /// commit.
    pub fn remove(&mut self, address: UniversalAddress) {
        self.pending.insert(address, BackingRecord::tombstone());
    }

    /// Queues a batch of updates produced by a condensation.
    pub fn stage(&mut self, updates: BackingUpdates) {
        self.pending.extend(updates);
    }

    pub fn pending(&self) -> &BackingUpdates {
        &self.pending
    }

    /// Merges `updates` into the pending cache and writes the whole cache to
    /// the trie in one atomic mutation, returning the new root.
    pub fn commit(&mut self, updates: BackingUpdates) -> Result<H256, BackingError> {
        self.stage(updates);
        let changes = self
            .pending
            .iter()
            .map(|(address, record)| {
                let value = record.alive.then(|| rlp::encode(record).to_vec());
                (address.trie_key(), value)
            })
            .collect::<Vec<_>>();

        let root = self.trie.apply(changes)?;
        debug!(
            "committed {} backing record changes, root {:x}",
            self.pending.len(),
            root
        );
        self.pending.clear();
        Ok(root)
    }

    /// Root of the committed trie. Pending changes are not reflected.
    pub fn root(&self) -> H256 {
        self.trie.root()
    }

    /// Re-points the ledger at an earlier committed root, dropping anything
    /// pending.
    pub fn set_root(&mut self, root: H256) -> Result<(), BackingError> {
        self.trie.set_root(root)?;
        self.pending.clear();
        Ok(())
    }

    pub(crate) fn restore(&mut self, root: H256, pending: BackingUpdates) -> Result<(), BackingError> {
        self.set_root(root)?;
        self.pending = pending;
        Ok(())
    }

    /// Every committed record.
    pub fn committed_records(&self) -> Result<Vec<BackingRecord>, BackingError> {
        self.trie
            .values()
            .map(|raw| {
                rlp::decode(&raw).map_err(|source| BackingError::Decode {
                    address: UniversalAddress::unknown(),
                    source,
                })
            })
            .collect()
    }
}
