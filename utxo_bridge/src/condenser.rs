//! The condensing transaction: turns the value transfers produced by
//! contract execution back into a single ledger transaction.
//!
//! For every address a batch touches, the condenser nets its credits and
//! debits, adds the value of the output currently backing it and ends up with
//! a resulting balance. Every consumed backing output becomes an input, every
//! nonzero balance becomes an output, and the backing ledger learns which of
//! the new outputs now backs which account.
//!
//! Everything is ordered by [`UniversalAddress`]'s `Ord`, so every node
//! builds the same transaction byte for byte from the same batch.

use std::collections::{BTreeMap, BTreeSet};

use enum_as_inner::EnumAsInner;
use ethereum_types::{H256, U256};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utxo_bridge_common::MAX_AMOUNT;

use crate::{
    address::UniversalAddress,
    backing::{BackingError, BackingRecord, BackingUpdates, BackingView},
    config::BridgeConfig,
    transaction::{OutPoint, Transaction, TxIn, TxOut},
};

/// A value transfer reported by an execution engine.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Transfer {
    pub from: UniversalAddress,
    pub to: UniversalAddress,
    pub value: u64,
}

impl Transfer {
    pub fn new(from: UniversalAddress, to: UniversalAddress, value: u64) -> Self {
        Self { from, to, value }
    }
}

/// The output carrying a contract call's value, spendable by the caller.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SenderVin {
    pub address: UniversalAddress,
    pub outpoint: OutPoint,
    pub value: u64,
}

impl SenderVin {
    fn record(&self) -> BackingRecord {
        BackingRecord::new(self.outpoint.txid, self.outpoint.vout, self.value.into())
    }
}

#[derive(Debug, Error)]
pub enum CondenseError {
    /// An address would end up owing value.
    #[error("{address} would end with a negative balance ({available} available, {spent} spent)")]
    NegativeBalance {
        address: UniversalAddress,
        available: U256,
        spent: U256,
    },

    /// A balance exceeds what one ledger output may carry.
    #[error("{address} would end with {balance}, beyond the largest ledger amount")]
    AmountOutOfRange {
        address: UniversalAddress,
        balance: U256,
    },

    /// A deleted account still holds value nobody redirected.
    #[error("deleted account {address} still holds {balance}")]
    OrphanedValue {
        address: UniversalAddress,
        balance: u64,
    },

    /// Value would be sent to an address no output script can pay.
    #[error("no output can pay {0}")]
    UnspendableRecipient(UniversalAddress),

    #[error("inputs carry {inputs} but outputs carry {outputs}")]
    ValueNotConserved { inputs: U256, outputs: U256 },

    #[error(transparent)]
    Ledger(#[from] BackingError),
}

/// A successful condensation.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CondensedTransaction {
    /// `None` when the batch moves no value.
    pub transaction: Option<Transaction>,
    /// Output index assigned to each address that receives an output.
    pub vout_numbers: BTreeMap<UniversalAddress, u32>,
    /// Backing records consumed as inputs.
    pub spent: BackingUpdates,
    /// Records to commit to the backing ledger.
    pub updates: BackingUpdates,
}

impl CondensedTransaction {
    pub fn txid(&self) -> Option<H256> {
        self.transaction.as_ref().map(Transaction::txid)
    }
}

/// Result of running the condenser.
#[derive(Clone, Debug, EnumAsInner, Eq, PartialEq)]
pub enum Condensation {
    Condensed(CondensedTransaction),
    /// More outputs were needed than a condensing transaction may carry. No
    /// transaction was built.
    VoutOverflow { required: usize, limit: usize },
}

impl Condensation {
    pub fn reached_vout_limit(&self) -> bool {
        matches!(self, Condensation::VoutOverflow { .. })
    }
}

/// Credits and debits of one address.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Flow {
    pub(crate) credit: U256,
    pub(crate) debit: U256,
}

/// Nets a batch of transfers per address. Duplicates are summed and an
/// address that both sends and receives keeps a single entry.
pub(crate) fn net_flows<'a, I>(transfers: I) -> BTreeMap<UniversalAddress, Flow>
where
    I: IntoIterator<Item = &'a Transfer>,
{
    let mut flows = BTreeMap::<UniversalAddress, Flow>::new();
    for t in transfers {
        let value = U256::from(t.value);
        flows.entry(t.from.clone()).or_default().debit += value;
        flows.entry(t.to.clone()).or_default().credit += value;
    }
    flows
}

/// Resolved position of one address.
#[derive(Clone, Debug)]
pub(crate) struct Settlement {
    pub(crate) address: UniversalAddress,
    /// Backing output consumed as an input.
    pub(crate) prior: Option<BackingRecord>,
    pub(crate) balance: u64,
    /// The address receives no backing-record update.
    pub(crate) skip_update: bool,
}

impl Settlement {
    /// `prior + credit - debit`, range checked.
    pub(crate) fn resolve(
        address: UniversalAddress,
        prior: Option<BackingRecord>,
        flow: Flow,
    ) -> Result<Self, CondenseError> {
        let prior_value = prior.map_or(U256::zero(), |p| p.value);
        // No ledger output can carry more than this, so neither can its record.
        if prior_value > U256::from(MAX_AMOUNT) {
            return Err(CondenseError::AmountOutOfRange {
                address,
                balance: prior_value,
            });
        }
        let Some(available) = prior_value.checked_add(flow.credit) else {
            return Err(CondenseError::AmountOutOfRange {
                address,
                balance: U256::MAX,
            });
        };
        if flow.debit > available {
            return Err(CondenseError::NegativeBalance {
                address,
                available,
                spent: flow.debit,
            });
        }
        let balance = available - flow.debit;
        if balance > U256::from(MAX_AMOUNT) {
            return Err(CondenseError::AmountOutOfRange { address, balance });
        }
        trace!("{address}: prior {prior:?}, {flow:?}, balance {balance}");
        Ok(Self {
            address,
            prior,
            balance: balance.as_u64(),
            skip_update: false,
        })
    }
}

/// Builds the condensing transaction for settlements already in canonical
/// order.
pub(crate) fn assemble(
    settlements: &[Settlement],
    max_vouts: usize,
    tx_version: i32,
) -> Result<Condensation, CondenseError> {
    let required = settlements.iter().filter(|s| s.balance > 0).count();
    if required > max_vouts {
        debug!("condensation needs {required} outputs, limit is {max_vouts}");
        return Ok(Condensation::VoutOverflow {
            required,
            limit: max_vouts,
        });
    }

    let mut tx = Transaction {
        version: tx_version,
        ..Default::default()
    };
    let mut vout_numbers = BTreeMap::new();
    let mut spent = BackingUpdates::new();
    let mut inputs_value = U256::zero();
    let mut outputs_value = U256::zero();

    for s in settlements {
        if let Some(prior) = s.prior.filter(BackingRecord::is_spendable) {
            tx.inputs.push(TxIn::spend(prior.outpoint()));
            spent.insert(s.address.clone(), prior);
            inputs_value += prior.value;
        }
        if s.balance > 0 {
            let script = s
                .address
                .locking_script()
                .ok_or_else(|| CondenseError::UnspendableRecipient(s.address.clone()))?;
            vout_numbers.insert(s.address.clone(), tx.outputs.len() as u32);
            tx.outputs.push(TxOut::new(s.balance, script));
            outputs_value += U256::from(s.balance);
        }
    }

    if inputs_value != outputs_value {
        return Err(CondenseError::ValueNotConserved {
            inputs: inputs_value,
            outputs: outputs_value,
        });
    }

    let transaction = (!tx.inputs.is_empty()).then_some(tx);
    let txid = transaction.as_ref().map(Transaction::txid);

    let mut updates = BackingUpdates::new();
    for s in settlements.iter().filter(|s| !s.skip_update) {
        let record = match (txid, vout_numbers.get(&s.address)) {
            (Some(txid), Some(&vout)) => BackingRecord::new(txid, vout, s.balance.into()),
            _ => BackingRecord::tombstone(),
        };
        updates.insert(s.address.clone(), record);
    }

    if let Some(tx) = &transaction {
        debug!(
            "condensed {} inputs into {} outputs, txid {:x}",
            tx.inputs.len(),
            tx.outputs.len(),
            tx.txid()
        );
    }

    Ok(Condensation::Condensed(CondensedTransaction {
        transaction,
        vout_numbers,
        spent,
        updates,
    }))
}

/// Builder for one condensation over a borrowed view of the backing ledger.
///
/// ```ignore
/// let result = CondensingTx::new(&ledger, &transfers, &config)
///     .with_sender(sender_vin)
///     .with_deleted(deleted)
///     .condense()?;
/// ```
#[derive(Debug)]
pub struct CondensingTx<'a, L> {
    ledger: &'a L,
    transfers: &'a [Transfer],
    sender: Option<SenderVin>,
    deleted: BTreeSet<UniversalAddress>,
    max_vouts: usize,
    tx_version: i32,
}

impl<'a, L: BackingView> CondensingTx<'a, L> {
    pub fn new(ledger: &'a L, transfers: &'a [Transfer], config: &BridgeConfig) -> Self {
        Self {
            ledger,
            transfers,
            sender: None,
            deleted: BTreeSet::new(),
            max_vouts: config.max_contract_vouts,
            tx_version: config.condensing_tx_version,
        }
    }

    /// The call output the sender's side of the batch is funded from. The
    /// sender's backing record is never updated.
    pub fn with_sender(mut self, sender: SenderVin) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Accounts destroyed during execution.
    pub fn with_deleted<I>(mut self, deleted: I) -> Self
    where
        I: IntoIterator<Item = UniversalAddress>,
    {
        self.deleted.extend(deleted);
        self
    }

    fn prior(&self, address: &UniversalAddress) -> Result<Option<BackingRecord>, CondenseError> {
        match &self.sender {
            Some(sender) if sender.address == *address => Ok(Some(sender.record())),
            _ => Ok(self.ledger.spendable(address)?),
        }
    }

    fn settlements(&self) -> Result<Vec<Settlement>, CondenseError> {
        let mut flows = net_flows(self.transfers);
        for address in &self.deleted {
            flows.entry(address.clone()).or_default();
        }
        if let Some(sender) = &self.sender {
            flows.entry(sender.address.clone()).or_default();
        }

        flows
            .into_iter()
            .map(|(address, flow)| {
                let prior = self.prior(&address)?;
                let mut settlement = Settlement::resolve(address, prior, flow)?;
                if self.deleted.contains(&settlement.address) && settlement.balance > 0 {
                    return Err(CondenseError::OrphanedValue {
                        address: settlement.address,
                        balance: settlement.balance,
                    });
                }
                settlement.skip_update = self
                    .sender
                    .as_ref()
                    .is_some_and(|s| s.address == settlement.address);
                Ok(settlement)
            })
            .collect()
    }

    /// Runs the condensation. Nothing is written anywhere: the caller stages
    /// [`CondensedTransaction::updates`] once it accepts the transaction.
    pub fn condense(&self) -> Result<Condensation, CondenseError> {
        let settlements = self.settlements()?;
        assemble(&settlements, self.max_vouts, self.tx_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{address::AddressVersion, script::Script};

    fn pkh(b: u8) -> UniversalAddress {
        UniversalAddress::new(AddressVersion::PubKeyHash, [b; 20])
    }

    fn evm(b: u8) -> UniversalAddress {
        UniversalAddress::new(AddressVersion::Evm, [b; 20])
    }

    fn prior(b: u8, value: u64) -> BackingRecord {
        BackingRecord::new(H256::repeat_byte(b), b as u32, value.into())
    }

    fn ledger(entries: &[(UniversalAddress, BackingRecord)]) -> BackingUpdates {
        entries.iter().cloned().collect()
    }

    fn condensed(c: Condensation) -> CondensedTransaction {
        c.into_condensed().unwrap()
    }

    fn output_of(ct: &CondensedTransaction, address: &UniversalAddress) -> Option<u64> {
        let vout = *ct.vout_numbers.get(address)?;
        Some(ct.transaction.as_ref()?.outputs[vout as usize].value)
    }

    #[test]
    fn remainder_returns_to_the_sending_account() {
        let (a, b, c) = (evm(0xa), evm(0xb), evm(0xc));
        let view = ledger(&[(a.clone(), prior(1, 200))]);
        let transfers = [
            Transfer::new(a.clone(), b.clone(), 100),
            Transfer::new(b.clone(), c.clone(), 40),
            Transfer::new(a.clone(), b.clone(), 20),
        ];

        let ct = condensed(
            CondensingTx::new(&view, &transfers, &BridgeConfig::default())
                .condense()
                .unwrap(),
        );
        let tx = ct.transaction.as_ref().unwrap();

        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.inputs[0].prevout, prior(1, 200).outpoint());
        assert_eq!(tx.inputs[0].script_sig, Script::spend());

        assert_eq!(tx.outputs.len(), 3);
        assert_eq!(output_of(&ct, &a), Some(80));
        assert_eq!(output_of(&ct, &b), Some(80));
        assert_eq!(output_of(&ct, &c), Some(40));
        // Canonical order: a < b < c by bytes.
        assert_eq!(ct.vout_numbers.values().copied().collect::<Vec<_>>(), vec![0, 1, 2]);

        let txid = tx.txid();
        assert_eq!(ct.updates[&c], BackingRecord::new(txid, 2, 40.into()));
        assert_eq!(ct.spent[&a], prior(1, 200));
    }

    #[test]
    fn fully_spent_account_is_tombstoned() {
        let (a, b) = (evm(1), evm(2));
        let view = ledger(&[(a.clone(), prior(1, 50))]);
        let transfers = [Transfer::new(a.clone(), b.clone(), 50)];

        let ct = condensed(
            CondensingTx::new(&view, &transfers, &BridgeConfig::default())
                .condense()
                .unwrap(),
        );
        assert_eq!(ct.transaction.as_ref().unwrap().outputs.len(), 1);
        assert_eq!(ct.vout_numbers.get(&a), None);
        assert_eq!(ct.updates[&a], BackingRecord::tombstone());
        assert!(ct.updates[&b].alive);
    }

    #[test]
    fn deleted_account_without_prior_record() {
        let d = evm(0xd);
        let view = BackingUpdates::new();
        let ct = condensed(
            CondensingTx::new(&view, &[], &BridgeConfig::default())
                .with_deleted([d.clone()])
                .condense()
                .unwrap(),
        );
        assert_eq!(ct.transaction, None);
        assert_eq!(ct.updates[&d], BackingRecord::tombstone());
        assert!(ct.spent.is_empty());
    }

    #[test]
    fn deleted_account_must_have_redirected_its_value() {
        let (d, heir) = (evm(0xd), evm(0xe));
        let view = ledger(&[(d.clone(), prior(4, 30))]);

        let err = CondensingTx::new(&view, &[], &BridgeConfig::default())
            .with_deleted([d.clone()])
            .condense()
            .unwrap_err();
        assert!(matches!(err, CondenseError::OrphanedValue { balance: 30, .. }));

        let transfers = [Transfer::new(d.clone(), heir.clone(), 30)];
        let ct = condensed(
            CondensingTx::new(&view, &transfers, &BridgeConfig::default())
                .with_deleted([d.clone()])
                .condense()
                .unwrap(),
        );
        assert_eq!(ct.spent[&d], prior(4, 30));
        assert_eq!(ct.updates[&d], BackingRecord::tombstone());
        assert_eq!(output_of(&ct, &heir), Some(30));
    }

    #[test]
    fn overflow_is_reported_not_truncated() {
        let sender = pkh(0xff);
        let recipients: Vec<_> = (0..2001u32)
            .map(|i| {
                let mut data = [0u8; 20];
                data[..4].copy_from_slice(&i.to_be_bytes());
                UniversalAddress::new(AddressVersion::Evm, data)
            })
            .collect();
        let transfers: Vec<_> = recipients
            .iter()
            .map(|r| Transfer::new(sender.clone(), r.clone(), 1))
            .collect();
        let config = BridgeConfig {
            max_contract_vouts: 2000,
            ..Default::default()
        };
        let sender_vin = SenderVin {
            address: sender,
            outpoint: OutPoint::new(H256::repeat_byte(9), 0),
            value: 2001,
        };

        let result = CondensingTx::new(&BackingUpdates::new(), &transfers, &config)
            .with_sender(sender_vin)
            .condense()
            .unwrap();
        assert!(result.reached_vout_limit());
        assert_eq!(
            result,
            Condensation::VoutOverflow {
                required: 2001,
                limit: 2000
            }
        );
    }

    #[test]
    fn spending_more_than_owned_is_rejected() {
        let (a, b) = (evm(1), evm(2));
        let view = ledger(&[(a.clone(), prior(1, 10))]);
        let transfers = [Transfer::new(a.clone(), b, 11)];
        let err = CondensingTx::new(&view, &transfers, &BridgeConfig::default())
            .condense()
            .unwrap_err();
        assert!(matches!(err, CondenseError::NegativeBalance { address, .. } if address == a));
    }

    #[test]
    fn balances_beyond_the_ledger_amount_range_are_rejected() {
        let (a, b) = (evm(1), evm(2));
        let view = ledger(&[
            (a.clone(), prior(1, MAX_AMOUNT)),
            (b.clone(), prior(2, 1)),
        ]);
        let transfers = [Transfer::new(b, a, 1)];
        let err = CondensingTx::new(&view, &transfers, &BridgeConfig::default())
            .condense()
            .unwrap_err();
        assert!(matches!(err, CondenseError::AmountOutOfRange { .. }));
    }

    #[test]
    fn oversized_backing_records_are_rejected_not_summed() {
        let (a, b) = (evm(1), evm(2));
        let huge = BackingRecord::new(H256::repeat_byte(1), 0, U256::MAX);
        let view = ledger(&[(a.clone(), huge), (b.clone(), prior(2, 5))]);
        let transfers = [Transfer::new(b.clone(), a.clone(), 1)];
        let err = CondensingTx::new(&view, &transfers, &BridgeConfig::default())
            .condense()
            .unwrap_err();
        assert!(matches!(
            err,
            CondenseError::AmountOutOfRange { address, balance }
                if address == a && balance == U256::MAX
        ));

        let just_over = BackingRecord::new(H256::repeat_byte(1), 0, U256::from(MAX_AMOUNT) + 1);
        let view = ledger(&[(a.clone(), just_over)]);
        let transfers = [Transfer::new(a.clone(), b, 1)];
        let err = CondensingTx::new(&view, &transfers, &BridgeConfig::default())
            .condense()
            .unwrap_err();
        assert!(matches!(err, CondenseError::AmountOutOfRange { address, .. } if address == a));
    }

    #[test]
    fn duplicate_transfers_are_summed() {
        let (a, b) = (evm(1), evm(2));
        let view = ledger(&[(a.clone(), prior(1, 100))]);
        let transfers = [
            Transfer::new(a.clone(), b.clone(), 10),
            Transfer::new(a.clone(), b.clone(), 10),
            Transfer::new(b.clone(), b.clone(), 5),
        ];
        let ct = condensed(
            CondensingTx::new(&view, &transfers, &BridgeConfig::default())
                .condense()
                .unwrap(),
        );
        let tx = ct.transaction.unwrap();
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(ct.vout_numbers.len(), 2);
        assert_eq!(tx.outputs[ct.vout_numbers[&b] as usize].value, 20);
    }

    #[test]
    fn sender_funds_the_batch_and_gets_no_update() {
        let sender = pkh(7);
        let contract = evm(8);
        let vin = SenderVin {
            address: sender.clone(),
            outpoint: OutPoint::new(H256::repeat_byte(3), 1),
            value: 100,
        };
        let transfers = [Transfer::new(sender.clone(), contract.clone(), 60)];

        let ct = condensed(
            CondensingTx::new(&BackingUpdates::new(), &transfers, &BridgeConfig::default())
                .with_sender(vin.clone())
                .condense()
                .unwrap(),
        );
        let tx = ct.transaction.as_ref().unwrap();
        assert_eq!(tx.inputs[0].prevout, vin.outpoint);
        assert_eq!(output_of(&ct, &sender), Some(40));
        assert_eq!(
            tx.outputs[ct.vout_numbers[&sender] as usize].script_pubkey,
            Script::p2pkh(&[7; 20])
        );
        assert_eq!(
            tx.outputs[ct.vout_numbers[&contract] as usize].script_pubkey,
            Script::no_exec_call(&[8; 20])
        );
        assert!(!ct.updates.contains_key(&sender));
        assert!(ct.updates[&contract].alive);
    }

    #[test]
    fn unknown_recipients_are_rejected() {
        let a = evm(1);
        let view = ledger(&[(a.clone(), prior(1, 5))]);
        let transfers = [Transfer::new(a, UniversalAddress::unknown(), 5)];
        let err = CondensingTx::new(&view, &transfers, &BridgeConfig::default())
            .condense()
            .unwrap_err();
        assert!(matches!(err, CondenseError::UnspendableRecipient(addr) if addr.is_unknown()));
    }

    #[test]
    fn identical_batches_condense_identically() {
        let view = ledger(&[(evm(1), prior(1, 1_000)), (evm(9), prior(9, 7))]);
        let transfers: Vec<_> = (2..40u8)
            .map(|b| Transfer::new(evm(1), evm(b), b as u64))
            .chain([Transfer::new(evm(9), evm(3), 7)])
            .collect();
        let mut shuffled = transfers.clone();
        shuffled.reverse();

        let run = |t: &[Transfer]| {
            let ct = condensed(
                CondensingTx::new(&view, t, &BridgeConfig::default())
                    .condense()
                    .unwrap(),
            );
            ct.transaction.unwrap().encode()
        };
        assert_eq!(run(&transfers), run(&transfers));
        assert_eq!(run(&transfers), run(&shuffled));
    }

    #[test]
    fn empty_batch_moves_nothing() {
        let result = CondensingTx::new(&BackingUpdates::new(), &[], &BridgeConfig::default())
            .condense()
            .unwrap();
        assert_eq!(result, Condensation::Condensed(CondensedTransaction::default()));
    }
}
