//! Ledger transaction types and their wire encoding.
//!
//! Inputs are `(32-byte txid, 4-byte little-endian output index)` followed by
//! a length-prefixed script-sig and a sequence number; outputs are
//! `(8-byte little-endian amount, length-prefixed locking script)`. Length
//! prefixes use the ledger's compact integer encoding.

use ethereum_types::H256;
use serde::{Deserialize, Serialize};
use utxo_bridge_common::sha256d;

use crate::script::Script;

/// Reference to an output of an earlier transaction.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct OutPoint {
    pub txid: H256,
    pub vout: u32,
}

impl OutPoint {
    pub const fn new(txid: H256, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// The outpoint coinbase inputs reference.
    pub fn null() -> Self {
        Self::new(H256::zero(), u32::MAX)
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.vout == u32::MAX
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.txid.as_bytes());
        buf.extend_from_slice(&self.vout.to_le_bytes());
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
}

impl TxIn {
    /// Final sequence number.
    pub const SEQUENCE_FINAL: u32 = u32::MAX;

    /// An input of a condensing transaction, unlocked by `OP_SPEND`.
    pub fn spend(prevout: OutPoint) -> Self {
        Self {
            prevout,
            script_sig: Script::spend(),
            sequence: Self::SEQUENCE_FINAL,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Script,
}

impl TxOut {
    pub fn new(value: u64, script_pubkey: Script) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    /// The zero-value, empty-script marker that opens a coinstake.
    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Serializes the transaction in wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + self.inputs.len() * 41 + self.outputs.len() * 34);
        buf.extend_from_slice(&self.version.to_le_bytes());

        write_compact_size(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.prevout.encode_into(&mut buf);
            write_script(&mut buf, &input.script_sig);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_compact_size(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_script(&mut buf, &output.script_pubkey);
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    /// Double-SHA256 of the wire encoding.
    pub fn txid(&self) -> H256 {
        sha256d(&self.encode())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// A proof-of-stake reward transaction: real inputs, at least two
    /// outputs, the first of which is empty.
    pub fn is_coinstake(&self) -> bool {
        !self.inputs.is_empty()
            && !self.inputs[0].prevout.is_null()
            && self.outputs.len() >= 2
            && self.outputs[0].is_empty()
    }

    /// Sum of all output values, or `None` on overflow.
    pub fn value_out(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }
}

/// A block as far as contract execution needs to see it.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Block {
    pub time: u32,
    pub bits: u32,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions
            .get(1)
            .is_some_and(Transaction::is_coinstake)
    }

    /// The output that pays the block's creator: the second output of the
    /// coinstake for proof-of-stake blocks, otherwise the first coinbase
    /// output.
    pub fn creator_output(&self) -> Option<&TxOut> {
        if self.is_proof_of_stake() {
            self.transactions.get(1)?.outputs.get(1)
        } else {
            self.transactions.first()?.outputs.first()
        }
    }
}

fn write_script(buf: &mut Vec<u8>, script: &Script) {
    write_compact_size(buf, script.len() as u64);
    buf.extend_from_slice(script.as_bytes());
}

/// The ledger's variable-length integer prefix.
pub(crate) fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}
