//! Decoding contract invocations out of ledger outputs.
//!
//! A contract output is a sequence of pushes followed by `OP_CREATE` or
//! `OP_CALL`:
//!
//! ```text
//! <version> <gas limit> <gas price> <payload> OP_CREATE
//! <version> <gas limit> <gas price> <payload> <contract address> OP_CALL
//! ```
//!
//! Every malformed output must be rejected identically on every node, so each
//! rejection is its own [`ParseError`] variant and nothing is ever partially
//! decoded.

use std::{collections::HashMap, fmt};

use ethereum_types::H256;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    address::{AddressVersion, UniversalAddress},
    script::{
        opcodes::{OP_CALL, OP_CREATE},
        Script, ScriptError,
    },
    transaction::{OutPoint, Transaction, TxOut},
    version_vm::VersionVm,
};

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ParseError {
    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("transaction has no output {0}")]
    MissingOutput(u32),

    /// The output does not end in a contract opcode.
    #[error("output is not a contract invocation")]
    NotContract,

    #[error("contract output needs {required} stack elements, found {found}")]
    StackUnderflow { required: usize, found: usize },

    #[error("contract output carries no payload")]
    EmptyPayload,

    #[error("version header is {0} bytes, at most 4 allowed")]
    VersionTooLong(usize),

    #[error("numeric field is {0} bytes, at most 8 allowed")]
    NumberTooLong(usize),

    /// Gas price or gas limit does not fit a signed 64-bit integer.
    #[error("gas price {gas_price} or gas limit {gas_limit} out of range")]
    GasOutOfRange { gas_price: u64, gas_limit: u64 },

    /// `gas_price * gas_limit` does not fit a signed 64-bit integer.
    #[error("gas price {gas_price} times gas limit {gas_limit} overflows")]
    GasOverflow { gas_price: u64, gas_limit: u64 },

    /// The version header names a root VM that cannot execute calls.
    #[error("root VM {0} cannot execute contract calls")]
    UnknownRootVm(u8),
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum CallKind {
    Create,
    Call,
}

/// The fields of a contract output, as decoded from its script alone.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DecodedCall {
    pub kind: CallKind,
    pub version: VersionVm,
    pub gas_limit: u64,
    pub gas_price: u64,
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    /// Address pushed by an `OP_CALL` output. `None` for `OP_CREATE`.
    pub target: Option<UniversalAddress>,
}

/// A fully resolved contract invocation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ContractCall {
    pub kind: CallKind,
    pub version: VersionVm,
    pub gas_price: u64,
    pub gas_limit: u64,
    /// The called contract, or the address a `Create` brings into existence.
    pub target: UniversalAddress,
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    /// Value carried by the contract output.
    pub value: u64,
    /// Spender of the enclosing transaction's first input.
    pub sender: UniversalAddress,
    /// The contract output itself.
    pub outpoint: OutPoint,
}

/// Reads a little-endian unsigned number of at most 8 bytes.
fn read_u64(bytes: &[u8]) -> Result<u64, ParseError> {
    if bytes.len() > 8 {
        return Err(ParseError::NumberTooLong(bytes.len()));
    }
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

fn read_version(bytes: &[u8]) -> Result<VersionVm, ParseError> {
    if bytes.len() > 4 {
        return Err(ParseError::VersionTooLong(bytes.len()));
    }
    let mut buf = [0u8; 4];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(VersionVm::from_le_bytes(buf))
}

/// Decodes the script of a contract output.
pub fn decode_call_script(script: &Script) -> Result<DecodedCall, ParseError> {
    let mut stack = script.eval_byte_code()?;

    let kind = match stack.pop().as_deref().and_then(<[u8]>::first) {
        Some(&OP_CREATE) => CallKind::Create,
        Some(&OP_CALL) => CallKind::Call,
        _ => return Err(ParseError::NotContract),
    };

    let required = match kind {
        CallKind::Create => 4,
        CallKind::Call => 5,
    };
    if stack.len() < required {
        return Err(ParseError::StackUnderflow {
            required,
            found: stack.len(),
        });
    }
    let top = stack.split_off(stack.len() - required);
    let [version, gas_limit, gas_price, payload, rest @ ..] = top.as_slice() else {
        return Err(ParseError::StackUnderflow {
            required,
            found: top.len(),
        });
    };

    if payload.is_empty() {
        return Err(ParseError::EmptyPayload);
    }
    let gas_price = read_u64(gas_price)?;
    let gas_limit = read_u64(gas_limit)?;
    let version = read_version(version)?;

    let signed_max = i64::MAX as u64;
    if gas_price > signed_max || gas_limit > signed_max {
        return Err(ParseError::GasOutOfRange {
            gas_price,
            gas_limit,
        });
    }
    if gas_price != 0 && gas_limit > signed_max / gas_price {
        return Err(ParseError::GasOverflow {
            gas_price,
            gas_limit,
        });
    }

    let address_version = version
        .root()
        .and_then(|root| root.contract_address_version())
        .ok_or(ParseError::UnknownRootVm(version.root_vm()))?;

    let target = match rest {
        [] => None,
        // Any length is accepted; the bytes are the account as pushed.
        [address, ..] => Some(UniversalAddress::new(address_version, address.clone())),
    };

    Ok(DecodedCall {
        kind,
        version,
        gas_limit,
        gas_price,
        payload: payload.clone(),
        target,
    })
}

/// Unspent outputs the current chain state knows about.
pub trait UtxoView {
    fn output(&self, outpoint: &OutPoint) -> Option<TxOut>;
}

impl UtxoView for HashMap<OutPoint, TxOut> {
    fn output(&self, outpoint: &OutPoint) -> Option<TxOut> {
        self.get(outpoint).cloned()
    }
}

/// Historical transaction lookup.
#[cfg_attr(test, mockall::automock)]
pub trait TransactionIndex {
    /// The transaction with `txid` and the hash of the block containing it.
    fn transaction(&self, txid: &H256) -> Option<(Transaction, H256)>;
}

impl TransactionIndex for HashMap<H256, (Transaction, H256)> {
    fn transaction(&self, txid: &H256) -> Option<(Transaction, H256)> {
        self.get(txid).cloned()
    }
}

/// Where the spender of a transaction's first input is looked up, in
/// priority order.
#[derive(Clone, Copy, Default)]
pub struct SenderSources<'a> {
    /// Transactions of the block being connected.
    pub block: &'a [Transaction],
    pub utxos: Option<&'a dyn UtxoView>,
    pub history: Option<&'a dyn TransactionIndex>,
}

impl fmt::Debug for SenderSources<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderSources")
            .field("block", &self.block.len())
            .field("utxos", &self.utxos.is_some())
            .field("history", &self.history.is_some())
            .finish()
    }
}

impl<'a> SenderSources<'a> {
    pub fn with_block(mut self, block: &'a [Transaction]) -> Self {
        self.block = block;
        self
    }

    pub fn with_utxos(mut self, utxos: &'a dyn UtxoView) -> Self {
        self.utxos = Some(utxos);
        self
    }

    pub fn with_history(mut self, history: &'a dyn TransactionIndex) -> Self {
        self.history = Some(history);
        self
    }

    fn find(&self, prevout: &OutPoint) -> Option<TxOut> {
        let from_block = || {
            self.block
                .iter()
                .find(|tx| tx.txid() == prevout.txid)
                .and_then(|tx| tx.outputs.get(prevout.vout as usize).cloned())
        };
        let from_utxos = || self.utxos.and_then(|u| u.output(prevout));
        let from_history = || {
            self.history
                .and_then(|h| h.transaction(&prevout.txid))
                .and_then(|(tx, _)| tx.outputs.get(prevout.vout as usize).cloned())
        };
        from_block().or_else(from_utxos).or_else(from_history)
    }
}

/// Parses one output of a transaction into a [`ContractCall`].
#[derive(Debug)]
pub struct ContractOutputParser<'a> {
    tx: &'a Transaction,
    vout: u32,
    sources: SenderSources<'a>,
}

impl<'a> ContractOutputParser<'a> {
    pub fn new(tx: &'a Transaction, vout: u32, sources: SenderSources<'a>) -> Self {
        Self { tx, vout, sources }
    }

    pub fn parse(&self) -> Result<ContractCall, ParseError> {
        let output = self
            .tx
            .outputs
            .get(self.vout as usize)
            .ok_or(ParseError::MissingOutput(self.vout))?;

        let decoded = decode_call_script(&output.script_pubkey).map_err(|e| {
            debug!("rejecting output {} as a contract call: {e}", self.vout);
            e
        })?;

        let txid = self.tx.txid();
        let target = match decoded.target {
            Some(target) => target,
            None => {
                // `decode_call_script` only accepts executable root VMs.
                let version = decoded
                    .version
                    .root()
                    .and_then(|r| r.contract_address_version())
                    .unwrap_or(AddressVersion::Evm);
                UniversalAddress::from_output(version, &txid, self.vout)
            }
        };

        Ok(ContractCall {
            kind: decoded.kind,
            version: decoded.version,
            gas_price: decoded.gas_price,
            gas_limit: decoded.gas_limit,
            target,
            payload: decoded.payload,
            value: output.value,
            sender: self.sender_address(),
            outpoint: OutPoint::new(txid, self.vout),
        })
    }

    /// The key-hash owner of the output spent by input 0, or
    /// [`UniversalAddress::unknown`] if it cannot be determined.
    pub fn sender_address(&self) -> UniversalAddress {
        let Some(input) = self.tx.inputs.first() else {
            return UniversalAddress::unknown();
        };
        match self.sources.find(&input.prevout) {
            Some(spent) => UniversalAddress::from_script(&spent.script_pubkey),
            None => {
                warn!(
                    "could not resolve the output {:x}:{} spent by the contract transaction",
                    input.prevout.txid, input.prevout.vout
                );
                UniversalAddress::unknown()
            }
        }
    }
}
