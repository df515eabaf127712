//! Ledger scripts: push-data parsing, the restricted byte-code interpreter
//! used to read contract outputs, and the handful of standard script shapes
//! the bridge has to build or recognise.

use std::fmt::{self, Debug};

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version_vm::VersionVm;

/// Opcode values the bridge cares about.
pub mod opcodes {
    /// Push an empty byte vector.
    pub const OP_0: u8 = 0x00;
    /// Largest opcode that is itself a push length.
    pub const OP_PUSHBYTES_75: u8 = 0x4b;
    /// Next byte is the push length.
    pub const OP_PUSHDATA1: u8 = 0x4c;
    /// Next 2 bytes (little-endian) are the push length.
    pub const OP_PUSHDATA2: u8 = 0x4d;
    /// Next 4 bytes (little-endian) are the push length.
    pub const OP_PUSHDATA4: u8 = 0x4e;
    /// Push the script number `-1`.
    pub const OP_1NEGATE: u8 = 0x4f;
    /// Push the script number `1`.
    pub const OP_1: u8 = 0x51;
    /// Push the script number `16`.
    pub const OP_16: u8 = 0x60;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_CHECKSIG: u8 = 0xac;
    /// Deploy a contract.
    pub const OP_CREATE: u8 = 0xc1;
    /// Call an existing contract.
    pub const OP_CALL: u8 = 0xc2;
    /// Spend a contract-owned output. Only valid in condensing transactions.
    pub const OP_SPEND: u8 = 0xc3;
}

use opcodes::*;

/// Failure to read a script.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ScriptError {
    /// A push ran past the end of the script.
    #[error("push at offset {offset} wants {wanted} bytes but only {available} remain")]
    TruncatedPush {
        /// Offset of the push opcode.
        offset: usize,
        /// Declared push length.
        wanted: usize,
        /// Bytes left after the length prefix.
        available: usize,
    },

    /// A length prefix was itself cut short.
    #[error("length prefix of push at offset {0} is truncated")]
    TruncatedLength(usize),

    /// Something other than a push or a contract opcode appeared while
    /// evaluating in byte-code mode.
    #[error("opcode {opcode:#04x} at offset {offset} is not allowed in byte-code mode")]
    DisallowedOpcode {
        /// The offending opcode.
        opcode: u8,
        /// Its offset in the script.
        offset: usize,
    },
}

/// A single parsed element of a script.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Instruction<'a> {
    /// Push data, including the empty push of `OP_0`.
    Push(&'a [u8]),
    /// Any non-push opcode.
    Op(u8),
}

/// Iterator over the instructions of a script, yielding each with its offset.
#[derive(Clone, Debug)]
pub struct Instructions<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Instructions<'a> {
    fn take(&mut self, n: usize, offset: usize, wanted: usize) -> Result<&'a [u8], ScriptError> {
        let available = self.bytes.len() - self.pos;
        if n > available {
            return Err(ScriptError::TruncatedPush {
                offset,
                wanted,
                available,
            });
        }
        let data = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(data)
    }

    fn read_len<const N: usize>(&mut self, offset: usize) -> Result<usize, ScriptError> {
        if self.bytes.len() - self.pos < N {
            return Err(ScriptError::TruncatedLength(offset));
        }
        let mut buf = [0u8; 8];
        buf[..N].copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        Ok(u64::from_le_bytes(buf) as usize)
    }

    fn next_instruction(&mut self) -> Result<(usize, Instruction<'a>), ScriptError> {
        let offset = self.pos;
        let opcode = self.bytes[offset];
        self.pos += 1;

        let len = match opcode {
            OP_0 => return Ok((offset, Instruction::Push(&[]))),
            1..=OP_PUSHBYTES_75 => opcode as usize,
            OP_PUSHDATA1 => self.read_len::<1>(offset)?,
            OP_PUSHDATA2 => self.read_len::<2>(offset)?,
            OP_PUSHDATA4 => self.read_len::<4>(offset)?,
            _ => return Ok((offset, Instruction::Op(opcode))),
        };
        let data = self.take(len, offset, len)?;
        Ok((offset, Instruction::Push(data)))
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<(usize, Instruction<'a>), ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let res = self.next_instruction();
        if res.is_err() {
            // Nothing after a malformed push can be trusted.
            self.pos = self.bytes.len();
        }
        Some(res)
    }
}

/// Standard script shapes.
#[derive(Clone, Debug, EnumAsInner, Eq, PartialEq)]
pub enum ScriptKind {
    /// `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`
    PubKeyHash([u8; 20]),
    /// `<33 or 65 byte key> OP_CHECKSIG`
    PubKey(Vec<u8>),
    /// `OP_HASH160 <20> OP_EQUAL`
    ScriptHash([u8; 20]),
    /// Ends in `OP_CREATE`.
    Create,
    /// Ends in `OP_CALL`.
    Call,
    /// A lone `OP_SPEND`.
    Spend,
    /// Anything else.
    NonStandard,
}

/// A raw script.
#[derive(Clone, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Script(#[serde(with = "hex::serde")] Vec<u8>);

impl Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({})", hex::encode(&self.0))
    }
}

impl From<Vec<u8>> for Script {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Script {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Script {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends a bare opcode.
    pub fn push_opcode(mut self, opcode: u8) -> Self {
        self.0.push(opcode);
        self
    }

    /// Appends `data` with the shortest length prefix that fits. An empty
    /// slice becomes `OP_0`.
    pub fn push_slice(mut self, data: &[u8]) -> Self {
        match data.len() {
            0 => self.0.push(OP_0),
            n @ 1..=0x4b => self.0.push(n as u8),
            n @ 0x4c..=0xff => {
                self.0.push(OP_PUSHDATA1);
                self.0.push(n as u8);
            }
            n @ 0x100..=0xffff => {
                self.0.push(OP_PUSHDATA2);
                self.0.extend_from_slice(&(n as u16).to_le_bytes());
            }
            n => {
                self.0.push(OP_PUSHDATA4);
                self.0.extend_from_slice(&(n as u32).to_le_bytes());
            }
        }
        self.0.extend_from_slice(data);
        self
    }

    /// Appends an unsigned number as its shortest little-endian byte string.
    /// Zero is pushed as a single zero byte so every field stays non-empty.
    pub fn push_uint(self, n: u64) -> Self {
        let bytes = n.to_le_bytes();
        let used = bytes.iter().rposition(|b| *b != 0).map_or(1, |i| i + 1);
        self.push_slice(&bytes[..used])
    }

    /// Pay-to-pubkey-hash.
    pub fn p2pkh(key_hash: &[u8; 20]) -> Self {
        Self::new()
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(key_hash)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
    }

    /// Pay-to-script-hash.
    pub fn p2sh(script_hash: &[u8; 20]) -> Self {
        Self::new()
            .push_opcode(OP_HASH160)
            .push_slice(script_hash)
            .push_opcode(OP_EQUAL)
    }

    /// Contract deployment output.
    pub fn contract_create(version: VersionVm, gas_limit: u64, gas_price: u64, code: &[u8]) -> Self {
        Self::new()
            .push_slice(&version.to_le_bytes())
            .push_uint(gas_limit)
            .push_uint(gas_price)
            .push_slice(code)
            .push_opcode(OP_CREATE)
    }

    /// Contract call output.
    pub fn contract_call(
        version: VersionVm,
        gas_limit: u64,
        gas_price: u64,
        data: &[u8],
        contract: &[u8],
    ) -> Self {
        Self::new()
            .push_slice(&version.to_le_bytes())
            .push_uint(gas_limit)
            .push_uint(gas_price)
            .push_slice(data)
            .push_slice(contract)
            .push_opcode(OP_CALL)
    }

    /// The output a condensing transaction pays to a contract account: a call
    /// that nothing will execute.
    pub fn no_exec_call(contract: &[u8]) -> Self {
        Self::new()
            .push_slice(&[0])
            .push_slice(&[0])
            .push_slice(&[0])
            .push_slice(&[0])
            .push_slice(contract)
            .push_opcode(OP_CALL)
    }

    /// Script-sig of every condensing transaction input.
    pub fn spend() -> Self {
        Self::new().push_opcode(OP_SPEND)
    }

    pub fn instructions(&self) -> Instructions<'_> {
        Instructions {
            bytes: &self.0,
            pos: 0,
        }
    }

    pub fn kind(&self) -> ScriptKind {
        let b = &self.0;
        if b.len() == 25
            && b[0] == OP_DUP
            && b[1] == OP_HASH160
            && b[2] == 20
            && b[23] == OP_EQUALVERIFY
            && b[24] == OP_CHECKSIG
        {
            return ScriptKind::PubKeyHash(b[3..23].try_into().unwrap_or_default());
        }
        if b.len() == 23 && b[0] == OP_HASH160 && b[1] == 20 && b[22] == OP_EQUAL {
            return ScriptKind::ScriptHash(b[2..22].try_into().unwrap_or_default());
        }
        if (b.len() == 35 || b.len() == 67)
            && b[0] as usize == b.len() - 2
            && b[b.len() - 1] == OP_CHECKSIG
        {
            return ScriptKind::PubKey(b[1..b.len() - 1].to_vec());
        }
        if b.as_slice() == [OP_SPEND] {
            return ScriptKind::Spend;
        }

        let mut last = None;
        for ins in self.instructions() {
            match ins {
                Ok((_, ins)) => last = Some(ins),
                Err(_) => return ScriptKind::NonStandard,
            }
        }
        match last {
            Some(Instruction::Op(OP_CREATE)) => ScriptKind::Create,
            Some(Instruction::Op(OP_CALL)) => ScriptKind::Call,
            _ => ScriptKind::NonStandard,
        }
    }

    /// Evaluates the script in byte-code mode.
    ///
    /// Only pushes execute. On reaching `OP_CREATE` or `OP_CALL` the remainder
    /// of the script, starting at that opcode, is pushed as a final element
    /// and evaluation stops. Any other opcode aborts.
    pub fn eval_byte_code(&self) -> Result<Vec<Vec<u8>>, ScriptError> {
        let mut stack = Vec::new();
        for ins in self.instructions() {
            let (offset, ins) = ins?;
            match ins {
                Instruction::Push(data) => stack.push(data.to_vec()),
                Instruction::Op(OP_1NEGATE) => stack.push(vec![0x81]),
                Instruction::Op(op @ OP_1..=OP_16) => stack.push(vec![op - OP_1 + 1]),
                Instruction::Op(OP_CREATE | OP_CALL) => {
                    stack.push(self.0[offset..].to_vec());
                    return Ok(stack);
                }
                Instruction::Op(opcode) => {
                    return Err(ScriptError::DisallowedOpcode { opcode, offset })
                }
            }
        }
        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_prefixes_are_minimal() {
        assert_eq!(Script::new().push_slice(&[]).as_bytes(), [OP_0]);
        assert_eq!(Script::new().push_slice(&[7; 75]).as_bytes()[0], 75);
        assert_eq!(
            Script::new().push_slice(&[7; 76]).as_bytes()[..2],
            [OP_PUSHDATA1, 76]
        );
        assert_eq!(
            Script::new().push_slice(&[7; 256]).as_bytes()[..3],
            [OP_PUSHDATA2, 0, 1]
        );
        assert_eq!(
            Script::new().push_slice(&vec![7; 0x10000]).as_bytes()[..5],
            [OP_PUSHDATA4, 0, 0, 1, 0]
        );
    }

    #[test]
    fn push_uint_is_shortest_le() {
        assert_eq!(Script::new().push_uint(0).as_bytes(), [1, 0]);
        assert_eq!(Script::new().push_uint(0x0102).as_bytes(), [2, 0x02, 0x01]);
        assert_eq!(
            Script::new().push_uint(u64::MAX).as_bytes(),
            [8, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn instructions_walk_every_push_form() {
        let script = Script::from(vec![
            OP_0,
            2, 0xaa, 0xbb,
            OP_PUSHDATA1, 1, 0xcc,
            OP_PUSHDATA2, 1, 0, 0xdd,
            OP_PUSHDATA4, 1, 0, 0, 0, 0xee,
            OP_DUP,
        ]);
        let ins: Vec<_> = script
            .instructions()
            .map(|i| i.map(|(_, ins)| ins))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            ins,
            vec![
                Instruction::Push(&[]),
                Instruction::Push(&[0xaa, 0xbb]),
                Instruction::Push(&[0xcc]),
                Instruction::Push(&[0xdd]),
                Instruction::Push(&[0xee]),
                Instruction::Op(OP_DUP),
            ]
        );
    }

    #[test]
    fn truncated_pushes_are_errors() {
        let script = Script::from(vec![3, 1, 2]);
        assert_eq!(
            script.instructions().next(),
            Some(Err(ScriptError::TruncatedPush {
                offset: 0,
                wanted: 3,
                available: 2
            }))
        );

        let script = Script::from(vec![OP_PUSHDATA2, 1]);
        assert_eq!(
            script.instructions().next(),
            Some(Err(ScriptError::TruncatedLength(0)))
        );
        assert_eq!(script.instructions().count(), 1);
    }

    #[test]
    fn classifies_standard_scripts() {
        let hash = [9u8; 20];
        assert_eq!(Script::p2pkh(&hash).kind(), ScriptKind::PubKeyHash(hash));
        assert_eq!(Script::p2sh(&hash).kind(), ScriptKind::ScriptHash(hash));

        let key = [2u8; 33];
        let p2pk = Script::new().push_slice(&key).push_opcode(OP_CHECKSIG);
        assert_eq!(p2pk.kind(), ScriptKind::PubKey(key.to_vec()));

        assert_eq!(Script::spend().kind(), ScriptKind::Spend);
        assert_eq!(Script::no_exec_call(&hash).kind(), ScriptKind::Call);
        assert_eq!(
            Script::contract_create(VersionVm::evm_default(), 1, 1, &[0x60]).kind(),
            ScriptKind::Create
        );
        assert_eq!(Script::from(vec![OP_DUP]).kind(), ScriptKind::NonStandard);
    }

    #[test]
    fn byte_code_mode_stops_at_contract_opcode() {
        let script = Script::new()
            .push_slice(&[4])
            .push_opcode(OP_1 + 2)
            .push_opcode(OP_1NEGATE)
            .push_opcode(OP_CALL)
            .push_opcode(OP_DUP);
        let stack = script.eval_byte_code().unwrap();
        assert_eq!(stack, vec![vec![4], vec![3], vec![0x81], vec![OP_CALL, OP_DUP]]);
    }

    #[test]
    fn byte_code_mode_rejects_other_opcodes() {
        let script = Script::p2pkh(&[0; 20]);
        assert_eq!(
            script.eval_byte_code(),
            Err(ScriptError::DisallowedOpcode {
                opcode: OP_DUP,
                offset: 0
            })
        );
    }
}
