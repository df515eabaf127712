//! [`UniversalAddress`], one identifier for accounts across every addressing
//! scheme the ledger supports.

use std::{
    cmp::Ordering,
    fmt::{self, Display},
};

use ethereum_types::H256;
use keccak_hash::keccak;
use serde::{Deserialize, Serialize};
use utxo_bridge_common::hash160;

use crate::script::{Script, ScriptKind};

/// Addressing scheme tag. The discriminants are part of consensus: they are
/// hashed into backing-ledger keys.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[repr(u8)]
pub enum AddressVersion {
    /// Attributable to nobody.
    #[default]
    Unknown = 0,
    /// Either a key hash or an EVM account, depending on whether the account
    /// already exists.
    LegacyEvm = 1,
    /// Hash of a public key.
    PubKeyHash = 2,
    /// EVM contract account.
    Evm = 3,
    /// Account of the ledger's own contract VM.
    LedgerNative = 4,
    /// Hash of a redeem script.
    ScriptHash = 5,
}

impl AddressVersion {
    /// Whether addresses of this version name contract accounts.
    pub const fn is_contract(self) -> bool {
        matches!(
            self,
            AddressVersion::LegacyEvm | AddressVersion::Evm | AddressVersion::LedgerNative
        )
    }
}

impl TryFrom<u8> for AddressVersion {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => AddressVersion::Unknown,
            1 => AddressVersion::LegacyEvm,
            2 => AddressVersion::PubKeyHash,
            3 => AddressVersion::Evm,
            4 => AddressVersion::LedgerNative,
            5 => AddressVersion::ScriptHash,
            other => return Err(other),
        })
    }
}

/// An account address tagged with its scheme.
///
/// Equality covers both `version` and `data`. Ordering compares `data` first
/// and only falls back to `version` when the bytes are identical, so any two
/// addresses with different bytes sort exactly as a data-only comparison
/// would, while `Ord` stays consistent with `Eq` for ordered collections.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct UniversalAddress {
    /// Addressing scheme.
    pub version: AddressVersion,
    /// Scheme-specific bytes, usually a 20-byte hash.
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
}

impl Ord for UniversalAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.data
            .cmp(&other.data)
            .then(self.version.cmp(&other.version))
    }
}

impl PartialOrd for UniversalAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for UniversalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:0x{}", self.version, hex::encode(&self.data))
    }
}

impl UniversalAddress {
    pub fn new(version: AddressVersion, data: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            data: data.into(),
        }
    }

    /// The sentinel for "could not be determined".
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.version == AddressVersion::Unknown
    }

    /// Owner of a standard output.
    ///
    /// Pay-to-pubkey-hash and pay-to-pubkey outputs resolve to a key-hash
    /// address; every other shape is unattributable.
    pub fn from_script(script: &Script) -> Self {
        match script.kind() {
            ScriptKind::PubKeyHash(hash) => Self::new(AddressVersion::PubKeyHash, hash),
            ScriptKind::PubKey(key) => Self::new(AddressVersion::PubKeyHash, hash160(&key)),
            _ => Self::unknown(),
        }
    }

    /// The address of an account created by output `vout` of `txid`:
    /// `RIPEMD160(SHA256(txid || vout_le))`.
    pub fn from_output(version: AddressVersion, txid: &H256, vout: u32) -> Self {
        let mut preimage = Vec::with_capacity(36);
        preimage.extend_from_slice(txid.as_bytes());
        preimage.extend_from_slice(&vout.to_le_bytes());
        Self::new(version, hash160(&preimage))
    }

    /// Key of this address in the backing ledger trie.
    pub fn trie_key(&self) -> H256 {
        let mut preimage = Vec::with_capacity(1 + self.data.len());
        preimage.push(self.version as u8);
        preimage.extend_from_slice(&self.data);
        keccak(preimage)
    }

    /// The script an output paying this address carries, or `None` when value
    /// sent here could never be spent again.
    pub fn locking_script(&self) -> Option<Script> {
        match self.version {
            AddressVersion::PubKeyHash => Some(Script::p2pkh(self.data.as_slice().try_into().ok()?)),
            AddressVersion::ScriptHash => Some(Script::p2sh(self.data.as_slice().try_into().ok()?)),
            v if v.is_contract() => Some(Script::no_exec_call(&self.data)),
            _ => None,
        }
    }
}
