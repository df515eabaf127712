use ethereum_types::H256;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// The hash of an empty Merkle Patricia trie.
/// 0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421
pub const EMPTY_TRIE_HASH: H256 = H256([
    86, 232, 31, 23, 27, 204, 85, 166, 255, 131, 69, 230, 146, 192, 248, 110, 91, 72, 224, 27, 153,
    108, 173, 192, 1, 98, 47, 181, 227, 99, 180, 33,
]);

/// Default cap on the number of outputs a single condensing transaction may
/// carry.
pub const DEFAULT_MAX_CONTRACT_VOUTS: usize = 1000;

/// Default amount of gas shared by every contract call in one block.
pub const DEFAULT_BLOCK_GAS_LIMIT: u64 = 40_000_000;

/// How many ancestor block hashes the execution environment exposes.
pub const MAX_ANCESTOR_HASHES: usize = 256;

/// Version field written into synthesized transactions.
pub const CONDENSING_TX_VERSION: i32 = 2;

/// Largest amount a single ledger output may hold. Amounts are tracked as
/// signed 64-bit values on the ledger side.
pub const MAX_AMOUNT: u64 = i64::MAX as u64;

/// `SHA256(SHA256(data))`, the ledger's transaction id hash.
pub fn sha256d(data: &[u8]) -> H256 {
    let once = Sha256::digest(data);
    H256::from_slice(&Sha256::digest(once))
}

/// `RIPEMD160(SHA256(data))`, used for key hashes and derived addresses.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

#[test]
fn test_empty_trie_hash() {
    assert_eq!(
        EMPTY_TRIE_HASH,
        keccak_hash::keccak(rlp::NULL_RLP)
    );
}

#[test]
fn test_sha256d_of_empty_input() {
    assert_eq!(
        sha256d(&[]),
        H256(hex_literal::hex!(
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        ))
    );
}

#[test]
fn test_hash160_of_empty_input() {
    assert_eq!(
        hash160(&[]),
        hex_literal::hex!("b472a266d0bd89c13706a4132ccfb16f7c3b9fcb")
    );
}
