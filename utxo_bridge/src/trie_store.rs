//! A root-addressable authenticated key/value store.
//!
//! Wraps a [`HashedPartialTrie`] and remembers every root it has produced, so
//! the view can be re-pointed at any earlier state. Keys are 32-byte hashes;
//! callers hash their own keys before they reach the trie.

use std::collections::HashMap;

use ethereum_types::H256;
use log::trace;
use mpt_trie::{
    nibbles::Nibbles,
    partial_trie::{HashedPartialTrie, PartialTrie},
    trie_ops::{TrieOpError, ValOrHash},
};
use thiserror::Error;
use utxo_bridge_common::EMPTY_TRIE_HASH;

#[derive(Debug, Error)]
pub enum TrieStoreError {
    #[error(transparent)]
    Trie(#[from] TrieOpError),

    /// The store has never produced this root.
    #[error("unknown trie root {0:x}")]
    UnknownRoot(H256),
}

#[derive(Clone, Debug)]
pub struct TrieStore {
    working: HashedPartialTrie,
    roots: HashMap<H256, HashedPartialTrie>,
}

impl Default for TrieStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TrieStore {
    /// An empty store. The empty root is always known.
    pub fn new() -> Self {
        let working = HashedPartialTrie::default();
        let mut roots = HashMap::new();
        roots.insert(EMPTY_TRIE_HASH, working.clone());
        Self { working, roots }
    }

    pub fn get(&self, key: H256) -> Option<&[u8]> {
        self.working.get(Nibbles::from_h256_be(key))
    }

    pub fn contains(&self, key: H256) -> bool {
        self.working.contains(Nibbles::from_h256_be(key))
    }

    pub fn insert(&mut self, key: H256, value: Vec<u8>) -> Result<(), TrieStoreError> {
        self.working.insert(Nibbles::from_h256_be(key), value)?;
        Ok(())
    }

    /// Removes `key`, returning the value it held.
    pub fn remove(&mut self, key: H256) -> Result<Option<Vec<u8>>, TrieStoreError> {
        Ok(self.working.delete(Nibbles::from_h256_be(key))?)
    }

    /// Root hash of the working trie.
    pub fn root(&self) -> H256 {
        self.working.hash()
    }

    /// Records the working trie under its root so it can be returned to with
    /// [`TrieStore::set_root`], and returns that root.
    pub fn snapshot(&mut self) -> H256 {
        let root = self.working.hash();
        self.roots
            .entry(root)
            .or_insert_with(|| self.working.clone());
        root
    }

    /// Re-points the working trie at a previously recorded root.
    pub fn set_root(&mut self, root: H256) -> Result<(), TrieStoreError> {
        if self.working.hash() == root {
            return Ok(());
        }
        let trie = self
            .roots
            .get(&root)
            .ok_or(TrieStoreError::UnknownRoot(root))?;
        trace!("repointing trie from {:x} to {:x}", self.working.hash(), root);
        self.working = trie.clone();
        Ok(())
    }

    /// Applies a batch of writes (`Some`) and removals (`None`) as one unit.
    ///
    /// Either every change lands and the new root is recorded and returned,
    /// or the working trie is left exactly as it was.
    pub fn apply<I>(&mut self, changes: I) -> Result<H256, TrieStoreError>
    where
        I: IntoIterator<Item = (H256, Option<Vec<u8>>)>,
    {
        let mut scratch = self.working.clone();
        for (key, value) in changes {
            let key = Nibbles::from_h256_be(key);
            match value {
                Some(v) => scratch.insert(key, v)?,
                None => {
                    scratch.delete(key)?;
                }
            }
        }
        self.working = scratch;
        Ok(self.snapshot())
    }

    /// Every stored value, in key order.
    pub fn values(&self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.working.values().filter_map(|v| match v {
            ValOrHash::Val(v) => Some(v),
            ValOrHash::Hash(_) => None,
        })
    }
}
