//! The two tries contract execution touches, and the checkpoint discipline
//! that keeps them in step.

use ethereum_types::H256;
use log::trace;
use thiserror::Error;

use crate::{
    backing::{BackingError, BackingLedger, BackingUpdates},
    trie_store::{TrieStore, TrieStoreError},
};

#[derive(Debug, Error)]
pub enum WorldError {
    #[error("account state: {0}")]
    State(#[from] TrieStoreError),

    #[error("backing ledger: {0}")]
    Backing(#[from] BackingError),
}

/// Account state and backing ledger of one in-progress block.
#[derive(Clone, Debug, Default)]
pub struct WorldState {
    /// Account state written by the execution engines.
    pub state: TrieStore,
    /// Backing outputs of every account.
    pub backing: BackingLedger,
}

/// Everything needed to put a [`WorldState`] back where it was.
///
/// A checkpoint is a plain value, not a guard: dropping one does nothing.
/// Restoring is always an explicit [`WorldState::revert`], and
/// [`WorldState::speculate`] is the scope that guarantees it happens.
#[derive(Clone, Debug)]
#[must_use]
pub struct Checkpoint {
    state_root: H256,
    backing_root: H256,
    pending: BackingUpdates,
}

impl Checkpoint {
    pub fn state_root(&self) -> H256 {
        self.state_root
    }

    pub fn backing_root(&self) -> H256 {
        self.backing_root
    }
}

/// Roots after a durable commit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommittedRoots {
    pub state_root: H256,
    pub backing_root: H256,
}

/// Outcome of a speculative scope: keep its effects or discard them. The
/// value is returned either way.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Speculation<T> {
    Commit(T),
    Revert(T),
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the current roots of both tries and the backing ledger's
    /// pending cache.
    pub fn checkpoint(&mut self) -> Checkpoint {
        Checkpoint {
            state_root: self.state.snapshot(),
            backing_root: self.backing.root(),
            pending: self.backing.pending().clone(),
        }
    }

    /// Puts both tries back at `checkpoint`.
    pub fn revert(&mut self, checkpoint: Checkpoint) -> Result<(), WorldError> {
        trace!(
            "reverting to state root {:x}, backing root {:x}",
            checkpoint.state_root,
            checkpoint.backing_root
        );
        self.state.set_root(checkpoint.state_root)?;
        self.backing
            .restore(checkpoint.backing_root, checkpoint.pending)?;
        Ok(())
    }

    /// Records the account state and flushes the backing ledger's pending
    /// cache.
    pub fn commit(&mut self) -> Result<CommittedRoots, WorldError> {
        let backing_root = self.backing.commit(BackingUpdates::new())?;
        Ok(CommittedRoots {
            state_root: self.state.snapshot(),
            backing_root,
        })
    }

    /// Runs `f` inside a checkpoint.
    ///
    /// Both tries are restored on every exit path (`Revert`, or an error)
    /// except an explicit `Commit`.
    pub fn speculate<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self) -> Result<Speculation<T>, E>,
        E: From<WorldError>,
    {
        let checkpoint = self.checkpoint();
        match f(self) {
            Ok(Speculation::Commit(value)) => Ok(value),
            Ok(Speculation::Revert(value)) => {
                self.revert(checkpoint)?;
                Ok(value)
            }
            Err(e) => {
                self.revert(checkpoint)?;
                Err(e)
            }
        }
    }
}
