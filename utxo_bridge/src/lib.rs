//! Account-model contract execution on top of a UTXO ledger.
//!
//! The ledger tracks ownership as discrete spendable outputs; contracts track
//! it as mutable balances. This crate keeps the two in agreement:
//!
//! - [`contract_call`] reads contract invocations out of ledger outputs.
//! - [`executor`] hands them to an execution engine and collects the value
//!   transfers the engine reports.
//! - [`condenser`] turns those transfers into one ledger transaction, the
//!   *condensing transaction*, that spends the outputs backing every affected
//!   account and pays out their new balances.
//! - [`backing`] remembers, in an authenticated trie, which output currently
//!   backs each account, so any node can rebuild that mapping from chain
//!   state alone.
//! - [`abstraction`] is the inbound mirror of the condenser, resolving
//!   balances and output indices before a contract runs.
//!
//! Everything here is consensus critical and strictly deterministic: the same
//! inputs produce byte-identical transactions and trie roots on every node.
//! All collections that influence output order are ordered by
//! [`UniversalAddress`](address::UniversalAddress).
//!
//! # Usage
//!
//! ```
//! use utxo_bridge::{
//!     address::{AddressVersion, UniversalAddress},
//!     backing::{BackingLedger, BackingRecord},
//!     condenser::{CondensingTx, Transfer},
//!     config::BridgeConfig,
//! };
//! use ethereum_types::{H256, U256};
//!
//! let alice = UniversalAddress::new(AddressVersion::Evm, [0xa; 20]);
//! let bob = UniversalAddress::new(AddressVersion::Evm, [0xb; 20]);
//!
//! let mut ledger = BackingLedger::new();
//! let funded = BackingRecord::new(H256::repeat_byte(1), 0, U256::from(100));
//! ledger.commit([(alice.clone(), funded)].into_iter().collect()).unwrap();
//!
//! let transfers = [Transfer::new(alice.clone(), bob.clone(), 30)];
//! let condensed = CondensingTx::new(&ledger, &transfers, &BridgeConfig::default())
//!     .condense()
//!     .unwrap()
//!     .into_condensed()
//!     .unwrap();
//!
//! let tx = condensed.transaction.as_ref().unwrap();
//! assert_eq!(tx.inputs.len(), 1);
//! assert_eq!(tx.outputs.len(), 2);
//!
//! ledger.commit(condensed.updates).unwrap();
//! assert_eq!(ledger.get(&bob).unwrap().unwrap().value, U256::from(30));
//! ```

#![deny(rustdoc::broken_intra_doc_links)]
#![warn(missing_debug_implementations)]

pub mod abstraction;
pub mod address;
pub mod backing;
pub mod condenser;
pub mod config;
pub mod contract_call;
pub mod executor;
pub mod script;
pub mod transaction;
pub mod trie_store;
pub mod version_vm;
pub mod world;

pub use address::{AddressVersion, UniversalAddress};
pub use backing::{BackingLedger, BackingRecord};
pub use condenser::{Condensation, CondensedTransaction, CondensingTx, Transfer};
pub use config::BridgeConfig;
pub use contract_call::{ContractCall, ContractOutputParser};
pub use version_vm::VersionVm;
