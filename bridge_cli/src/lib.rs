//! Command-line plumbing for `utxo-bridge`: configuration flags, the JSON
//! batch format and log setup.

pub mod batch;
pub mod cli;
pub mod tracing;
