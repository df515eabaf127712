//! Consensus-relevant limits.

use serde::{Deserialize, Serialize};
use utxo_bridge_common::{
    CONDENSING_TX_VERSION, DEFAULT_BLOCK_GAS_LIMIT, DEFAULT_MAX_CONTRACT_VOUTS,
    MAX_ANCESTOR_HASHES,
};

/// Limits shared by the condenser and the execution orchestrator.
///
/// Every node on a network must run with the same values; they are exposed
/// for test networks and tooling, not for local tuning.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Most outputs one condensing transaction may carry.
    pub max_contract_vouts: usize,
    /// Gas shared by every contract call in a block.
    pub block_gas_limit: u64,
    /// Ancestor hashes handed to the execution engine.
    pub max_ancestor_hashes: usize,
    /// `version` of synthesized transactions.
    pub condensing_tx_version: i32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_contract_vouts: DEFAULT_MAX_CONTRACT_VOUTS,
            block_gas_limit: DEFAULT_BLOCK_GAS_LIMIT,
            max_ancestor_hashes: MAX_ANCESTOR_HASHES,
            condensing_tx_version: CONDENSING_TX_VERSION,
        }
    }
}
