use clap::Args;
use utxo_bridge::config::BridgeConfig;
use utxo_bridge_common::{DEFAULT_BLOCK_GAS_LIMIT, DEFAULT_MAX_CONTRACT_VOUTS};

const HELP_HEADING: &str = "Consensus limits";

/// Consensus limits as command-line options.
///
/// Every node on a network must agree on these; override them only for test
/// networks.
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct CliBridgeConfig {
    /// Most outputs one condensing transaction may carry.
    #[arg(long, env = "BRIDGE_MAX_CONTRACT_VOUTS", help_heading = HELP_HEADING, default_value_t = DEFAULT_MAX_CONTRACT_VOUTS)]
    pub max_contract_vouts: usize,
    /// Gas shared by all contract calls of one block.
    #[arg(long, env = "BRIDGE_BLOCK_GAS_LIMIT", help_heading = HELP_HEADING, default_value_t = DEFAULT_BLOCK_GAS_LIMIT)]
    pub block_gas_limit: u64,
}

impl Default for CliBridgeConfig {
    fn default() -> Self {
        BridgeConfig::default().into()
    }
}

impl From<BridgeConfig> for CliBridgeConfig {
    fn from(config: BridgeConfig) -> Self {
        Self {
            max_contract_vouts: config.max_contract_vouts,
            block_gas_limit: config.block_gas_limit,
        }
    }
}

impl From<CliBridgeConfig> for BridgeConfig {
    fn from(cli: CliBridgeConfig) -> Self {
        Self {
            max_contract_vouts: cli.max_contract_vouts,
            block_gas_limit: cli.block_gas_limit,
            ..Default::default()
        }
    }
}
