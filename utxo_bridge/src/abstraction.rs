//! The account abstraction layer, the inbound mirror of the condenser.
//!
//! Before a contract runs, the accounts its call touches are resolved from
//! transfers that already carry each side's backing record. The layer works
//! out every balance up front so execution-time code knows which outputs
//! will be spent and which output index each account will receive, before
//! the condensing transaction itself exists.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    address::UniversalAddress,
    backing::{BackingRecord, BackingUpdates},
    condenser::{assemble, net_flows, CondenseError, Condensation, Settlement, Transfer},
    config::BridgeConfig,
};

#[derive(Debug, Error)]
pub enum AbstractionError {
    /// Two transfers disagree on which output backs an account.
    #[error("conflicting backing records for {address}: {first:?} and {second:?}")]
    ConflictingVin {
        address: UniversalAddress,
        first: BackingRecord,
        second: BackingRecord,
    },

    #[error(transparent)]
    Condense(#[from] CondenseError),
}

/// A transfer together with the backing records its two sides held when it
/// was computed.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AccountTransfer {
    pub transfer: Transfer,
    pub from_vin: Option<BackingRecord>,
    pub to_vin: Option<BackingRecord>,
}

impl AccountTransfer {
    pub fn new(
        transfer: Transfer,
        from_vin: Option<BackingRecord>,
        to_vin: Option<BackingRecord>,
    ) -> Self {
        Self {
            transfer,
            from_vin,
            to_vin,
        }
    }
}

#[derive(Debug)]
pub struct AccountAbstractionLayer {
    settlements: Vec<Settlement>,
}

impl AccountAbstractionLayer {
    /// Resolves every balance.
    ///
    /// Fails when the transfers disagree about an account's backing output or
    /// when any account would end with a negative or out-of-range balance; in
    /// either case execution must not proceed.
    pub fn new(
        sender_transfer: AccountTransfer,
        transfers: Vec<AccountTransfer>,
    ) -> Result<Self, AbstractionError> {
        let sender = sender_transfer.transfer.from.clone();
        let all: Vec<_> = std::iter::once(sender_transfer).chain(transfers).collect();

        let mut vins = BTreeMap::<UniversalAddress, BackingRecord>::new();
        for t in &all {
            let sides = [
                (&t.transfer.from, t.from_vin),
                (&t.transfer.to, t.to_vin),
            ];
            for (address, vin) in sides {
                let Some(vin) = vin.filter(BackingRecord::is_spendable) else {
                    continue;
                };
                match vins.get(address) {
                    Some(first) if *first != vin => {
                        return Err(AbstractionError::ConflictingVin {
                            address: address.clone(),
                            first: *first,
                            second: vin,
                        })
                    }
                    Some(_) => {}
                    None => {
                        vins.insert(address.clone(), vin);
                    }
                }
            }
        }

        let settlements = net_flows(all.iter().map(|t| &t.transfer))
            .into_iter()
            .map(|(address, flow)| -> Result<Settlement, CondenseError> {
                let prior = vins.get(&address).copied();
                let mut s = Settlement::resolve(address, prior, flow)?;
                s.skip_update = s.address == sender;
                Ok(s)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { settlements })
    }

    /// Backing records that the condensing transaction will spend.
    pub fn spent_vins(&self) -> BackingUpdates {
        self.settlements
            .iter()
            .filter_map(|s| {
                s.prior
                    .filter(BackingRecord::is_spendable)
                    .map(|p| (s.address.clone(), p))
            })
            .collect()
    }

    /// Output index each account with a nonzero balance will receive.
    pub fn new_vout_numbers(&self) -> BTreeMap<UniversalAddress, u32> {
        self.settlements
            .iter()
            .filter(|s| s.balance > 0)
            .zip(0u32..)
            .map(|(s, vout)| (s.address.clone(), vout))
            .collect()
    }

    /// Resulting balance of every account the transfers touch.
    pub fn balances(&self) -> BTreeMap<UniversalAddress, u64> {
        self.settlements
            .iter()
            .map(|s| (s.address.clone(), s.balance))
            .collect()
    }

    pub fn reached_vout_limit(&self, config: &BridgeConfig) -> bool {
        self.settlements.iter().filter(|s| s.balance > 0).count() > config.max_contract_vouts
    }

    /// Builds the condensing transaction the resolved balances call for.
    pub fn create_condensing_tx(
        &self,
        config: &BridgeConfig,
    ) -> Result<Condensation, AbstractionError> {
        Ok(assemble(
            &self.settlements,
            config.max_contract_vouts,
            config.condensing_tx_version,
        )?)
    }
}
