//! Execution orchestration: builds what an execution engine gets to see,
//! dispatches a parsed call to the engine its version header selects, and
//! routes the engine's transfers into the condenser.
//!
//! The engines themselves live outside this crate behind
//! [`ContractEngine`]. This module does no accounting of its own.

use ethereum_types::H256;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    address::{AddressVersion, UniversalAddress},
    condenser::{
        CondenseError, Condensation, CondensedTransaction, CondensingTx, SenderVin, Transfer,
    },
    config::BridgeConfig,
    contract_call::ContractCall,
    transaction::Block,
    trie_store::TrieStore,
    version_vm::RootVm,
    world::{Speculation, WorldError, WorldState},
};

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The call's version header selects no engine.
    #[error("no execution engine for root VM {0}")]
    UnknownRootVm(u8),

    /// Returning a failed call's value would need more outputs than a
    /// condensing transaction may carry.
    #[error("refund needs {required} outputs, limit is {limit}")]
    RefundOverflow { required: usize, limit: usize },

    #[error(transparent)]
    Condense(#[from] CondenseError),

    #[error(transparent)]
    World(#[from] WorldError),
}

/// The account value owed to `sender` is settled to. An unresolved sender is
/// paid to the all-zero key hash, which nobody can spend from.
pub fn settlement_address(sender: &UniversalAddress) -> UniversalAddress {
    match sender.is_unknown() {
        true => UniversalAddress::new(AddressVersion::PubKeyHash, [0u8; 20]),
        false => sender.clone(),
    }
}

/// The active chain. Its tip is the block being connected.
#[cfg_attr(test, mockall::automock)]
pub trait ChainContext {
    /// Height of the current tip, `None` for an empty chain.
    fn tip_height(&self) -> Option<u64>;

    /// Hash of the block at `height` on the active chain.
    fn block_hash(&self, height: u64) -> Option<H256>;
}

/// Read-only view of the block a call executes in.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ExecutionEnvironment {
    pub number: u64,
    pub timestamp: u32,
    pub difficulty: u32,
    pub gas_limit: u64,
    /// Ancestor hashes, newest (the tip) first.
    pub ancestor_hashes: Vec<H256>,
    /// Who is paid for creating the block.
    pub author: UniversalAddress,
}

impl ExecutionEnvironment {
    pub fn build(chain: &impl ChainContext, block: &Block, config: &BridgeConfig) -> Self {
        let tip = chain.tip_height();
        let ancestor_hashes = tip
            .map(|tip| {
                (0..=tip)
                    .rev()
                    .take(config.max_ancestor_hashes)
                    .map_while(|height| chain.block_hash(height))
                    .collect()
            })
            .unwrap_or_default();

        let author = block
            .creator_output()
            .map(|out| UniversalAddress::from_script(&out.script_pubkey))
            .unwrap_or_default();

        Self {
            // The block being connected is already the tip.
            number: tip.unwrap_or_default(),
            timestamp: block.time,
            difficulty: block.bits,
            gas_limit: config.block_gas_limit,
            ancestor_hashes,
            author,
        }
    }
}

/// How an engine run ended.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum ExecStatus {
    Success,
    OutOfGas,
    CodeError,
    /// The called contract does not exist.
    DoesNotExist,
}

/// What an engine reports back.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EngineOutput {
    pub used_gas: u64,
    pub status: ExecStatus,
    /// Transfers made by the contract itself. The transfer of the call's own
    /// value to its target is added by the orchestrator.
    pub transfers: Vec<Transfer>,
    /// Accounts destroyed during the run.
    pub deleted: Vec<UniversalAddress>,
}

impl EngineOutput {
    pub fn failed(status: ExecStatus, used_gas: u64) -> Self {
        Self {
            used_gas,
            status,
            transfers: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

/// A contract execution engine.
pub trait ContractEngine {
    /// Runs `call` with at most `gas`, reading and writing account state in
    /// `state`.
    fn execute(
        &mut self,
        call: &ContractCall,
        env: &ExecutionEnvironment,
        gas: u64,
        state: &mut TrieStore,
    ) -> EngineOutput;
}

/// The engines, one variant per executable root VM.
#[derive(Debug)]
pub enum ContractVm<'a, E, N> {
    Evm(&'a mut E),
    Native(&'a mut N),
}

impl<E: ContractEngine, N: ContractEngine> ContractVm<'_, E, N> {
    fn execute(
        &mut self,
        call: &ContractCall,
        env: &ExecutionEnvironment,
        gas: u64,
        state: &mut TrieStore,
    ) -> EngineOutput {
        match self {
            ContractVm::Evm(engine) => engine.execute(call, env, gas, state),
            ContractVm::Native(engine) => engine.execute(call, env, gas, state),
        }
    }
}

/// Outcome of one orchestrated call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutionReceipt {
    pub status: ExecStatus,
    /// Gas the engine was allowed to use.
    pub gas_given: u64,
    pub used_gas: u64,
    /// The condensing transaction: the call's transfers, or the refund of
    /// its value when it failed or overflowed.
    pub condensed: CondensedTransaction,
    /// The engine's transfers needed more outputs than allowed; its effects
    /// were discarded and the call's value refunded.
    pub vout_overflow: bool,
    /// Account state root after the call.
    pub state_root: H256,
}

impl ExecutionReceipt {
    /// Whether the call's effects were kept.
    pub fn succeeded(&self) -> bool {
        self.status == ExecStatus::Success && !self.vout_overflow
    }
}

/// Runs the contract calls of one block against a [`WorldState`].
#[derive(Debug)]
pub struct ContractExecutor<'w, E, N> {
    world: &'w mut WorldState,
    evm: E,
    native: N,
    remaining_gas: u64,
    config: BridgeConfig,
}

impl<'w, E: ContractEngine, N: ContractEngine> ContractExecutor<'w, E, N> {
    pub fn new(world: &'w mut WorldState, evm: E, native: N, config: BridgeConfig) -> Self {
        Self {
            world,
            evm,
            native,
            remaining_gas: config.block_gas_limit,
            config,
        }
    }

    /// Gas left for the rest of the block.
    pub fn remaining_gas(&self) -> u64 {
        self.remaining_gas
    }

    pub fn into_engines(self) -> (E, N) {
        (self.evm, self.native)
    }

    /// Executes `call` and condenses its transfers.
    ///
    /// The engine's state changes and the backing updates of the condensing
    /// transaction are kept only when `commit` is set; otherwise both tries
    /// are restored before returning. A failed call, or one whose transfers
    /// overflow the output limit, keeps no engine effects and refunds the
    /// call's value to its sender.
    pub fn execute(
        &mut self,
        call: &ContractCall,
        env: &ExecutionEnvironment,
        commit: bool,
    ) -> Result<ExecutionReceipt, ExecutorError> {
        let mut vm = match call.version.root() {
            Some(RootVm::Evm) => ContractVm::Evm(&mut self.evm),
            Some(RootVm::Native) => ContractVm::Native(&mut self.native),
            Some(RootVm::NoExec) | None => {
                return Err(ExecutorError::UnknownRootVm(call.version.root_vm()))
            }
        };
        let gas = call.gas_limit.min(self.remaining_gas);
        let config = &self.config;
        let sender = settlement_address(&call.sender);
        let settle = |address: UniversalAddress| match address == call.sender {
            true => sender.clone(),
            false => address,
        };

        let receipt = self.world.speculate(|world| {
            let before_engine = world.checkpoint();
            let output = vm.execute(call, env, gas, &mut world.state);
            let used_gas = output.used_gas.min(gas);

            let sender_vin = (call.value > 0).then(|| SenderVin {
                address: sender.clone(),
                outpoint: call.outpoint,
                value: call.value,
            });

            let mut vout_overflow = false;
            let mut condensation = None;
            if output.status == ExecStatus::Success {
                let mut transfers = Vec::with_capacity(output.transfers.len() + 1);
                if call.value > 0 {
                    transfers.push(Transfer::new(
                        sender.clone(),
                        call.target.clone(),
                        call.value,
                    ));
                }
                transfers.extend(
                    output
                        .transfers
                        .into_iter()
                        .map(|t| Transfer::new(settle(t.from), settle(t.to), t.value)),
                );

                let mut condensing = CondensingTx::new(&world.backing, &transfers, config)
                    .with_deleted(output.deleted);
                if let Some(vin) = sender_vin.clone() {
                    condensing = condensing.with_sender(vin);
                }
                match condensing.condense()? {
                    Condensation::Condensed(ct) => condensation = Some(ct),
                    Condensation::VoutOverflow { required, limit } => {
                        info!(
                            "call {:x}:{} needs {required} outputs, limit {limit}; refunding",
                            call.outpoint.txid, call.outpoint.vout
                        );
                        vout_overflow = true;
                    }
                }
            }

            let condensed = match condensation {
                Some(ct) => ct,
                None => {
                    world.revert(before_engine)?;
                    refund(world, sender_vin, config)?
                }
            };
            world.backing.stage(condensed.updates.clone());

            let receipt = ExecutionReceipt {
                status: output.status,
                gas_given: gas,
                used_gas,
                condensed,
                vout_overflow,
                state_root: world.state.root(),
            };
            Ok::<_, ExecutorError>(match commit {
                true => Speculation::Commit(receipt),
                false => Speculation::Revert(receipt),
            })
        })?;

        if commit {
            self.remaining_gas -= receipt.used_gas;
        }
        debug!(
            "call {:x}:{} finished with {:?}, used {} of {} gas",
            call.outpoint.txid, call.outpoint.vout, receipt.status, receipt.used_gas, receipt.gas_given
        );
        Ok(receipt)
    }
}

/// Condenses the return of a call's value to its sender.
fn refund(
    world: &WorldState,
    sender_vin: Option<SenderVin>,
    config: &BridgeConfig,
) -> Result<CondensedTransaction, ExecutorError> {
    let Some(vin) = sender_vin else {
        return Ok(CondensedTransaction::default());
    };
    match CondensingTx::new(&world.backing, &[], config)
        .with_sender(vin)
        .condense()?
    {
        Condensation::Condensed(ct) => Ok(ct),
        Condensation::VoutOverflow { required, limit } => {
            Err(ExecutorError::RefundOverflow { required, limit })
        }
    }
}

#[cfg(test)]
mod tests {
    use ethereum_types::U256;

    use super::*;
    use crate::{
        address::AddressVersion,
        backing::BackingRecord,
        contract_call::CallKind,
        script::Script,
        transaction::{OutPoint, Transaction, TxIn, TxOut},
        version_vm::VersionVm,
    };

    #[derive(Debug, Default)]
    struct ScriptedEngine {
        output: Option<EngineOutput>,
        write: Option<(H256, Vec<u8>)>,
        gas_seen: Vec<u64>,
    }

    impl ScriptedEngine {
        fn returning(output: EngineOutput) -> Self {
            Self {
                output: Some(output),
                write: Some((H256::repeat_byte(0x5e), vec![1])),
                ..Default::default()
            }
        }
    }

    impl ContractEngine for ScriptedEngine {
        fn execute(
            &mut self,
            _call: &ContractCall,
            _env: &ExecutionEnvironment,
            gas: u64,
            state: &mut TrieStore,
        ) -> EngineOutput {
            self.gas_seen.push(gas);
            if let Some((key, value)) = &self.write {
                state.insert(*key, value.clone()).unwrap();
            }
            self.output
                .clone()
                .unwrap_or_else(|| EngineOutput::failed(ExecStatus::DoesNotExist, 0))
        }
    }

    fn success(used_gas: u64, transfers: Vec<Transfer>) -> EngineOutput {
        EngineOutput {
            used_gas,
            status: ExecStatus::Success,
            transfers,
            deleted: Vec::new(),
        }
    }

    fn pkh(b: u8) -> UniversalAddress {
        UniversalAddress::new(AddressVersion::PubKeyHash, [b; 20])
    }

    fn evm(b: u8) -> UniversalAddress {
        UniversalAddress::new(AddressVersion::Evm, [b; 20])
    }

    fn call(version: VersionVm, value: u64, gas_limit: u64) -> ContractCall {
        ContractCall {
            kind: CallKind::Call,
            version,
            gas_price: 1,
            gas_limit,
            target: evm(0xc),
            payload: vec![1],
            value,
            sender: pkh(0x5),
            outpoint: OutPoint::new(H256::repeat_byte(0xca), 1),
        }
    }

    fn chain(len: u64) -> MockChainContext {
        let mut chain = MockChainContext::new();
        chain.expect_tip_height().return_const(len.checked_sub(1));
        chain
            .expect_block_hash()
            .returning(move |h| (h < len).then(|| H256::from_low_u64_be(h + 1)));
        chain
    }

    #[test]
    fn environment_lists_ancestors_newest_first() {
        let env = ExecutionEnvironment::build(&chain(4), &Block::default(), &BridgeConfig::default());
        assert_eq!(env.number, 3);
        assert_eq!(
            env.ancestor_hashes,
            (1..=4u64).rev().map(H256::from_low_u64_be).collect::<Vec<_>>()
        );
        assert!(env.author.is_unknown());

        let env = ExecutionEnvironment::build(&chain(300), &Block::default(), &BridgeConfig::default());
        assert_eq!(env.ancestor_hashes.len(), 256);
        assert_eq!(env.ancestor_hashes[0], H256::from_low_u64_be(300));
        assert_eq!(env.ancestor_hashes[255], H256::from_low_u64_be(45));

        let env = ExecutionEnvironment::build(&chain(0), &Block::default(), &BridgeConfig::default());
        assert_eq!(env.number, 0);
        assert!(env.ancestor_hashes.is_empty());
    }

    #[test]
    fn environment_author_comes_from_the_coinstake_on_pos_blocks() {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxIn::spend(OutPoint::null())],
            outputs: vec![TxOut::new(0, Script::p2pkh(&[1; 20]))],
            lock_time: 0,
        };
        let coinstake = Transaction {
            version: 1,
            inputs: vec![TxIn::spend(OutPoint::new(H256::repeat_byte(7), 0))],
            outputs: vec![TxOut::new(0, Script::new()), TxOut::new(5, Script::p2pkh(&[2; 20]))],
            lock_time: 0,
        };
        let block = Block {
            time: 1_600_000_000,
            bits: 0x1d00ffff,
            transactions: vec![coinbase.clone(), coinstake],
        };
        let env = ExecutionEnvironment::build(&chain(1), &block, &BridgeConfig::default());
        assert_eq!(env.author, pkh(2));
        assert_eq!(env.timestamp, 1_600_000_000);
        assert_eq!(env.difficulty, 0x1d00ffff);

        let pow = Block {
            transactions: vec![coinbase],
            ..block
        };
        let env = ExecutionEnvironment::build(&chain(1), &pow, &BridgeConfig::default());
        assert_eq!(env.author, pkh(1));
    }

    #[test]
    fn successful_call_moves_value_into_the_contract() {
        let mut world = WorldState::new();
        let evm_engine = ScriptedEngine::returning(success(21_000, vec![]));
        let mut exec = ContractExecutor::new(
            &mut world,
            evm_engine,
            ScriptedEngine::default(),
            BridgeConfig::default(),
        );
        let c = call(VersionVm::evm_default(), 50, 100_000);

        let receipt = exec
            .execute(&c, &ExecutionEnvironment::default(), true)
            .unwrap();
        assert!(receipt.succeeded());
        assert_eq!(receipt.used_gas, 21_000);
        assert_eq!(exec.remaining_gas(), BridgeConfig::default().block_gas_limit - 21_000);

        let ct = receipt.condensed;
        let tx = ct.transaction.as_ref().unwrap();
        assert_eq!(tx.inputs[0].prevout, c.outpoint);
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].script_pubkey, Script::no_exec_call(&[0xc; 20]));

        let (evm_engine, native) = exec.into_engines();
        assert_eq!(evm_engine.gas_seen, vec![100_000]);
        assert!(native.gas_seen.is_empty());

        assert_eq!(
            world.backing.get(&evm(0xc)).unwrap(),
            Some(BackingRecord::new(tx.txid(), 0, U256::from(50)))
        );
        assert!(world.state.get(H256::repeat_byte(0x5e)).is_some());
    }

    #[test]
    fn failed_call_refunds_and_discards_state() {
        let mut world = WorldState::new();
        let engine = ScriptedEngine {
            output: Some(EngineOutput::failed(ExecStatus::OutOfGas, 100_000)),
            write: Some((H256::repeat_byte(0x5e), vec![1])),
            ..Default::default()
        };
        let mut exec =
            ContractExecutor::new(&mut world, engine, ScriptedEngine::default(), BridgeConfig::default());
        let c = call(VersionVm::evm_default(), 50, 100_000);

        let receipt = exec.execute(&c, &ExecutionEnvironment::default(), true).unwrap();
        assert_eq!(receipt.status, ExecStatus::OutOfGas);
        assert!(!receipt.succeeded());

        let ct = receipt.condensed;
        let tx = ct.transaction.unwrap();
        assert_eq!(tx.inputs[0].prevout, c.outpoint);
        assert_eq!(tx.outputs, vec![TxOut::new(50, Script::p2pkh(&[0x5; 20]))]);
        assert!(ct.updates.is_empty());

        assert_eq!(world.state.get(H256::repeat_byte(0x5e)), None);
        assert_eq!(world.backing.get(&evm(0xc)).unwrap(), None);
    }

    #[test]
    fn speculative_calls_leave_no_trace() {
        let mut world = WorldState::new();
        let state_root = world.state.root();
        let engine = ScriptedEngine::returning(success(30_000, vec![]));
        let mut exec =
            ContractExecutor::new(&mut world, engine, ScriptedEngine::default(), BridgeConfig::default());
        let c = call(VersionVm::evm_default(), 50, 100_000);

        let receipt = exec.execute(&c, &ExecutionEnvironment::default(), false).unwrap();
        assert!(receipt.succeeded());
        assert_ne!(receipt.state_root, state_root);
        assert_eq!(exec.remaining_gas(), BridgeConfig::default().block_gas_limit);

        assert_eq!(world.state.root(), state_root);
        assert!(world.backing.pending().is_empty());
    }

    #[test]
    fn gas_is_capped_by_what_the_block_has_left() {
        let mut world = WorldState::new();
        let config = BridgeConfig {
            block_gas_limit: 150_000,
            ..Default::default()
        };
        let engine = ScriptedEngine::returning(success(u64::MAX, vec![]));
        let mut exec = ContractExecutor::new(&mut world, engine, ScriptedEngine::default(), config);
        let env = ExecutionEnvironment::default();

        let first = exec.execute(&call(VersionVm::evm_default(), 0, 100_000), &env, true).unwrap();
        assert_eq!(first.used_gas, 100_000);
        let second = exec.execute(&call(VersionVm::evm_default(), 0, 100_000), &env, true).unwrap();
        assert_eq!(second.gas_given, 50_000);
        assert_eq!(exec.remaining_gas(), 0);
    }

    #[test]
    fn dispatch_follows_the_root_vm() {
        let mut world = WorldState::new();
        let native = ScriptedEngine::returning(success(1, vec![]));
        let mut exec =
            ContractExecutor::new(&mut world, ScriptedEngine::default(), native, BridgeConfig::default());
        let env = ExecutionEnvironment::default();

        let native_version = VersionVm::new(0, RootVm::Native as u8, 0, 0).unwrap();
        exec.execute(&call(native_version, 0, 10), &env, true).unwrap();

        let err = exec
            .execute(&call(VersionVm::from_raw(9 << 2), 0, 10), &env, true)
            .unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownRootVm(9)));
        let err = exec
            .execute(&call(VersionVm::no_exec(), 0, 10), &env, true)
            .unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownRootVm(0)));

        let (evm_engine, native) = exec.into_engines();
        assert!(evm_engine.gas_seen.is_empty());
        assert_eq!(native.gas_seen, vec![10]);
    }

    #[test]
    fn unresolved_sender_is_refunded_to_the_zero_key_hash() {
        let mut world = WorldState::new();
        let engine = ScriptedEngine {
            output: Some(EngineOutput::failed(ExecStatus::OutOfGas, 10)),
            ..Default::default()
        };
        let mut exec =
            ContractExecutor::new(&mut world, engine, ScriptedEngine::default(), BridgeConfig::default());
        let c = ContractCall {
            sender: UniversalAddress::unknown(),
            ..call(VersionVm::evm_default(), 50, 100_000)
        };

        let receipt = exec.execute(&c, &ExecutionEnvironment::default(), true).unwrap();
        assert_eq!(receipt.status, ExecStatus::OutOfGas);
        let tx = receipt.condensed.transaction.unwrap();
        assert_eq!(tx.inputs[0].prevout, c.outpoint);
        assert_eq!(tx.outputs, vec![TxOut::new(50, Script::p2pkh(&[0; 20]))]);
        assert!(receipt.condensed.updates.is_empty());
    }

    #[test]
    fn value_sent_back_to_an_unresolved_sender_is_settled() {
        let mut world = WorldState::new();
        let back = Transfer::new(evm(0xc), UniversalAddress::unknown(), 20);
        let engine = ScriptedEngine::returning(success(1, vec![back]));
        let mut exec =
            ContractExecutor::new(&mut world, engine, ScriptedEngine::default(), BridgeConfig::default());
        let c = ContractCall {
            sender: UniversalAddress::unknown(),
            ..call(VersionVm::evm_default(), 50, 100_000)
        };

        let receipt = exec.execute(&c, &ExecutionEnvironment::default(), true).unwrap();
        assert!(receipt.succeeded());
        let ct = receipt.condensed;
        let zero = settlement_address(&UniversalAddress::unknown());
        assert_eq!(output_value(&ct, &zero), Some(20));
        assert_eq!(output_value(&ct, &evm(0xc)), Some(30));
        assert!(!ct.updates.contains_key(&zero));
    }

    fn output_value(ct: &CondensedTransaction, address: &UniversalAddress) -> Option<u64> {
        let vout = *ct.vout_numbers.get(address)?;
        Some(ct.transaction.as_ref()?.outputs[vout as usize].value)
    }

    #[test]
    fn refund_that_cannot_fit_is_an_error_not_a_loss() {
        let mut world = WorldState::new();
        let config = BridgeConfig {
            max_contract_vouts: 0,
            ..Default::default()
        };
        let engine = ScriptedEngine {
            output: Some(EngineOutput::failed(ExecStatus::CodeError, 10)),
            write: Some((H256::repeat_byte(0x5e), vec![1])),
            ..Default::default()
        };
        let mut exec = ContractExecutor::new(&mut world, engine, ScriptedEngine::default(), config);
        let c = call(VersionVm::evm_default(), 50, 100_000);

        let err = exec
            .execute(&c, &ExecutionEnvironment::default(), true)
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::RefundOverflow {
                required: 1,
                limit: 0
            }
        ));
        assert_eq!(exec.remaining_gas(), BridgeConfig::default().block_gas_limit);
        assert_eq!(world.state.get(H256::repeat_byte(0x5e)), None);
        assert!(world.backing.pending().is_empty());
    }

    #[test]
    fn overflowing_transfers_are_refunded() {
        let mut world = WorldState::new();
        let config = BridgeConfig {
            max_contract_vouts: 2,
            ..Default::default()
        };
        let spread = (1..=3u8)
            .map(|b| Transfer::new(evm(0xc), evm(0x10 + b), 10))
            .collect();
        let engine = ScriptedEngine::returning(success(5, spread));
        let mut exec = ContractExecutor::new(&mut world, engine, ScriptedEngine::default(), config);
        let c = call(VersionVm::evm_default(), 30, 1_000);

        let receipt = exec.execute(&c, &ExecutionEnvironment::default(), true).unwrap();
        assert!(receipt.vout_overflow);
        assert!(!receipt.succeeded());
        let tx = receipt.condensed.transaction.unwrap();
        assert_eq!(tx.outputs, vec![TxOut::new(30, Script::p2pkh(&[0x5; 20]))]);

        assert_eq!(world.state.get(H256::repeat_byte(0x5e)), None);
        assert!(world.backing.pending().is_empty());
    }
}
