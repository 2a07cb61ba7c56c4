//! # Final Chain Bridge
//!
//! The consensus core never interprets EVM bytecode; it talks to an opaque
//! [`StateApi`] that executes finalized periods and answers DPoS queries.
//! This crate defines that port, the Solidity-ABI encoding used to call the
//! DPoS system contract, and an in-memory implementation that covers value
//! transfers, fee accounting, stake bookkeeping and jailing — enough state
//! semantics for every consensus invariant, behind the same trait a full
//! EVM backend would implement.

pub mod abi;
pub mod in_memory;

pub use in_memory::InMemoryState;

use shared_types::{Address, BlockHash, PbftPeriod, Transaction, TrxHash, B256, U256};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StateApiError {
    /// Query against a period that has not been executed yet. Internal
    /// callers back off and retry; RPC callers receive it structured.
    #[error("future block: requested period {requested}, last executed {last}")]
    FutureBlock { requested: PbftPeriod, last: PbftPeriod },

    #[error("execution failed: {0}")]
    Execution(String),
}

pub type StateResult<T> = Result<T, StateApiError>;

/// Basic account record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Account {
    pub balance: U256,
    pub nonce: u64,
}

/// Receipt of one executed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub trx_hash: TrxHash,
    pub status_ok: bool,
    pub gas_used: u64,
}

/// What the consensus layer hands to the executor for one period.
#[derive(Debug, Clone)]
pub struct FinalizationInput {
    pub period: PbftPeriod,
    pub anchor: BlockHash,
    pub dag_order: Vec<BlockHash>,
    pub transactions: Vec<Transaction>,
    pub proposer: Address,
    /// Cert voters of the previous period, rewarded here.
    pub reward_voters: Vec<Address>,
}

/// What execution produced for one period.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub period: PbftPeriod,
    pub state_root: B256,
    pub receipts: Vec<TransactionReceipt>,
    /// Fees credited to the block proposer.
    pub proposer_reward: U256,
}

/// The opaque execution and DPoS query surface.
///
/// All period-parameterized queries answer from the state as of that
/// period and return [`StateApiError::FutureBlock`] when the period has
/// not been executed.
pub trait StateApi: Send + Sync {
    /// Highest executed period.
    fn last_block_number(&self) -> PbftPeriod;

    fn account(&self, period: PbftPeriod, address: &Address) -> StateResult<Option<Account>>;

    fn balance(&self, period: PbftPeriod, address: &Address) -> StateResult<U256> {
        Ok(self.account(period, address)?.unwrap_or_default().balance)
    }

    /// Executed nonce of the sender (next expected nonce).
    fn nonce(&self, period: PbftPeriod, address: &Address) -> StateResult<u64> {
        Ok(self.account(period, address)?.unwrap_or_default().nonce)
    }

    /// Gas a transaction would consume at the given period's state.
    fn estimate_gas(&self, trx: &Transaction, period: PbftPeriod) -> StateResult<u64>;

    /// Eligible vote count of one validator at a period.
    fn dpos_eligible_vote_count(&self, period: PbftPeriod, address: &Address) -> StateResult<u64>;

    /// Total eligible vote count at a period.
    fn dpos_eligible_total_vote_count(&self, period: PbftPeriod) -> StateResult<u64>;

    fn dpos_is_eligible(&self, period: PbftPeriod, address: &Address) -> StateResult<bool>;

    /// Registered VRF key commitment of a validator.
    fn dpos_vrf_key(
        &self,
        period: PbftPeriod,
        address: &Address,
    ) -> StateResult<Option<shared_crypto::vrf::VrfPublicKey>>;

    /// Registered BLS public key of a validator.
    fn dpos_bls_key(
        &self,
        period: PbftPeriod,
        address: &Address,
    ) -> StateResult<Option<shared_types::BlsPkBytes>>;

    /// All validator stakes at a period (for pillar delta computation).
    fn dpos_validators_stakes(&self, period: PbftPeriod) -> StateResult<Vec<(Address, U256)>>;

    /// Execute one finalized period. Must be called with strictly
    /// increasing periods.
    fn execute_period(&self, input: &FinalizationInput) -> StateResult<ExecutionResult>;

    /// State root of an executed period.
    fn state_root(&self, period: PbftPeriod) -> StateResult<B256>;
}
