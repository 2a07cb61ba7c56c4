//! # Transaction Pool
//!
//! Holds not-yet-included signed transactions behind three indices:
//!
//! - `by_hash`: O(1) dedup and lookup
//! - `by_sender`: nonce-ordered transactions per account
//! - `by_price`: gas-price-ordered selection for proposers
//!
//! Transactions included in a DAG block leave the pool for the
//! non-finalized index, where they are held (reference-counted) until the
//! block is finalized or expires; expired blocks return their transactions
//! to the pool unless another live block still references them.

pub mod gas_pricer;

pub use gas_pricer::GasPricer;

use hx_final_chain::{StateApi, StateApiError};
use hx_storage::DbStorage;
use parking_lot::RwLock;
use shared_bus::{EventBus, NodeEvent};
use shared_types::{Address, PbftPeriod, Transaction, TrxHash, U256};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Why a transaction was refused admission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InsertError {
    #[error("nonce {nonce} already executed for sender")]
    Stale { nonce: u64 },

    #[error("transaction already known")]
    Duplicate,

    #[error("balance below transaction cost")]
    InsufficientBalance,

    #[error("gas price below pool bid")]
    GasPriceTooLow,

    #[error("wrong chain id {got}, expected {expected}")]
    InvalidChainId { got: u64, expected: u64 },

    #[error("signature does not recover")]
    InvalidSignature,

    #[error("gas limit over per-transaction cap")]
    OverflowGasLimit,
}

/// Pool limits and identity checks.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub chain_id: u64,
    pub max_transaction_gas: u64,
    pub max_pool_size: usize,
    pub minimum_gas_price: U256,
    pub gas_price_window: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            chain_id: 842,
            max_transaction_gas: 31_500_000,
            max_pool_size: 200_000,
            minimum_gas_price: U256::from(1u64),
            gas_price_window: 200,
        }
    }
}

/// Entry of the price index: best transaction first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PricedEntry {
    price: Reverse<U256>,
    nonce: u64,
    hash: TrxHash,
}

#[derive(Debug, Default)]
struct PoolInner {
    by_hash: HashMap<TrxHash, Transaction>,
    by_sender: HashMap<Address, BTreeMap<u64, TrxHash>>,
    by_price: BTreeSet<PricedEntry>,
    /// Transactions attached to non-finalized DAG blocks, with the number
    /// of live blocks referencing each.
    non_finalized: HashMap<TrxHash, (Transaction, usize)>,
}

impl PoolInner {
    fn insert(&mut self, trx: Transaction, sender: Address) {
        let hash = trx.hash();
        self.by_price.insert(PricedEntry {
            price: Reverse(trx.gas_price()),
            nonce: trx.nonce(),
            hash,
        });
        self.by_sender.entry(sender).or_default().insert(trx.nonce(), hash);
        self.by_hash.insert(hash, trx);
    }

    fn remove(&mut self, hash: &TrxHash) -> Option<Transaction> {
        let trx = self.by_hash.remove(hash)?;
        self.by_price.remove(&PricedEntry {
            price: Reverse(trx.gas_price()),
            nonce: trx.nonce(),
            hash: *hash,
        });
        if let Ok(sender) = trx.sender() {
            if let Some(nonces) = self.by_sender.get_mut(&sender) {
                nonces.remove(&trx.nonce());
                if nonces.is_empty() {
                    self.by_sender.remove(&sender);
                }
            }
        }
        Some(trx)
    }
}

pub struct TransactionPool {
    config: PoolConfig,
    state: Arc<dyn StateApi>,
    db: Arc<DbStorage>,
    bus: Arc<EventBus>,
    gas_pricer: GasPricer,
    inner: RwLock<PoolInner>,
}

impl TransactionPool {
    pub fn new(
        config: PoolConfig,
        state: Arc<dyn StateApi>,
        db: Arc<DbStorage>,
        bus: Arc<EventBus>,
    ) -> Self {
        let gas_pricer = GasPricer::new(config.minimum_gas_price, config.gas_price_window);
        Self {
            config,
            state,
            db,
            bus,
            gas_pricer,
            inner: RwLock::new(PoolInner::default()),
        }
    }

    pub fn gas_pricer(&self) -> &GasPricer {
        &self.gas_pricer
    }

    /// Admit one transaction. On success the `TransactionAdded` event fires.
    pub fn insert_transaction(&self, trx: Transaction) -> Result<(), InsertError> {
        if trx.chain_id() != self.config.chain_id {
            return Err(InsertError::InvalidChainId {
                got: trx.chain_id(),
                expected: self.config.chain_id,
            });
        }
        if trx.gas() > self.config.max_transaction_gas {
            return Err(InsertError::OverflowGasLimit);
        }
        let sender = trx.sender().map_err(|_| InsertError::InvalidSignature)?;
        if trx.gas_price() < self.gas_pricer.bid() {
            return Err(InsertError::GasPriceTooLow);
        }

        let hash = trx.hash();
        {
            let inner = self.inner.read();
            if inner.by_hash.contains_key(&hash) || inner.non_finalized.contains_key(&hash) {
                return Err(InsertError::Duplicate);
            }
        }
        if self.db.transaction_period(&hash).ok().flatten().is_some() {
            return Err(InsertError::Duplicate);
        }

        let period = self.state.last_block_number();
        let executed_nonce = match self.state.nonce(period, &sender) {
            Ok(nonce) => nonce,
            Err(StateApiError::FutureBlock { .. }) => 0,
            Err(_) => 0,
        };
        if trx.nonce() < executed_nonce {
            return Err(InsertError::Stale { nonce: trx.nonce() });
        }
        let balance = self.state.balance(period, &sender).unwrap_or(U256::ZERO);
        if trx.cost() > balance {
            return Err(InsertError::InsufficientBalance);
        }

        let mut inner = self.inner.write();
        if inner.by_hash.contains_key(&hash) {
            return Err(InsertError::Duplicate);
        }
        inner.insert(trx, sender);
        drop(inner);

        trace!(%hash, "transaction admitted");
        self.bus.publish(NodeEvent::TransactionAdded { trx_hash: hash });
        Ok(())
    }

    /// Poolable transactions ordered `(gas_price desc, nonce asc)`.
    pub fn get_pool_transactions(&self) -> Vec<Transaction> {
        let inner = self.inner.read();
        inner
            .by_price
            .iter()
            .filter_map(|entry| inner.by_hash.get(&entry.hash).cloned())
            .collect()
    }

    /// Every transaction currently held: pool plus non-finalized index.
    pub fn get_all_pool_trxs(&self) -> Vec<Transaction> {
        let inner = self.inner.read();
        inner
            .by_hash
            .values()
            .cloned()
            .chain(inner.non_finalized.values().map(|(trx, _)| trx.clone()))
            .collect()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.read().by_hash.len()
    }

    pub fn size_over_limit(&self) -> bool {
        self.pool_size() > self.config.max_pool_size
    }

    pub fn contains(&self, hash: &TrxHash) -> bool {
        let inner = self.inner.read();
        inner.by_hash.contains_key(hash) || inner.non_finalized.contains_key(hash)
    }

    /// A DAG block carrying these transactions entered the DAG: move them
    /// from the pool into the non-finalized index and persist them.
    pub fn save_transactions_from_dag_block(&self, trxs: &[Transaction]) {
        let mut inner = self.inner.write();
        for trx in trxs {
            let hash = trx.hash();
            inner.remove(&hash);
            let entry = inner
                .non_finalized
                .entry(hash)
                .or_insert_with(|| (trx.clone(), 0));
            entry.1 += 1;
            // Persist so sync can serve the block's payload later.
            if let Err(err) = self.db.save_transaction(trx) {
                debug!(%hash, %err, "failed to persist dag block transaction");
            }
        }
    }

    /// Blocks referencing these transactions expired: drop one reference
    /// each and return still-unfinalized orphans to the pool.
    pub fn remove_non_finalized_transactions(&self, hashes: &HashSet<TrxHash>) {
        let mut to_reinsert = Vec::new();
        {
            let mut inner = self.inner.write();
            for hash in hashes {
                let Some((trx, refs)) = inner.non_finalized.get_mut(hash) else {
                    continue;
                };
                *refs = refs.saturating_sub(1);
                if *refs == 0 {
                    let trx = trx.clone();
                    inner.non_finalized.remove(hash);
                    to_reinsert.push(trx);
                }
            }
        }
        for trx in to_reinsert {
            let finalized = self
                .db
                .transaction_period(&trx.hash())
                .ok()
                .flatten()
                .is_some();
            if !finalized {
                // Ignore admission failures; a stale nonce by now is fine.
                let _ = self.insert_transaction(trx);
            }
        }
    }

    /// Finalization of a period: referenced transactions leave the pool and
    /// the non-finalized index for good, and their prices feed the pricer.
    pub fn mark_transactions_finalized(&self, trxs: &[Transaction]) {
        let mut inner = self.inner.write();
        for trx in trxs {
            let hash = trx.hash();
            inner.remove(&hash);
            inner.non_finalized.remove(&hash);
        }
        drop(inner);
        self.gas_pricer
            .on_finalized(trxs.iter().map(|t| t.gas_price()));
    }

    /// Of the given hashes, those available in the pool or attached to a
    /// non-finalized DAG block.
    pub fn get_nonfinalized_trxs(&self, hashes: &[TrxHash]) -> Vec<Transaction> {
        let inner = self.inner.read();
        hashes
            .iter()
            .filter_map(|hash| {
                inner
                    .by_hash
                    .get(hash)
                    .cloned()
                    .or_else(|| inner.non_finalized.get(hash).map(|(trx, _)| trx.clone()))
            })
            .collect()
    }

    /// Resolve a DAG block's transaction hashes from every known source
    /// (pool, non-finalized index, finalized storage). `None` when any hash
    /// is unknown.
    pub fn resolve_block_transactions(&self, hashes: &[TrxHash]) -> Option<Vec<Transaction>> {
        let mut result = Vec::with_capacity(hashes.len());
        let inner = self.inner.read();
        for hash in hashes {
            let found = inner
                .by_hash
                .get(hash)
                .cloned()
                .or_else(|| inner.non_finalized.get(hash).map(|(trx, _)| trx.clone()))
                .or_else(|| self.db.transaction(hash).ok().flatten());
            result.push(found?);
        }
        Some(result)
    }

    /// Delegated gas estimation against a period's state.
    pub fn estimate_transaction_gas(
        &self,
        trx: &Transaction,
        period: PbftPeriod,
    ) -> Result<u64, StateApiError> {
        self.state.estimate_gas(trx, period)
    }
}
