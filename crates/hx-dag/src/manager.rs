//! The DAG manager.
//!
//! Two locks guard the manager: `inner` protects all DAG state, and the
//! outer `order_mutex` spans insertion plus gossip so two blocks accepted
//! by the same thread are gossiped in acceptance order.

use crate::{
    graph::{Dag, PivotTree},
    sortition_params::SortitionParamsManager,
    DagBlockGossiper, DagError,
};
use hx_final_chain::{StateApi, StateApiError};
use hx_storage::{DbBatch, DbStorage};
use hx_transaction_pool::TransactionPool;
use parking_lot::{Mutex, RwLock};
use shared_bus::{EventBus, NodeEvent};
use shared_types::{
    BlockHash, DagBlock, DagConfig, Level, PbftPeriod, Transaction, TrxHash, B256, NULL_BLOCK_HASH,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of stateless + stateful DAG block verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyBlockStatus {
    Verified,
    /// A referenced transaction is not known anywhere yet.
    MissingTransaction,
    /// Too many tips or duplicated tips/pivot.
    FailedTipsVerification,
    /// Proposal period for the block's level is not known yet.
    AheadBlock,
    /// Below the expiry horizon.
    ExpiredBlock,
    FailedVdfVerification,
    /// Proposer holds no DPoS eligibility at the proposal period.
    NotEligible,
    /// Proposal period is ahead of the executed state.
    FutureBlock,
    /// Declared gas estimation does not match re-estimation.
    IncorrectTransactionsEstimation,
    /// Gas estimation over the DAG or PBFT budget.
    BlockTooBig,
    /// A tip needed for the gas extension check is unavailable.
    MissingTip,
}

/// The pair a proposer builds on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DagFrontier {
    pub pivot: BlockHash,
    pub tips: Vec<BlockHash>,
}

struct DagInner {
    pivot_tree: PivotTree,
    total_dag: Dag,
    /// Arena of known non-finalized blocks plus the current anchor.
    blocks: HashMap<BlockHash, DagBlock>,
    non_finalized: BTreeMap<Level, HashSet<BlockHash>>,
    anchor: BlockHash,
    old_anchor: BlockHash,
    period: PbftPeriod,
    dag_expiry_level: Level,
    max_level: Level,
    frontier: DagFrontier,
}

pub struct DagManager {
    genesis_block: DagBlock,
    config: DagConfig,
    pbft_gas_limit: u64,
    db: Arc<DbStorage>,
    pool: Arc<TransactionPool>,
    state: Arc<dyn StateApi>,
    bus: Arc<EventBus>,
    sortition_params: SortitionParamsManager,
    network: RwLock<Option<Arc<dyn DagBlockGossiper>>>,
    inner: RwLock<DagInner>,
    /// Serializes insert+gossip so gossip order equals acceptance order.
    order_mutex: Mutex<()>,
}

impl DagManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        genesis_block: DagBlock,
        config: DagConfig,
        pbft_gas_limit: u64,
        sortition_params: SortitionParamsManager,
        db: Arc<DbStorage>,
        pool: Arc<TransactionPool>,
        state: Arc<dyn StateApi>,
        bus: Arc<EventBus>,
    ) -> Result<Arc<Self>, DagError> {
        let genesis_hash = genesis_block.hash();
        let inner = DagInner {
            pivot_tree: PivotTree::new(genesis_hash),
            total_dag: Dag::new(genesis_hash),
            blocks: HashMap::from([(genesis_hash, genesis_block.clone())]),
            non_finalized: BTreeMap::new(),
            anchor: genesis_hash,
            old_anchor: NULL_BLOCK_HASH,
            period: 0,
            dag_expiry_level: 0,
            max_level: 0,
            frontier: DagFrontier {
                pivot: genesis_hash,
                tips: vec![],
            },
        };

        let manager = Arc::new(Self {
            genesis_block,
            config,
            pbft_gas_limit,
            db,
            pool,
            state,
            bus,
            sortition_params,
            network: RwLock::new(None),
            inner: RwLock::new(inner),
            order_mutex: Mutex::new(()),
        });

        // Seed the level → proposal-period map on first start.
        if manager
            .db
            .proposal_period_for_level(manager.config.max_levels_per_period)?
            .is_none()
        {
            manager
                .db
                .save_proposal_period_level(manager.config.max_levels_per_period, 0)?;
        }
        manager.recover_dag()?;
        Ok(manager)
    }

    /// Inject the network handle; constructed last, see module docs.
    pub fn set_network(&self, network: Arc<dyn DagBlockGossiper>) {
        *self.network.write() = Some(network);
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis_block.hash()
    }

    pub fn period(&self) -> PbftPeriod {
        self.inner.read().period
    }

    pub fn anchor(&self) -> BlockHash {
        self.inner.read().anchor
    }

    pub fn dag_expiry_level(&self) -> Level {
        self.inner.read().dag_expiry_level
    }

    pub fn max_level(&self) -> Level {
        self.inner.read().max_level
    }

    /// `(vertices, edges)` of the in-memory (non-finalized) DAG.
    pub fn dag_size(&self) -> (usize, u64) {
        let inner = self.inner.read();
        (inner.total_dag.num_vertices(), inner.total_dag.num_edges())
    }

    /// Total finalized counters from storage.
    pub fn finalized_counts(&self) -> (u64, u64) {
        (
            self.db.dag_blocks_count().unwrap_or(0),
            self.db.dag_edges_count().unwrap_or(0),
        )
    }

    pub fn get_dag_frontier(&self) -> DagFrontier {
        self.inner.read().frontier.clone()
    }

    /// `(pivot, tips)` the proposer should build on.
    pub fn get_latest_pivot_and_tips(&self) -> DagFrontier {
        self.get_dag_frontier()
    }

    pub fn get_ghost_path(&self, source: &BlockHash) -> Vec<BlockHash> {
        if *source == NULL_BLOCK_HASH {
            return vec![];
        }
        self.inner.read().pivot_tree.ghost_path(source)
    }

    pub fn is_block_known(&self, hash: &BlockHash) -> bool {
        if self.inner.read().blocks.contains_key(hash) {
            return true;
        }
        self.db.dag_block_in_db(hash).unwrap_or(false)
    }

    pub fn get_dag_block(&self, hash: &BlockHash) -> Option<DagBlock> {
        if let Some(block) = self.inner.read().blocks.get(hash) {
            return Some(block.clone());
        }
        if *hash == self.genesis_block.hash() {
            return Some(self.genesis_block.clone());
        }
        self.db.dag_block(hash).ok().flatten()
    }

    /// Non-finalized block hashes per level (for sync requests).
    pub fn get_non_finalized_blocks(&self) -> (PbftPeriod, BTreeMap<Level, Vec<BlockHash>>) {
        let inner = self.inner.read();
        let levels = inner
            .non_finalized
            .iter()
            .map(|(level, hashes)| {
                let mut sorted: Vec<BlockHash> = hashes.iter().copied().collect();
                sorted.sort();
                (*level, sorted)
            })
            .collect();
        (inner.period, levels)
    }

    /// Non-finalized blocks the requester does not know, with their
    /// transactions (for the DAG sync server side).
    pub fn get_non_finalized_blocks_with_transactions(
        &self,
        known_hashes: &HashSet<BlockHash>,
    ) -> (PbftPeriod, Vec<DagBlock>, Vec<Transaction>) {
        let inner = self.inner.read();
        let mut blocks = Vec::new();
        for hashes in inner.non_finalized.values() {
            let mut level_blocks: Vec<&DagBlock> = hashes
                .iter()
                .filter(|h| !known_hashes.contains(*h))
                .filter_map(|h| inner.blocks.get(h))
                .collect();
            level_blocks.sort_by_key(|b| b.hash());
            blocks.extend(level_blocks.into_iter().cloned());
        }
        drop(inner);

        let mut seen_trxs = HashSet::new();
        let mut trx_hashes = Vec::new();
        for block in &blocks {
            for trx in block.trxs() {
                if seen_trxs.insert(*trx) {
                    trx_hashes.push(*trx);
                }
            }
        }
        let trxs = self
            .pool
            .resolve_block_transactions(&trx_hashes)
            .unwrap_or_else(|| {
                warn!("non-finalized dag block with unresolvable transactions");
                vec![]
            });
        let period = self.inner.read().period;
        (period, blocks, trxs)
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Insert a verified block. `save = false` replays already-persisted
    /// blocks during recovery.
    pub fn add_dag_block(
        &self,
        block: DagBlock,
        trxs: Vec<Transaction>,
        proposed: bool,
        save: bool,
    ) -> Result<(), DagError> {
        let hash = block.hash();
        let _order_guard = self.order_mutex.lock();
        {
            let mut inner = self.inner.write();
            if save && self.db.dag_block_in_db(&hash)? {
                // Two peers handed us the same block concurrently.
                return Ok(());
            }
            if block.level() < inner.dag_expiry_level {
                return Err(DagError::Expired {
                    level: block.level(),
                    expiry: inner.dag_expiry_level,
                });
            }

            self.check_pivot_and_tips(&inner, &block)?;

            if save {
                self.pool.save_transactions_from_dag_block(&trxs);
                let mut batch = DbBatch::new();
                batch.put_dag_block(&block);
                let mut level_hashes: Vec<BlockHash> = inner
                    .non_finalized
                    .get(&block.level())
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default();
                level_hashes.push(hash);
                level_hashes.sort();
                batch.put_level_index(block.level(), &level_hashes);
                self.db.commit(batch)?;
                self.db
                    .add_dag_counts(1, 1 + block.tips().len() as u64)?;
            }

            self.insert_into_graphs(&mut inner, &block);
            inner.max_level = inner.max_level.max(block.level());
            Self::update_frontier(&mut inner);
            debug!(%hash, level = block.level(), "dag block inserted");
        }

        if save {
            self.bus.publish(NodeEvent::DagBlockAdded {
                block_hash: hash,
                level: block.level(),
            });
            let network = self.network.read().clone();
            if let Some(network) = network {
                network.gossip_dag_block(&block, &trxs, proposed);
            }
        }
        Ok(())
    }

    fn check_pivot_and_tips(&self, inner: &DagInner, block: &DagBlock) -> Result<(), DagError> {
        let mut missing = Vec::new();
        let mut expected_level = 0;
        for parent in block.parents() {
            match self.level_of(inner, &parent) {
                Some(level) => expected_level = expected_level.max(level + 1),
                None => missing.push(parent),
            }
        }
        if !missing.is_empty() {
            return Err(DagError::MissingTipsOrPivot(missing));
        }
        if expected_level != block.level() {
            return Err(DagError::LevelMismatch {
                declared: block.level(),
                expected: expected_level,
            });
        }
        Ok(())
    }

    fn level_of(&self, inner: &DagInner, hash: &BlockHash) -> Option<Level> {
        if let Some(block) = inner.blocks.get(hash) {
            return Some(block.level());
        }
        if *hash == self.genesis_block.hash() {
            return Some(0);
        }
        // Finalized parents (the anchor after a reset, or older finalized
        // blocks referenced across a commit) live in storage.
        self.db.dag_block(hash).ok().flatten().map(|b| b.level())
    }

    fn insert_into_graphs(&self, inner: &mut DagInner, block: &DagBlock) {
        let hash = block.hash();
        inner.total_dag.add_vertex(hash, &block.parents());
        inner.pivot_tree.add_vertex(hash, &block.pivot());
        if !inner
            .non_finalized
            .entry(block.level())
            .or_default()
            .insert(hash)
        {
            error!(%hash, "duplicate insertion into non-finalized dag");
        }
        inner.blocks.insert(hash, block.clone());
    }

    fn update_frontier(inner: &mut DagInner) {
        let ghost = inner.pivot_tree.ghost_path(&inner.anchor);
        let Some(pivot) = ghost.last().copied() else {
            return;
        };
        let mut tips = inner.total_dag.leaves();
        tips.retain(|t| *t != pivot);
        inner.frontier = DagFrontier { pivot, tips };
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Full stateless + stateful verification. On success returns the
    /// block's resolved transactions.
    pub fn verify_block(
        &self,
        block: &DagBlock,
        candidate_trxs: &HashMap<TrxHash, Transaction>,
    ) -> (VerifyBlockStatus, Vec<Transaction>) {
        let hash = block.hash();

        if block.tips().len() > self.config.max_tips {
            warn!(%hash, tips = block.tips().len(), "tips over limit");
            return (VerifyBlockStatus::FailedTipsVerification, vec![]);
        }
        let mut unique = HashSet::from([block.pivot()]);
        for tip in block.tips() {
            if !unique.insert(*tip) {
                warn!(%hash, %tip, "duplicate tip");
                return (VerifyBlockStatus::FailedTipsVerification, vec![]);
            }
        }

        let Ok(sender) = block.sender() else {
            return (VerifyBlockStatus::NotEligible, vec![]);
        };

        let proposal_period = match self.db.proposal_period_for_level(block.level()) {
            Ok(Some(period)) => period,
            Ok(None) => {
                // Our period map lags this block's level; retry after sync.
                debug!(%hash, level = block.level(), "no proposal period known yet");
                return (VerifyBlockStatus::AheadBlock, vec![]);
            }
            Err(_) => return (VerifyBlockStatus::AheadBlock, vec![]),
        };

        // Resolve the payload: prefer the candidates bundled with the block.
        let mut trxs = Vec::with_capacity(block.trxs().len());
        let mut to_query = Vec::new();
        for trx_hash in block.trxs() {
            match candidate_trxs.get(trx_hash) {
                Some(trx) => trxs.push(trx.clone()),
                None => to_query.push(*trx_hash),
            }
        }
        match self.pool.resolve_block_transactions(&to_query) {
            Some(found) => trxs.extend(found),
            None => {
                debug!(%hash, "missing transactions");
                return (VerifyBlockStatus::MissingTransaction, vec![]);
            }
        }

        if block.level() < self.dag_expiry_level() {
            return (VerifyBlockStatus::ExpiredBlock, vec![]);
        }

        let vrf_key = match self.state.dpos_vrf_key(proposal_period, &sender) {
            Ok(Some(key)) => key,
            Ok(None) => {
                warn!(%hash, %sender, "sender has no registered vrf key");
                return (VerifyBlockStatus::FailedVdfVerification, vec![]);
            }
            Err(StateApiError::FutureBlock { .. }) => {
                return (VerifyBlockStatus::FutureBlock, vec![])
            }
            Err(_) => return (VerifyBlockStatus::FailedVdfVerification, vec![]),
        };
        let (vote_count, total_count) = match (
            self.state.dpos_eligible_vote_count(proposal_period, &sender),
            self.state.dpos_eligible_total_vote_count(proposal_period),
        ) {
            (Ok(votes), Ok(total)) => (votes, total),
            (Err(StateApiError::FutureBlock { .. }), _)
            | (_, Err(StateApiError::FutureBlock { .. })) => {
                return (VerifyBlockStatus::FutureBlock, vec![])
            }
            _ => return (VerifyBlockStatus::FailedVdfVerification, vec![]),
        };

        let period_hash = self
            .db
            .pbft_block_hash_for_period(proposal_period)
            .ok()
            .flatten()
            .unwrap_or(B256::ZERO);
        let params = self.sortition_params.params_for_period(proposal_period);
        if let Err(err) =
            block.verify_vdf(&params, &period_hash, &vrf_key, vote_count, total_count)
        {
            warn!(%hash, %err, "vdf verification failed");
            return (VerifyBlockStatus::FailedVdfVerification, vec![]);
        }

        match self.state.dpos_is_eligible(proposal_period, &sender) {
            Ok(true) => {}
            Ok(false) => {
                warn!(%hash, %sender, proposal_period, "proposer not dpos-eligible");
                return (VerifyBlockStatus::NotEligible, vec![]);
            }
            Err(StateApiError::FutureBlock { .. }) => {
                return (VerifyBlockStatus::FutureBlock, vec![])
            }
            Err(_) => return (VerifyBlockStatus::NotEligible, vec![]),
        }

        // Gas estimation must match and fit the budgets.
        let mut estimation: u64 = 0;
        for trx in &trxs {
            estimation = estimation.saturating_add(
                self.pool
                    .estimate_transaction_gas(trx, proposal_period)
                    .unwrap_or(0),
            );
        }
        if estimation != block.gas_estimation() {
            warn!(
                %hash,
                declared = block.gas_estimation(),
                estimation,
                "gas estimation mismatch"
            );
            return (VerifyBlockStatus::IncorrectTransactionsEstimation, vec![]);
        }
        if estimation > self.config.gas_limit {
            return (VerifyBlockStatus::BlockTooBig, vec![]);
        }

        // With many tips the combined estimation must fit the PBFT budget.
        if (block.tips().len() as u64 + 1) > self.pbft_gas_limit / self.config.gas_limit {
            let mut combined = block.gas_estimation();
            for tip in block.tips() {
                let Some(tip_block) = self.get_dag_block(tip) else {
                    return (VerifyBlockStatus::MissingTip, vec![]);
                };
                combined = combined.saturating_add(tip_block.gas_estimation());
            }
            if combined > self.pbft_gas_limit {
                return (VerifyBlockStatus::BlockTooBig, vec![]);
            }
        }

        (VerifyBlockStatus::Verified, trxs)
    }

    // =========================================================================
    // Anchor ordering
    // =========================================================================

    /// Deterministic order of all non-finalized blocks reachable from
    /// `anchor`: ascending `(level, hash)`. Idempotent for a fixed DAG
    /// state. Empty when the guards fail.
    pub fn get_dag_block_order(&self, anchor: &BlockHash, period: PbftPeriod) -> Vec<BlockHash> {
        let inner = self.inner.read();
        if period != inner.period + 1 {
            warn!(period, expected = inner.period + 1, "order query for wrong period");
            return vec![];
        }
        if inner.anchor == *anchor {
            warn!(%anchor, "order query from anchor to itself");
            return vec![];
        }
        let reachable = inner.total_dag.ancestors(anchor);
        if reachable.is_empty() {
            error!(%anchor, "order query for unknown anchor");
            return vec![];
        }

        let mut order = Vec::new();
        for (_, hashes) in inner.non_finalized.iter() {
            let mut level_hashes: Vec<BlockHash> = hashes
                .iter()
                .filter(|h| reachable.contains(*h))
                .copied()
                .collect();
            level_hashes.sort();
            order.extend(level_hashes);
        }
        order
    }

    /// Commit an anchor: re-root the DAG, expire stragglers, return the
    /// number of finalized blocks.
    pub fn set_dag_block_order(
        &self,
        new_anchor: &BlockHash,
        period: PbftPeriod,
        dag_order: &[BlockHash],
    ) -> Result<usize, DagError> {
        let _order_guard = self.order_mutex.lock();
        let mut inner = self.inner.write();

        if period != inner.period + 1 {
            warn!(
                period,
                current = inner.period,
                "anchor commit with non-consecutive period"
            );
            return Ok(0);
        }

        if *new_anchor == NULL_BLOCK_HASH {
            inner.period = period;
            info!(period, "null anchor: period advanced without finalization");
            return Ok(0);
        }

        let order_set: HashSet<BlockHash> = dag_order.iter().copied().collect();
        debug_assert!(order_set.contains(new_anchor));

        // Counter updates for blocks arriving via sync (never in memory).
        let in_memory: HashSet<BlockHash> = inner
            .non_finalized
            .values()
            .flatten()
            .copied()
            .collect();
        let mut synced_blocks = 0u64;
        let mut synced_edges = 0u64;
        for hash in dag_order {
            if !in_memory.contains(hash) {
                if let Some(block) = self.get_dag_block_with(&inner, hash) {
                    synced_blocks += 1;
                    synced_edges += 1 + block.tips().len() as u64;
                }
            }
        }
        if synced_blocks > 0 {
            self.db.add_dag_counts(synced_blocks, synced_edges)?;
        }

        let anchor_block = self
            .get_dag_block_with(&inner, new_anchor)
            .ok_or_else(|| DagError::MissingTipsOrPivot(vec![*new_anchor]))?;
        let anchor_level = anchor_block.level();

        // Re-seed both graphs at the new anchor.
        inner.total_dag.reset(*new_anchor);
        inner.pivot_tree.reset(*new_anchor);
        let old_non_finalized = std::mem::take(&mut inner.non_finalized);
        let mut old_blocks = std::mem::take(&mut inner.blocks);
        inner.blocks.insert(*new_anchor, anchor_block);

        if anchor_level > self.config.dag_expiry_limit {
            inner.dag_expiry_level = anchor_level - self.config.dag_expiry_limit;
        }

        let mut batch = DbBatch::new();
        let mut expired: HashMap<BlockHash, DagBlock> = HashMap::new();
        for (level, hashes) in &old_non_finalized {
            let mut survivors: Vec<BlockHash> = Vec::new();
            for hash in hashes {
                if order_set.contains(hash) {
                    // Finalized now; the period data batch owns persistence.
                    old_blocks.remove(hash);
                    continue;
                }
                let Some(block) = old_blocks.remove(hash) else {
                    continue;
                };
                if self.block_not_expired(&inner, &block, &expired) {
                    self.insert_into_graphs(&mut inner, &block);
                    survivors.push(*hash);
                } else {
                    batch.delete_dag_block(hash);
                    expired.insert(*hash, block);
                }
            }
            survivors.sort();
            batch.put_level_index(*level, &survivors);
        }
        // Window for the next period's proposals.
        batch.put_proposal_period_level(
            anchor_level + self.config.max_levels_per_period,
            period + 1,
        );
        self.db.commit(batch)?;

        // Return expired payloads to the pool (refcounted per block).
        for block in expired.values() {
            let trxs: HashSet<TrxHash> = block.trxs().iter().copied().collect();
            self.pool.remove_non_finalized_transactions(&trxs);
        }

        inner.old_anchor = inner.anchor;
        inner.anchor = *new_anchor;
        inner.period = period;
        Self::update_frontier(&mut inner);

        info!(
            period,
            anchor = %new_anchor,
            finalized = order_set.len(),
            expired = expired.len(),
            "anchor committed"
        );
        drop(inner);

        self.bus.publish(NodeEvent::DagPeriodCommitted {
            period,
            anchor: *new_anchor,
            finalized_count: order_set.len(),
        });
        Ok(order_set.len())
    }

    fn get_dag_block_with(&self, inner: &DagInner, hash: &BlockHash) -> Option<DagBlock> {
        if let Some(block) = inner.blocks.get(hash) {
            return Some(block.clone());
        }
        if *hash == self.genesis_block.hash() {
            return Some(self.genesis_block.clone());
        }
        self.db.dag_block(hash).ok().flatten()
    }

    /// A straggler survives the commit iff it is above the expiry horizon
    /// and none of its parents were just expired.
    fn block_not_expired(
        &self,
        inner: &DagInner,
        block: &DagBlock,
        expired: &HashMap<BlockHash, DagBlock>,
    ) -> bool {
        if block.level() < inner.dag_expiry_level {
            return false;
        }
        !block.parents().iter().any(|p| expired.contains_key(p))
    }

    // =========================================================================
    // Recovery & pruning
    // =========================================================================

    fn recover_dag(&self) -> Result<(), DagError> {
        if let Some(head) = self.db.pbft_head()? {
            {
                let mut inner = self.inner.write();
                inner.period = head.period;
            }
            // Walk back to the most recent non-null anchor.
            let mut period = head.period;
            loop {
                let Some(data) = self.db.period_data(period)? else {
                    break;
                };
                let anchor = data.pbft_block.pivot_dag_block_hash();
                if anchor != NULL_BLOCK_HASH {
                    let anchor_block = self
                        .db
                        .dag_block(&anchor)?
                        .ok_or_else(|| DagError::MissingTipsOrPivot(vec![anchor]))?;
                    let mut inner = self.inner.write();
                    inner.total_dag.reset(anchor);
                    inner.pivot_tree.reset(anchor);
                    inner.blocks.clear();
                    inner.blocks.insert(anchor, anchor_block.clone());
                    inner.anchor = anchor;
                    if anchor_block.level() > self.config.dag_expiry_limit {
                        inner.dag_expiry_level =
                            anchor_block.level() - self.config.dag_expiry_limit;
                    }
                    Self::update_frontier(&mut inner);
                    info!(%anchor, period, "recovered anchor");
                    break;
                }
                if period == 0 {
                    break;
                }
                period -= 1;
            }
        }

        // Replay persisted non-finalized blocks in level order.
        for (level, blocks) in self.db.non_finalized_dag_blocks()? {
            for block in blocks {
                let hash = block.hash();
                if let Err(err) = self.add_dag_block(block, vec![], false, false) {
                    warn!(%hash, level, %err, "dropping unrecoverable dag block");
                    self.db.remove_dag_block(&hash)?;
                }
            }
        }
        Ok(())
    }

    /// Light-node pruning after an anchor commit.
    pub fn clear_light_node_history(&self, light_node_history: u64) -> Result<(), DagError> {
        let (period, expiry_level) = {
            let inner = self.inner.read();
            (inner.period, inner.dag_expiry_level)
        };
        let mlpp = self.config.max_levels_per_period;
        // Both guards are load-bearing: pruning may never touch levels a
        // proposal period still references.
        if period <= light_node_history || expiry_level <= mlpp + 1 {
            return Ok(());
        }
        let Some(proposal_period) = self
            .db
            .proposal_period_for_level(expiry_level - mlpp - 1)?
        else {
            return Ok(());
        };
        let end = (period - light_node_history).min(proposal_period);
        let dag_level_to_keep = 1.max(expiry_level.saturating_sub(mlpp));
        self.db.clear_period_data_history(end, dag_level_to_keep)?;
        Ok(())
    }
}
