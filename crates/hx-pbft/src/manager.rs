//! The PBFT consensus driver.
//!
//! A cooperative task stepping one round of the 5-step machine:
//!
//! | step | state            | action |
//! |------|------------------|--------|
//! | 1    | Propose          | propose a block (or carry the previous round's value) and propose-vote it |
//! | 2    | SoftVote         | soft-vote the leader among received proposals |
//! | 3    | CertVotePolling  | cert-vote once 2t+1 soft votes coalesce, bounded by `2λ` |
//! | 4    | ChainPush        | push the block if 2t+1 cert votes are in, else next-vote |
//! | 5..  | NextVotePolling  | poll (and re-vote) until 2t+1 next votes advance the round |
//!
//! Period advancement happens wherever 2t+1 cert votes are observed,
//! including via the period-data sync queue.

use crate::{
    chain::PbftChain, period_data_queue::PeriodDataQueue, proposed_blocks::ProposedBlocks,
    slashing::SlashingManager, vote_manager::{VoteError, VoteManager}, ConsensusGossiper,
    VOTE_RETENTION_PERIODS,
};
use hx_dag::DagManager;
use hx_final_chain::{FinalizationInput, StateApi};
use hx_pillar_chain::PillarChainManager;
use hx_storage::{DbBatch, DbStorage};
use hx_transaction_pool::TransactionPool;
use parking_lot::RwLock;
use shared_bus::{EventBus, NodeEvent};
use shared_crypto::ecdsa::KeyPair;
use shared_crypto::hashing::keccak256;
use shared_types::{
    calculate_order_hash, BlockHash, PbftBlock, PbftConfig, PbftPeriod, PbftRound, PbftStep,
    PeriodData, Transaction, Vote, VoteType, NULL_BLOCK_HASH,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// The five machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PbftState {
    Propose,
    SoftVote,
    CertVotePolling,
    ChainPush,
    NextVotePolling,
}

struct RoundState {
    period: PbftPeriod,
    round: PbftRound,
    step: PbftStep,
    state: PbftState,
    state_started: Instant,
    /// The 2t+1 soft-voted value observed this round.
    soft_voted_value: Option<BlockHash>,
    /// Our cert vote this round, if cast.
    cert_voted_value: Option<BlockHash>,
    proposed_this_round: bool,
    soft_voted_this_round: bool,
    previous_round_next_voted_value: Option<BlockHash>,
    previous_round_next_voted_null: bool,
}

impl RoundState {
    fn new(period: PbftPeriod) -> Self {
        Self {
            period,
            round: 1,
            step: 1,
            state: PbftState::Propose,
            state_started: Instant::now(),
            soft_voted_value: None,
            cert_voted_value: None,
            proposed_this_round: false,
            soft_voted_this_round: false,
            previous_round_next_voted_value: None,
            previous_round_next_voted_null: false,
        }
    }
}

pub struct PbftManager {
    config: PbftConfig,
    node_keys: Arc<KeyPair>,
    chain: Arc<PbftChain>,
    vote_mgr: Arc<VoteManager>,
    dag: Arc<DagManager>,
    pool: Arc<TransactionPool>,
    state: Arc<dyn StateApi>,
    db: Arc<DbStorage>,
    bus: Arc<EventBus>,
    pillar: Arc<PillarChainManager>,
    slashing: Arc<SlashingManager>,
    proposed_blocks: ProposedBlocks,
    period_data_queue: Arc<PeriodDataQueue>,
    network: RwLock<Option<Arc<dyn ConsensusGossiper>>>,
    stopped: AtomicBool,
    round_state: RwLock<RoundState>,
}

impl PbftManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PbftConfig,
        node_keys: Arc<KeyPair>,
        chain: Arc<PbftChain>,
        vote_mgr: Arc<VoteManager>,
        dag: Arc<DagManager>,
        pool: Arc<TransactionPool>,
        state: Arc<dyn StateApi>,
        db: Arc<DbStorage>,
        bus: Arc<EventBus>,
        pillar: Arc<PillarChainManager>,
        slashing: Arc<SlashingManager>,
        period_data_queue: Arc<PeriodDataQueue>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            node_keys,
            chain,
            vote_mgr,
            dag,
            pool,
            state,
            db,
            bus,
            pillar,
            slashing,
            proposed_blocks: ProposedBlocks::new(),
            period_data_queue,
            network: RwLock::new(None),
            stopped: AtomicBool::new(false),
            round_state: RwLock::new(RoundState::new(1)),
        });
        manager.initial_state();
        manager
    }

    pub fn set_network(&self, network: Arc<dyn ConsensusGossiper>) {
        *self.network.write() = Some(network);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn period(&self) -> PbftPeriod {
        self.round_state.read().period
    }

    pub fn round(&self) -> PbftRound {
        self.round_state.read().round
    }

    pub fn step(&self) -> PbftStep {
        self.round_state.read().step
    }

    pub fn pbft_state(&self) -> PbftState {
        self.round_state.read().state
    }

    pub fn period_data_queue(&self) -> &Arc<PeriodDataQueue> {
        &self.period_data_queue
    }

    pub fn proposed_blocks(&self) -> &ProposedBlocks {
        &self.proposed_blocks
    }

    /// Load the recovered chain head into the round state and restore the
    /// reward-vote certificate of the latest block.
    fn initial_state(&self) {
        let head = self.chain.head();
        if head.chain_size > 0 {
            let cert_votes = self.db.cert_votes(&head.last_block_hash).unwrap_or_default();
            self.vote_mgr
                .replace_reward_votes(head.last_block_hash, &cert_votes);
        }
        *self.round_state.write() = RoundState::new(head.period + 1);
        info!(period = head.period + 1, "pbft initial state");
    }

    /// The cooperative driver loop.
    pub async fn run(self: Arc<Self>) {
        info!("pbft state machine running");
        while !self.stopped.load(Ordering::SeqCst) {
            let sleep = self.step_once();
            tokio::time::sleep(sleep).await;
        }
        info!("pbft state machine terminated");
    }

    /// Execute one scheduling slice; returns how long to sleep before the
    /// next one.
    pub fn step_once(&self) -> Duration {
        let lambda = Duration::from_millis(self.config.lambda_ms);

        self.process_period_data_queue();
        // Cert votes may have landed at any time (gossip or sync).
        self.try_push_cert_voted_block();
        self.check_round_advance();

        let state = self.round_state.read().state;
        match state {
            PbftState::Propose => {
                self.state_propose();
                self.transition(PbftState::SoftVote, 2);
                lambda
            }
            PbftState::SoftVote => {
                self.state_soft_vote();
                self.transition(PbftState::CertVotePolling, 3);
                lambda
            }
            PbftState::CertVotePolling => {
                if self.try_cert_vote() {
                    self.transition(PbftState::ChainPush, 4);
                    Duration::ZERO
                } else if self.state_elapsed() > lambda * 2 {
                    debug!(round = self.round(), "certify state expired");
                    self.transition(PbftState::ChainPush, 4);
                    Duration::ZERO
                } else {
                    lambda / 4
                }
            }
            PbftState::ChainPush => {
                if self.try_push_cert_voted_block() {
                    // Period advanced; round state was reset.
                    Duration::ZERO
                } else {
                    self.state_next_vote();
                    self.transition(PbftState::NextVotePolling, 5);
                    lambda / 4
                }
            }
            PbftState::NextVotePolling => {
                if self.try_push_cert_voted_block() {
                    return Duration::ZERO;
                }
                if self.state_elapsed() > lambda {
                    // Re-cast next votes at the following polling step.
                    {
                        let mut rs = self.round_state.write();
                        rs.step += 1;
                        rs.state_started = Instant::now();
                    }
                    self.state_next_vote();
                }
                lambda / 4
            }
        }
    }

    fn transition(&self, state: PbftState, step: PbftStep) {
        let mut rs = self.round_state.write();
        rs.state = state;
        rs.step = step;
        rs.state_started = Instant::now();
    }

    fn state_elapsed(&self) -> Duration {
        self.round_state.read().state_started.elapsed()
    }

    // =========================================================================
    // Step 1: propose
    // =========================================================================

    fn state_propose(&self) {
        let (period, round, carried, null_carried, already) = {
            let rs = self.round_state.read();
            (
                rs.period,
                rs.round,
                rs.previous_round_next_voted_value,
                rs.previous_round_next_voted_null,
                rs.proposed_this_round,
            )
        };
        if already {
            return;
        }

        // A value carried over the round boundary is re-proposed as-is.
        let (value, block) = if let Some(carried_value) = carried {
            (carried_value, self.proposed_blocks.get_block(period, &carried_value))
        } else if round == 1 || null_carried {
            match self.generate_pbft_block(period) {
                Some(block) => {
                    let hash = block.hash();
                    self.proposed_blocks.push_proposed_block(block.clone());
                    (hash, Some(block))
                }
                None => return,
            }
        } else {
            return;
        };

        match self.vote_mgr.generate_vote(value, VoteType::Propose, period, round, 1) {
            Ok(Some(vote)) => {
                self.place_own_vote(&vote);
                self.gossip_vote(&vote, block.as_ref());
                self.round_state.write().proposed_this_round = true;
                debug!(period, round, %value, "proposed");
            }
            Ok(None) => {}
            Err(err) => debug!(%err, "propose vote generation failed"),
        }
    }

    /// Assemble a new PBFT block on the current DAG frontier. Falls back
    /// to a null anchor when there is nothing new to finalize.
    fn generate_pbft_block(&self, period: PbftPeriod) -> Option<PbftBlock> {
        let frontier = self.dag.get_latest_pivot_and_tips();
        let current_anchor = self.dag.anchor();

        let (anchor, order) = if frontier.pivot == current_anchor
            || frontier.pivot == NULL_BLOCK_HASH
        {
            (NULL_BLOCK_HASH, vec![])
        } else {
            let order = self.dag.get_dag_block_order(&frontier.pivot, period);
            if order.is_empty() {
                (NULL_BLOCK_HASH, vec![])
            } else {
                (frontier.pivot, order)
            }
        };

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let block = PbftBlock::new(
            self.chain.last_pbft_block_hash(),
            anchor,
            calculate_order_hash(&order),
            self.pillar.pillar_block_hash_for_proposal(period),
            period,
            timestamp,
            self.vote_mgr.reward_votes_hashes(),
            &self.node_keys,
        );
        match block {
            Ok(block) => Some(block),
            Err(err) => {
                error!(%err, "failed to sign pbft block");
                None
            }
        }
    }

    // =========================================================================
    // Step 2: soft vote
    // =========================================================================

    fn state_soft_vote(&self) {
        let (period, round, carried, already) = {
            let rs = self.round_state.read();
            (
                rs.period,
                rs.round,
                rs.previous_round_next_voted_value,
                rs.soft_voted_this_round,
            )
        };
        if already {
            return;
        }

        let value = match carried {
            Some(value) => Some(value),
            None => self.identify_leader(period, round),
        };
        let Some(value) = value else {
            return;
        };

        match self.vote_mgr.generate_vote(value, VoteType::Soft, period, round, 2) {
            Ok(Some(vote)) => {
                self.place_own_vote(&vote);
                self.gossip_vote(&vote, None);
                self.round_state.write().soft_voted_this_round = true;
                debug!(period, round, %value, "soft voted");
            }
            Ok(None) => {}
            Err(err) => debug!(%err, "soft vote generation failed"),
        }
    }

    /// The leader is the propose-vote whose `keccak(vote_hash)` is lowest,
    /// ties broken by voter address.
    fn identify_leader(&self, period: PbftPeriod, round: PbftRound) -> Option<BlockHash> {
        self.vote_mgr
            .get_proposal_votes(period, round)
            .into_iter()
            .filter(|vote| !vote.is_null())
            .min_by_key(|vote| {
                (
                    keccak256(vote.hash()),
                    vote.voter().unwrap_or_default(),
                )
            })
            .map(|vote| vote.block_hash())
    }

    // =========================================================================
    // Step 3: cert vote
    // =========================================================================

    /// Cert-vote once 2t+1 soft votes coalesce on a block we hold and that
    /// extends the chain. Returns true when this round's cert vote is done.
    fn try_cert_vote(&self) -> bool {
        let (period, round) = {
            let rs = self.round_state.read();
            if rs.cert_voted_value.is_some() {
                return true;
            }
            (rs.period, rs.round)
        };

        let Some((value, _)) = self
            .vote_mgr
            .get_two_t_plus_one_voted_block(period, round, VoteType::Soft)
        else {
            return false;
        };
        self.round_state.write().soft_voted_value = Some(value);
        if value == NULL_BLOCK_HASH {
            return false;
        }

        let Some(block) = self.proposed_blocks.get_block(period, &value) else {
            // Soft quorum on a block we have not received yet.
            return false;
        };
        if !self.chain.check_pbft_block_validation(&block) {
            warn!(%value, "soft-voted block does not extend the chain");
            return false;
        }
        // A non-null anchor must be orderable from our DAG.
        let anchor = block.pivot_dag_block_hash();
        if anchor != NULL_BLOCK_HASH
            && self.dag.get_dag_block_order(&anchor, period).is_empty()
        {
            debug!(%anchor, "anchor not yet orderable, holding cert vote");
            return false;
        }

        match self.vote_mgr.generate_vote(value, VoteType::Cert, period, round, 3) {
            Ok(Some(vote)) => {
                self.place_own_vote(&vote);
                self.gossip_vote(&vote, None);
                self.round_state.write().cert_voted_value = Some(value);
                debug!(period, round, %value, "cert voted");
                true
            }
            Ok(None) => true,
            Err(err) => {
                debug!(%err, "cert vote generation failed");
                false
            }
        }
    }

    // =========================================================================
    // Step 4: chain push
    // =========================================================================

    /// Finalize the period if any round holds 2t+1 cert votes for a block
    /// we can validate. Resets the round state on success.
    pub fn try_push_cert_voted_block(&self) -> bool {
        let period = self.round_state.read().period;
        let Some((round, value)) = self.find_cert_quorum(period) else {
            return false;
        };
        let Some(block) = self.proposed_blocks.get_block(period, &value) else {
            debug!(%value, "cert quorum on unknown block, waiting for payload");
            return false;
        };
        let cert_votes = self
            .vote_mgr
            .get_two_t_plus_one_votes(period, round, VoteType::Cert, &value);
        if cert_votes.is_empty() {
            return false;
        }
        let Some((order, dag_blocks, transactions)) = self.collect_anchor_payload(&block) else {
            return false;
        };
        self.finalize_with_payload(block, cert_votes, order, dag_blocks, transactions)
    }

    fn find_cert_quorum(&self, period: PbftPeriod) -> Option<(PbftRound, BlockHash)> {
        // Quorums normally form in the current round; scan a small window
        // behind it for votes that arrived late.
        let current_round = self.round_state.read().round;
        let first = current_round.saturating_sub(1).max(1);
        for round in (first..=current_round + 1).rev() {
            if let Some((value, _)) = self
                .vote_mgr
                .get_two_t_plus_one_voted_block(period, round, VoteType::Cert)
            {
                if value != NULL_BLOCK_HASH {
                    return Some((round, value));
                }
            }
        }
        None
    }

    /// Persist and execute one finalized period atomically. The payload
    /// (anchor order, DAG blocks, transactions) comes either from our own
    /// DAG (live path) or from synced period data.
    fn finalize_with_payload(
        &self,
        block: PbftBlock,
        cert_votes: Vec<Vote>,
        order: Vec<BlockHash>,
        dag_blocks: Vec<shared_types::DagBlock>,
        transactions: Vec<Transaction>,
    ) -> bool {
        let period = block.period();
        if !self.chain.check_pbft_block_validation(&block) {
            warn!(period, "finalize candidate does not extend the chain");
            return false;
        }
        let anchor = block.pivot_dag_block_hash();

        let prev_cert_votes = self
            .db
            .cert_votes(&block.prev_block_hash())
            .unwrap_or_default();
        let reward_voters: Vec<_> = prev_cert_votes
            .iter()
            .filter_map(|vote| vote.voter().ok())
            .collect();

        let period_data = PeriodData::new(
            block.clone(),
            prev_cert_votes,
            dag_blocks,
            transactions.clone(),
        );

        let mut batch = DbBatch::new();
        batch.put_period_data(&period_data);
        batch.put_cert_votes(&block.hash(), &cert_votes);
        if anchor != NULL_BLOCK_HASH {
            batch.put_finalized_order(&anchor, &order);
        }
        for dag_block in &period_data.dag_blocks {
            batch.put_dag_block(dag_block);
        }
        for trx in &transactions {
            batch.put_transaction(trx);
            batch.put_trx_period(&trx.hash(), period);
        }
        self.chain.stage_push(&mut batch, &block);
        if let Err(err) = self.db.commit(batch) {
            // A failed finalization write risks divergence on restart.
            error!(%err, period, "FATAL: period data write failed");
            panic!("period data write failed: {err}");
        }

        let proposer = block.proposer().unwrap_or_default();
        let result = self
            .state
            .execute_period(&FinalizationInput {
                period,
                anchor,
                dag_order: order.clone(),
                transactions: transactions.clone(),
                proposer,
                reward_voters,
            })
            .unwrap_or_else(|err| {
                error!(%err, period, "FATAL: period execution failed");
                panic!("period execution failed: {err}");
            });

        self.pool.mark_transactions_finalized(&transactions);
        if let Err(err) = self.dag.set_dag_block_order(&anchor, period, &order) {
            error!(%err, period, "anchor commit failed");
        }
        self.chain.apply_head(&block);
        self.vote_mgr.replace_reward_votes(block.hash(), &cert_votes);
        self.vote_mgr
            .cleanup_votes_by_period((period + 1).saturating_sub(VOTE_RETENTION_PERIODS));
        self.proposed_blocks.cleanup_old_blocks(period + 1);
        if let Err(err) = self.pillar.on_finalized_period(period, result.state_root) {
            warn!(%err, period, "pillar hook failed");
        }

        info!(period, block = %block.hash(), trxs = transactions.len(), "pbft block finalized");
        self.bus.publish(NodeEvent::PbftBlockFinalized {
            period,
            block_hash: block.hash(),
        });
        self.bus
            .publish(NodeEvent::PbftPeriodAdvanced { period: period + 1 });

        *self.round_state.write() = RoundState::new(period + 1);
        true
    }

    /// Resolve the anchor's ordered DAG blocks and their deduplicated
    /// transactions; verifies the embedded order hash.
    fn collect_anchor_payload(
        &self,
        block: &PbftBlock,
    ) -> Option<(Vec<BlockHash>, Vec<shared_types::DagBlock>, Vec<Transaction>)> {
        let anchor = block.pivot_dag_block_hash();
        if anchor == NULL_BLOCK_HASH {
            if block.order_hash() != calculate_order_hash(&[]) {
                warn!("null anchor with non-empty order hash");
                return None;
            }
            return Some((vec![], vec![], vec![]));
        }

        let order = self.dag.get_dag_block_order(&anchor, block.period());
        if order.is_empty() {
            debug!(%anchor, "anchor not orderable yet");
            return None;
        }
        if calculate_order_hash(&order) != block.order_hash() {
            warn!(%anchor, "order hash mismatch");
            return None;
        }

        let mut dag_blocks = Vec::with_capacity(order.len());
        let mut seen = HashSet::new();
        let mut trx_hashes = Vec::new();
        for hash in &order {
            let dag_block = self.dag.get_dag_block(hash)?;
            for trx in dag_block.trxs() {
                if seen.insert(*trx) {
                    trx_hashes.push(*trx);
                }
            }
            dag_blocks.push(dag_block);
        }
        let transactions = self.pool.resolve_block_transactions(&trx_hashes)?;
        Some((order, dag_blocks, transactions))
    }

    // =========================================================================
    // Step 5..: next votes
    // =========================================================================

    fn state_next_vote(&self) {
        let (period, round, step, cert_voted, soft_voted) = {
            let rs = self.round_state.read();
            (
                rs.period,
                rs.round,
                rs.step.max(5),
                rs.cert_voted_value,
                rs.soft_voted_value,
            )
        };

        // Prefer a value we certified, then a soft quorum; with neither,
        // the null vote is the only thing that can unstick the round.
        let value = cert_voted
            .or(soft_voted)
            .filter(|v| *v != NULL_BLOCK_HASH)
            .unwrap_or(NULL_BLOCK_HASH);

        match self.vote_mgr.generate_vote(value, VoteType::Next, period, round, step) {
            Ok(Some(vote)) => {
                self.place_own_vote(&vote);
                self.gossip_vote(&vote, None);
                debug!(period, round, step, %value, "next voted");
            }
            Ok(None) => {}
            Err(err) => debug!(%err, "next vote generation failed"),
        }
    }

    /// Advance the round when 2t+1 next votes coalesce.
    fn check_round_advance(&self) {
        let (period, round) = {
            let rs = self.round_state.read();
            (rs.period, rs.round)
        };
        let Some((value, _)) = self
            .vote_mgr
            .get_two_t_plus_one_voted_block(period, round, VoteType::Next)
        else {
            return;
        };

        let bundle = self
            .vote_mgr
            .get_two_t_plus_one_votes(period, round, VoteType::Next, &value);
        if let Err(err) = self.db.save_own_next_votes(&bundle) {
            warn!(%err, "failed to persist next-vote bundle");
        }

        {
            let mut rs = self.round_state.write();
            if rs.round != round || rs.period != period {
                return;
            }
            let carried = (value != NULL_BLOCK_HASH).then_some(value);
            info!(period, from_round = round, ?carried, "round advanced");
            *rs = RoundState::new(period);
            rs.round = round + 1;
            rs.previous_round_next_voted_value = carried;
            rs.previous_round_next_voted_null = value == NULL_BLOCK_HASH;
        }

        let network = self.network.read().clone();
        if let Some(network) = network {
            network.gossip_votes_bundle(&bundle);
        }
    }

    // =========================================================================
    // Sync ingestion
    // =========================================================================

    /// Drain the period-data queue in order, validating and finalizing
    /// each synced period.
    fn process_period_data_queue(&self) {
        while let Some(entry) = self.period_data_queue.pop() {
            if !self.finalize_from_sync(entry.data, entry.cert_votes) {
                // The rest of the queue builds on the failed period.
                self.period_data_queue.clear();
                return;
            }
        }
    }

    fn finalize_from_sync(&self, data: PeriodData, cert_votes: Vec<Vote>) -> bool {
        let block = data.pbft_block.clone();
        let period = block.period();
        if period != self.chain.size() + 1 {
            debug!(period, chain = self.chain.size(), "stale synced period dropped");
            return true;
        }
        if !block.verify_sig() {
            warn!(period, "synced pbft block with bad signature");
            return false;
        }
        match self.validate_cert_quorum(&block, &cert_votes) {
            Ok(()) => {}
            Err(err) => {
                warn!(period, %err, "synced period fails cert quorum");
                return false;
            }
        }

        // The synced order is authoritative: the certificate was formed
        // over this exact set, and our own DAG may hold extra blocks.
        let order: Vec<BlockHash> = data.dag_blocks.iter().map(|b| b.hash()).collect();
        if calculate_order_hash(&order) != block.order_hash() {
            warn!(period, "synced period order hash mismatch");
            return false;
        }

        // Feed the period's DAG blocks (with their payloads) into the DAG
        // before finalizing against it.
        for dag_block in &data.dag_blocks {
            let trxs: Vec<Transaction> = data
                .transactions
                .iter()
                .filter(|trx| dag_block.trxs().contains(&trx.hash()))
                .cloned()
                .collect();
            if let Err(err) = self.dag.add_dag_block(dag_block.clone(), trxs, false, true) {
                debug!(hash = %dag_block.hash(), %err, "synced dag block rejected");
            }
        }

        self.finalize_with_payload(
            block,
            cert_votes,
            order,
            data.dag_blocks,
            data.transactions,
        )
    }

    /// Verify that `cert_votes` are valid cert votes for this block whose
    /// combined weight reaches 2t+1.
    pub fn validate_cert_quorum(
        &self,
        block: &PbftBlock,
        cert_votes: &[Vote],
    ) -> Result<(), VoteError> {
        let threshold = self
            .vote_mgr
            .two_t_plus_one_threshold(block.period())
            .ok_or(VoteError::FutureBlock)?;
        let mut weight = 0u64;
        let mut voters = HashSet::new();
        for vote in cert_votes {
            if vote.vote_type() != VoteType::Cert
                || vote.period() != block.period()
                || vote.block_hash() != block.hash()
            {
                return Err(VoteError::InvalidSignature);
            }
            self.vote_mgr.verify_vote(vote)?;
            if voters.insert(vote.voter().map_err(|_| VoteError::InvalidSignature)?) {
                weight += vote.weight();
            }
        }
        if weight < threshold {
            return Err(VoteError::SortitionFailed);
        }
        Ok(())
    }

    // =========================================================================
    // Vote plumbing
    // =========================================================================

    /// Store one of our own votes; a double vote here is a bug, not an
    /// offence to prosecute.
    fn place_own_vote(&self, vote: &Vote) {
        if let Err(err) = self.vote_mgr.add_verified_vote(vote) {
            error!(%err, "own vote rejected by store");
        }
    }

    /// Entry point for verified external votes (from the network layer).
    /// Detects double votes and forwards provable ones to slashing.
    pub fn add_external_vote(&self, vote: &Vote) -> Result<bool, VoteError> {
        match self.vote_mgr.add_verified_vote(vote) {
            Ok(fresh) => Ok(fresh),
            Err(VoteError::DoubleVote { existing }) => {
                if matches!(vote.vote_type(), VoteType::Cert | VoteType::Propose) {
                    self.slashing.submit_double_voting_proof(&existing, vote);
                }
                Err(VoteError::DoubleVote { existing })
            }
            Err(other) => Err(other),
        }
    }

    fn gossip_vote(&self, vote: &Vote, block: Option<&PbftBlock>) {
        let network = self.network.read().clone();
        if let Some(network) = network {
            network.gossip_vote(vote, block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hx_dag::SortitionParamsManager;
    use hx_final_chain::InMemoryState;
    use hx_transaction_pool::PoolConfig;
    use shared_crypto::bls::PillarBlsKeys;
    use shared_crypto::vrf::VrfKeyPair;
    use shared_types::{
        Address, BlsPkBytes, Bytes, DagBlock, GenesisConfig, GenesisValidator, SortitionConfig,
        B256, U256,
    };
    use tempfile::TempDir;

    struct Node {
        _dir: TempDir,
        manager: Arc<PbftManager>,
        chain: Arc<PbftChain>,
        dag: Arc<DagManager>,
        pool: Arc<TransactionPool>,
        state: Arc<InMemoryState>,
        db: Arc<DbStorage>,
        wallet: Arc<KeyPair>,
    }

    /// Single-validator genesis; `node_keys` may or may not be the
    /// validator.
    fn build_node(node_secret: u8, genesis: &GenesisConfig) -> Node {
        let node_keys = Arc::new(KeyPair::from_secret_bytes(&[node_secret; 32]).unwrap());
        let vrf_keys = Arc::new(VrfKeyPair::from_secret_bytes(&[node_secret + 1; 32]).unwrap());
        let wallet = Arc::new(KeyPair::from_secret_bytes(&[0xD0; 32]).unwrap());

        let dir = TempDir::new().unwrap();
        let db = Arc::new(DbStorage::open(dir.path()).unwrap());
        let state = Arc::new(InMemoryState::from_genesis(genesis));
        let bus = Arc::new(EventBus::new());
        let pool = Arc::new(TransactionPool::new(
            PoolConfig {
                chain_id: genesis.chain_id,
                ..PoolConfig::default()
            },
            state.clone(),
            db.clone(),
            bus.clone(),
        ));
        let dag = DagManager::new(
            genesis.dag_genesis_block.clone(),
            genesis.dag.clone(),
            genesis.pbft.gas_limit,
            SortitionParamsManager::new(SortitionConfig::default(), db.clone()),
            db.clone(),
            pool.clone(),
            state.clone(),
            bus.clone(),
        )
        .unwrap();
        let chain = Arc::new(PbftChain::new(db.clone()).unwrap());
        let vote_mgr = Arc::new(VoteManager::new(
            node_keys.clone(),
            vrf_keys,
            genesis.pbft.committee_size,
            state.clone(),
        ));
        let pillar = PillarChainManager::new(
            genesis.hardforks.ficus.clone(),
            node_keys.address(),
            Arc::new(PillarBlsKeys::generate()),
            db.clone(),
            state.clone(),
            bus.clone(),
        )
        .unwrap();
        let slashing = Arc::new(SlashingManager::new(
            node_keys.clone(),
            genesis.chain_id,
            pool.clone(),
            state.clone(),
            bus.clone(),
        ));
        let manager = PbftManager::new(
            genesis.pbft.clone(),
            node_keys,
            chain.clone(),
            vote_mgr,
            dag.clone(),
            pool.clone(),
            state.clone(),
            db.clone(),
            bus,
            pillar,
            slashing,
            Arc::new(PeriodDataQueue::new()),
        );
        Node {
            _dir: dir,
            manager,
            chain,
            dag,
            pool,
            state,
            db,
            wallet,
        }
    }

    fn validator_genesis(validator_secret: u8) -> GenesisConfig {
        let keys = KeyPair::from_secret_bytes(&[validator_secret; 32]).unwrap();
        let vrf = VrfKeyPair::from_secret_bytes(&[validator_secret + 1; 32]).unwrap();
        let wallet = KeyPair::from_secret_bytes(&[0xD0; 32]).unwrap();
        let mut genesis = GenesisConfig::default();
        genesis.pbft.lambda_ms = 10;
        genesis.validators.push(GenesisValidator {
            address: keys.address(),
            vrf_key: vrf.public_key(),
            bls_key: BlsPkBytes::ZERO,
            stake: U256::from(1_000u64),
        });
        genesis
            .state
            .initial_balances
            .push((wallet.address(), U256::from(1_000_000_000u64)));
        genesis
    }

    fn drive(node: &Node, max_iterations: usize, until: impl Fn(&Node) -> bool) {
        for _ in 0..max_iterations {
            if until(node) {
                return;
            }
            node.manager.step_once();
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached in {max_iterations} iterations");
    }

    #[test]
    fn test_single_validator_finalizes_periods() {
        let node = build_node(0x81, &validator_genesis(0x81));

        drive(&node, 200, |n| n.chain.size() >= 3);

        // Every finalized period carries exactly one cert vote, linked
        // into a proper chain.
        let mut prev_hash = NULL_BLOCK_HASH;
        for period in 1..=3u64 {
            let block = node.chain.get_pbft_block(period).unwrap();
            assert_eq!(block.prev_block_hash(), prev_hash);
            assert_eq!(block.period(), period);
            let cert_votes = node.db.cert_votes(&block.hash()).unwrap();
            assert_eq!(cert_votes.len(), 1);
            prev_hash = block.hash();
        }
        assert_eq!(node.state.last_block_number(), node.chain.size());
    }

    #[test]
    fn test_dag_anchor_and_transactions_finalize() {
        let genesis = validator_genesis(0x83);
        let node = build_node(0x83, &genesis);

        // A transfer enters the pool, a DAG block includes it.
        let trx = Transaction::new(
            0,
            U256::from(5u64),
            U256::from(1u64),
            21_000,
            Some(Address::repeat_byte(0x05)),
            Bytes::new(),
            genesis.chain_id,
            &node.wallet,
        )
        .unwrap();
        node.pool.insert_transaction(trx.clone()).unwrap();

        let dag_block = DagBlock::new(
            genesis.dag_genesis_block.hash(),
            1,
            1,
            vec![],
            vec![trx.hash()],
            node.pool.estimate_transaction_gas(&trx, 0).unwrap(),
            shared_crypto::vdf::VdfSortition {
                vrf_proof: shared_crypto::vrf::VrfProof::from_bytes([0u8; 65]),
                difficulty: 0,
                output: B256::ZERO,
            },
            &node.wallet,
        )
        .unwrap();
        node.dag
            .add_dag_block(dag_block.clone(), vec![trx.clone()], true, true)
            .unwrap();

        drive(&node, 100, |n| n.chain.size() >= 1);

        let block = node.chain.get_pbft_block(1).unwrap();
        assert_eq!(block.pivot_dag_block_hash(), dag_block.hash());
        assert_eq!(node.dag.anchor(), dag_block.hash());

        // The transfer executed: nonce advanced, receipt ok, value moved.
        assert_eq!(node.state.nonce(1, &node.wallet.address()).unwrap(), 1);
        let receipt = node.state.receipt(&trx.hash()).unwrap();
        assert!(receipt.status_ok);
        assert_eq!(
            node.state.balance(1, &Address::repeat_byte(0x05)).unwrap(),
            U256::from(5u64)
        );
        // Finalized transactions leave the pool.
        assert!(!node.pool.contains(&trx.hash()));
        assert_eq!(node.db.transaction_period(&trx.hash()).unwrap(), Some(1));
    }

    #[test]
    fn test_sync_path_replays_remote_periods() {
        let genesis = validator_genesis(0x85);
        let validator = build_node(0x85, &genesis);
        drive(&validator, 200, |n| n.chain.size() >= 2);

        // An observer node (not a validator) ingests the periods.
        let observer = build_node(0x91, &genesis);
        let source = shared_types::NodeId::repeat_byte(0x01);
        for period in 1..=2u64 {
            let data = validator.db.period_data(period).unwrap().unwrap();
            let cert_votes = validator
                .db
                .cert_votes(&data.pbft_block.hash())
                .unwrap();
            assert!(observer.manager.period_data_queue().push(
                data,
                cert_votes,
                source,
                observer.chain.size(),
            ));
        }

        observer.manager.step_once();
        assert_eq!(observer.chain.size(), 2);
        assert_eq!(observer.state.last_block_number(), 2);
        assert_eq!(
            observer.chain.last_pbft_block_hash(),
            validator.chain.get_pbft_block(2).unwrap().hash()
        );
    }

    #[test]
    fn test_tampered_sync_period_rejected() {
        let genesis = validator_genesis(0x87);
        let validator = build_node(0x87, &genesis);
        drive(&validator, 200, |n| n.chain.size() >= 1);

        let observer = build_node(0x93, &genesis);
        let data = validator.db.period_data(1).unwrap().unwrap();
        // Wrong votes: period 1 data with empty certificate.
        assert!(observer.manager.period_data_queue().push(
            data,
            vec![],
            shared_types::NodeId::repeat_byte(0x01),
            observer.chain.size(),
        ));

        observer.manager.step_once();
        assert_eq!(observer.chain.size(), 0);
        assert!(observer.manager.period_data_queue().is_empty());
    }

    #[test]
    fn test_round_advances_without_quorum_progress() {
        // A non-validator node can never see votes: its rounds only move
        // via next-vote bundles, so the state machine must stay in
        // NextVotePolling without panicking.
        let genesis = validator_genesis(0x89);
        let observer = build_node(0x95, &genesis);
        for _ in 0..40 {
            observer.manager.step_once();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(observer.chain.size(), 0);
        assert_eq!(observer.manager.round(), 1);
        assert_eq!(observer.manager.pbft_state(), PbftState::NextVotePolling);
    }
}
